use crate::error::{PilotError, Result};
use once_cell::sync::Lazy;
use regex::Regex;

/// Literal reply meaning "no safe patch exists for this request"
pub const DECLINE_SENTINEL: &str = "UNABLE_TO_GENERATE_PATCH";

static FENCED_BLOCK_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```(?:diff|patch|udiff)?[ \t]*\n(.*?)\n?```").expect("static regex")
});

/// Replies that explain instead of answering
const META_PATTERNS: &[&str] = &[
    "I am unable to",
    "I cannot",
    "I can't",
    "I'm sorry",
    "As an AI",
    "I don't have the ability",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeneratorReply {
    /// Unified diff text, fences stripped
    Diff(String),
    Declined(String),
}

/// Post-process a generator's raw output into diff text or a refusal
pub struct ResponseProcessor;

impl ResponseProcessor {
    pub fn process(raw: &str) -> Result<GeneratorReply> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(PilotError::PatchParse("generator returned an empty response".to_string()));
        }

        if trimmed.contains(DECLINE_SENTINEL) {
            let rest = trimmed.replace(DECLINE_SENTINEL, "");
            let rest = rest.trim().trim_start_matches(':').trim();
            return Ok(GeneratorReply::Declined(if rest.is_empty() {
                DECLINE_SENTINEL.to_string()
            } else {
                rest.to_string()
            }));
        }

        let body = match FENCED_BLOCK_REGEX.captures(trimmed) {
            Some(caps) => caps.get(1).map_or("", |m| m.as_str()).to_string(),
            None => trimmed.to_string(),
        };

        // Prose without any diff header is a refusal in disguise
        let looks_like_diff = body
            .lines()
            .any(|l| l.starts_with("--- ") || l.starts_with("diff --git ") || l.starts_with("@@"));
        if !looks_like_diff {
            let lower = body.to_lowercase();
            if META_PATTERNS.iter().any(|p| lower.contains(&p.to_lowercase())) {
                return Ok(GeneratorReply::Declined(body));
            }
            return Err(PilotError::PatchParse(format!(
                "generator reply contains no diff: {}",
                body.lines().next().unwrap_or("")
            )));
        }

        let mut diff = body;
        if !diff.ends_with('\n') {
            diff.push('\n');
        }
        Ok(GeneratorReply::Diff(diff))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIFF: &str = "--- a/configuration.nix\n+++ b/configuration.nix\n@@ -1 +1 @@\n-a\n+b\n";

    #[test]
    fn test_plain_diff() {
        assert_eq!(
            ResponseProcessor::process(DIFF).unwrap(),
            GeneratorReply::Diff(DIFF.to_string())
        );
    }

    #[test]
    fn test_fenced_diff() {
        let raw = format!("Here is the patch:\n```diff\n{}```\nApply with care.", DIFF);
        assert_eq!(
            ResponseProcessor::process(&raw).unwrap(),
            GeneratorReply::Diff(DIFF.to_string())
        );

        let raw = format!("```\n{}```", DIFF);
        assert!(matches!(ResponseProcessor::process(&raw).unwrap(), GeneratorReply::Diff(_)));
    }

    #[test]
    fn test_sentinel() {
        assert_eq!(
            ResponseProcessor::process("UNABLE_TO_GENERATE_PATCH").unwrap(),
            GeneratorReply::Declined(DECLINE_SENTINEL.to_string())
        );
        assert_eq!(
            ResponseProcessor::process("UNABLE_TO_GENERATE_PATCH: would disable sshd").unwrap(),
            GeneratorReply::Declined("would disable sshd".to_string())
        );
    }

    #[test]
    fn test_meta_reply_is_declined() {
        let reply = ResponseProcessor::process("I'm sorry, I cannot modify the bootloader.").unwrap();
        assert!(matches!(reply, GeneratorReply::Declined(_)));
    }

    #[test]
    fn test_empty_and_prose_rejected() {
        assert!(ResponseProcessor::process("").is_err());
        assert!(ResponseProcessor::process("  \n ").is_err());
        assert!(ResponseProcessor::process("Enable nginx in your config.").is_err());
    }
}
