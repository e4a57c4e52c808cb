pub mod response;

use crate::config::GeneratorConfig;
use crate::error::{PilotError, Result};
use crate::executor::runner::CommandRunner;
use crate::patch::Patch;
use crate::request::ChangeRequest;
use crate::snapshot::store::TreeScanner;
use async_trait::async_trait;
use response::{GeneratorReply, ResponseProcessor, DECLINE_SENTINEL};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use walkdir::WalkDir;

/// Cap on configuration text embedded into a prompt
const MAX_CONTEXT_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct GenerationInput {
    pub instruction: String,
    pub target_paths: Vec<PathBuf>,
    pub context: String,
}

/// Turns a natural-language instruction into a diff
#[async_trait]
pub trait PatchGenerator: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, input: &GenerationInput) -> Result<GeneratorReply>;
}

/// Invokes an LLM command-line tool with the prompt as its last argument
pub struct CliGenerator {
    config: GeneratorConfig,
    runner: CommandRunner,
}

impl CliGenerator {
    pub fn new(config: GeneratorConfig) -> Self {
        Self {
            config,
            runner: CommandRunner::new(),
        }
    }
}

#[async_trait]
impl PatchGenerator for CliGenerator {
    fn name(&self) -> &str {
        &self.config.command
    }

    async fn generate(&self, input: &GenerationInput) -> Result<GeneratorReply> {
        let prompt = PromptTemplate::build_patch_prompt(&input.instruction, &input.context);
        let mut argv = vec![self.config.command.clone()];
        argv.extend(self.config.args.iter().cloned());
        argv.push(prompt);

        tracing::info!(generator = %self.config.command, "requesting patch");
        let output = self
            .runner
            .execute(&argv, None, Duration::from_secs(self.config.timeout_secs))
            .await
            .map_err(|e| match e {
                PilotError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => PilotError::Config(
                    format!("patch generator '{}' is not installed", self.config.command),
                ),
                other => other,
            })?;

        if output.timed_out {
            return Err(PilotError::Execution(format!(
                "{} did not answer within {}s",
                self.config.command, self.config.timeout_secs
            )));
        }
        if !output.success() {
            return Err(PilotError::Execution(format!(
                "{} failed: {}",
                self.config.command,
                output.stderr.trim()
            )));
        }

        ResponseProcessor::process(&output.stdout)
    }
}

/// Prompt text shared by every generator
pub struct PromptTemplate;

impl PromptTemplate {
    pub fn build_patch_prompt(instruction: &str, context: &str) -> String {
        format!(
            "You edit a NixOS declarative configuration. Produce a unified diff that \
             implements the request below.\n\n\
             RULES:\n\
             - Output ONLY the unified diff (--- a/<path>, +++ b/<path>, @@ hunks)\n\
             - Paths are relative to the configuration root\n\
             - Copy context lines exactly from the files shown\n\
             - Never touch credentials, SSH keys, sudoers, or the bootloader\n\
             - If the request cannot be done safely, output exactly {}\n\n\
             Current configuration:\n{}\n\
             Request: {}\n\n\
             Diff:",
            DECLINE_SENTINEL, context, instruction
        )
    }
}

/// Embed the tree's `.nix` files into prompt context until the size cap
pub fn gather_context(scanner: &TreeScanner) -> Result<(String, Vec<PathBuf>)> {
    let root = scanner.root();
    let mut context = String::new();
    let mut paths = Vec::new();

    let walker = WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.path()
                .strip_prefix(root)
                .map(|rel| !scanner.is_excluded(rel))
                .unwrap_or(false)
        });
    for entry in walker {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() || entry.path().extension().and_then(|e| e.to_str()) != Some("nix") {
            continue;
        }
        let text = match fs::read_to_string(entry.path()) {
            Ok(text) => text,
            Err(_) => continue,
        };
        if context.len() + text.len() > MAX_CONTEXT_BYTES {
            tracing::debug!(path = %entry.path().display(), "prompt context full, skipping");
            continue;
        }
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        context.push_str(&format!("=== {} ===\n{}\n", rel.display(), text));
        paths.push(entry.path().to_path_buf());
    }
    Ok((context, paths))
}

/// Build the change request for a generator reply. Base hashes are bound to
/// the tree as it is now.
pub fn request_from_reply(
    reply: GeneratorReply,
    config_root: &Path,
    target_paths: Vec<PathBuf>,
) -> Result<ChangeRequest> {
    match reply {
        GeneratorReply::Declined(message) => Ok(ChangeRequest::declined(message, target_paths)),
        GeneratorReply::Diff(text) => {
            let mut patch = Patch::parse(&text)?;
            patch.bind_base(config_root)?;
            Ok(ChangeRequest::patch(patch, config_root))
        }
    }
}
