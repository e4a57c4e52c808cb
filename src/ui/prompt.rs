use crate::error::{PilotError, Result};
use crate::patch::Patch;
use crate::policy::CommandClass;
use colored::*;
use dialoguer::Confirm;

/// Color one line of a unified diff
pub fn diff_line(line: &str) -> ColoredString {
    if line.starts_with('+') && !line.starts_with("+++") {
        line.green()
    } else if line.starts_with('-') && !line.starts_with("---") {
        line.red()
    } else if line.starts_with("@@") {
        line.cyan()
    } else {
        line.normal()
    }
}

pub struct ConfirmPrompt;

impl ConfirmPrompt {
    pub fn new() -> Self {
        Self
    }

    /// Show the patch preview and ask before submitting it
    pub fn confirm_patch(&self, patch: &Patch) -> Result<bool> {
        let summary = patch.summary();
        eprintln!("\n{}", "[>] Proposed change:".cyan().bold());
        eprintln!("  {}", summary);
        for file in &summary.files_modified {
            eprintln!("    {}", file.display().to_string().yellow());
        }
        eprintln!();
        for line in patch.to_unified().lines() {
            eprintln!("  {}", diff_line(line));
        }

        self.ask("Apply this change?")
    }

    /// Restricted commands need an explicit yes; the answer travels with the
    /// request as its confirmation flag
    pub fn confirm_command(&self, argv: &[String], class: CommandClass) -> Result<bool> {
        eprintln!("\n{}", "[>] Command:".cyan().bold());
        let command = argv.join(" ");
        let (colored_command, label) = match class {
            CommandClass::Safe => (command.green(), "[*] Read-only".green()),
            CommandClass::Restricted => (command.yellow(), "[!] Changes system state".yellow()),
            CommandClass::Forbidden => (command.red().bold(), "[!!!] Forbidden by policy".red().bold()),
        };
        eprintln!("  {}", colored_command);
        eprintln!("\n{} {}", "Class:".bold(), label);

        self.ask("Run this command?")
    }

    fn ask(&self, prompt: &str) -> Result<bool> {
        Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .map_err(|_| PilotError::UserCancelled)
    }
}

impl Default for ConfirmPrompt {
    fn default() -> Self {
        Self::new()
    }
}
