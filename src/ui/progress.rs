use crate::transaction::TxState;
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

pub fn create_spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner()
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
        .template("{spinner:.cyan} {msg}")
    {
        spinner.set_style(style);
    }
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(80));
    spinner
}

/// Spinner text for a transaction state
pub fn state_message(state: TxState) -> String {
    match state {
        TxState::Received => "Queued...".to_string(),
        TxState::Validating => "Validating (policy, base hashes, syntax)...".to_string(),
        TxState::Staged => "Snapshot taken".to_string(),
        TxState::BuildTesting => "Building the new configuration...".to_string(),
        TxState::Applying => "Activating...".to_string(),
        TxState::Applied | TxState::Monitoring => "Watching system health...".to_string(),
        other => other.to_string(),
    }
}

/// Colored terminal state label
pub fn state_label(state: TxState) -> ColoredString {
    match state {
        TxState::Committed => state.as_str().green().bold(),
        TxState::Rejected => state.as_str().yellow().bold(),
        TxState::RolledBack => state.as_str().magenta().bold(),
        TxState::RollbackFailed => state.as_str().red().bold().reversed(),
        other => other.as_str().normal(),
    }
}
