pub mod progress;
pub mod prompt;

pub use progress::{create_spinner, state_label, state_message};
pub use prompt::{diff_line, ConfirmPrompt};
