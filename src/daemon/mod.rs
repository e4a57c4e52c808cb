pub mod protocol;
pub mod server;

pub use protocol::{DaemonRequest, DaemonResponse};
pub use server::{DaemonClient, DaemonServer};
