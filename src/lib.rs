pub mod backup;
pub mod cli;
pub mod config;
pub mod error;
pub mod host;
pub mod targets;
pub mod types;
pub mod util;

pub use error::{BackupError, Result};
