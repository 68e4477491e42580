use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("{0}")]
    Message(String),
    #[error("{0}")]
    Config(ConfigError),
    #[error("{0}")]
    Host(HostError),
    #[error("checkpoint {}: {source}", .path.display())]
    Checkpoint {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("backup volume {}: {source}", .path.display())]
    Volume {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("parse config: {0}")]
    Parse(String),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("{0}")]
    Spawn(String),
    #[error("{0}")]
    CommandFailed(String),
    #[error("unexpected output: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, BackupError>;

impl BackupError {
    pub fn message(msg: impl Into<String>) -> Self {
        BackupError::Message(msg.into())
    }

    pub fn checkpoint(path: impl Into<PathBuf>, source: io::Error) -> Self {
        BackupError::Checkpoint {
            path: path.into(),
            source,
        }
    }
}

impl From<ConfigError> for BackupError {
    fn from(err: ConfigError) -> Self {
        BackupError::Config(err)
    }
}

impl From<HostError> for BackupError {
    fn from(err: HostError) -> Self {
        BackupError::Host(err)
    }
}
