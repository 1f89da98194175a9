//! Fatal startup errors
//!
//! Everything here ends the process before the pipeline starts; per-frame
//! problems are statistics, not errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InitError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("cannot bind port {port}: {source}")]
    Bind {
        port: u16,
        source: std::io::Error,
    },

    #[error("cannot start sample source: {0}")]
    Device(std::io::Error),

    #[error("cannot open input file {path}: {source}")]
    Input {
        path: String,
        source: std::io::Error,
    },
}

impl InitError {
    /// 2 for device open failures, 1 for everything else fatal.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Device(_) => 2,
            _ => 1,
        }
    }
}
