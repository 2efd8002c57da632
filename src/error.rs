//! Top-level error hierarchy for `mup`.
//!
//! Every subsystem (config, store, account clients, plugins) defines its own
//! error enum close to where it's thrown; this module stitches them together
//! behind a single [`MupError`] so `main` has one thing to match on when
//! deciding the process exit code.

use thiserror::Error;

use crate::config::ConfigError;
use crate::db::DbError;

/// Errors that can escape to `main` and decide the process exit code.
#[derive(Debug, Error)]
pub enum MupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("store error: {0}")]
    Db(#[from] DbError),

    #[error("protocol error: {0}")]
    Protocol(#[from] mup_proto::ProtocolError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl MupError {
    /// The process exit code this error should produce (§6: "1 on
    /// startup/fatal error").
    pub fn exit_code(&self) -> i32 {
        1
    }

    /// Static label suitable for a log field, independent of any
    /// interpolated detail.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::Db(_) => "db_error",
            Self::Protocol(_) => "protocol_error",
            Self::Io(_) => "io_error",
        }
    }
}

/// Convenience alias for fallible functions throughout the crate.
pub type Result<T> = std::result::Result<T, MupError>;
