//! Error types shared by the resolution, planning and synthesis stages.

use crate::config::PresetKind;
use crate::xml::XmlError;

/// Every failure is fatal for the invocation; the variant says which stage
/// rejected the request.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A `--disk`, `--nic` or `--cloud-seed-disk` value could not be parsed
    #[error("invalid spec '{spec}': {reason}")]
    Parse { spec: String, reason: String },

    #[error("preset {kind}/{name} not found in the config")]
    NotFound { kind: PresetKind, name: String },

    /// A resolved value is missing, out of range, or conflicts with another
    #[error("{0}")]
    Validation(String),

    #[error("volume {volume} already exists in pool {pool}")]
    AlreadyExists { pool: String, volume: String },

    #[error("invalid domain template: {0}")]
    Template(#[source] XmlError),

    /// The pool backend cannot be used the way the disk requires
    #[error("pool {pool}: {reason}")]
    Capability { pool: String, reason: String },

    #[error("{command} failed: {message}")]
    Daemon { command: String, message: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn parse(spec: &str, reason: impl Into<String>) -> Self {
        Error::Parse {
            spec: spec.to_owned(),
            reason: reason.into(),
        }
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub(crate) fn capability(pool: &str, reason: impl Into<String>) -> Self {
        Error::Capability {
            pool: pool.to_owned(),
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
