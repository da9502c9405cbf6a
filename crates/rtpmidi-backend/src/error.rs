//! Backend error types

use std::fmt;

use thiserror::Error;

use rtpmidi_protocol::{ChannelError, PacketError};

use crate::config::Mode;

pub type Result<T> = std::result::Result<T, BackendError>;

/// Rejected option assignments. Reported at configuration time, or at start
/// for checks that need the complete option set.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown option {0:?}")]
    UnknownOption(String),

    #[error("invalid value {value:?} for option {option:?}: {reason}")]
    InvalidValue {
        option: String,
        value: String,
        reason: String,
    },

    /// A mode-specific option was set before `mode`
    #[error("option {0:?} requires `mode` to be set first")]
    ModeNotSet(String),

    /// A mode-specific option does not apply to the configured mode
    #[error("option {option:?} is not valid in {mode} mode")]
    ModeMismatch { option: String, mode: Mode },

    /// `mode` changed after mode-specific options were applied
    #[error("mode is locked to {current} by earlier options, cannot switch to {requested}")]
    ModeLocked { current: Mode, requested: Mode },

    #[error("option {0:?} may only be set once")]
    Duplicate(String),
}

impl ConfigError {
    pub(crate) fn invalid(option: &str, value: &str, reason: impl fmt::Display) -> Self {
        Self::InvalidValue {
            option: option.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Configuration failure of one instance, collected at start so every
/// sibling is still validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceFailure {
    pub instance: String,
    pub error: ConfigError,
}

impl fmt::Display for InstanceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.instance, self.error)
    }
}

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error("instance {0:?} already exists")]
    DuplicateInstance(String),

    #[error("unknown instance id {0}")]
    UnknownInstance(usize),

    #[error("{} instance(s) failed to start: {}", .0.len(), join_failures(.0))]
    Startup(Vec<InstanceFailure>),

    #[error("backend already started")]
    AlreadyStarted,

    #[error("mDNS error: {0}")]
    Discovery(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn join_failures(failures: &[InstanceFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<mdns_sd::Error> for BackendError {
    fn from(e: mdns_sd::Error) -> Self {
        Self::Discovery(e.to_string())
    }
}
