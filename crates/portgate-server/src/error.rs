//! Error types for the portgate daemon.

use portgate_core::{RelayTarget, ValidationError};
use std::fmt;
use thiserror::Error;

/// One failed step of a firewall baseline install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedStep {
    /// Human-readable step name, e.g. `rule 4: tcp admission`.
    pub step: String,
    /// Diagnostic output of the failing command.
    pub stderr: String,
}

impl fmt::Display for FailedStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.step, self.stderr.trim())
    }
}

/// Errors produced by the packet filter, the relay, and start-up.
#[derive(Debug, Error)]
pub enum PortgateError {
    #[error("external command failed: `{command}`: {stderr}")]
    ExternalTool { command: String, stderr: String },

    #[error("relay {target} failed to start: {reason}")]
    RelayStart { target: RelayTarget, reason: String },

    #[error("firewall baseline partially applied ({} failed steps)", failed_steps.len())]
    PartialFailure { failed_steps: Vec<FailedStep> },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PortgateError {
    pub(crate) fn external(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::ExternalTool {
            command: command.into(),
            stderr: stderr.into(),
        }
    }
}

pub type PortgateResult<T> = Result<T, PortgateError>;
