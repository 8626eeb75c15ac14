use thiserror::Error;

/// Malformed input rejected before any state is touched.
///
/// Messages are stable and safe to return to a client verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid address: {0:?}")]
    InvalidAddress(String),

    #[error("invalid port: {0:?}")]
    InvalidPort(String),

    #[error("port {port} outside allowed range {start}-{end}")]
    PortOutOfRange { port: u16, start: u16, end: u16 },

    #[error("invalid port range: {0:?}")]
    InvalidRange(String),

    #[error("address family not enabled: {0}")]
    FamilyDisabled(String),

    #[error("loopback or unspecified address not allowed: {0}")]
    LocalAddress(String),
}

pub type ValidationResult<T> = Result<T, ValidationError>;
