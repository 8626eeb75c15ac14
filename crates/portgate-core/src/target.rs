//! Relay targets and the dynamic port range they must fall into.

use crate::address::Address;
use crate::error::{ValidationError, ValidationResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// Validate a numeric port (`1..=65535`).
pub fn port_from_u64(value: u64) -> ValidationResult<u16> {
    match u16::try_from(value) {
        Ok(0) | Err(_) => Err(ValidationError::InvalidPort(value.to_string())),
        Ok(port) => Ok(port),
    }
}

/// Parse a decimal port string (`1..=65535`, digits only).
pub fn parse_port(input: &str) -> ValidationResult<u16> {
    if input.is_empty() || !input.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ValidationError::InvalidPort(input.to_string()));
    }
    let value: u64 = input
        .parse()
        .map_err(|_| ValidationError::InvalidPort(input.to_string()))?;
    port_from_u64(value)
}

/// Inclusive port range, written `start-end` in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> ValidationResult<Self> {
        if start == 0 || start > end {
            return Err(ValidationError::InvalidRange(format!("{start}-{end}")));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    fn check(&self, port: u16) -> ValidationResult<()> {
        if self.contains(port) {
            Ok(())
        } else {
            Err(ValidationError::PortOutOfRange {
                port,
                start: self.start,
                end: self.end,
            })
        }
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 10000,
            end: 60000,
        }
    }
}

impl FromStr for PortRange {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| ValidationError::InvalidRange(s.to_string()))?;
        let invalid = |_| ValidationError::InvalidRange(s.to_string());
        let start = parse_port(start.trim()).map_err(invalid)?;
        let end = parse_port(end.trim()).map_err(invalid)?;
        Self::new(start, end)
    }
}

impl TryFrom<String> for PortRange {
    type Error = ValidationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<PortRange> for String {
    fn from(range: PortRange) -> Self {
        range.to_string()
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// The single forwarding rule the relay runs: `bind_port` → `backend:backend_port`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelayTarget {
    pub bind_port: u16,
    pub backend_address: Address,
    pub backend_port: u16,
}

impl RelayTarget {
    /// Build a target, checking both ports and the bind range.
    pub fn new(
        bind_port: u16,
        backend_address: Address,
        backend_port: u16,
        bind_range: &PortRange,
    ) -> ValidationResult<Self> {
        let target = Self {
            bind_port,
            backend_address,
            backend_port,
        };
        target.validate(bind_range)?;
        Ok(target)
    }

    /// Re-check an already constructed target against `bind_range`.
    pub fn validate(&self, bind_range: &PortRange) -> ValidationResult<()> {
        if self.bind_port == 0 {
            return Err(ValidationError::InvalidPort("0".into()));
        }
        if self.backend_port == 0 {
            return Err(ValidationError::InvalidPort("0".into()));
        }
        bind_range.check(self.bind_port)
    }

    pub fn backend_socket(&self) -> SocketAddr {
        SocketAddr::new(self.backend_address.ip(), self.backend_port)
    }
}

impl fmt::Display for RelayTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{} -> {}", self.bind_port, self.backend_socket())
    }
}
