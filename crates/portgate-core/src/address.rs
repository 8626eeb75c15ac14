//! Validated host addresses.
//!
//! An [`Address`] is a single IPv4 or IPv6 host in canonical textual form.
//! Hostnames, CIDR blocks, `ip:port` pairs and zone-scoped IPv6 literals are
//! all rejected: the packet filter only ever sees literal host addresses.

use crate::error::{ValidationError, ValidationResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Address family of an [`Address`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    V4,
    V6,
}

/// A syntactically valid host address.
///
/// Equality and hashing follow the canonical form, so `"::0001"` and `"::1"`
/// are the same member of an address set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(IpAddr);

impl Address {
    /// Parse and validate a textual address.
    pub fn parse(input: &str) -> ValidationResult<Self> {
        if input.is_empty() {
            return Err(ValidationError::MissingField("address"));
        }
        input
            .parse::<IpAddr>()
            .map(Self)
            .map_err(|_| ValidationError::InvalidAddress(input.to_string()))
    }

    pub fn family(&self) -> Family {
        match self.0 {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.0
    }

    /// Whether this is a loopback or unspecified address.
    ///
    /// Neither is a meaningful relay backend.
    pub fn is_local(&self) -> bool {
        self.0.is_loopback() || self.0.is_unspecified()
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        Self(ip)
    }
}

impl FromStr for Address {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = ValidationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Address> for String {
    fn from(addr: Address) -> Self {
        addr.to_string()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
