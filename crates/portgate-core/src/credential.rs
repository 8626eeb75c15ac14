//! Shared-secret credential for mutating control requests.
//!
//! The daemon holds exactly one [`Credential`], loaded at start-up. Every
//! mutating request presents a key that is compared against it in constant
//! time, so response timing does not reveal how much of a guess was right.

use std::fmt;
use subtle::ConstantTimeEq;

/// The process-wide control secret.
#[derive(Clone)]
pub struct Credential(String);

impl Credential {
    /// Wrap a secret. Returns `None` for an empty secret, which would
    /// otherwise authorize any request carrying an empty key.
    pub fn new(secret: impl Into<String>) -> Option<Self> {
        let secret = secret.into();
        if secret.is_empty() {
            None
        } else {
            Some(Self(secret))
        }
    }

    /// Check a presented key against the secret.
    pub fn verify(&self, presented: &str) -> bool {
        constant_time_eq(presented.as_bytes(), self.0.as_bytes())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Constant-time byte comparison.
///
/// Length mismatch returns early; only the secret's length can leak.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_exact_match_only() {
        let cred = Credential::new("afterlife").unwrap();
        assert!(cred.verify("afterlife"));
        assert!(!cred.verify("afterlif"));
        assert!(!cred.verify("afterlifE"));
        assert!(!cred.verify("afterlife "));
        assert!(!cred.verify(""));
    }

    #[test]
    fn empty_secret_rejected() {
        assert!(Credential::new("").is_none());
    }

    #[test]
    fn debug_does_not_leak() {
        let cred = Credential::new("hunter2").unwrap();
        assert!(!format!("{cred:?}").contains("hunter2"));
    }
}
