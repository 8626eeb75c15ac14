//! portgate-core: shared domain types for the portgate control daemon.
//!
//! Provides validated host addresses, relay targets with their dynamic port
//! range, the shared-secret credential, and the validation error taxonomy.
//! Nothing in this crate performs I/O.

pub mod address;
pub mod credential;
pub mod error;
pub mod target;

// Re-export commonly used items at crate root.
pub use address::{Address, Family};
pub use credential::Credential;
pub use error::{ValidationError, ValidationResult};
pub use target::{parse_port, port_from_u64, PortRange, RelayTarget};
