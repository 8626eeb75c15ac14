//! Relay module: the TCP/UDP data plane and the controller that repoints it.
//!
//! # Submodule Architecture
//!
//! - **[`forwarder`]**: [`RelayInstance`], the in-process data plane bound
//!   to one port and forwarding to one backend.
//! - **[`launcher`]**: the [`RelayLauncher`] seam: [`EmbeddedLauncher`]
//!   runs a `RelayInstance` on the daemon's runtime, [`ProcessLauncher`]
//!   runs `portgate relay` as a child process.
//! - **[`controller`]**: [`RelayController`], the single active relay and
//!   the make-before-break repoint procedure.

pub mod controller;
pub mod forwarder;
pub mod launcher;

pub use controller::{RelayController, RelayStatus};
pub use forwarder::{RelayInstance, RelayOptions, Transports};
pub use launcher::{EmbeddedLauncher, ProcessLauncher, RelayHandle, RelayLauncher};
