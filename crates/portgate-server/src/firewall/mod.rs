//! Firewall module: packet-filter backends, the allowlist address sets,
//! and the start-up rule baseline.
//!
//! # Submodule Architecture
//!
//! - **[`filter`]**: the [`PacketFilter`] trait and its two backends:
//!   [`IptablesFilter`] (runs `ipset` / `iptables` / `ip6tables`) and
//!   [`DryRunFilter`] (logs the same command lines without running them).
//!
//! - **[`address_set`]**: [`AddressSet`], an ipset mirrored into a local
//!   snapshot so membership checks never hit the kernel.
//!
//! - **[`baseline`]**: [`FirewallBaseline`] (ordered rule list ending in
//!   default deny) and [`FirewallPolicy`], which installs it best-effort.
//!
//! # Data Flow
//!
//! ```text
//! start-up
//!   → FirewallPolicy::apply(baseline)
//!       → PacketFilter::ensure_set / ensure_chain / flush_chain
//!       → PacketFilter::install_rule (loopback … admission … DROP)
//!       → PacketFilter::ensure_jump (INPUT → chain)
//! control request
//!   → AdmissionGateway
//!       → AddressSet::add / remove / flush → PacketFilter::*_set
//! relay accept
//!   → AddressSet::contains (snapshot only)
//! ```

pub mod address_set;
pub mod baseline;
pub mod filter;

pub use address_set::AddressSet;
pub use baseline::{FirewallBaseline, FirewallPolicy, Hardening, HashLimit, Protocol, RuleSpec};
pub use filter::{DryRunFilter, IptablesFilter, PacketFilter};
