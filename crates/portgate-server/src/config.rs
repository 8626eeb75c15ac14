//! Daemon configuration: TOML file + CLI overrides.

use crate::error::{PortgateError, PortgateResult};
use crate::firewall::{Hardening, HashLimit};
use portgate_core::{Address, Credential, PortRange, RelayTarget};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Default location of the config file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/portgate/portgate.toml";

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub api: ApiSection,
    #[serde(default)]
    pub firewall: FirewallSection,
    #[serde(default)]
    pub packet_filter: PacketFilterSection,
    #[serde(default)]
    pub relay: RelaySection,
}

/// `[api]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiSection {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_auth_attempts")]
    pub auth_attempts_per_minute: u32,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            secret: None,
            auth_attempts_per_minute: default_auth_attempts(),
        }
    }
}

/// `[firewall]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct FirewallSection {
    #[serde(default = "default_chain")]
    pub chain: String,
    #[serde(default = "default_allowlist_set")]
    pub allowlist_set: String,
    #[serde(default = "default_backend_set")]
    pub backend_set: String,
    #[serde(default)]
    pub dynamic_ports: PortRange,
    /// Sources accepted regardless of the allowlist.
    #[serde(default)]
    pub static_exempt: Vec<Address>,
    #[serde(default = "default_true")]
    pub allow_icmp: bool,
    #[serde(default = "default_icmp_rate")]
    pub icmp_rate: Option<String>,
    #[serde(default)]
    pub hashlimit: Option<HashLimit>,
    #[serde(default)]
    pub connlimit: Option<u32>,
    #[serde(default)]
    pub ipv6: bool,
    #[serde(default = "default_true")]
    pub allow_backend: bool,
}

impl Default for FirewallSection {
    fn default() -> Self {
        Self {
            chain: default_chain(),
            allowlist_set: default_allowlist_set(),
            backend_set: default_backend_set(),
            dynamic_ports: PortRange::default(),
            static_exempt: Vec::new(),
            allow_icmp: true,
            icmp_rate: default_icmp_rate(),
            hashlimit: None,
            connlimit: None,
            ipv6: false,
            allow_backend: true,
        }
    }
}

impl FirewallSection {
    pub fn hardening(&self) -> Hardening {
        Hardening {
            hashlimit: self.hashlimit.clone(),
            connlimit: self.connlimit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterBackend {
    #[default]
    Iptables,
    DryRun,
}

/// `[packet_filter]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct PacketFilterSection {
    #[serde(default)]
    pub backend: FilterBackend,
    #[serde(default)]
    pub sudo: bool,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

impl Default for PacketFilterSection {
    fn default() -> Self {
        Self {
            backend: FilterBackend::default(),
            sudo: false,
            command_timeout_secs: default_command_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    #[default]
    Embedded,
    Process,
}

/// `[relay.initial]`: the target started at boot.
#[derive(Debug, Clone, Deserialize)]
pub struct InitialTarget {
    pub bind_port: u16,
    pub backend_ip: Address,
    pub backend_port: u16,
}

/// `[relay]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RelaySection {
    #[serde(default)]
    pub mode: RelayMode,
    /// Executable run by the process launcher; defaults to this binary.
    #[serde(default)]
    pub binary: Option<String>,
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    #[serde(default = "default_launch_grace")]
    pub launch_grace_ms: u64,
    #[serde(default = "default_udp_idle_timeout")]
    pub udp_idle_timeout_secs: u64,
    #[serde(default = "default_max_udp_sessions")]
    pub max_udp_sessions: usize,
    #[serde(default)]
    pub enforce_allowlist: bool,
    #[serde(default)]
    pub initial: Option<InitialTarget>,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            mode: RelayMode::default(),
            binary: None,
            bind_address: default_bind_address(),
            launch_grace_ms: default_launch_grace(),
            udp_idle_timeout_secs: default_udp_idle_timeout(),
            max_udp_sessions: default_max_udp_sessions(),
            enforce_allowlist: false,
            initial: None,
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8080)
}
fn default_auth_attempts() -> u32 {
    5
}
fn default_chain() -> String {
    "PORTGATE".to_string()
}
fn default_allowlist_set() -> String {
    "portgate-allow".to_string()
}
fn default_backend_set() -> String {
    "portgate-backend".to_string()
}
fn default_icmp_rate() -> Option<String> {
    Some("5/second".to_string())
}
fn default_command_timeout() -> u64 {
    10
}
fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_launch_grace() -> u64 {
    300
}
fn default_udp_idle_timeout() -> u64 {
    15
}
fn default_max_udp_sessions() -> usize {
    200
}
fn default_true() -> bool {
    true
}

/// Resolved relay settings.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub mode: RelayMode,
    pub binary: PathBuf,
    pub bind_address: IpAddr,
    pub launch_grace: Duration,
    pub udp_idle_timeout: Duration,
    pub max_udp_sessions: usize,
    pub enforce_allowlist: bool,
    pub initial: Option<RelayTarget>,
}

/// Resolved daemon configuration (CLI overrides applied, values checked).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub api_listen: SocketAddr,
    pub credential: Credential,
    pub auth_attempts_per_minute: u32,
    pub firewall: FirewallSection,
    pub filter_backend: FilterBackend,
    pub sudo: bool,
    pub command_timeout: Duration,
    pub relay: RelaySettings,
}

impl ServerConfig {
    /// Load config from the TOML file, then apply CLI overrides.
    ///
    /// A missing file means defaults; the secret has no default and must
    /// come from the file, `--secret`, or `PORTGATE_SECRET`.
    pub fn load(
        config_path: Option<&Path>,
        cli_listen: Option<SocketAddr>,
        cli_secret: Option<&str>,
        cli_dry_run: bool,
    ) -> PortgateResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| PortgateError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file_config, cli_listen, cli_secret, cli_dry_run)
    }

    fn resolve(
        file: ConfigFile,
        cli_listen: Option<SocketAddr>,
        cli_secret: Option<&str>,
        cli_dry_run: bool,
    ) -> PortgateResult<Self> {
        let secret = cli_secret
            .map(str::to_string)
            .or(file.api.secret)
            .unwrap_or_default();
        let credential = Credential::new(secret).ok_or_else(|| {
            PortgateError::Config(
                "api secret is not set (use [api] secret or PORTGATE_SECRET)".into(),
            )
        })?;

        if file.api.auth_attempts_per_minute == 0 {
            return Err(PortgateError::Config("auth_attempts_per_minute must be at least 1".into()));
        }
        if file.relay.max_udp_sessions == 0 {
            return Err(PortgateError::Config("max_udp_sessions must be at least 1".into()));
        }
        if !file.firewall.ipv6 {
            let v6 = file
                .firewall
                .static_exempt
                .iter()
                .find(|a| a.family() == portgate_core::Family::V6);
            if let Some(addr) = v6 {
                return Err(PortgateError::Config(format!(
                    "static exempt address {addr} requires firewall.ipv6"
                )));
            }
        }

        let initial = match &file.relay.initial {
            Some(t) => Some(
                RelayTarget::new(
                    t.bind_port,
                    t.backend_ip,
                    t.backend_port,
                    &file.firewall.dynamic_ports,
                )
                .map_err(|e| PortgateError::Config(format!("relay.initial: {e}")))?,
            ),
            None => None,
        };

        let binary = match &file.relay.binary {
            Some(path) => expand_tilde_str(path),
            None => std::env::current_exe().unwrap_or_else(|_| PathBuf::from("portgate")),
        };

        let filter_backend = if cli_dry_run {
            FilterBackend::DryRun
        } else {
            file.packet_filter.backend
        };

        Ok(Self {
            api_listen: cli_listen.unwrap_or(file.api.listen),
            credential,
            auth_attempts_per_minute: file.api.auth_attempts_per_minute,
            filter_backend,
            sudo: file.packet_filter.sudo,
            command_timeout: Duration::from_secs(file.packet_filter.command_timeout_secs.max(1)),
            relay: RelaySettings {
                mode: file.relay.mode,
                binary,
                bind_address: file.relay.bind_address,
                launch_grace: Duration::from_millis(file.relay.launch_grace_ms),
                udp_idle_timeout: Duration::from_secs(file.relay.udp_idle_timeout_secs.max(1)),
                max_udp_sessions: file.relay.max_udp_sessions,
                enforce_allowlist: file.relay.enforce_allowlist,
                initial,
            },
            firewall: file.firewall,
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
