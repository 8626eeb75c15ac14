//! Daemon assembly and start-up sequence.
//!
//! 1. build the packet filter (real or dry-run) and both address sets;
//! 2. apply the firewall baseline; a partial failure is logged and start-up
//!    continues;
//! 3. reload the allowlist snapshot from the kernel and reset the backend
//!    set;
//! 4. start the initial relay, if one is configured; a failure is logged
//!    and the relay can be repointed through the API;
//! 5. serve the control API until shutdown, then stop the relay.

use crate::api::{self, ApiState};
use crate::auth::AuthLimits;
use crate::config::{FilterBackend, RelayMode, ServerConfig};
use crate::error::{PortgateError, PortgateResult};
use crate::firewall::{
    AddressSet, DryRunFilter, FirewallBaseline, FirewallPolicy, IptablesFilter, PacketFilter,
    Protocol, RuleSpec,
};
use crate::gateway::AdmissionGateway;
use crate::relay::{
    EmbeddedLauncher, ProcessLauncher, RelayController, RelayLauncher, RelayOptions, Transports,
};
use portgate_core::Family;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// How often expired rate-limit entries are dropped.
const GC_INTERVAL: Duration = Duration::from_secs(60);

/// Build the start-up rule list from configuration.
pub fn build_baseline(config: &ServerConfig) -> PortgateResult<FirewallBaseline> {
    let fw = &config.firewall;
    let mut builder = FirewallBaseline::builder(fw.chain.clone())
        .with_ipv6(fw.ipv6)
        .set(fw.allowlist_set.clone())
        .rule(RuleSpec::Loopback)
        .rule(RuleSpec::Established);
    if fw.allow_backend {
        builder = builder.set(fw.backend_set.clone());
    }
    if fw.allow_icmp {
        builder = builder.rule(RuleSpec::Icmp {
            limit: fw.icmp_rate.clone(),
        });
    }
    for addr in &fw.static_exempt {
        builder = builder.rule(RuleSpec::ExemptSource(*addr));
    }
    builder = builder.rule(RuleSpec::ControlPort(config.api_listen.port()));
    for protocol in [Protocol::Tcp, Protocol::Udp] {
        builder = builder.rule(RuleSpec::Admission {
            protocol,
            set: fw.allowlist_set.clone(),
            ports: fw.dynamic_ports,
            hardening: fw.hardening(),
        });
    }
    if fw.allow_backend {
        builder = builder.rule(RuleSpec::BackendSource {
            set: fw.backend_set.clone(),
        });
    }
    builder.build()
}

/// The assembled daemon.
pub struct PortgateServer {
    config: Arc<ServerConfig>,
    policy: FirewallPolicy,
    baseline: FirewallBaseline,
    allowlist: Arc<AddressSet>,
    backends: Option<Arc<AddressSet>>,
    relay: Arc<RelayController>,
    gateway: Arc<AdmissionGateway>,
    limits: Arc<Mutex<AuthLimits>>,
}

impl PortgateServer {
    pub fn new(config: ServerConfig) -> PortgateResult<Self> {
        let config = Arc::new(config);
        let filter: Arc<dyn PacketFilter> = match config.filter_backend {
            FilterBackend::Iptables => {
                Arc::new(IptablesFilter::new(config.sudo, config.command_timeout))
            }
            FilterBackend::DryRun => {
                warn!("dry-run: packet filter commands are logged, not executed");
                Arc::new(DryRunFilter::new())
            }
        };

        let mut families = vec![Family::V4];
        if config.firewall.ipv6 {
            families.push(Family::V6);
        }
        let allowlist = Arc::new(AddressSet::new(
            config.firewall.allowlist_set.clone(),
            families.clone(),
            filter.clone(),
        ));
        let backends = config.firewall.allow_backend.then(|| {
            Arc::new(AddressSet::new(
                config.firewall.backend_set.clone(),
                families,
                filter.clone(),
            ))
        });

        let settings = &config.relay;
        let launcher: Arc<dyn RelayLauncher> = match settings.mode {
            RelayMode::Embedded => Arc::new(EmbeddedLauncher::new(RelayOptions {
                bind_ip: settings.bind_address,
                transports: Transports::BOTH,
                udp_idle_timeout: settings.udp_idle_timeout,
                max_udp_sessions: settings.max_udp_sessions,
                gate: settings.enforce_allowlist.then(|| allowlist.clone()),
            })),
            RelayMode::Process => {
                if settings.enforce_allowlist {
                    return Err(PortgateError::Config(
                        "relay.enforce_allowlist requires the embedded relay".into(),
                    ));
                }
                Arc::new(ProcessLauncher::new(
                    settings.binary.clone(),
                    settings.bind_address,
                    settings.udp_idle_timeout,
                    settings.launch_grace,
                ))
            }
        };

        let relay = Arc::new(RelayController::new(
            launcher,
            config.firewall.dynamic_ports,
            backends.clone(),
        ));
        let gateway = Arc::new(AdmissionGateway::new(
            config.credential.clone(),
            allowlist.clone(),
            relay.clone(),
        ));

        Ok(Self {
            baseline: build_baseline(&config)?,
            policy: FirewallPolicy::new(filter),
            limits: Arc::new(Mutex::new(AuthLimits::per_minute(
                config.auth_attempts_per_minute,
            ))),
            config,
            allowlist,
            backends,
            relay,
            gateway,
        })
    }

    /// Bring up firewall and relay state. Only failures that leave the
    /// daemon unable to do its job are returned.
    pub async fn prepare(&self) -> PortgateResult<()> {
        match self.policy.apply(&self.baseline).await {
            Ok(report) => info!(steps = report.steps, "firewall baseline in place"),
            Err(PortgateError::PartialFailure { failed_steps }) => {
                for step in &failed_steps {
                    error!(step = %step.step, stderr = %step.stderr, "baseline step failed");
                }
                error!(failed = failed_steps.len(), "firewall baseline incomplete, continuing");
            }
            Err(e) => return Err(e),
        }

        match self.allowlist.load().await {
            Ok(count) => info!(members = count, "allowlist restored"),
            Err(e) => warn!(
                error = %e,
                "could not read allowlist from packet filter, starting empty"
            ),
        }

        if let Some(backends) = &self.backends {
            if let Err(e) = backends.flush().await {
                warn!(error = %e, "could not reset backend set");
            }
        }

        if let Some(target) = self.config.relay.initial {
            if let Err(e) = self.relay.repoint(target).await {
                error!(
                    target = %target,
                    error = %e,
                    "initial repoint failed, control API stays up"
                );
            }
        }
        Ok(())
    }

    /// Serve the control API until `shutdown` resolves, then stop the relay.
    pub async fn run(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> PortgateResult<()> {
        let listener = TcpListener::bind(self.config.api_listen).await?;

        let gc_limits = self.limits.clone();
        let gc_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(GC_INTERVAL);
            loop {
                interval.tick().await;
                gc_limits.lock().await.gc();
            }
        });

        let state = ApiState::new(self.gateway.clone(), self.limits.clone());
        let served = api::serve(listener, state, shutdown).await;
        gc_task.abort();

        if let Err(e) = self.relay.shutdown().await {
            warn!(error = %e, "relay did not stop cleanly");
        }
        served?;
        info!("portgate stopped");
        Ok(())
    }
}
