//! Single active relay with live repointing.
//!
//! [`RelayController`] owns at most one running [`RelayHandle`]. A repoint to
//! a different bind port is make-before-break: the new relay is confirmed
//! running before the old one is stopped, so a failed start leaves traffic
//! untouched. A repoint that keeps the bind port cannot hold the port twice;
//! the old relay is stopped, the new one started, and on failure the
//! previous target is relaunched.

use super::launcher::{RelayHandle, RelayLauncher};
use crate::error::PortgateResult;
use crate::firewall::AddressSet;
use portgate_core::{PortRange, RelayTarget};
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Snapshot of the relay for the status API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayStatus {
    pub target: Option<RelayTarget>,
    pub alive: bool,
    pub uptime_secs: Option<u64>,
    pub tcp_active: Option<usize>,
    pub udp_sessions: Option<usize>,
    /// A repoint was in progress when the snapshot was taken.
    pub transitioning: bool,
}

pub struct RelayController {
    launcher: Arc<dyn RelayLauncher>,
    bind_range: PortRange,
    /// Backend allowlist kept in step with the active target, if enabled.
    backends: Option<Arc<AddressSet>>,
    active: Mutex<Option<RelayHandle>>,
    /// Last confirmed target; readable while a repoint holds `active`.
    current: RwLock<Option<RelayTarget>>,
}

impl RelayController {
    pub fn new(
        launcher: Arc<dyn RelayLauncher>,
        bind_range: PortRange,
        backends: Option<Arc<AddressSet>>,
    ) -> Self {
        Self {
            launcher,
            bind_range,
            backends,
            active: Mutex::new(None),
            current: RwLock::new(None),
        }
    }

    pub fn bind_range(&self) -> PortRange {
        self.bind_range
    }

    /// Point the relay at `target` and return the target now in effect.
    pub async fn repoint(&self, target: RelayTarget) -> PortgateResult<RelayTarget> {
        target.validate(&self.bind_range)?;
        let mut active = self.active.lock().await;

        if let Some(handle) = active.as_ref() {
            if handle.target() == target && handle.is_alive() {
                debug!(target = %target, "relay already on target");
                // A previous reconcile for this target may have failed.
                self.reconcile_backends(target).await?;
                return Ok(target);
            }
        }

        match active.take() {
            None => {
                *active = Some(self.launcher.start(target).await?);
            }
            Some(old) if old.target().bind_port != target.bind_port => {
                let previous = old.target();
                match self.launcher.start(target).await {
                    Ok(new) => {
                        *active = Some(new);
                        self.publish(Some(target));
                        if let Err(e) = self.launcher.stop(old).await {
                            warn!(target = %previous, error = %e, "old relay did not stop cleanly");
                        }
                    }
                    Err(e) => {
                        *active = Some(old);
                        warn!(
                            from = %previous,
                            to = %target,
                            error = %e,
                            "repoint failed, old relay kept"
                        );
                        return Err(e);
                    }
                }
            }
            Some(old) => {
                let previous = old.target();
                if let Err(e) = self.launcher.stop(old).await {
                    warn!(target = %previous, error = %e, "old relay did not stop cleanly");
                }
                match self.launcher.start(target).await {
                    Ok(new) => *active = Some(new),
                    Err(e) => {
                        warn!(
                            from = %previous,
                            to = %target,
                            error = %e,
                            "repoint failed, rolling back"
                        );
                        match self.launcher.start(previous).await {
                            Ok(restored) => {
                                *active = Some(restored);
                                self.publish(Some(previous));
                            }
                            Err(re) => {
                                error!(
                                    target = %previous,
                                    error = %re,
                                    "rollback failed, relay is down"
                                );
                                self.publish(None);
                            }
                        }
                        return Err(e);
                    }
                }
            }
        }

        self.publish(Some(target));
        info!(target = %target, "relay repointed");
        self.reconcile_backends(target).await?;
        Ok(target)
    }

    /// Admit the new backend, then drop every other member.
    async fn reconcile_backends(&self, target: RelayTarget) -> PortgateResult<()> {
        let Some(set) = &self.backends else {
            return Ok(());
        };
        let backend = target.backend_address;
        if !set.accepts(backend.family()) {
            warn!(
                set = %set.name(),
                backend = %backend,
                "backend family not enabled, not allowlisted"
            );
        } else {
            set.add(backend).await?;
        }
        for stale in set.members().into_iter().filter(|a| *a != backend) {
            set.remove(stale).await?;
        }
        Ok(())
    }

    /// Target of the running relay, if any.
    pub fn active(&self) -> Option<RelayTarget> {
        *self.current.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> RelayStatus {
        match self.active.try_lock() {
            Ok(guard) => match guard.as_ref() {
                Some(handle) => {
                    let sessions = handle.sessions();
                    RelayStatus {
                        target: Some(handle.target()),
                        alive: handle.is_alive(),
                        uptime_secs: Some(handle.uptime().as_secs()),
                        tcp_active: sessions.map(|s| s.tcp_active),
                        udp_sessions: sessions.map(|s| s.udp_sessions),
                        transitioning: false,
                    }
                }
                None => RelayStatus {
                    target: None,
                    alive: false,
                    uptime_secs: None,
                    tcp_active: None,
                    udp_sessions: None,
                    transitioning: false,
                },
            },
            Err(_) => {
                let target = self.active();
                RelayStatus {
                    target,
                    alive: target.is_some(),
                    uptime_secs: None,
                    tcp_active: None,
                    udp_sessions: None,
                    transitioning: true,
                }
            }
        }
    }

    /// Stop the active relay, if any.
    pub async fn shutdown(&self) -> PortgateResult<()> {
        let mut active = self.active.lock().await;
        self.publish(None);
        match active.take() {
            Some(handle) => self.launcher.stop(handle).await,
            None => Ok(()),
        }
    }

    fn publish(&self, target: Option<RelayTarget>) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = target;
    }
}
