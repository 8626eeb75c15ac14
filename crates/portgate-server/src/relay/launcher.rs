//! Relay launchers: how a [`RelayTarget`] becomes a running data plane.
//!
//! - [`EmbeddedLauncher`] runs [`RelayInstance`] inside the daemon. A start
//!   is confirmed once both sockets are bound.
//! - [`ProcessLauncher`] spawns `portgate relay …` as a child process. A
//!   start is confirmed when the child is still running after a grace
//!   period; a bind failure makes the child exit inside that window.

use super::forwarder::{RelayInstance, RelayOptions};
use crate::error::{PortgateError, PortgateResult};
use portgate_core::RelayTarget;
use serde::Serialize;
use std::future::Future;
use std::net::IpAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tracing::{info, warn};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Live session counts, when the data plane can report them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionCounts {
    pub tcp_active: usize,
    pub udp_sessions: usize,
}

/// A launched data plane.
pub trait RelayProcess: Send + Sync {
    fn is_alive(&self) -> bool;

    fn sessions(&self) -> Option<SessionCounts>;

    /// Stop the data plane. Already-stopped is success.
    fn stop(self: Box<Self>) -> BoxFuture<'static, PortgateResult<()>>;
}

/// Handle to a running relay, returned by [`RelayLauncher::start`].
pub struct RelayHandle {
    target: RelayTarget,
    launched_at: Instant,
    process: Box<dyn RelayProcess>,
}

impl RelayHandle {
    pub fn new(target: RelayTarget, process: Box<dyn RelayProcess>) -> Self {
        Self {
            target,
            launched_at: Instant::now(),
            process,
        }
    }

    pub fn target(&self) -> RelayTarget {
        self.target
    }

    pub fn uptime(&self) -> Duration {
        self.launched_at.elapsed()
    }

    pub fn is_alive(&self) -> bool {
        self.process.is_alive()
    }

    pub fn sessions(&self) -> Option<SessionCounts> {
        self.process.sessions()
    }
}

/// Starts and stops relay data planes.
pub trait RelayLauncher: Send + Sync {
    /// Start forwarding `target.bind_port` to the backend.
    ///
    /// Resolves only once the new relay is confirmed running; otherwise
    /// fails with [`PortgateError::RelayStart`].
    fn start(&self, target: RelayTarget) -> BoxFuture<'_, PortgateResult<RelayHandle>>;

    fn stop(&self, handle: RelayHandle) -> BoxFuture<'_, PortgateResult<()>> {
        let target = handle.target;
        Box::pin(async move {
            handle.process.stop().await?;
            info!(target = %target, "relay instance stopped");
            Ok(())
        })
    }
}

// ── Embedded ─────────────────────────────────────────────────────────

/// Runs the relay on the daemon's own runtime.
pub struct EmbeddedLauncher {
    options: RelayOptions,
}

impl EmbeddedLauncher {
    pub fn new(options: RelayOptions) -> Self {
        Self { options }
    }
}

impl RelayProcess for RelayInstance {
    fn is_alive(&self) -> bool {
        RelayInstance::is_alive(self)
    }

    fn sessions(&self) -> Option<SessionCounts> {
        Some(SessionCounts {
            tcp_active: self.stats().tcp_active(),
            udp_sessions: self.stats().udp_sessions(),
        })
    }

    fn stop(self: Box<Self>) -> BoxFuture<'static, PortgateResult<()>> {
        Box::pin(async move {
            RelayInstance::stop(*self).await;
            Ok(())
        })
    }
}

impl RelayLauncher for EmbeddedLauncher {
    fn start(&self, target: RelayTarget) -> BoxFuture<'_, PortgateResult<RelayHandle>> {
        Box::pin(async move {
            let instance = RelayInstance::start(target, self.options.clone())
                .await
                .map_err(|e| PortgateError::RelayStart {
                    target,
                    reason: e.to_string(),
                })?;
            info!(target = %target, "embedded relay started");
            Ok(RelayHandle::new(target, Box::new(instance)))
        })
    }
}

// ── Child process ────────────────────────────────────────────────────

/// Runs each relay as `<binary> relay --listen … --remote …`.
pub struct ProcessLauncher {
    binary: PathBuf,
    bind_ip: IpAddr,
    udp_idle_timeout: Duration,
    grace: Duration,
}

impl ProcessLauncher {
    pub fn new(
        binary: PathBuf,
        bind_ip: IpAddr,
        udp_idle_timeout: Duration,
        grace: Duration,
    ) -> Self {
        Self {
            binary,
            bind_ip,
            udp_idle_timeout,
            grace,
        }
    }

    fn command(&self, target: &RelayTarget) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("relay")
            .arg("--listen")
            .arg(target.bind_port.to_string())
            .arg("--remote")
            .arg(target.backend_socket().to_string())
            .arg("--bind")
            .arg(self.bind_ip.to_string())
            .arg("--udp-timeout")
            .arg(self.udp_idle_timeout.as_secs().max(1).to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

impl RelayLauncher for ProcessLauncher {
    fn start(&self, target: RelayTarget) -> BoxFuture<'_, PortgateResult<RelayHandle>> {
        Box::pin(async move {
            let fail = |reason: String| PortgateError::RelayStart { target, reason };
            let mut child = self
                .command(&target)
                .spawn()
                .map_err(|e| fail(format!("spawn {}: {e}", self.binary.display())))?;

            tokio::time::sleep(self.grace).await;
            if let Some(status) = child.try_wait().map_err(|e| fail(e.to_string()))? {
                return Err(fail(format!("relay process exited during start-up ({status})")));
            }

            info!(target = %target, pid = ?child.id(), "relay process started");
            Ok(RelayHandle::new(
                target,
                Box::new(ChildRelay {
                    child: Mutex::new(child),
                }),
            ))
        })
    }
}

/// Time a relay child gets to exit after SIGTERM before it is killed.
const TERM_GRACE: Duration = Duration::from_secs(3);

struct ChildRelay {
    child: Mutex<Child>,
}

impl RelayProcess for ChildRelay {
    fn is_alive(&self) -> bool {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        matches!(child.try_wait(), Ok(None))
    }

    fn sessions(&self) -> Option<SessionCounts> {
        None
    }

    fn stop(self: Box<Self>) -> BoxFuture<'static, PortgateResult<()>> {
        let mut child = self.child.into_inner().unwrap_or_else(PoisonError::into_inner);
        Box::pin(async move {
            if child.try_wait()?.is_some() {
                return Ok(());
            }
            if let Some(pid) = child.id() {
                terminate(pid)?;
            }
            match tokio::time::timeout(TERM_GRACE, child.wait()).await {
                Ok(result) => {
                    result?;
                }
                Err(_) => {
                    warn!("relay process ignored SIGTERM, killing");
                    child.kill().await?;
                }
            }
            Ok(())
        })
    }
}

/// Send SIGTERM to `pid`. A process that is already gone counts as stopped.
#[cfg(unix)]
fn terminate(pid: u32) -> PortgateResult<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)
        .map_err(|_| PortgateError::Internal(format!("pid {pid} out of range")))?;
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(std::io::Error::from(errno).into()),
    }
}

#[cfg(not(unix))]
fn terminate(_pid: u32) -> PortgateResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use portgate_core::Address;
    use std::net::Ipv4Addr;

    fn target(bind_port: u16) -> RelayTarget {
        RelayTarget {
            bind_port,
            backend_address: Address::parse("2001:db8::7").unwrap(),
            backend_port: 30120,
        }
    }

    #[test]
    fn process_command_line() {
        let launcher = ProcessLauncher::new(
            PathBuf::from("/usr/local/bin/portgate"),
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Duration::from_secs(15),
            Duration::from_millis(200),
        );
        let cmd = launcher.command(&target(30000));
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            [
                "relay",
                "--listen",
                "30000",
                "--remote",
                "[2001:db8::7]:30120",
                "--bind",
                "0.0.0.0",
                "--udp-timeout",
                "15"
            ]
        );
    }

    #[tokio::test]
    async fn process_spawn_failure_is_relay_start() {
        let launcher = ProcessLauncher::new(
            PathBuf::from("/nonexistent/portgate"),
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Duration::from_secs(15),
            Duration::from_millis(10),
        );
        let err = launcher.start(target(30000)).await.err().unwrap();
        assert!(matches!(err, PortgateError::RelayStart { .. }));
    }

    #[tokio::test]
    async fn embedded_bind_conflict_is_relay_start() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let launcher = EmbeddedLauncher::new(RelayOptions {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..RelayOptions::default()
        });
        let t = RelayTarget {
            bind_port: port,
            backend_address: Address::parse("127.0.0.1").unwrap(),
            backend_port: 9,
        };
        let err = launcher.start(t).await.err().unwrap();
        assert!(matches!(err, PortgateError::RelayStart { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn child_stops_on_sigterm() {
        let child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let relay = Box::new(ChildRelay {
            child: Mutex::new(child),
        });
        assert!(relay.is_alive());

        let started = Instant::now();
        relay.stop().await.unwrap();
        assert!(started.elapsed() < TERM_GRACE);
    }

    #[cfg(unix)]
    #[test]
    fn terminate_missing_process_is_ok() {
        // Above the kernel's pid_max, so no such process can exist.
        terminate(i32::MAX as u32).unwrap();
    }
}
