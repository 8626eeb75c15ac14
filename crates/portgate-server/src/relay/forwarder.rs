//! In-process TCP/UDP relay data plane.
//!
//! A [`RelayInstance`] binds `bind_ip:bind_port` for TCP and UDP and forwards
//! traffic to one backend:
//!
//! - **TCP**: an accept loop spawns one task per client that connects to the
//!   backend and copies bytes in both directions until either side closes.
//! - **UDP**: one listening socket; each client address gets a session with
//!   its own connected upstream socket, so backend replies are routed back
//!   to the right client. Sessions idle for longer than the configured
//!   timeout are evicted.
//!
//! Every task watches a shared `watch` shutdown channel. [`RelayInstance::stop`]
//! signals it and waits for the listeners to be dropped, so the port is free
//! again once `stop` returns.

use crate::firewall::AddressSet;
use portgate_core::{Address, RelayTarget};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Upper bound on backend connect time for a single TCP client.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Maximum UDP datagram size.
const UDP_BUFFER: usize = 65536;
/// How long `stop` waits for a task before aborting it.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Which transports a relay instance serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transports {
    pub tcp: bool,
    pub udp: bool,
}

impl Transports {
    pub const BOTH: Self = Self { tcp: true, udp: true };
}

/// Tunables for a relay instance.
#[derive(Clone)]
pub struct RelayOptions {
    /// Local address to bind (`0.0.0.0` in production).
    pub bind_ip: IpAddr,
    pub transports: Transports,
    pub udp_idle_timeout: Duration,
    pub max_udp_sessions: usize,
    /// When set, only sources contained in this set are relayed.
    pub gate: Option<Arc<AddressSet>>,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            transports: Transports::BOTH,
            udp_idle_timeout: Duration::from_secs(15),
            max_udp_sessions: 200,
            gate: None,
        }
    }
}

impl RelayOptions {
    fn admits(&self, peer: &SocketAddr) -> bool {
        match &self.gate {
            Some(set) => set.contains(&Address::from(peer.ip())),
            None => true,
        }
    }
}

/// Live session counters for a relay instance.
#[derive(Debug, Default)]
pub struct RelayStats {
    tcp_active: Arc<AtomicUsize>,
    udp_sessions: AtomicUsize,
}

impl RelayStats {
    pub fn tcp_active(&self) -> usize {
        self.tcp_active.load(Ordering::Relaxed)
    }

    pub fn udp_sessions(&self) -> usize {
        self.udp_sessions.load(Ordering::Relaxed)
    }

    /// Count a TCP connection until the returned guard is dropped.
    fn acquire_tcp(&self) -> ConnectionGuard {
        self.tcp_active.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            counter: self.tcp_active.clone(),
        }
    }
}

/// RAII guard that decrements the TCP connection count on drop.
/// Owns an `Arc<AtomicUsize>` so it can be moved into spawned tasks.
struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A running relay bound to one port and forwarding to one backend.
pub struct RelayInstance {
    target: RelayTarget,
    local_tcp: Option<SocketAddr>,
    local_udp: Option<SocketAddr>,
    stats: Arc<RelayStats>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayInstance {
    /// Bind the enabled transports and start forwarding.
    ///
    /// Returns only after every socket is bound; a bind failure on either
    /// transport releases whatever was already bound.
    pub async fn start(target: RelayTarget, options: RelayOptions) -> io::Result<Self> {
        let bind = SocketAddr::new(options.bind_ip, target.bind_port);
        let tcp = if options.transports.tcp {
            Some(TcpListener::bind(bind).await?)
        } else {
            None
        };
        let udp = if options.transports.udp {
            Some(UdpSocket::bind(bind).await?)
        } else {
            None
        };

        let local_tcp = tcp.as_ref().map(|l| l.local_addr()).transpose()?;
        let local_udp = udp.as_ref().map(|s| s.local_addr()).transpose()?;
        let stats = Arc::new(RelayStats::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let backend = target.backend_socket();
        let options = Arc::new(options);
        let mut tasks = Vec::new();

        if let Some(listener) = tcp {
            info!(bind = %bind, backend = %backend, "TCP relay listening");
            tasks.push(tokio::spawn(accept_loop(
                listener,
                backend,
                options.clone(),
                stats.clone(),
                shutdown_rx.clone(),
            )));
        }
        if let Some(socket) = udp {
            info!(bind = %bind, backend = %backend, "UDP relay listening");
            tasks.push(tokio::spawn(udp_loop(
                Arc::new(socket),
                backend,
                options.clone(),
                stats.clone(),
                shutdown_rx,
            )));
        }

        Ok(Self {
            target,
            local_tcp,
            local_udp,
            stats,
            shutdown_tx,
            tasks,
        })
    }

    pub fn target(&self) -> RelayTarget {
        self.target
    }

    pub fn local_tcp_addr(&self) -> Option<SocketAddr> {
        self.local_tcp
    }

    pub fn local_udp_addr(&self) -> Option<SocketAddr> {
        self.local_udp
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    /// `true` while every listener task is still running.
    pub fn is_alive(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.iter().all(|t| !t.is_finished())
    }

    /// Wait until any listener task ends (used by the standalone relay).
    pub async fn closed(&self) {
        while self.is_alive() {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    /// Stop forwarding, close live sessions, and release the port.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        for mut task in self.tasks {
            if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
                warn!(target = %self.target, "relay task did not stop in time, aborting");
                task.abort();
                let _ = task.await;
            }
        }
        info!(target = %self.target, "relay stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    backend: SocketAddr,
    options: Arc<RelayOptions>,
    stats: Arc<RelayStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!("TCP accept loop cancelled");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        if !options.admits(&peer) {
                            debug!(peer = %peer, "TCP client not in allowlist, dropped");
                            continue;
                        }
                        let guard = stats.acquire_tcp();
                        info!(
                            peer = %peer.ip(),
                            active = stats.tcp_active(),
                            "TCP client connected"
                        );
                        let stats = stats.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            let _guard = guard;
                            tcp_session(stream, peer, backend, shutdown).await;
                            drop(_guard);
                            info!(
                                peer = %peer.ip(),
                                active = stats.tcp_active(),
                                "TCP client disconnected"
                            );
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "TCP accept failed");
                    }
                }
            }
        }
    }
}

/// Bidirectional TCP copy between one client and the backend.
async fn tcp_session(
    mut client: TcpStream,
    peer: SocketAddr,
    backend: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    let connect = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(backend));
    let mut upstream = match connect.await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(peer = %peer, backend = %backend, error = %e, "backend connect failed");
            return;
        }
        Err(_) => {
            warn!(peer = %peer, backend = %backend, "backend connect timed out");
            return;
        }
    };

    tokio::select! {
        _ = shutdown.changed() => {
            debug!(peer = %peer, "TCP session cancelled");
        }
        result = tokio::io::copy_bidirectional(&mut client, &mut upstream) => {
            match result {
                Ok((up, down)) => debug!(peer = %peer, up, down, "TCP session closed"),
                Err(e) => debug!(peer = %peer, error = %e, "TCP session ended with error"),
            }
        }
    }
}

/// Last-activity clock shared between the UDP loop and a session's reply task.
struct Activity {
    base: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            base: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let ms = self.base.elapsed().as_millis() as u64;
        self.last_ms.store(ms, Ordering::Relaxed);
    }

    fn idle(&self) -> Duration {
        let now = self.base.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_ms.load(Ordering::Relaxed)))
    }
}

struct UdpSession {
    upstream: Arc<UdpSocket>,
    activity: Arc<Activity>,
    reply_task: JoinHandle<()>,
}

async fn udp_loop(
    socket: Arc<UdpSocket>,
    backend: SocketAddr,
    options: Arc<RelayOptions>,
    stats: Arc<RelayStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sessions: HashMap<SocketAddr, UdpSession> = HashMap::new();
    let mut buf = vec![0u8; UDP_BUFFER];
    let sweep_every = (options.udp_idle_timeout / 2).max(Duration::from_millis(100));
    let mut sweep = tokio::time::interval(sweep_every);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!("UDP relay cancelled");
                break;
            }
            _ = sweep.tick() => {
                sessions.retain(|peer, session| {
                    if session.activity.idle() > options.udp_idle_timeout {
                        session.reply_task.abort();
                        info!(peer = %peer.ip(), "UDP client idle, session closed");
                        false
                    } else {
                        true
                    }
                });
                stats.udp_sessions.store(sessions.len(), Ordering::Relaxed);
            }
            result = socket.recv_from(&mut buf) => {
                let (n, peer) = match result {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "UDP recv failed");
                        continue;
                    }
                };
                if !options.admits(&peer) {
                    debug!(peer = %peer, "UDP client not in allowlist, dropped");
                    continue;
                }
                if !sessions.contains_key(&peer) {
                    if sessions.len() >= options.max_udp_sessions {
                        debug!(
                            peer = %peer,
                            max = options.max_udp_sessions,
                            "UDP session limit reached, dropped"
                        );
                        continue;
                    }
                    match open_udp_session(socket.clone(), peer, backend).await {
                        Ok(session) => {
                            sessions.insert(peer, session);
                            stats.udp_sessions.store(sessions.len(), Ordering::Relaxed);
                            info!(
                                peer = %peer.ip(),
                                active = sessions.len(),
                                "UDP client connected"
                            );
                        }
                        Err(e) => {
                            warn!(
                                peer = %peer,
                                backend = %backend,
                                error = %e,
                                "UDP upstream setup failed"
                            );
                            continue;
                        }
                    }
                }
                if let Some(session) = sessions.get(&peer) {
                    match session.upstream.send(&buf[..n]).await {
                        Ok(_) => session.activity.touch(),
                        Err(e) => debug!(peer = %peer, error = %e, "UDP send to backend failed"),
                    }
                }
            }
        }
    }

    // Reply tasks hold a clone of the listening socket; wait for them so the
    // port is released when this loop returns.
    for (_, session) in sessions.drain() {
        session.reply_task.abort();
        let _ = session.reply_task.await;
    }
    stats.udp_sessions.store(0, Ordering::Relaxed);
}

async fn open_udp_session(
    listen: Arc<UdpSocket>,
    peer: SocketAddr,
    backend: SocketAddr,
) -> io::Result<UdpSession> {
    let local: SocketAddr = match backend {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let upstream = UdpSocket::bind(local).await?;
    upstream.connect(backend).await?;
    let upstream = Arc::new(upstream);
    let activity = Arc::new(Activity::new());

    let reply_task = tokio::spawn({
        let upstream = upstream.clone();
        let activity = activity.clone();
        async move {
            let mut buf = vec![0u8; UDP_BUFFER];
            loop {
                match upstream.recv(&mut buf).await {
                    Ok(n) => {
                        if let Err(e) = listen.send_to(&buf[..n], peer).await {
                            debug!(peer = %peer, error = %e, "UDP reply to client failed");
                            continue;
                        }
                        activity.touch();
                    }
                    Err(e) => {
                        // ICMP port unreachable from the backend surfaces here.
                        debug!(peer = %peer, error = %e, "UDP recv from backend failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        }
    });

    Ok(UdpSession {
        upstream,
        activity,
        reply_task,
    })
}
