//! HTTP control API.
//!
//! | Method | Path                      | Body / header                               |
//! |--------|---------------------------|---------------------------------------------|
//! | POST   | `/api/ipsetadd`           | `{key, ipplayer}`                           |
//! | POST   | `/api/ipsetdel`           | `{key, ipplayer}`                           |
//! | POST   | `/api/proxy/change/port`  | `{key, port, backend_ip, backend_port}`     |
//! | GET    | `/api/proxy/status`       | `x-api-key` header                          |
//! | GET    | `/api/health`             | none                                        |
//!
//! Mutations run on their own task, so a client that disconnects mid-request
//! does not cancel a half-applied change. Peers that fail authorization too
//! often are answered with 429 until the window passes.

use crate::auth::AuthLimits;
use crate::error::PortgateError;
use crate::gateway::{incident_id, AdmissionGateway, GatewayError, GatewayResult};
use crate::relay::RelayStatus;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use portgate_core::{Address, ValidationError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

const MISSING_PARAMETERS: &str = "Missing required parameters";

/// Shared state of every handler.
#[derive(Clone)]
pub struct ApiState {
    gateway: Arc<AdmissionGateway>,
    limits: Arc<Mutex<AuthLimits>>,
}

impl ApiState {
    pub fn new(gateway: Arc<AdmissionGateway>, limits: Arc<Mutex<AuthLimits>>) -> Self {
        Self { gateway, limits }
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/ipsetadd", post(add_address))
        .route("/api/ipsetdel", post(remove_address))
        .route("/api/proxy/change/port", post(repoint_relay))
        .route("/api/proxy/status", get(relay_status))
        .route("/api/health", get(health))
        .with_state(state)
}

/// Serve the API on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: ApiState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "control API listening");
    }
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

// ── Request bodies ───────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct AddressRequest {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    ipplayer: Option<String>,
}

/// A port given either as a JSON number or as a string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PortField {
    Number(u64),
    Text(String),
}

impl PortField {
    fn into_text(self) -> String {
        match self {
            PortField::Number(n) => n.to_string(),
            PortField::Text(s) => s,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RepointRequest {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    port: Option<PortField>,
    #[serde(default)]
    backend_ip: Option<String>,
    #[serde(default)]
    backend_port: Option<PortField>,
}

#[derive(Debug, Serialize)]
struct RepointResponse {
    effective_port: u16,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    relay: RelayStatus,
    allowlist: Vec<Address>,
}

/// Parse a JSON body; anything unreadable counts as missing parameters.
fn parse_body<T: for<'de> Deserialize<'de>>(body: &Bytes) -> Result<T, Response> {
    serde_json::from_slice(body)
        .map_err(|_| (StatusCode::BAD_REQUEST, MISSING_PARAMETERS).into_response())
}

// ── Handlers ─────────────────────────────────────────────────────────

async fn add_address(
    State(state): State<ApiState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Response {
    let req: AddressRequest = match parse_body(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let key = req.key.unwrap_or_default();
    let address = req.ipplayer.unwrap_or_default();
    let gateway = state.gateway.clone();
    let result = guarded(&state, peer.ip(), key.clone(), async move {
        gateway.add_address(&key, &address).await
    })
    .await;
    respond(result, |_| (StatusCode::OK, "IP added to whitelist").into_response())
}

async fn remove_address(
    State(state): State<ApiState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Response {
    let req: AddressRequest = match parse_body(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let key = req.key.unwrap_or_default();
    let address = req.ipplayer.unwrap_or_default();
    let gateway = state.gateway.clone();
    let result = guarded(&state, peer.ip(), key.clone(), async move {
        gateway.remove_address(&key, &address).await
    })
    .await;
    respond(result, |_| (StatusCode::OK, "IP removed from whitelist").into_response())
}

async fn repoint_relay(
    State(state): State<ApiState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Response {
    let req: RepointRequest = match parse_body(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let key = req.key.unwrap_or_default();
    let port = req.port.map(PortField::into_text).unwrap_or_default();
    let backend_ip = req.backend_ip.unwrap_or_default();
    let backend_port = req.backend_port.map(PortField::into_text).unwrap_or_default();

    let gateway = state.gateway.clone();
    let result = guarded(&state, peer.ip(), key.clone(), async move {
        gateway
            .repoint_relay(&key, &port, &backend_ip, &backend_port)
            .await
    })
    .await;
    respond(result, |ack| match ack.effective_port {
        Some(effective_port) => Json(RepointResponse { effective_port }).into_response(),
        None => StatusCode::OK.into_response(),
    })
}

async fn relay_status(
    State(state): State<ApiState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let gateway = state.gateway.clone();
    let result = guarded(&state, peer.ip(), key.clone(), async move {
        Ok::<_, GatewayError>(StatusResponse {
            relay: gateway.relay_status(&key)?,
            allowlist: gateway.allowlist(&key)?,
        })
    })
    .await;
    respond(result, |status| Json(status).into_response())
}

async fn health() -> &'static str {
    "ok"
}

// ── Plumbing ─────────────────────────────────────────────────────────

/// Outcome of a guarded call: the gateway result, or an early 429.
enum Guarded<T> {
    Done(GatewayResult<T>),
    Throttled,
}

/// Run `call` on its own task unless `peer` is locked out.
///
/// A request carrying a wrong key reserves a failure slot before it runs,
/// under the same lock as the lockout check. The slot is handed back if
/// the request ends in anything other than an authorization failure.
async fn guarded<T, F>(state: &ApiState, peer: IpAddr, key: String, call: F) -> Guarded<T>
where
    T: Send + 'static,
    F: Future<Output = GatewayResult<T>> + Send + 'static,
{
    let reserved = {
        let mut limits = state.limits.lock().await;
        let wrong_key = !key.is_empty() && !state.gateway.accepts_key(&key);
        if wrong_key {
            let Some(at) = limits.reserve_failure(&peer) else {
                return throttled(peer);
            };
            Some(at)
        } else if limits.is_blocked(&peer) {
            return throttled(peer);
        } else {
            None
        }
    };

    let result = match tokio::spawn(call).await {
        Ok(result) => result,
        Err(e) => {
            let incident = incident_id();
            error!(incident = %incident, error = %e, "control request task failed");
            Err(GatewayError::Application {
                cause: PortgateError::Internal(format!("request task failed: {e}")),
                incident,
            })
        }
    };

    if let Some(at) = reserved {
        if !matches!(result, Err(GatewayError::Authorization)) {
            state.limits.lock().await.release(&peer, at);
        }
    }
    Guarded::Done(result)
}

fn throttled<T>(peer: IpAddr) -> Guarded<T> {
    warn!(peer = %peer, "control request throttled after failed authorization");
    Guarded::Throttled
}

fn respond<T>(outcome: Guarded<T>, ok: impl FnOnce(T) -> Response) -> Response {
    match outcome {
        Guarded::Throttled => {
            (StatusCode::TOO_MANY_REQUESTS, "Too many failed attempts").into_response()
        }
        Guarded::Done(Ok(value)) => ok(value),
        Guarded::Done(Err(GatewayError::Validation(ValidationError::MissingField(_)))) => {
            (StatusCode::BAD_REQUEST, MISSING_PARAMETERS).into_response()
        }
        Guarded::Done(Err(GatewayError::Validation(e))) => {
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
        Guarded::Done(Err(GatewayError::Authorization)) => {
            (StatusCode::FORBIDDEN, "Forbidden").into_response()
        }
        Guarded::Done(Err(GatewayError::Application { incident, .. })) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Internal error (incident {incident})"),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PortgateResult;
    use crate::firewall::{AddressSet, DryRunFilter};
    use crate::relay::launcher::{
        BoxFuture, RelayHandle, RelayLauncher, RelayProcess, SessionCounts,
    };
    use crate::relay::RelayController;
    use portgate_core::{Credential, Family, PortRange, RelayTarget};
    use serde_json::json;

    const KEY: &str = "s3cret";

    struct Idle;

    impl RelayProcess for Idle {
        fn is_alive(&self) -> bool {
            true
        }

        fn sessions(&self) -> Option<SessionCounts> {
            Some(SessionCounts {
                tcp_active: 0,
                udp_sessions: 0,
            })
        }

        fn stop(self: Box<Self>) -> BoxFuture<'static, PortgateResult<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    struct InstantLauncher;

    impl RelayLauncher for InstantLauncher {
        fn start(&self, target: RelayTarget) -> BoxFuture<'_, PortgateResult<RelayHandle>> {
            Box::pin(async move { Ok(RelayHandle::new(target, Box::new(Idle))) })
        }
    }

    struct TestServer {
        base: String,
        client: reqwest::Client,
        allowlist: Arc<AddressSet>,
    }

    async fn spawn_server(filter: DryRunFilter, auth_attempts: u32) -> TestServer {
        let filter = Arc::new(filter);
        let allowlist = Arc::new(AddressSet::new("allow", vec![Family::V4], filter));
        let relay = Arc::new(RelayController::new(
            Arc::new(InstantLauncher),
            PortRange::default(),
            None,
        ));
        let gateway = Arc::new(AdmissionGateway::new(
            Credential::new(KEY).unwrap(),
            allowlist.clone(),
            relay,
        ));
        let limits = Arc::new(Mutex::new(AuthLimits::per_minute(auth_attempts)));
        let state = ApiState::new(gateway, limits);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, state, std::future::pending()));

        TestServer {
            base: format!("http://{addr}"),
            client: reqwest::Client::new(),
            allowlist,
        }
    }

    impl TestServer {
        async fn post(&self, path: &str, body: serde_json::Value) -> (u16, String) {
            let resp = self
                .client
                .post(format!("{}{path}", self.base))
                .json(&body)
                .send()
                .await
                .unwrap();
            let status = resp.status().as_u16();
            (status, resp.text().await.unwrap())
        }
    }

    #[tokio::test]
    async fn health_is_open() {
        let server = spawn_server(DryRunFilter::new(), 5).await;
        let resp = server
            .client
            .get(format!("{}/api/health", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        assert_eq!(resp.text().await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn add_and_remove_address() {
        let server = spawn_server(DryRunFilter::new(), 5).await;
        let (status, body) = server
            .post("/api/ipsetadd", json!({"key": KEY, "ipplayer": "198.51.100.4"}))
            .await;
        assert_eq!((status, body.as_str()), (200, "IP added to whitelist"));
        assert!(server.allowlist.contains(&Address::parse("198.51.100.4").unwrap()));

        let (status, body) = server
            .post("/api/ipsetdel", json!({"key": KEY, "ipplayer": "198.51.100.4"}))
            .await;
        assert_eq!((status, body.as_str()), (200, "IP removed from whitelist"));
        assert_eq!(server.allowlist.len(), 0);
    }

    #[tokio::test]
    async fn missing_and_malformed_parameters() {
        let server = spawn_server(DryRunFilter::new(), 5).await;
        let (status, body) = server.post("/api/ipsetadd", json!({"key": KEY})).await;
        assert_eq!((status, body.as_str()), (400, MISSING_PARAMETERS));

        let (status, body) = server
            .post("/api/ipsetadd", json!({"key": KEY, "ipplayer": "999.1.1.1"}))
            .await;
        assert_eq!(status, 400);
        assert!(body.contains("invalid address"));

        let resp = server
            .client
            .post(format!("{}/api/ipsetadd", server.base))
            .body("not json")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 400);
        assert_eq!(server.allowlist.len(), 0);
    }

    #[tokio::test]
    async fn wrong_key_is_forbidden_then_throttled() {
        let server = spawn_server(DryRunFilter::new(), 2).await;
        let bad = json!({"key": "guess", "ipplayer": "198.51.100.4"});
        assert_eq!(server.post("/api/ipsetadd", bad.clone()).await, (403, "Forbidden".into()));
        assert_eq!(server.post("/api/ipsetadd", bad.clone()).await.0, 403);
        assert_eq!(server.post("/api/ipsetadd", bad).await.0, 429);

        let good = json!({"key": KEY, "ipplayer": "198.51.100.4"});
        assert_eq!(server.post("/api/ipsetadd", good).await.0, 429);
        assert_eq!(server.allowlist.len(), 0);
    }

    #[tokio::test]
    async fn concurrent_wrong_keys_cannot_exceed_limit() {
        let server = Arc::new(spawn_server(DryRunFilter::new(), 2).await);
        let mut requests = Vec::new();
        for _ in 0..10 {
            let server = server.clone();
            requests.push(tokio::spawn(async move {
                let bad = json!({"key": "guess", "ipplayer": "198.51.100.4"});
                server.post("/api/ipsetadd", bad).await.0
            }));
        }
        let mut forbidden = 0;
        for request in requests {
            match request.await.unwrap() {
                403 => forbidden += 1,
                429 => {}
                other => panic!("unexpected status {other}"),
            }
        }
        assert_eq!(forbidden, 2);
        assert_eq!(server.allowlist.len(), 0);
    }

    #[tokio::test]
    async fn malformed_request_with_wrong_key_is_not_counted() {
        let server = spawn_server(DryRunFilter::new(), 1).await;
        let malformed = json!({"key": "guess", "ipplayer": "999.1.1.1"});
        assert_eq!(server.post("/api/ipsetadd", malformed.clone()).await.0, 400);
        assert_eq!(server.post("/api/ipsetadd", malformed).await.0, 400);

        let good = json!({"key": KEY, "ipplayer": "198.51.100.4"});
        assert_eq!(server.post("/api/ipsetadd", good).await.0, 200);
    }

    #[tokio::test]
    async fn repoint_accepts_numbers_and_strings() {
        let server = spawn_server(DryRunFilter::new(), 5).await;
        let (status, body) = server
            .post(
                "/api/proxy/change/port",
                json!({
                    "key": KEY,
                    "port": 30000,
                    "backend_ip": "10.0.0.5",
                    "backend_port": "30120"
                }),
            )
            .await;
        assert_eq!(status, 200);
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["effective_port"], 30000);

        let (status, _) = server
            .post(
                "/api/proxy/change/port",
                json!({"key": KEY, "port": 70000, "backend_ip": "10.0.0.5", "backend_port": 30120}),
            )
            .await;
        assert_eq!(status, 400);
    }

    #[tokio::test]
    async fn status_requires_header_key() {
        let server = spawn_server(DryRunFilter::new(), 5).await;
        server
            .post(
                "/api/proxy/change/port",
                json!({"key": KEY, "port": 30000, "backend_ip": "10.0.0.5", "backend_port": 30120}),
            )
            .await;

        let url = format!("{}/api/proxy/status", server.base);
        let resp = server.client.get(&url).header("x-api-key", "guess").send().await.unwrap();
        assert_eq!(resp.status().as_u16(), 403);

        let resp = server.client.get(&url).header("x-api-key", KEY).send().await.unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let status: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(status["relay"]["target"]["bind_port"], 30000);
        assert_eq!(status["relay"]["alive"], true);
        assert_eq!(status["allowlist"], json!([]));
    }

    #[tokio::test]
    async fn application_failure_hides_cause() {
        let server = spawn_server(DryRunFilter::new().failing_on("ipset add"), 5).await;
        let (status, body) = server
            .post("/api/ipsetadd", json!({"key": KEY, "ipplayer": "198.51.100.4"}))
            .await;
        assert_eq!(status, 500);
        assert!(body.starts_with("Internal error (incident "));
        assert!(!body.contains("ipset"));
    }
}
