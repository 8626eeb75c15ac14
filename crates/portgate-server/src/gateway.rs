//! Admission gateway: the authenticated entry point for every control
//! request.
//!
//! Each request is validated first, authorized second, and only then
//! applied, so a malformed or unauthorized request never mutates anything.
//! Repoints take the write side of the repoint gate and allowlist changes
//! the read side: address adds and removes run concurrently with each other
//! but never interleave with a relay switch.

use crate::error::PortgateError;
use crate::firewall::AddressSet;
use crate::relay::{RelayController, RelayStatus};
use portgate_core::{parse_port, Address, Credential, RelayTarget, ValidationError};
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Successful control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Ack {
    /// Port the relay listens on after a repoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effective_port: Option<u16>,
}

/// Why a control request was not applied.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("forbidden")]
    Authorization,

    /// The request was valid but applying it failed. Only `incident` is
    /// shown to the client; `cause` is logged under the same id.
    #[error("internal error (incident {incident})")]
    Application {
        cause: PortgateError,
        incident: String,
    },
}

impl GatewayError {
    fn application(operation: &'static str, cause: PortgateError) -> Self {
        match cause {
            PortgateError::Validation(e) => Self::Validation(e),
            cause => {
                let incident = incident_id();
                error!(operation, incident = %incident, error = %cause, "control request failed");
                Self::Application { cause, incident }
            }
        }
    }
}

/// Random correlation id for an application failure.
pub(crate) fn incident_id() -> String {
    let bytes: [u8; 8] = rand::thread_rng().gen();
    hex::encode(bytes)
}

pub type GatewayResult<T> = Result<T, GatewayError>;

pub struct AdmissionGateway {
    credential: Credential,
    allowlist: Arc<AddressSet>,
    relay: Arc<RelayController>,
    /// Write side held by repoints, read side by allowlist changes.
    repoint_gate: RwLock<()>,
}

impl AdmissionGateway {
    pub fn new(
        credential: Credential,
        allowlist: Arc<AddressSet>,
        relay: Arc<RelayController>,
    ) -> Self {
        Self {
            credential,
            allowlist,
            relay,
            repoint_gate: RwLock::new(()),
        }
    }

    fn require_key(key: &str) -> Result<(), ValidationError> {
        if key.is_empty() {
            Err(ValidationError::MissingField("key"))
        } else {
            Ok(())
        }
    }

    /// Whether `key` would pass authorization. Used to count failures
    /// before a request runs.
    pub fn accepts_key(&self, key: &str) -> bool {
        self.credential.verify(key)
    }

    fn authorize(&self, key: &str) -> GatewayResult<()> {
        if self.credential.verify(key) {
            Ok(())
        } else {
            warn!("control request with invalid key rejected");
            Err(GatewayError::Authorization)
        }
    }

    /// Parse an address destined for the client allowlist.
    fn client_address(&self, input: &str) -> Result<Address, ValidationError> {
        let addr = Address::parse(input)?;
        if addr.is_local() {
            return Err(ValidationError::LocalAddress(addr.to_string()));
        }
        if !self.allowlist.accepts(addr.family()) {
            return Err(ValidationError::FamilyDisabled(addr.to_string()));
        }
        Ok(addr)
    }

    /// Admit `address` through the firewall.
    pub async fn add_address(&self, key: &str, address: &str) -> GatewayResult<Ack> {
        let addr = self.client_address(address)?;
        Self::require_key(key)?;
        self.authorize(key)?;

        let _gate = self.repoint_gate.read().await;
        self.allowlist
            .add(addr)
            .await
            .map_err(|e| GatewayError::application("add_address", e))?;
        info!(addr = %addr, "client admitted");
        Ok(Ack::default())
    }

    /// Revoke `address`. Revoking an address that was never admitted succeeds.
    pub async fn remove_address(&self, key: &str, address: &str) -> GatewayResult<Ack> {
        let addr = self.client_address(address)?;
        Self::require_key(key)?;
        self.authorize(key)?;

        let _gate = self.repoint_gate.read().await;
        self.allowlist
            .remove(addr)
            .await
            .map_err(|e| GatewayError::application("remove_address", e))?;
        info!(addr = %addr, "client revoked");
        Ok(Ack::default())
    }

    /// Point the relay at a new bind port and backend.
    pub async fn repoint_relay(
        &self,
        key: &str,
        bind_port: &str,
        backend_address: &str,
        backend_port: &str,
    ) -> GatewayResult<Ack> {
        let target = RelayTarget::new(
            required_port("port", bind_port)?,
            Address::parse(backend_address)?,
            required_port("backend_port", backend_port)?,
            &self.relay.bind_range(),
        )?;
        Self::require_key(key)?;
        self.authorize(key)?;

        let _gate = self.repoint_gate.write().await;
        let effective = self
            .relay
            .repoint(target)
            .await
            .map_err(|e| GatewayError::application("repoint_relay", e))?;
        Ok(Ack {
            effective_port: Some(effective.bind_port),
        })
    }

    pub fn relay_status(&self, key: &str) -> GatewayResult<RelayStatus> {
        Self::require_key(key)?;
        self.authorize(key)?;
        Ok(self.relay.status())
    }

    /// Current client allowlist in sorted order.
    pub fn allowlist(&self, key: &str) -> GatewayResult<Vec<Address>> {
        Self::require_key(key)?;
        self.authorize(key)?;
        Ok(self.allowlist.members())
    }
}

fn required_port(field: &'static str, input: &str) -> Result<u16, ValidationError> {
    if input.is_empty() {
        return Err(ValidationError::MissingField(field));
    }
    parse_port(input)
}
