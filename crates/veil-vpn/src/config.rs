//! Session and tunnel configuration.
//!
//! Holds the plain-data types that cross the boundary between the session
//! core and its collaborators: relay endpoints, account credentials, and
//! the tunnel configuration handed to the tunnel provider. Settings
//! persistence lives outside this crate; these types only describe the
//! in-memory shape.

use crate::keys::KeyPair;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Network endpoint (IP + port)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// IP address
    pub addr: IpAddr,
    /// UDP port
    pub port: u16,
}

impl Endpoint {
    /// Create a new endpoint
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self { addr, port }
    }

    /// Create from IPv4 octets
    pub fn ipv4(a: u8, b: u8, c: u8, d: u8, port: u16) -> Self {
        Self {
            addr: IpAddr::V4(Ipv4Addr::new(a, b, c, d)),
            port,
        }
    }

    /// Convert to SocketAddr
    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// Opaque account identifier issued by the account backend.
///
/// Never logged in full.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountToken(String);

impl AccountToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The full token, for backend requests only
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccountToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Char-based tail; byte slicing would panic on multibyte tokens.
        let tail = self
            .0
            .char_indices()
            .rev()
            .nth(3)
            .map(|(start, _)| &self.0[start..])
            .unwrap_or("");
        write!(f, "AccountToken(...{tail})")
    }
}

impl fmt::Display for AccountToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Tunnel-internal addresses assigned by the backend when a key is pushed.
pub type AssignedAddresses = BTreeSet<IpAddr>;

/// A provisioned account credential.
///
/// Exists only after the device key has been pushed to the backend; the
/// whole value is dropped when the account is unset, so there is no state
/// where a token is held with unsynchronized key material.
#[derive(Debug, Clone)]
pub struct AccountCredential {
    /// Token identifying the account
    pub account_token: AccountToken,
    /// Device key pair registered with the backend
    pub key_pair: KeyPair,
    /// Addresses the backend assigned to this key
    pub assigned_addresses: AssignedAddresses,
}

/// Configuration handed to the tunnel provider for a single start attempt.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Device key pair to authenticate the tunnel with
    pub key_pair: KeyPair,
    /// Tunnel-internal addresses for this device
    pub addresses: AssignedAddresses,
    /// Relay the tunnel terminates at
    pub relay: Endpoint,
    /// DNS servers to use inside the tunnel
    pub dns: Vec<IpAddr>,
}

impl TunnelConfig {
    /// Build a tunnel configuration from a provisioned credential.
    pub fn from_credential(
        credential: &AccountCredential,
        relay: Endpoint,
        dns: Vec<IpAddr>,
    ) -> Self {
        Self {
            key_pair: credential.key_pair.clone(),
            addresses: credential.assigned_addresses.clone(),
            relay,
            dns,
        }
    }

    /// Validate before handing to the provider
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.relay.port == 0 {
            return Err(ConfigError::InvalidRelayPort);
        }
        if self.addresses.is_empty() {
            return Err(ConfigError::NoAssignedAddresses);
        }
        Ok(())
    }
}

/// Static session configuration supplied by the embedder.
///
/// Relay selection is a collaborator's job; the session only needs the
/// chosen endpoint and the in-tunnel DNS servers.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Relay endpoint to connect tunnels to
    pub relay: Endpoint,
    /// DNS servers pushed into tunnel configurations
    pub dns: Vec<IpAddr>,
}

impl SessionConfig {
    pub fn new(relay: Endpoint) -> Self {
        Self {
            relay,
            dns: vec![IpAddr::V4(Ipv4Addr::new(10, 64, 0, 1))],
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Relay port must be non-zero")]
    InvalidRelayPort,

    #[error("Credential has no assigned addresses")]
    NoAssignedAddresses,
}
