//! Network policy layers.
//!
//! The session keeps a fixed, ordered set of traffic-filtering layers
//! installed through an OS policy backend. Layers are evaluated by
//! descending priority weight, and the persistent "block by default" layer
//! carries the maximum weight so default-deny wins no matter what other
//! layers are mid-install or mid-removal. That layer also survives process
//! restart, which is why a crashed client cannot leak.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Owner key identifying this application's layers in the policy backend.
pub const OWNER_KEY: &str = "net.veil.vpn";

/// Stable identifier of a policy layer.
///
/// Installation is keyed by `(owner, id)`, so re-installing after a crash
/// converges on the same logical layer instead of duplicating it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LayerId {
    /// Default-deny layer, survives process restart
    Persistent,
    /// Baseline filters (allow tunnel, loopback, DHCP)
    Baseline,
    /// Filters restricting DNS to the tunnel resolver
    DnsRestriction,
}

impl LayerId {
    /// Stable string key used by backends
    pub fn key(&self) -> &'static str {
        match self {
            LayerId::Persistent => "persistent",
            LayerId::Baseline => "baseline",
            LayerId::DnsRestriction => "dns-restriction",
        }
    }
}

/// A named, weighted set of traffic-filtering rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyLayer {
    /// Stable identity within the owner's scope
    pub id: LayerId,
    /// Evaluation priority; higher weight is evaluated first
    pub priority_weight: u16,
    /// Whether the layer survives process restart
    pub persist_across_restart: bool,
    /// Provider scope the layer belongs to
    pub owner_key: &'static str,
}

impl PolicyLayer {
    /// The default-deny layer. Maximum weight, persistent.
    pub fn persistent() -> Self {
        Self {
            id: LayerId::Persistent,
            priority_weight: u16::MAX,
            persist_across_restart: true,
            owner_key: OWNER_KEY,
        }
    }

    /// Baseline filters that keep the tunnel itself reachable.
    pub fn baseline() -> Self {
        Self {
            id: LayerId::Baseline,
            priority_weight: u16::MAX - 1,
            persist_across_restart: false,
            owner_key: OWNER_KEY,
        }
    }

    /// Filters that restrict DNS traffic to the in-tunnel resolver.
    pub fn dns_restriction() -> Self {
        Self {
            id: LayerId::DnsRestriction,
            priority_weight: u16::MAX - 2,
            persist_across_restart: false,
            owner_key: OWNER_KEY,
        }
    }
}

/// Policy backend errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum PolicyError {
    #[error("Failed to install layer '{layer}': {reason}")]
    InstallFailed { layer: &'static str, reason: String },

    #[error("Failed to remove layer '{layer}': {reason}")]
    RemoveFailed { layer: &'static str, reason: String },

    #[error("Persistent layer cannot be removed while a tunnel operation is in flight")]
    PersistentLayerProtected,
}

/// OS policy capability consumed by the registry.
#[async_trait]
pub trait PolicyBackend: Send + Sync + 'static {
    /// Install the layer, replacing any previous layer with the same identity.
    async fn install(&self, layer: PolicyLayer) -> Result<(), PolicyError>;

    /// Remove the layer. Removing an absent layer is not an error.
    async fn uninstall(&self, id: LayerId) -> Result<(), PolicyError>;
}

/// Tracks which of the fixed layers are installed and guards the persistent
/// layer against removal during tunnel transitions.
///
/// Only the session task mutates the registry, so the internal locks are
/// uncontended; they exist to keep snapshot reads safe from other tasks.
pub struct PolicyLayerRegistry {
    backend: Box<dyn PolicyBackend>,
    installed: Mutex<HashMap<LayerId, PolicyLayer>>,
    transition_in_flight: AtomicBool,
}

impl PolicyLayerRegistry {
    pub fn new(backend: Box<dyn PolicyBackend>) -> Self {
        Self {
            backend,
            installed: Mutex::new(HashMap::new()),
            transition_in_flight: AtomicBool::new(false),
        }
    }

    /// Install a layer if absent. A no-op when the identical layer is
    /// already installed.
    pub async fn ensure_installed(&self, layer: PolicyLayer) -> Result<(), PolicyError> {
        {
            let installed = self.installed.lock().unwrap();
            if installed.get(&layer.id) == Some(&layer) {
                debug!("Policy layer '{}' already installed", layer.id.key());
                return Ok(());
            }
        }

        info!(
            "Installing policy layer '{}' (weight {})",
            layer.id.key(),
            layer.priority_weight
        );
        self.backend.install(layer.clone()).await?;
        self.installed.lock().unwrap().insert(layer.id, layer);
        Ok(())
    }

    /// Remove a layer. The persistent layer is refused while a
    /// tunnel-affecting operation is in flight.
    ///
    /// Always reaches the backend: the in-memory map starts empty after a
    /// restart, but the OS may still hold layers from the previous process.
    pub async fn remove(&self, id: LayerId) -> Result<(), PolicyError> {
        if id == LayerId::Persistent && self.transition_in_flight.load(Ordering::Acquire) {
            return Err(PolicyError::PersistentLayerProtected);
        }

        debug!("Removing policy layer '{}'", id.key());
        self.backend.uninstall(id).await?;
        self.installed.lock().unwrap().remove(&id);
        Ok(())
    }

    /// Whether a layer is currently installed
    pub fn is_installed(&self, id: LayerId) -> bool {
        self.installed.lock().unwrap().contains_key(&id)
    }

    /// Mark the start of a tunnel-affecting operation
    pub fn begin_transition(&self) {
        self.transition_in_flight.store(true, Ordering::Release);
    }

    /// Mark the end of a tunnel-affecting operation
    pub fn end_transition(&self) {
        self.transition_in_flight.store(false, Ordering::Release);
    }
}
