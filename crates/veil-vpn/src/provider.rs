//! Tunnel provider capability.
//!
//! The session core does not implement the encrypted tunnel itself; it
//! drives an OS-level provider through this trait. Implementations wrap
//! whatever the platform offers (a kernel module, a userspace transport, a
//! system extension) and are free to take as long as the OS needs; the
//! session never forcibly aborts an in-flight start or stop.

use crate::config::{Endpoint, TunnelConfig};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Live status reported by the provider, polled by UI surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    /// No tunnel device exists
    Down,
    /// A start call is in progress
    Starting,
    /// Tunnel is up and routing
    Up,
}

/// Tunnel provider errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("Tunnel start failed: {0}")]
    StartFailed(String),

    #[error("Tunnel stop failed: {0}")]
    StopFailed(String),

    #[error("Tunnel provider unavailable")]
    Unavailable,
}

/// OS-level tunnel capability consumed by the session core.
///
/// `start` resolves once the tunnel is routing traffic (or has definitely
/// failed); `stop` resolves once the device is gone. Both are one-shot per
/// transition: the session serializes calls, so implementations never see
/// overlapping start/stop.
#[async_trait]
pub trait TunnelProvider: Send + Sync + 'static {
    /// Bring the tunnel up with the given configuration.
    async fn start(&self, config: TunnelConfig) -> Result<Endpoint, ProviderError>;

    /// Tear the tunnel down.
    async fn stop(&self) -> Result<(), ProviderError>;

    /// Current provider-side status snapshot.
    fn current_status(&self) -> ProviderStatus;
}
