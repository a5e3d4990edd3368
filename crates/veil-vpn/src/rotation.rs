//! Device credential rotation.
//!
//! Pushes and deletes device keys against the remote account backend.
//! Pushes retry with bounded backoff on transient failures; deletes are
//! best-effort and idempotent, because keeping a possibly-stale key on the
//! server is less harmful than blocking an account switch.

use crate::config::{AccountToken, AssignedAddresses};
use crate::keys::PublicKey;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Account backend errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Rate limited by backend")]
    RateLimited,

    #[error("Key not found on backend")]
    KeyNotFound,

    #[error("Too many keys registered for this account")]
    QuotaExceeded,

    #[error("Account token rejected")]
    InvalidToken,
}

impl BackendError {
    /// Transient failures are worth retrying; definitive rejections are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendError::Network(_) | BackendError::Timeout | BackendError::RateLimited
        )
    }
}

/// Remote account capability consumed by the rotator.
#[async_trait]
pub trait AccountBackend: Send + Sync + 'static {
    /// Register a device key; returns the tunnel addresses assigned to it.
    async fn push_key(
        &self,
        token: &AccountToken,
        key: &PublicKey,
    ) -> Result<AssignedAddresses, BackendError>;

    /// Remove a device key from the account.
    async fn delete_key(&self, token: &AccountToken, key: &PublicKey)
    -> Result<(), BackendError>;
}

/// Bounded exponential backoff for transient push failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry; doubles per attempt
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        self.initial_delay * 2u32.saturating_pow(attempt)
    }
}

/// Rotates device key material against the account backend.
pub struct CredentialRotator {
    backend: Box<dyn AccountBackend>,
    retry: RetryPolicy,
}

impl CredentialRotator {
    pub fn new(backend: Box<dyn AccountBackend>) -> Self {
        Self {
            backend,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(backend: Box<dyn AccountBackend>, retry: RetryPolicy) -> Self {
        Self { backend, retry }
    }

    /// Register a key with the backend.
    ///
    /// Transient failures are retried per the policy; a definitive
    /// rejection (quota, bad token) is surfaced immediately.
    pub async fn push(
        &self,
        token: &AccountToken,
        key: &PublicKey,
    ) -> Result<AssignedAddresses, BackendError> {
        let mut attempt = 0;
        loop {
            match self.backend.push_key(token, key).await {
                Ok(addresses) => {
                    info!("Registered device key {} with backend", key);
                    return Ok(addresses);
                }
                Err(err) if err.is_transient() && attempt + 1 < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        "Key push failed ({}), retrying in {:?} (attempt {}/{})",
                        err,
                        delay,
                        attempt + 1,
                        self.retry.max_attempts
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Delete a key from the backend.
    ///
    /// "Key not found" counts as success so the delete is idempotent. No
    /// retries: the caller clears local state regardless of the outcome.
    pub async fn delete(
        &self,
        token: &AccountToken,
        key: &PublicKey,
    ) -> Result<(), BackendError> {
        match self.backend.delete_key(token, key).await {
            Ok(()) => {
                info!("Removed device key {} from backend", key);
                Ok(())
            }
            Err(BackendError::KeyNotFound) => {
                debug!("Device key {} already absent on backend", key);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}
