//! Veil VPN - Tunnel Session & Network-Policy Lifecycle
//!
//! Drives a VPN client through connect/disconnect/reconnect/account-change
//! transitions while guaranteeing that no unencrypted traffic can leak
//! during any transition.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      SessionHandle (UI/CLI)                 │
//! │     connect / disconnect / reconnect / set_account          │
//! └───────────────┬─────────────────────────────▲───────────────┘
//!                 │ commands                    │ status stream
//!                 ▼                             │
//! ┌─────────────────────────────────────────────┴───────────────┐
//! │  TunnelStateMachine ── OperationSerializer (one in flight)  │
//! │        │                    │                    │          │
//! │        ▼                    ▼                    ▼          │
//! │  TunnelProvider     PolicyLayerRegistry   CredentialRotator │
//! │  (OS tunnel)        (default-deny layers) (account backend) │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - **Fail closed**: the persistent default-deny policy layer is installed
//!   before any tunnel teardown and survives process restart
//! - **Serialized transitions**: at most one mutating operation at a time;
//!   duplicate commands merge, stale queued commands are superseded
//! - **Honest blocking flag**: a published `is_blocking = true` means the
//!   default-deny layer is actually installed at that moment
//! - **Key hygiene**: at most two device keys live per logical account
//!   switch; the old key is deleted before the new one is pushed

mod config;
mod keys;
mod policy;
mod provider;
mod rotation;
mod serializer;
mod session;

pub use config::{
    AccountCredential, AccountToken, AssignedAddresses, ConfigError, Endpoint, SessionConfig,
    TunnelConfig,
};
pub use keys::{KeyError, KeyPair, PrivateKey, PublicKey};
pub use policy::{
    LayerId, OWNER_KEY, PolicyBackend, PolicyError, PolicyLayer, PolicyLayerRegistry,
};
pub use provider::{ProviderError, ProviderStatus, TunnelProvider};
pub use rotation::{AccountBackend, BackendError, CredentialRotator, RetryPolicy};
pub use serializer::{
    ConcurrencyError, Operation, OperationHandle, OperationId, OperationKind, OperationSerializer,
};
pub use session::{
    AfterDisconnect, CommandResult, ErrorCause, SessionError, SessionHandle, SessionState,
    TunnelSession, spawn,
};
