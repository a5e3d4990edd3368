//! Tunnel session state machine.
//!
//! A single task owns the `TunnelSession` and drives every transition:
//! commands admitted by the [`OperationSerializer`](crate::serializer) mutate
//! state, provider start/stop and backend key calls run on their own tasks
//! and report completions back into the loop, and every committed state is
//! published in order over a broadcast channel.
//!
//! The correctness contract: whenever a published state carries
//! `is_blocking = true`, the persistent default-deny policy layer is
//! actually installed, and the persistent layer is never absent while no
//! tunnel is up.

use crate::config::{AccountCredential, AccountToken, Endpoint, SessionConfig, TunnelConfig};
use crate::keys::{KeyPair, PublicKey};
use crate::policy::{LayerId, PolicyBackend, PolicyError, PolicyLayer, PolicyLayerRegistry};
use crate::provider::{ProviderError, ProviderStatus, TunnelProvider};
use crate::rotation::{AccountBackend, BackendError, CredentialRotator};
use crate::serializer::{
    ConcurrencyError, Operation, OperationHandle, OperationId, OperationSerializer,
};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// What the state machine does once an in-flight teardown completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AfterDisconnect {
    /// Settle in `Disconnected`
    Nothing,
    /// Bring the tunnel back up
    Reconnect,
    /// Enter the blocking error state
    Block,
}

/// Why the session is in an error state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum ErrorCause {
    #[error("Tunnel provider failure: {0}")]
    Provider(String),

    #[error("Network policy failure: {0}")]
    Policy(String),

    #[error("Account backend failure: {0}")]
    Backend(String),

    #[error("Invalid tunnel configuration: {0}")]
    Configuration(String),

    #[error("No account is set")]
    NoAccount,
}

impl From<ProviderError> for ErrorCause {
    fn from(err: ProviderError) -> Self {
        ErrorCause::Provider(err.to_string())
    }
}

impl From<PolicyError> for ErrorCause {
    fn from(err: PolicyError) -> Self {
        ErrorCause::Policy(err.to_string())
    }
}

/// Session state. Exactly one value at any instant; every committed
/// transition is published to observers in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting { next: AfterDisconnect },
    Error { cause: ErrorCause, is_blocking: bool },
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected)
    }

    /// Whether the default-deny layer is confirmed active in this state
    pub fn is_blocking(&self) -> bool {
        matches!(self, SessionState::Error { is_blocking: true, .. })
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Disconnecting { next } => write!(f, "disconnecting ({next:?})"),
            SessionState::Error { cause, is_blocking } => {
                write!(f, "error (blocking: {is_blocking}): {cause}")
            }
        }
    }
}

/// Snapshot published to status observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelSession {
    pub state: SessionState,
    pub active_endpoint: Option<Endpoint>,
    pub last_error: Option<ErrorCause>,
}

impl TunnelSession {
    fn initial() -> Self {
        Self {
            state: SessionState::Disconnected,
            active_endpoint: None,
            last_error: None,
        }
    }
}

/// Errors returned to command callers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),

    #[error("Key rotation failed: {0}")]
    Rotation(#[from] BackendError),

    #[error("Network policy failure: {0}")]
    Policy(#[from] PolicyError),

    #[error("Tunnel provider failure: {0}")]
    Provider(#[from] ProviderError),

    #[error("Session task has shut down")]
    Closed,
}

/// Result delivered to each command waiter.
pub type CommandResult = Result<SessionState, SessionError>;

enum SessionRequest {
    Submit {
        operation: Operation,
        reply: oneshot::Sender<OperationHandle<CommandResult>>,
    },
    Cancel(OperationId),
}

enum InternalEvent {
    TunnelUp(Result<Endpoint, ProviderError>),
    TunnelDown(Result<(), ProviderError>),
    RotationDone(Result<Option<AccountCredential>, BackendError>),
}

/// Handle to a running session task.
///
/// Cheap to clone; dropping every handle shuts the task down once its
/// current operation has settled.
#[derive(Clone)]
pub struct SessionHandle {
    request_tx: mpsc::Sender<SessionRequest>,
    events: broadcast::Sender<TunnelSession>,
    snapshot: watch::Receiver<TunnelSession>,
    provider: Arc<dyn TunnelProvider>,
}

impl SessionHandle {
    /// Connect the tunnel. Idempotent while connecting or connected.
    pub async fn connect(&self) -> CommandResult {
        self.execute(Operation::Connect).await
    }

    /// Disconnect the tunnel.
    pub async fn disconnect(&self) -> CommandResult {
        self.execute(Operation::Disconnect).await
    }

    /// Tear down and re-establish the tunnel.
    pub async fn reconnect(&self) -> CommandResult {
        self.execute(Operation::Reconnect).await
    }

    /// Switch, set, or clear the account. Forces the tunnel down and
    /// rotates device keys against the backend before resolving.
    pub async fn set_account(&self, token: Option<AccountToken>) -> CommandResult {
        self.execute(Operation::SetAccount(token)).await
    }

    /// Submit without waiting; the returned handle can be awaited or
    /// cancelled.
    pub async fn submit(
        &self,
        operation: Operation,
    ) -> Result<OperationHandle<CommandResult>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.request_tx
            .send(SessionRequest::Submit { operation, reply })
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Cooperatively cancel a submitted operation.
    pub async fn cancel(&self, id: OperationId) {
        let _ = self.request_tx.send(SessionRequest::Cancel(id)).await;
    }

    /// Subscribe to committed state transitions, in commit order.
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelSession> {
        self.events.subscribe()
    }

    /// Lock-free snapshot of the latest committed session.
    pub fn current(&self) -> TunnelSession {
        self.snapshot.borrow().clone()
    }

    /// Live status straight from the tunnel provider.
    pub fn provider_status(&self) -> ProviderStatus {
        self.provider.current_status()
    }

    async fn execute(&self, operation: Operation) -> CommandResult {
        let handle = self.submit(operation).await?;
        match handle.result.await {
            Ok(Ok(result)) => result,
            Ok(Err(concurrency)) => Err(SessionError::Concurrency(concurrency)),
            Err(_) => Err(SessionError::Closed),
        }
    }
}

/// Spawn the session task and return its handle.
pub fn spawn(
    config: SessionConfig,
    provider: Arc<dyn TunnelProvider>,
    policy_backend: Box<dyn PolicyBackend>,
    account_backend: Box<dyn AccountBackend>,
) -> SessionHandle {
    let (request_tx, request_rx) = mpsc::channel(16);
    let (event_tx, event_rx) = mpsc::channel(16);
    let (events, _) = broadcast::channel(64);
    let (snapshot_tx, snapshot_rx) = watch::channel(TunnelSession::initial());

    let machine = TunnelStateMachine {
        config,
        provider: provider.clone(),
        registry: PolicyLayerRegistry::new(policy_backend),
        rotator: Arc::new(CredentialRotator::new(account_backend)),
        session: TunnelSession::initial(),
        credential: None,
        tunnel_config: None,
        pending_account_change: None,
        pending_block_cause: None,
        serializer: OperationSerializer::new(),
        events: events.clone(),
        snapshot: snapshot_tx,
        request_rx,
        event_rx,
        event_tx,
    };
    tokio::spawn(machine.run());

    SessionHandle {
        request_tx,
        events,
        snapshot: snapshot_rx,
        provider,
    }
}

/// The single owner of the tunnel session.
struct TunnelStateMachine {
    config: SessionConfig,
    provider: Arc<dyn TunnelProvider>,
    registry: PolicyLayerRegistry,
    rotator: Arc<CredentialRotator>,

    session: TunnelSession,
    credential: Option<AccountCredential>,
    tunnel_config: Option<TunnelConfig>,
    /// Account change waiting for teardown to finish (`Some(None)` = unset)
    pending_account_change: Option<Option<AccountToken>>,
    /// Error to report once a `Disconnecting { next: Block }` teardown lands
    pending_block_cause: Option<ErrorCause>,

    serializer: OperationSerializer<CommandResult>,
    events: broadcast::Sender<TunnelSession>,
    snapshot: watch::Sender<TunnelSession>,
    request_rx: mpsc::Receiver<SessionRequest>,
    event_rx: mpsc::Receiver<InternalEvent>,
    event_tx: mpsc::Sender<InternalEvent>,
}

impl TunnelStateMachine {
    async fn run(mut self) {
        // Fail closed from the first instant: no tunnel exists yet, so the
        // default-deny layer must be in place before any command runs.
        if let Err(err) = self.registry.ensure_installed(PolicyLayer::persistent()).await {
            error!("Could not install default-deny layer at startup: {}", err);
        }

        let mut commands_open = true;
        loop {
            tokio::select! {
                request = self.request_rx.recv(), if commands_open => match request {
                    Some(request) => self.handle_request(request).await,
                    None => commands_open = false,
                },
                event = self.event_rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
            if !commands_open && self.serializer.is_idle() {
                break;
            }
        }
        debug!("Session task stopped");
    }

    async fn handle_request(&mut self, request: SessionRequest) {
        match request {
            SessionRequest::Submit { operation, reply } => {
                // Commands racing an in-flight teardown mutate the recorded
                // intent instead of queueing: the latest intent wins.
                if let SessionState::Disconnecting { next } = self.session.state {
                    if self.pending_account_change.is_none() {
                        match &operation {
                            Operation::Disconnect => {
                                if next == AfterDisconnect::Reconnect {
                                    info!("Disconnect during reconnect teardown, downgrading");
                                    self.commit(SessionState::Disconnecting {
                                        next: AfterDisconnect::Nothing,
                                    });
                                }
                                if let Some(handle) = self.serializer.join_active() {
                                    let _ = reply.send(handle);
                                    return;
                                }
                            }
                            Operation::Connect | Operation::Reconnect => {
                                if next != AfterDisconnect::Reconnect {
                                    info!("Connect during teardown, will reconnect after stop");
                                    self.pending_block_cause = None;
                                    self.commit(SessionState::Disconnecting {
                                        next: AfterDisconnect::Reconnect,
                                    });
                                }
                                if let Some(handle) = self.serializer.join_active() {
                                    let _ = reply.send(handle);
                                    return;
                                }
                            }
                            Operation::SetAccount(_) => {}
                        }
                    }
                }

                let handle = self.serializer.submit(operation);
                let _ = reply.send(handle);
                self.pump().await;
            }
            SessionRequest::Cancel(id) => self.serializer.cancel(id),
        }
    }

    /// Admit and start queued operations until one suspends or the queue
    /// drains.
    async fn pump(&mut self) {
        while let Some(operation) = self.serializer.admit_next() {
            if !self.start_operation(operation).await {
                break;
            }
        }
    }

    /// Begin an admitted operation. Returns `true` if it completed
    /// synchronously, `false` if it now waits on an internal event.
    async fn start_operation(&mut self, operation: Operation) -> bool {
        match operation {
            Operation::Connect => self.start_connect().await,
            Operation::Reconnect => match self.session.state {
                SessionState::Connected | SessionState::Connecting => {
                    self.start_teardown(AfterDisconnect::Reconnect).await
                }
                // Nothing to tear down; degrade to a plain connect.
                _ => self.start_connect().await,
            },
            Operation::Disconnect => match self.session.state.clone() {
                SessionState::Disconnected => {
                    self.finish(Ok(SessionState::Disconnected));
                    true
                }
                SessionState::Error { .. } => {
                    // Leaving the blocking state; the persistent layer stays
                    // installed since no tunnel exists.
                    self.registry.begin_transition();
                    self.session.active_endpoint = None;
                    self.commit(SessionState::Disconnected);
                    self.finish(Ok(SessionState::Disconnected));
                    true
                }
                _ => self.start_teardown(AfterDisconnect::Nothing).await,
            },
            Operation::SetAccount(token) => self.start_set_account(token).await,
        }
    }

    async fn start_connect(&mut self) -> bool {
        match self.session.state {
            SessionState::Connecting | SessionState::Connected => {
                let state = self.session.state.clone();
                self.finish(Ok(state));
                return true;
            }
            SessionState::Disconnecting { .. } => {
                // Teardown still in flight from a previous operation; honor
                // the connect once it lands.
                self.pending_block_cause = None;
                self.commit(SessionState::Disconnecting {
                    next: AfterDisconnect::Reconnect,
                });
                return false;
            }
            SessionState::Disconnected | SessionState::Error { .. } => {}
        }

        self.registry.begin_transition();
        if let Err(err) = self.ensure_base_layers().await {
            let state = self.enter_error_state(err.into()).await;
            self.finish(Ok(state));
            return true;
        }
        self.launch_tunnel().await
    }

    /// Install the layers every tunnel transition relies on.
    async fn ensure_base_layers(&mut self) -> Result<(), PolicyError> {
        self.registry.ensure_installed(PolicyLayer::persistent()).await?;
        self.registry.ensure_installed(PolicyLayer::baseline()).await?;
        Ok(())
    }

    /// Build the tunnel configuration and dispatch the provider start.
    /// Requires base layers installed and a transition in progress.
    async fn launch_tunnel(&mut self) -> bool {
        let Some(credential) = &self.credential else {
            warn!("Connect requested without an account");
            let state = self.enter_error_state(ErrorCause::NoAccount).await;
            self.finish(Ok(state));
            return true;
        };

        let config =
            TunnelConfig::from_credential(credential, self.config.relay, self.config.dns.clone());
        if let Err(err) = config.validate() {
            let state = self
                .enter_error_state(ErrorCause::Configuration(err.to_string()))
                .await;
            self.finish(Ok(state));
            return true;
        }
        self.tunnel_config = Some(config.clone());

        self.commit(SessionState::Connecting);
        let provider = self.provider.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let result = provider.start(config).await;
            let _ = event_tx.send(InternalEvent::TunnelUp(result)).await;
        });
        false
    }

    /// Dispatch a provider stop with the given follow-up intent. The
    /// persistent layer must be confirmed before teardown begins.
    async fn start_teardown(&mut self, next: AfterDisconnect) -> bool {
        self.registry.begin_transition();
        if let Err(err) = self.registry.ensure_installed(PolicyLayer::persistent()).await {
            // Tearing down without the default-deny layer would leak; keep
            // the tunnel as-is and fail the operation instead.
            error!("Refusing teardown, default-deny layer unavailable: {}", err);
            self.finish(Err(SessionError::Policy(err)));
            return true;
        }

        self.commit(SessionState::Disconnecting { next });
        self.dispatch_stop();
        false
    }

    fn dispatch_stop(&self) {
        let provider = self.provider.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let result = provider.stop().await;
            let _ = event_tx.send(InternalEvent::TunnelDown(result)).await;
        });
    }

    async fn start_set_account(&mut self, token: Option<AccountToken>) -> bool {
        let current = self.credential.as_ref().map(|c| &c.account_token);
        if current == token.as_ref() {
            debug!("Account unchanged, nothing to rotate");
            let state = self.session.state.clone();
            self.finish(Ok(state));
            return true;
        }

        self.registry.begin_transition();
        match self.session.state {
            SessionState::Connected | SessionState::Connecting => {
                if let Err(err) = self.registry.ensure_installed(PolicyLayer::persistent()).await {
                    error!("Refusing account change, default-deny layer unavailable: {}", err);
                    self.finish(Err(SessionError::Policy(err)));
                    return true;
                }
                self.pending_account_change = Some(token);
                self.commit(SessionState::Disconnecting {
                    next: AfterDisconnect::Nothing,
                });
                self.dispatch_stop();
            }
            _ => {
                if self.session.state != SessionState::Disconnected {
                    self.session.active_endpoint = None;
                    self.commit(SessionState::Disconnected);
                }
                self.begin_rotation(token);
            }
        }
        false
    }

    /// Invalidate the local credential and hand the backend work to its own
    /// task. The old key is deleted before the new one is pushed.
    fn begin_rotation(&mut self, token: Option<AccountToken>) {
        let old = self
            .credential
            .take()
            .map(|c| (c.account_token, c.key_pair.public));
        self.tunnel_config = None;

        let rotator = self.rotator.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let result = rotate_credential(&rotator, old, token).await;
            let _ = event_tx.send(InternalEvent::RotationDone(result)).await;
        });
    }

    async fn handle_event(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::TunnelUp(result) => self.on_tunnel_up(result).await,
            InternalEvent::TunnelDown(result) => self.on_tunnel_down(result).await,
            InternalEvent::RotationDone(result) => self.on_rotation_done(result).await,
        }
        self.pump().await;
    }

    async fn on_tunnel_up(&mut self, result: Result<Endpoint, ProviderError>) {
        match result {
            Ok(endpoint) => {
                if self.serializer.active_cancelled() {
                    // The caller gave up while the start was past its point
                    // of no return. The tunnel is up, but the result is
                    // withheld and the tunnel comes straight back down.
                    info!("Connect cancelled mid-start, tearing tunnel back down");
                    self.session.state = SessionState::Connected;
                    self.session.active_endpoint = Some(endpoint);
                    self.finish(Ok(SessionState::Connected));
                    drop(self.serializer.submit(Operation::Disconnect));
                    return;
                }

                if let Err(err) = self
                    .registry
                    .ensure_installed(PolicyLayer::dns_restriction())
                    .await
                {
                    // Unknown filtering state; fail closed through a
                    // blocking teardown.
                    warn!("DNS restriction layer failed to install: {}", err);
                    self.pending_block_cause = Some(err.into());
                    self.commit(SessionState::Disconnecting {
                        next: AfterDisconnect::Block,
                    });
                    self.dispatch_stop();
                    return;
                }

                info!("Tunnel up via {}", endpoint);
                self.session.active_endpoint = Some(endpoint);
                self.session.last_error = None;
                self.commit(SessionState::Connected);
                self.finish(Ok(SessionState::Connected));
            }
            Err(err) => {
                warn!("Tunnel start failed: {}", err);
                self.session.active_endpoint = None;
                if self.serializer.active_cancelled() {
                    self.commit(SessionState::Disconnected);
                    self.finish(Ok(SessionState::Disconnected));
                    return;
                }
                let state = self.enter_error_state(err.into()).await;
                self.finish(Ok(state));
            }
        }
    }

    async fn on_tunnel_down(&mut self, result: Result<(), ProviderError>) {
        if let Err(err) = result {
            error!("Tunnel stop failed: {}", err);
            self.enter_error_state(ErrorCause::from(err.clone())).await;
            self.pending_account_change = None;
            self.pending_block_cause = None;
            self.finish(Err(SessionError::Provider(err)));
            return;
        }

        if let Err(err) = self.registry.remove(LayerId::DnsRestriction).await {
            // Leftover DNS filtering blocks more than intended but leaks
            // nothing; not fatal to the teardown.
            warn!("Could not remove DNS restriction layer: {}", err);
        }
        self.session.active_endpoint = None;

        let next = match self.session.state {
            SessionState::Disconnecting { next } => next,
            ref other => {
                warn!("Unexpected tunnel stop while {}", other);
                AfterDisconnect::Nothing
            }
        };

        match next {
            AfterDisconnect::Nothing => {
                self.commit(SessionState::Disconnected);
                if let Some(token) = self.pending_account_change.take() {
                    self.begin_rotation(token);
                } else {
                    self.finish(Ok(SessionState::Disconnected));
                }
            }
            AfterDisconnect::Reconnect => {
                // May settle synchronously when the credential or the
                // configuration turns out unusable.
                let _ = self.launch_tunnel().await;
            }
            AfterDisconnect::Block => {
                let cause = self
                    .pending_block_cause
                    .take()
                    .unwrap_or_else(|| ErrorCause::Provider("unknown failure".into()));
                let state = self.enter_error_state(cause).await;
                self.finish(Ok(state));
            }
        }
    }

    async fn on_rotation_done(&mut self, result: Result<Option<AccountCredential>, BackendError>) {
        match result {
            Ok(credential) => {
                match &credential {
                    Some(c) => info!("Account set, device key {} provisioned", c.key_pair.public),
                    None => info!("Account cleared"),
                }
                self.credential = credential;
                self.finish(Ok(SessionState::Disconnected));
            }
            Err(err) => {
                error!("Account key provisioning failed: {}", err);
                self.finish(Err(SessionError::Rotation(err)));
            }
        }
    }

    /// Enter the error state, asserting `is_blocking` only if the
    /// default-deny layer is confirmed installed.
    async fn enter_error_state(&mut self, cause: ErrorCause) -> SessionState {
        let is_blocking = self
            .registry
            .ensure_installed(PolicyLayer::persistent())
            .await
            .is_ok();
        if !is_blocking {
            error!("Default-deny layer could not be engaged; traffic is NOT blocked");
        }
        let state = SessionState::Error { cause, is_blocking };
        self.commit(state.clone());
        state
    }

    /// Commit a state transition and publish it to observers.
    fn commit(&mut self, state: SessionState) {
        if let SessionState::Error { cause, .. } = &state {
            self.session.last_error = Some(cause.clone());
        }
        info!("Session state: {}", state);
        self.session.state = state;
        let _ = self.snapshot.send(self.session.clone());
        let _ = self.events.send(self.session.clone());
    }

    /// Complete the active operation and close the transition bracket.
    fn finish(&mut self, result: CommandResult) {
        self.serializer.complete_active(result);
        self.registry.end_transition();
    }
}

/// Backend side of an account switch: best-effort delete of the old key,
/// then push of a freshly generated key for the new token.
async fn rotate_credential(
    rotator: &CredentialRotator,
    old: Option<(AccountToken, PublicKey)>,
    token: Option<AccountToken>,
) -> Result<Option<AccountCredential>, BackendError> {
    if let Some((old_token, old_key)) = old {
        if let Err(err) = rotator.delete(&old_token, &old_key).await {
            // Lesser risk than blocking the switch; the stale key ages out
            // server-side.
            warn!("Old device key not removed ({}); continuing account switch", err);
        }
    }

    match token {
        None => Ok(None),
        Some(token) => {
            let key_pair = KeyPair::generate();
            let assigned_addresses = rotator.push(&token, &key_pair.public).await?;
            Ok(Some(AccountCredential {
                account_token: token,
                key_pair,
                assigned_addresses,
            }))
        }
    }
}
