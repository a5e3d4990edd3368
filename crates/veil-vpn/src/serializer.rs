//! Operation serialization.
//!
//! At most one mutating tunnel/account operation runs at a time. Later
//! submissions either merge into an identical in-flight operation (a second
//! `connect` resolves to the same result as the first), queue as the single
//! pending successor of their kind, or supersede an older queued operation
//! of the same kind. Superseded and cancelled callers are answered with a
//! concurrency error, never through the session's public error field.

use crate::config::AccountToken;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::debug;

/// A mutating command accepted by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Connect,
    Disconnect,
    Reconnect,
    SetAccount(Option<AccountToken>),
}

/// Operation kind, ignoring payload. At most one queued successor per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Connect,
    Disconnect,
    Reconnect,
    SetAccount,
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Connect => OperationKind::Connect,
            Operation::Disconnect => OperationKind::Disconnect,
            Operation::Reconnect => OperationKind::Reconnect,
            Operation::SetAccount(_) => OperationKind::SetAccount,
        }
    }
}

/// Reported to callers whose operation never produced a session result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConcurrencyError {
    #[error("Operation superseded by a newer command")]
    Superseded,

    #[error("Operation cancelled")]
    Cancelled,
}

/// Identifies a submitted operation for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationId(u64);

/// Handle returned from `submit`: the id plus the channel the final result
/// arrives on.
pub struct OperationHandle<R> {
    pub id: OperationId,
    pub result: oneshot::Receiver<Result<R, ConcurrencyError>>,
}

type Waiter<R> = oneshot::Sender<Result<R, ConcurrencyError>>;

struct PendingOperation<R> {
    id: OperationId,
    operation: Operation,
    submitted_at: Instant,
    cancelled: AtomicBool,
    waiters: Vec<Waiter<R>>,
}

impl<R: Clone> PendingOperation<R> {
    fn resolve(self, result: Result<R, ConcurrencyError>) {
        for waiter in self.waiters {
            // A dropped receiver just means the caller stopped listening.
            let _ = waiter.send(result.clone());
        }
    }
}

/// Admission queue in front of the session state machine.
///
/// The owning task drives it: `submit` from callers, `admit_next` when
/// idle, `complete_active` when the admitted operation commits.
pub struct OperationSerializer<R> {
    active: Option<PendingOperation<R>>,
    queue: VecDeque<PendingOperation<R>>,
    next_id: u64,
}

impl<R: Clone> OperationSerializer<R> {
    pub fn new() -> Self {
        Self {
            active: None,
            queue: VecDeque::new(),
            next_id: 0,
        }
    }

    /// Submit an operation.
    ///
    /// An identical active or queued operation absorbs the submission as an
    /// extra waiter; a queued operation of the same kind with a different
    /// payload is superseded and replaced.
    pub fn submit(&mut self, operation: Operation) -> OperationHandle<R> {
        let (tx, rx) = oneshot::channel();

        if let Some(active) = &mut self.active {
            if active.operation == operation && !active.cancelled.load(Ordering::Acquire) {
                debug!("Merging {:?} into identical in-flight operation", operation.kind());
                active.waiters.push(tx);
                return OperationHandle { id: active.id, result: rx };
            }
        }

        if let Some(pos) = self
            .queue
            .iter()
            .position(|pending| pending.operation.kind() == operation.kind())
        {
            if self.queue[pos].operation == operation {
                self.queue[pos].waiters.push(tx);
                return OperationHandle { id: self.queue[pos].id, result: rx };
            }
            // Same kind, different payload: latest intent wins.
            let superseded = self.queue.remove(pos).unwrap();
            debug!(
                "Superseding {:?} queued {:?} ago",
                superseded.operation.kind(),
                superseded.submitted_at.elapsed()
            );
            superseded.resolve(Err(ConcurrencyError::Superseded));
        }

        let id = OperationId(self.next_id);
        self.next_id += 1;
        self.queue.push_back(PendingOperation {
            id,
            operation,
            submitted_at: Instant::now(),
            cancelled: AtomicBool::new(false),
            waiters: vec![tx],
        });
        OperationHandle { id, result: rx }
    }

    /// Cancel by handle id.
    ///
    /// A queued operation is dropped immediately. An admitted operation is
    /// past its point of no return: it runs to completion, but its result
    /// is withheld from the cancelling caller and the status stream.
    pub fn cancel(&mut self, id: OperationId) {
        if let Some(pos) = self.queue.iter().position(|pending| pending.id == id) {
            let cancelled = self.queue.remove(pos).unwrap();
            debug!("Cancelled queued {:?}", cancelled.operation.kind());
            cancelled.resolve(Err(ConcurrencyError::Cancelled));
            return;
        }

        if let Some(active) = &self.active {
            if active.id == id {
                debug!("Marking in-flight {:?} cancelled", active.operation.kind());
                active.cancelled.store(true, Ordering::Release);
            }
        }
    }

    /// Admit the next queued operation. Returns `None` while one is active
    /// or the queue is empty.
    pub fn admit_next(&mut self) -> Option<Operation> {
        if self.active.is_some() {
            return None;
        }
        let pending = self.queue.pop_front()?;
        self.active = Some(pending);
        self.active.as_ref().map(|active| active.operation.clone())
    }

    /// The currently admitted operation, if any.
    pub fn active(&self) -> Option<&Operation> {
        self.active.as_ref().map(|active| &active.operation)
    }

    /// Whether the admitted operation was cooperatively cancelled.
    pub fn active_cancelled(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| active.cancelled.load(Ordering::Acquire))
    }

    /// Attach another waiter to the admitted operation.
    pub fn join_active(&mut self) -> Option<OperationHandle<R>> {
        let active = self.active.as_mut()?;
        let (tx, rx) = oneshot::channel();
        active.waiters.push(tx);
        Some(OperationHandle { id: active.id, result: rx })
    }

    /// Complete the admitted operation and notify its waiters.
    ///
    /// Returns `true` if the result should be published (the operation was
    /// not cancelled).
    pub fn complete_active(&mut self, result: R) -> bool {
        let Some(active) = self.active.take() else {
            return false;
        };
        let cancelled = active.cancelled.load(Ordering::Acquire);
        if cancelled {
            active.resolve(Err(ConcurrencyError::Cancelled));
        } else {
            active.resolve(Ok(result));
        }
        !cancelled
    }

    /// Whether any operation is admitted or queued.
    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.queue.is_empty()
    }
}

impl<R: Clone> Default for OperationSerializer<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(s: &str) -> Option<AccountToken> {
        Some(AccountToken::new(s))
    }

    #[tokio::test]
    async fn test_identical_inflight_submissions_merge() {
        let mut serializer = OperationSerializer::<u32>::new();

        let first = serializer.submit(Operation::Connect);
        assert_eq!(serializer.admit_next(), Some(Operation::Connect));
        let second = serializer.submit(Operation::Connect);
        assert_eq!(first.id, second.id);

        assert!(serializer.complete_active(7));
        assert_eq!(first.result.await.unwrap(), Ok(7));
        assert_eq!(second.result.await.unwrap(), Ok(7));
    }

    #[tokio::test]
    async fn test_queued_same_kind_different_payload_is_superseded() {
        let mut serializer = OperationSerializer::<u32>::new();

        let _connect = serializer.submit(Operation::Connect);
        serializer.admit_next();

        let old = serializer.submit(Operation::SetAccount(token("1111")));
        let new = serializer.submit(Operation::SetAccount(token("2222")));
        assert_ne!(old.id, new.id);

        assert_eq!(old.result.await.unwrap(), Err(ConcurrencyError::Superseded));

        serializer.complete_active(1);
        assert_eq!(serializer.admit_next(), Some(Operation::SetAccount(token("2222"))));
    }

    #[tokio::test]
    async fn test_queued_identical_submissions_share_one_slot() {
        let mut serializer = OperationSerializer::<u32>::new();

        let _disconnect = serializer.submit(Operation::Disconnect);
        serializer.admit_next();

        let a = serializer.submit(Operation::Connect);
        let b = serializer.submit(Operation::Connect);
        assert_eq!(a.id, b.id);

        serializer.complete_active(0);
        assert_eq!(serializer.admit_next(), Some(Operation::Connect));
        serializer.complete_active(9);
        assert_eq!(a.result.await.unwrap(), Ok(9));
        assert_eq!(b.result.await.unwrap(), Ok(9));
        assert!(serializer.is_idle());
    }

    #[tokio::test]
    async fn test_cancel_queued_operation() {
        let mut serializer = OperationSerializer::<u32>::new();

        let _active = serializer.submit(Operation::Connect);
        serializer.admit_next();

        let queued = serializer.submit(Operation::Disconnect);
        serializer.cancel(queued.id);

        assert_eq!(queued.result.await.unwrap(), Err(ConcurrencyError::Cancelled));
        serializer.complete_active(0);
        assert_eq!(serializer.admit_next(), None);
    }

    #[tokio::test]
    async fn test_cancel_admitted_operation_discards_result() {
        let mut serializer = OperationSerializer::<u32>::new();

        let handle = serializer.submit(Operation::Connect);
        serializer.admit_next();
        serializer.cancel(handle.id);

        assert!(serializer.active_cancelled());
        // Runs to completion, but the result is not published.
        assert!(!serializer.complete_active(3));
        assert_eq!(handle.result.await.unwrap(), Err(ConcurrencyError::Cancelled));
    }

    #[tokio::test]
    async fn test_admission_is_fifo() {
        let mut serializer = OperationSerializer::<u32>::new();

        let _a = serializer.submit(Operation::Connect);
        let _b = serializer.submit(Operation::Disconnect);

        assert_eq!(serializer.admit_next(), Some(Operation::Connect));
        assert_eq!(serializer.admit_next(), None);
        serializer.complete_active(0);
        assert_eq!(serializer.admit_next(), Some(Operation::Disconnect));
    }
}
