//! Per-run event coordination.
//!
//! The coordinator is the single funnel for everything a run emits: the
//! streaming path, middleware, the function-call processor, and the driver
//! itself all write into one unbounded queue that the driver drains toward
//! the caller. It also owns the request/response waiter map that powers the
//! bidirectional events (permissions, continuations, clarifications), and
//! the optional parent link that lets nested agents bubble their events to
//! the orchestrating run in real time.

use crate::error::{EngineError, WaitError};
use crate::events::{EngineEvent, EngineEventKind};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Sentinel for "no iteration" on emitted events.
const NO_ITERATION: u32 = u32::MAX;

/// Answer to a permission request.
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionDecision {
    pub approved: bool,
    pub reason: Option<String>,
}

/// Answer to a continuation request at the iteration cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinuationDecision {
    pub approved: bool,
}

/// Answer to a clarification request.
#[derive(Debug, Clone, PartialEq)]
pub struct ClarificationAnswer {
    pub answer: Option<Value>,
}

/// The typed payloads a caller can deliver to a pending waiter.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    Permission(PermissionDecision),
    Continuation(ContinuationDecision),
    Clarification(ClarificationAnswer),
}

impl TryFrom<ResponsePayload> for PermissionDecision {
    type Error = WaitError;

    fn try_from(payload: ResponsePayload) -> Result<Self, WaitError> {
        match payload {
            ResponsePayload::Permission(decision) => Ok(decision),
            _ => Err(WaitError::TypeMismatch {
                expected: "PermissionDecision",
            }),
        }
    }
}

impl TryFrom<ResponsePayload> for ContinuationDecision {
    type Error = WaitError;

    fn try_from(payload: ResponsePayload) -> Result<Self, WaitError> {
        match payload {
            ResponsePayload::Continuation(decision) => Ok(decision),
            _ => Err(WaitError::TypeMismatch {
                expected: "ContinuationDecision",
            }),
        }
    }
}

impl TryFrom<ResponsePayload> for ClarificationAnswer {
    type Error = WaitError;

    fn try_from(payload: ResponsePayload) -> Result<Self, WaitError> {
        match payload {
            ResponsePayload::Clarification(answer) => Ok(answer),
            _ => Err(WaitError::TypeMismatch {
                expected: "ClarificationAnswer",
            }),
        }
    }
}

pub struct EventCoordinator {
    run_id: String,
    queue: mpsc::UnboundedSender<EngineEvent>,
    sequence: AtomicU64,
    iteration: AtomicU32,
    parent: RwLock<Option<Arc<EventCoordinator>>>,
    waiters: Mutex<HashMap<String, oneshot::Sender<ResponsePayload>>>,
    closed: AtomicBool,
}

impl EventCoordinator {
    /// Creates a coordinator and hands back the single consumer end of its
    /// queue.
    pub fn new(run_id: impl Into<String>) -> (Arc<Self>, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = Arc::new(Self {
            run_id: run_id.into(),
            queue: tx,
            sequence: AtomicU64::new(1),
            iteration: AtomicU32::new(NO_ITERATION),
            parent: RwLock::new(None),
            waiters: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        (coordinator, rx)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Sets the iteration stamped onto subsequently emitted events.
    pub fn set_iteration(&self, iteration: u32) {
        self.iteration.store(iteration, Ordering::Relaxed);
    }

    pub fn clear_iteration(&self) {
        self.iteration.store(NO_ITERATION, Ordering::Relaxed);
    }

    /// Emits an event into the local queue and bubbles it to the parent
    /// chain. Emissions after close are dropped.
    pub fn emit(&self, kind: EngineEventKind) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        let iteration = match self.iteration.load(Ordering::Relaxed) {
            NO_ITERATION => None,
            n => Some(n),
        };
        let event = EngineEvent {
            seq: self.sequence.fetch_add(1, Ordering::Relaxed),
            timestamp: time::OffsetDateTime::now_utc().unix_timestamp(),
            run_id: self.run_id.clone(),
            iteration,
            kind,
        };
        let _ = self.queue.send(event.clone());
        if let Some(parent) = self.parent.read().clone() {
            parent.emit_raw(event);
        }
    }

    /// Enqueues a fully materialized event (bubbled from a child) without
    /// restamping it, bumping the local sequence past it so later local
    /// events do not collide.
    pub fn emit_raw(&self, event: EngineEvent) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        self.bump_sequence_past(event.seq);
        let _ = self.queue.send(event.clone());
        if let Some(parent) = self.parent.read().clone() {
            parent.emit_raw(event);
        }
    }

    fn bump_sequence_past(&self, seq: u64) {
        let min_next = seq.saturating_add(1);
        let mut current = self.sequence.load(Ordering::Relaxed);
        while current < min_next {
            match self.sequence.compare_exchange_weak(
                current,
                min_next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    /// Installs `parent` as the bubbling target. Rejects any assignment
    /// that would make the parent chain cyclic.
    pub fn set_parent(&self, parent: Arc<EventCoordinator>) -> Result<(), EngineError> {
        let mut cursor = Some(parent.clone());
        while let Some(node) = cursor {
            if std::ptr::eq(node.as_ref(), self) {
                return Err(EngineError::CoordinatorCycle);
            }
            cursor = node.parent.read().clone();
        }
        *self.parent.write() = Some(parent);
        Ok(())
    }

    pub fn parent(&self) -> Option<Arc<EventCoordinator>> {
        self.parent.read().clone()
    }

    /// Registers a waiter for `request_id` and awaits its response.
    ///
    /// Completion, timeout, and external cancellation race; timeout and
    /// cancellation surface as distinct errors. A response whose payload
    /// does not convert to `T` is a type mismatch. The waiter is always
    /// removed on the way out.
    pub async fn wait_for_response<T>(
        &self,
        request_id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<T, WaitError>
    where
        T: TryFrom<ResponsePayload, Error = WaitError>,
    {
        if self.closed.load(Ordering::Relaxed) {
            return Err(WaitError::Closed);
        }

        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(request_id.to_string(), tx);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(WaitError::Cancelled),
            received = rx => match received {
                Ok(payload) => T::try_from(payload),
                // Sender dropped without a response: close() failed us.
                Err(_) => Err(WaitError::Cancelled),
            },
            _ = tokio::time::sleep(timeout) => Err(WaitError::Timeout),
        };

        self.waiters.lock().remove(request_id);
        outcome
    }

    /// Delivers a response to a pending waiter. Responses for unknown ids
    /// (already timed out or completed) are silently dropped.
    pub fn send_response(&self, request_id: &str, payload: ResponsePayload) {
        let sender = self.waiters.lock().remove(request_id);
        if let Some(sender) = sender {
            if sender.send(payload).is_ok() {
                self.emit(EngineEventKind::BidirectionalEventProcessed {
                    request_id: request_id.to_string(),
                });
            }
        }
    }

    pub fn pending_waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Shuts the coordinator down: no further emissions, and every pending
    /// waiter fails as cancelled.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.waiters.lock().clear();
    }
}
