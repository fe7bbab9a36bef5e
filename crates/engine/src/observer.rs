//! Observer dispatch with per-observer circuit breaking.
//!
//! Observers are notified fire-and-forget; a misbehaving observer is
//! isolated by its own breaker and can never stall or fail a run. An open
//! breaker lets a probe event through periodically so a recovered observer
//! can close it again.

use crate::events::{EngineEvent, EngineObserver};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

pub type ObserverToken = u64;

#[derive(Debug, Clone, Copy)]
pub struct ObserverHealthConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Consecutive successes that close it again.
    pub recovery_threshold: u32,
    /// While open, one probe event is let through every this-many skips.
    pub probe_interval: u32,
}

impl Default for ObserverHealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_threshold: 2,
            probe_interval: 25,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    consecutive_failures: u32,
    consecutive_successes: u32,
    skips_since_open: u32,
    open: bool,
}

/// Thread-safe per-observer health tracker with hysteresis.
pub struct ObserverHealth {
    config: ObserverHealthConfig,
    counters: Mutex<HashMap<ObserverToken, Counters>>,
}

impl ObserverHealth {
    pub fn new(config: ObserverHealthConfig) -> Self {
        Self {
            config,
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Whether the observer should receive the next event. Advances the
    /// probe counter when the breaker is open.
    pub fn should_process(&self, token: ObserverToken) -> bool {
        let mut counters = self.counters.lock();
        let entry = counters.entry(token).or_default();
        if !entry.open {
            return true;
        }
        entry.skips_since_open += 1;
        if entry.skips_since_open >= self.config.probe_interval {
            entry.skips_since_open = 0;
            return true;
        }
        false
    }

    pub fn record_success(&self, token: ObserverToken) {
        let mut counters = self.counters.lock();
        let entry = counters.entry(token).or_default();
        entry.consecutive_failures = 0;
        entry.consecutive_successes += 1;
        if entry.open && entry.consecutive_successes >= self.config.recovery_threshold {
            entry.open = false;
            entry.skips_since_open = 0;
            log::info!("observer {token}: circuit closed after recovery");
        }
    }

    pub fn record_failure(&self, token: ObserverToken, error: &anyhow::Error) {
        let mut counters = self.counters.lock();
        let entry = counters.entry(token).or_default();
        entry.consecutive_successes = 0;
        entry.consecutive_failures += 1;
        if !entry.open && entry.consecutive_failures >= self.config.failure_threshold {
            entry.open = true;
            entry.skips_since_open = 0;
            log::warn!(
                "observer {token}: circuit opened after {} consecutive failures (last: {error})",
                entry.consecutive_failures
            );
        }
    }

    pub fn is_open(&self, token: ObserverToken) -> bool {
        self.counters
            .lock()
            .get(&token)
            .map(|c| c.open)
            .unwrap_or(false)
    }
}

/// The registered observers of one engine, dispatched to on every forwarded
/// event.
#[derive(Clone)]
pub struct ObserverSet {
    observers: Arc<Vec<(ObserverToken, Arc<dyn EngineObserver>)>>,
    health: Arc<ObserverHealth>,
}

impl ObserverSet {
    pub fn new(
        observers: Vec<Arc<dyn EngineObserver>>,
        config: ObserverHealthConfig,
    ) -> Self {
        let observers = observers
            .into_iter()
            .enumerate()
            .map(|(index, observer)| (index as ObserverToken + 1, observer))
            .collect();
        Self {
            observers: Arc::new(observers),
            health: Arc::new(ObserverHealth::new(config)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Notifies every healthy, interested observer, fire-and-forget.
    pub fn dispatch(&self, event: &EngineEvent) {
        for (token, observer) in self.observers.iter() {
            if !self.health.should_process(*token) {
                continue;
            }
            if !observer.should_process(event) {
                continue;
            }
            let token = *token;
            let observer = observer.clone();
            let health = self.health.clone();
            let event = event.clone();
            tokio::spawn(async move {
                match observer.on_event(&event).await {
                    Ok(()) => health.record_success(token),
                    Err(err) => health.record_failure(token, &err),
                }
            });
        }
    }

    pub fn health(&self) -> &Arc<ObserverHealth> {
        &self.health
    }
}
