// ============================================================================
// Refresh Scheduler
// ============================================================================
//
// Two kinds of deferred work:
//
// - Debounced refresh per trigger group. A newer request cancels the pending
//   (or running) one and restarts the window.
// - Gated validation per key. At most one run starts per interval; a request
//   inside the interval is deferred to the interval boundary and replaces any
//   earlier deferred request.
//
// Cancellation is cooperative (the handler's token) and forced (task abort).
//
// ============================================================================

use crate::config::{DebounceConfig, SyncConfig};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{Level, event};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TriggerGroup {
    Navigation,
    Foreground,
    Custom(String),
}

impl fmt::Display for TriggerGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerGroup::Navigation => write!(f, "navigation"),
            TriggerGroup::Foreground => write!(f, "foreground"),
            TriggerGroup::Custom(name) => write!(f, "custom:{}", name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationDecision {
    /// No validation ran within the interval; the handler started now.
    Started,
    /// Queued for the interval boundary.
    Deferred,
}

struct Scheduled {
    generation: u64,
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl Scheduled {
    fn cancel(self) {
        self.token.cancel();
        self.join.abort();
    }

    fn is_live(&self) -> bool {
        !self.join.is_finished()
    }
}

#[derive(Default)]
struct ValidationSlot {
    last_started: Option<Instant>,
    running: Option<Scheduled>,
    deferred: Option<Scheduled>,
}

impl ValidationSlot {
    fn live(&self) -> usize {
        [&self.running, &self.deferred]
            .into_iter()
            .flatten()
            .filter(|s| s.is_live())
            .count()
    }

    fn cancel(&mut self) -> usize {
        let mut cancelled = 0;
        for scheduled in [self.running.take(), self.deferred.take()].into_iter().flatten() {
            scheduled.cancel();
            cancelled += 1;
        }
        cancelled
    }
}

#[derive(Default)]
struct Inner {
    debounced: HashMap<TriggerGroup, Scheduled>,
    validations: HashMap<String, ValidationSlot>,
    next_generation: u64,
}

impl Inner {
    fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}

/// Debounces refresh triggers and rate-limits validation passes.
///
/// Handlers receive a `CancellationToken` and must check it before touching
/// shared state. Dropping the scheduler cancels everything it still owns.
pub struct RefreshScheduler {
    debounce: DebounceConfig,
    validation_interval: Duration,
    inner: Arc<Mutex<Inner>>,
}

impl RefreshScheduler {
    pub fn new(debounce: DebounceConfig, validation_interval: Duration) -> Self {
        Self {
            debounce,
            validation_interval,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.debounce.clone(), config.validation_interval_duration())
    }

    pub fn window_for(&self, group: &TriggerGroup) -> Duration {
        match group {
            TriggerGroup::Foreground => Duration::from_millis(self.debounce.foreground_ms),
            TriggerGroup::Navigation | TriggerGroup::Custom(_) => {
                Duration::from_millis(self.debounce.navigation_ms)
            }
        }
    }

    pub fn validation_interval(&self) -> Duration {
        self.validation_interval
    }

    /// Runs `handler` once the group's window passes without a newer request.
    ///
    /// Returns the request's generation number.
    pub fn schedule<F, Fut>(&self, group: TriggerGroup, handler: F) -> u64
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let window = self.window_for(&group);
        let mut inner = lock(&self.inner);
        let generation = inner.next_generation();

        if let Some(previous) = inner.debounced.remove(&group) {
            event!(
                Level::DEBUG,
                group = %group,
                superseded = previous.generation,
                generation,
                "refresh request superseded"
            );
            previous.cancel();
        }

        let token = CancellationToken::new();
        let task_token = token.clone();
        let shared = self.inner.clone();
        let task_group = group.clone();
        let join = tokio::spawn(async move {
            tokio::select! {
                _ = task_token.cancelled() => return,
                _ = sleep(window) => {}
            }
            handler(task_token).await;

            let mut inner = lock(&shared);
            if inner
                .debounced
                .get(&task_group)
                .is_some_and(|current| current.generation == generation)
            {
                inner.debounced.remove(&task_group);
            }
        });

        inner.debounced.insert(
            group,
            Scheduled {
                generation,
                token,
                join,
            },
        );
        generation
    }

    /// Starts `handler` now, or defers it to the end of the key's interval.
    pub fn schedule_validation<F, Fut>(&self, key: impl Into<String>, handler: F) -> ValidationDecision
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        let interval = self.validation_interval;
        let now = Instant::now();

        let mut inner = lock(&self.inner);
        let generation = inner.next_generation();
        let slot = inner.validations.entry(key.clone()).or_default();

        let (decision, start_at) = match slot.last_started {
            Some(last) if now.duration_since(last) < interval => {
                (ValidationDecision::Deferred, last + interval)
            }
            _ => {
                slot.last_started = Some(now);
                (ValidationDecision::Started, now)
            }
        };

        // A deferred request only ever replaces the previous deferred one.
        if let Some(previous) = slot.deferred.take() {
            event!(
                Level::DEBUG,
                key = %key,
                superseded = previous.generation,
                "deferred validation superseded"
            );
            previous.cancel();
        }
        if decision == ValidationDecision::Started {
            if let Some(previous) = slot.running.take() {
                previous.cancel();
            }
        }

        let token = CancellationToken::new();
        let task_token = token.clone();
        let shared = self.inner.clone();
        let task_key = key.clone();
        let join = tokio::spawn(async move {
            if decision == ValidationDecision::Deferred {
                tokio::select! {
                    _ = task_token.cancelled() => return,
                    _ = sleep_until(start_at) => {}
                }
                let mut inner = lock(&shared);
                let Some(slot) = inner.validations.get_mut(&task_key) else {
                    return;
                };
                if !slot.deferred.as_ref().is_some_and(|t| t.generation == generation) {
                    return;
                }
                if let Some(previous) = slot.running.take() {
                    previous.cancel();
                }
                slot.running = slot.deferred.take();
                slot.last_started = Some(Instant::now());
            }

            handler(task_token).await;

            let mut inner = lock(&shared);
            if let Some(slot) = inner.validations.get_mut(&task_key) {
                if slot.running.as_ref().is_some_and(|t| t.generation == generation) {
                    slot.running = None;
                }
            }
        });

        let scheduled = Scheduled {
            generation,
            token,
            join,
        };
        match decision {
            ValidationDecision::Started => slot.running = Some(scheduled),
            ValidationDecision::Deferred => slot.deferred = Some(scheduled),
        }
        event!(Level::DEBUG, key = %key, decision = ?decision, "validation requested");
        decision
    }

    /// Cancels the group's pending or running refresh.
    pub fn cancel(&self, group: &TriggerGroup) -> bool {
        let removed = lock(&self.inner).debounced.remove(group);
        match removed {
            Some(scheduled) => {
                event!(Level::DEBUG, group = %group, "refresh cancelled");
                scheduled.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every refresh and validation; used at shutdown.
    pub fn cancel_all(&self) {
        let mut inner = lock(&self.inner);
        let mut cancelled = 0usize;
        for (_, scheduled) in inner.debounced.drain() {
            scheduled.cancel();
            cancelled += 1;
        }
        for slot in inner.validations.values_mut() {
            cancelled += slot.cancel();
        }
        if cancelled > 0 {
            event!(Level::DEBUG, cancelled, "scheduled work cancelled");
        }
    }

    /// Requests still waiting for their window or running.
    pub fn pending_count(&self) -> usize {
        let inner = lock(&self.inner);
        let debounced = inner.debounced.values().filter(|s| s.is_live()).count();
        let validations: usize = inner.validations.values().map(ValidationSlot::live).sum();
        debounced + validations
    }
}

impl fmt::Debug for RefreshScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshScheduler")
            .field("debounce", &self.debounce)
            .field("validation_interval", &self.validation_interval)
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
