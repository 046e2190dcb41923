//! Per-key trailing-edge debounce.
//!
//! `schedule(key, delay, action)` replaces whatever is pending for `key` with a new timer.
//! A burst of calls on one key, each less than `delay` apart, therefore runs exactly one
//! action (the last one scheduled), `delay` after the last call. Keys do not interact.
//!
//! ## Invariant
//!
//! At most one pending timer per key. Replacing, firing and cancelling all happen under
//! the registry lock, and a timer only runs its action if it is still the registered
//! generation for its key when it wakes up.
//!
//! Every timer's cancellation token is a child of the registry's shutdown token, so
//! process shutdown stops all pending timers. An action that has already started is
//! never interrupted.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use cityscore_core::TaskResult;
use cityscore_observability::Diagnostics;

#[derive(Debug)]
struct PendingTimer {
    generation: u64,
    cancel: CancellationToken,
    // Dropping the handle detaches the task; cancellation goes through `cancel`.
    _task: JoinHandle<()>,
}

type TimerMap = Arc<Mutex<HashMap<String, PendingTimer>>>;

#[derive(Debug)]
pub struct DebounceRegistry {
    timers: TimerMap,
    next_generation: AtomicU64,
    shutdown: CancellationToken,
    diagnostics: Arc<Diagnostics>,
}

impl DebounceRegistry {
    /// Create a registry whose timers all stop when `shutdown` is cancelled.
    pub fn new(shutdown: CancellationToken, diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            timers: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
            shutdown,
            diagnostics,
        }
    }

    /// Run `action` once `delay` has passed without another `schedule` on `key`.
    ///
    /// Cancels the timer currently pending for `key`, if any. A failing action is
    /// reported to the diagnostics sink. Returns `false` (and schedules nothing) once the
    /// registry has been shut down.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule<F, Fut>(&self, key: impl Into<String>, delay: Duration, action: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            return false;
        }

        let key = key.into();
        let deadline = Instant::now() + delay;
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shutdown.child_token();

        let mut timers = self.timers.lock();
        if let Some(previous) = timers.remove(&key) {
            previous.cancel.cancel();
            self.diagnostics.timer_superseded(&key);
        }

        // The timer cannot observe the map before this insert: it takes the same lock.
        let task = tokio::spawn(run_timer(
            self.timers.clone(),
            key.clone(),
            generation,
            cancel.clone(),
            deadline,
            action,
            self.diagnostics.clone(),
        ));

        timers.insert(
            key,
            PendingTimer {
                generation,
                cancel,
                _task: task,
            },
        );
        true
    }

    /// Cancel the pending timer for `key`. Returns whether one was pending.
    pub fn cancel(&self, key: &str) -> bool {
        match self.timers.lock().remove(key) {
            Some(timer) => {
                timer.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every pending timer. Returns how many were pending.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<PendingTimer> = self.timers.lock().drain().map(|(_, t)| t).collect();
        for timer in &drained {
            timer.cancel.cancel();
        }
        drained.len()
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.timers.lock().contains_key(key)
    }

    /// Keys with a pending timer, sorted.
    pub fn pending_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.timers.lock().keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize {
        self.timers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn run_timer<F, Fut>(
    timers: TimerMap,
    key: String,
    generation: u64,
    cancel: CancellationToken,
    deadline: Instant,
    action: F,
    diagnostics: Arc<Diagnostics>,
) where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = TaskResult> + Send + 'static,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            trace!(key = %key, generation, "debounce timer cancelled");
            return;
        }
        _ = tokio::time::sleep_until(deadline) => {}
    }

    {
        let mut timers = timers.lock();
        // Superseded between waking up and taking the lock.
        if cancel.is_cancelled() {
            return;
        }
        match timers.get(&key) {
            Some(current) if current.generation == generation => {
                timers.remove(&key);
            }
            _ => return,
        }
    }

    trace!(key = %key, generation, "debounce timer fired");
    if let Err(err) = action().await {
        diagnostics.handler_failed(&key, true, &err);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::time::advance;

    use cityscore_core::TaskError;

    use super::*;

    fn registry() -> (DebounceRegistry, CancellationToken, Arc<Diagnostics>) {
        let shutdown = CancellationToken::new();
        let diagnostics = Arc::new(Diagnostics::new());
        (
            DebounceRegistry::new(shutdown.clone(), diagnostics.clone()),
            shutdown,
            diagnostics,
        )
    }

    /// Let spawned timer tasks run without moving the paused clock.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_runs_only_the_last_action_after_the_last_call() {
        let (registry, _shutdown, diagnostics) = registry();
        let fired: Arc<Mutex<Vec<(usize, Instant)>>> = Arc::new(Mutex::new(Vec::new()));
        let delay = Duration::from_secs(2);

        let mut last_call = Instant::now();
        for i in 1..=5 {
            let fired = fired.clone();
            last_call = Instant::now();
            registry.schedule("K", delay, move || async move {
                fired.lock().push((i, Instant::now()));
                Ok(())
            });
            settle().await;
            advance(Duration::from_millis(500)).await;
        }

        // 0.5 s after the last call: nothing has fired yet.
        assert!(fired.lock().is_empty());
        assert!(registry.is_pending("K"));

        advance(Duration::from_millis(1_400)).await;
        settle().await;
        assert!(fired.lock().is_empty());

        advance(Duration::from_millis(200)).await;
        settle().await;

        let fired = fired.lock().clone();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, 5);
        assert!(fired[0].1 >= last_call + delay);
        assert!(registry.is_empty());
        assert_eq!(diagnostics.snapshot().superseded_timers, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let (registry, _shutdown, _diagnostics) = registry();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));

        {
            let a = a.clone();
            registry.schedule("A", Duration::from_secs(1), move || async move {
                a.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        {
            let b = b.clone();
            registry.schedule("B", Duration::from_secs(3), move || async move {
                b.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        assert_eq!(registry.pending_keys(), vec!["A".to_string(), "B".to_string()]);

        settle().await;
        advance(Duration::from_millis(1_100)).await;
        settle().await;
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 0);
        assert_eq!(registry.pending_keys(), vec!["B".to_string()]);

        advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_execution() {
        let (registry, _shutdown, _diagnostics) = registry();
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let ran = ran.clone();
            registry.schedule("K", Duration::from_secs(1), move || async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        assert!(registry.cancel("K"));
        assert!(!registry.cancel("K"));

        settle().await;
        advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending_timers_and_refuses_new_ones() {
        let (registry, shutdown, _diagnostics) = registry();
        let ran = Arc::new(AtomicUsize::new(0));
        for key in ["A", "B"] {
            let ran = ran.clone();
            registry.schedule(key, Duration::from_secs(1), move || async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        shutdown.cancel();
        settle().await;
        advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        assert!(!registry.schedule("C", Duration::from_secs(1), || async { Ok(()) }));
        assert_eq!(registry.cancel_all(), 2);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failing_action_is_reported() {
        let (registry, _shutdown, diagnostics) = registry();
        registry.schedule("K", Duration::from_secs(1), || async {
            Err(TaskError::failed("recompute failed"))
        });

        settle().await;
        advance(Duration::from_secs(2)).await;
        settle().await;

        assert_eq!(diagnostics.snapshot().handler_failures, 1);
        assert!(registry.is_empty());
    }
}
