use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::{Mutex, MutexGuard, PoisonError};

use blesyn_transport::TransportHealthSnapshot;
use tracing::warn;

/// Queue sizes shared by the worker-thread backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerQueueConfig {
    pub command_capacity: usize,
    pub event_capacity: usize,
}

impl Default for WorkerQueueConfig {
    fn default() -> Self {
        Self {
            command_capacity: 64,
            event_capacity: 256,
        }
    }
}

/// Health counters updated from both the caller and the worker thread.
#[derive(Debug, Default)]
pub struct WorkerCounters {
    calls_ok: AtomicU64,
    calls_err: AtomicU64,
    events_delivered: AtomicU64,
    events_dropped: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl WorkerCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_call<E: fmt::Display>(&self, result: &Result<(), E>) {
        match result {
            Ok(()) => Self::bump(&self.calls_ok),
            Err(err) => self.record_error(err),
        }
    }

    /// Counts a failure, including ones that happen inside the worker.
    pub fn record_error(&self, err: impl fmt::Display) {
        Self::bump(&self.calls_err);
        *lock(&self.last_error) = Some(err.to_string());
    }

    pub fn record_delivered(&self) {
        Self::bump(&self.events_delivered);
    }

    pub fn record_dropped(&self) {
        Self::bump(&self.events_dropped);
    }

    pub fn snapshot(&self) -> TransportHealthSnapshot {
        TransportHealthSnapshot {
            calls_ok: self.calls_ok.load(Ordering::Relaxed),
            calls_err: self.calls_err.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            last_error: lock(&self.last_error).clone(),
        }
    }
}

/// Hands an event from the worker to the polling side without blocking.
/// Returns `false` when the event was dropped.
pub fn forward<E: fmt::Debug>(tx: &SyncSender<E>, counters: &WorkerCounters, event: E) -> bool {
    match tx.try_send(event) {
        Ok(()) => true,
        Err(TrySendError::Full(event)) => {
            warn!("ble worker: event queue full, dropping {:?}", event);
            counters.record_dropped();
            false
        }
        Err(TrySendError::Disconnected(_)) => false,
    }
}

/// Locks `mutex`, recovering the data if a holder panicked.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn counters_feed_the_health_snapshot() {
        let counters = WorkerCounters::default();
        counters.record_call::<String>(&Ok(()));
        counters.record_call(&Err("adapter gone"));
        counters.record_delivered();

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.calls_ok, 1);
        assert_eq!(snapshot.calls_err, 1);
        assert_eq!(snapshot.events_delivered, 1);
        assert_eq!(snapshot.last_error.as_deref(), Some("adapter gone"));
    }

    #[test]
    fn full_queue_drops_and_counts() {
        let counters = WorkerCounters::default();
        let (tx, rx) = mpsc::sync_channel::<u8>(1);
        assert!(forward(&tx, &counters, 1));
        assert!(!forward(&tx, &counters, 2));
        assert_eq!(counters.snapshot().events_dropped, 1);
        assert_eq!(rx.try_recv(), Ok(1));

        drop(rx);
        assert!(!forward(&tx, &counters, 3));
        assert_eq!(counters.snapshot().events_dropped, 1);
    }
}
