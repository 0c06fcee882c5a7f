//! Single-flight execution
//!
//! At most one operation runs at a time. Callers arriving while it runs get
//! a clone of the same shared future and therefore the same result.
//!
//! The work itself runs in a spawned task. A waiter that gives up (for
//! example on a request deadline) only drops its handle; the operation keeps
//! going for everyone else.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use crate::error::{ZoneError, ZoneResult};

/// Shared handle to an in-flight operation's result
pub type FlightFuture<T> = Shared<BoxFuture<'static, ZoneResult<T>>>;

struct Flight<T: Clone> {
    id: u64,
    forced: bool,
    future: FlightFuture<T>,
}

/// Outcome of [`SingleFlight::join_or_start`]
pub struct Joined<T: Clone> {
    /// Shared result handle
    pub future: FlightFuture<T>,
    /// Whether this call started the operation
    pub started: bool,
    /// Whether the joined operation was started as forced
    pub forced: bool,
}

/// Single-flight guard for one logical operation
pub struct SingleFlight<T: Clone> {
    slot: Arc<Mutex<Option<Flight<T>>>>,
    next_id: AtomicU64,
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create an idle guard
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an operation is currently running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// The running operation, if any
    #[must_use]
    pub fn current(&self) -> Option<Joined<T>> {
        self.slot.lock().as_ref().map(|flight| Joined {
            future: flight.future.clone(),
            started: false,
            forced: flight.forced,
        })
    }

    /// Join the running operation, or start `work` if none is running
    ///
    /// `work` is only invoked when this call starts the operation.
    pub fn join_or_start<F, Fut>(&self, forced: bool, work: F) -> Joined<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ZoneResult<T>> + Send + 'static,
    {
        let mut slot = self.slot.lock();
        if let Some(flight) = slot.as_ref() {
            return Joined {
                future: flight.future.clone(),
                started: false,
                forced: flight.forced,
            };
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let task_slot = Arc::clone(&self.slot);
        let work = work();
        let handle = tokio::spawn(async move {
            let result = work.await;
            clear_if_current(&task_slot, id);
            result
        });

        // Also clears on the panic path, where the task never reaches its own
        // cleanup.
        let waiter_slot = Arc::clone(&self.slot);
        let future = async move {
            let result = handle.await.unwrap_or_else(|e| Err(ZoneError::from(e)));
            clear_if_current(&waiter_slot, id);
            result
        }
        .boxed()
        .shared();

        *slot = Some(Flight {
            id,
            forced,
            future: future.clone(),
        });

        Joined {
            future,
            started: true,
            forced,
        }
    }
}

fn clear_if_current<T: Clone>(slot: &Mutex<Option<Flight<T>>>, id: u64) {
    let mut slot = slot.lock();
    if slot.as_ref().is_some_and(|flight| flight.id == id) {
        *slot = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_run() {
        let flight: Arc<SingleFlight<u32>> = Arc::new(SingleFlight::new());
        let runs = Arc::new(AtomicU32::new(0));

        let mut waiters = Vec::new();
        for _ in 0..10 {
            let flight = Arc::clone(&flight);
            let runs = Arc::clone(&runs);
            waiters.push(tokio::spawn(async move {
                let joined = flight.join_or_start(false, move || async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(7)
                });
                joined.future.await
            }));
        }

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), Ok(7));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!flight.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_are_shared() {
        let flight: SingleFlight<u32> = SingleFlight::new();
        let a = flight.join_or_start(false, || async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err(ZoneError::SourceUnavailable("down".into()))
        });
        let b = flight.join_or_start(false, || async { Ok(1) });

        assert!(a.started);
        assert!(!b.started);
        let expected = Err(ZoneError::SourceUnavailable("down".into()));
        assert_eq!(a.future.await, expected);
        assert_eq!(b.future.await, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_waiter_does_not_cancel_work() {
        let flight: SingleFlight<u32> = SingleFlight::new();
        let done = Arc::new(AtomicU32::new(0));
        let marker = Arc::clone(&done);

        let joined = flight.join_or_start(false, move || async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            marker.store(1, Ordering::SeqCst);
            Ok(3)
        });

        let timed_out = tokio::time::timeout(Duration::from_secs(1), joined.future).await;
        assert!(timed_out.is_err());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert!(!flight.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_run_after_completion() {
        let flight: SingleFlight<u32> = SingleFlight::new();
        assert_eq!(flight.join_or_start(false, || async { Ok(1) }).future.await, Ok(1));

        let second = flight.join_or_start(true, || async { Ok(2) });
        assert!(second.started);
        assert!(second.forced);
        assert_eq!(second.future.await, Ok(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_work_reports_error_and_resets() {
        let flight: SingleFlight<u32> = SingleFlight::new();
        let joined = flight.join_or_start(false, || async {
            let fail = true;
            if fail {
                panic!("boom");
            }
            Ok(0)
        });
        assert!(matches!(joined.future.await, Err(ZoneError::IndexBuild(_))));
        assert!(!flight.is_running());
    }
}
