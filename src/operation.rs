use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{Error, Result};

type CancelFn = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Slot {
    /// Monotonic id of the operation currently (or last) occupying the
    /// slot. A finished operation may only clear its own generation,
    /// so a stale completion never evicts a successor.
    generation: u64,
    cancel: Option<CancelFn>,
}

/// Enforces at most one concurrent foreground cancellable action.
///
/// `start` runs the action in the background and clears the slot when
/// it finishes, success or failure, without invoking the compensating
/// callback. `cancel` invokes the callback exactly once; cancelling an
/// empty slot, or twice in a row, does nothing.
#[derive(Default)]
pub struct OperationCoordinator {
    slot: Arc<Mutex<Slot>>,
    send_locks: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl OperationCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a foreground operation.
    ///
    /// # Errors
    /// - [`Error::Busy`] if an operation is already active. `work` is
    ///   not invoked and the active operation is unaffected.
    pub fn start<F>(
        &self,
        work: F,
        on_cancel: impl FnOnce() + Send + 'static,
    ) -> Result<JoinHandle<()>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = {
            let mut slot = self.slot.lock();
            if slot.cancel.is_some() {
                return Err(Error::Busy);
            }

            slot.generation += 1;
            slot.cancel = Some(Box::new(on_cancel));
            slot.generation
        };

        let slot = Arc::clone(&self.slot);
        Ok(tokio::spawn(async move {
            work.await;

            let mut slot = slot.lock();
            if slot.generation == generation {
                // Completion clears the slot; the callback is dropped
                // unused.
                slot.cancel = None;
            }
        }))
    }

    /// Cancels the active operation by invoking its compensating
    /// callback. Returns whether a callback ran. Cancellation is
    /// cooperative; an in-flight remote call issued by the operation
    /// is not aborted.
    pub fn cancel(&self) -> bool {
        let cancel = self.slot.lock().cancel.take();

        match cancel {
            Some(cancel) => {
                info!("Cancelling active operation");
                cancel();
                true
            }
            None => {
                debug!("No active operation to cancel");
                false
            }
        }
    }

    pub fn is_busy(&self) -> bool {
        self.slot.lock().cancel.is_some()
    }

    /// Tries to take the advisory send lock for an adapter, so at most
    /// one send session is active per adapter. Never blocks; the
    /// permit frees the adapter when dropped.
    ///
    /// # Errors
    /// - [`Error::SendInProgress`] if a send already holds the lock.
    pub fn try_acquire_send(&self, adapter_path: &str) -> Result<OwnedSemaphorePermit> {
        let semaphore = {
            let mut locks = self.send_locks.lock();
            Arc::clone(
                locks
                    .entry(adapter_path.to_owned())
                    .or_insert_with(|| Arc::new(Semaphore::new(1))),
            )
        };

        semaphore
            .try_acquire_owned()
            .map_err(|_| Error::SendInProgress(adapter_path.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let cb = {
            let count = Arc::clone(&count);
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            }
        };
        (count, cb)
    }

    #[tokio::test]
    async fn a_second_start_is_rejected_without_touching_the_first() {
        let ops = OperationCoordinator::new();
        let (cancelled, on_cancel) = counter();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        ops.start(
            async move {
                let _ = release_rx.await;
            },
            on_cancel,
        )
        .expect("first start");

        let second = ops.start(async {}, || {});
        assert!(matches!(second, Err(Error::Busy)));
        assert_eq!(cancelled.load(Ordering::SeqCst), 0);

        release_tx.send(()).expect("release");
    }

    #[tokio::test]
    async fn completion_clears_the_slot_without_invoking_the_callback() {
        let ops = OperationCoordinator::new();
        let (cancelled, on_cancel) = counter();

        let handle = ops.start(async {}, on_cancel).expect("start");
        handle.await.expect("join");

        assert!(!ops.is_busy());
        assert_eq!(cancelled.load(Ordering::SeqCst), 0);
        assert!(ops.start(async {}, || {}).is_ok());
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let ops = OperationCoordinator::new();
        let (cancelled, on_cancel) = counter();
        let (_release_tx, release_rx) = oneshot::channel::<()>();

        ops.start(
            async move {
                let _ = release_rx.await;
            },
            on_cancel,
        )
        .expect("start");

        assert!(ops.cancel());
        assert!(!ops.cancel());
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_on_an_empty_slot_does_nothing() {
        let ops = OperationCoordinator::new();
        assert!(!ops.cancel());
    }

    #[tokio::test]
    async fn a_stale_completion_does_not_evict_a_successor() {
        let ops = OperationCoordinator::new();
        let (first_cancelled, first_cb) = counter();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let first = ops
            .start(
                async move {
                    let _ = release_rx.await;
                },
                first_cb,
            )
            .expect("first start");

        // Cancel the first operation, then start a second while the
        // first task is still draining.
        assert!(ops.cancel());
        assert_eq!(first_cancelled.load(Ordering::SeqCst), 1);

        let (_second_tx, second_rx) = oneshot::channel::<()>();
        ops.start(
            async move {
                let _ = second_rx.await;
            },
            || {},
        )
        .expect("second start");

        release_tx.send(()).expect("release first");
        first.await.expect("join first");

        // The second operation still occupies the slot.
        assert!(ops.is_busy());
        assert!(matches!(ops.start(async {}, || {}), Err(Error::Busy)));
    }

    #[tokio::test]
    async fn send_lock_is_exclusive_per_adapter() {
        let ops = OperationCoordinator::new();

        let permit = ops.try_acquire_send("/org/bluez/hci0").expect("acquire");
        assert!(matches!(
            ops.try_acquire_send("/org/bluez/hci0"),
            Err(Error::SendInProgress(_))
        ));

        // A different adapter is unaffected.
        ops.try_acquire_send("/org/bluez/hci1").expect("acquire other");

        drop(permit);
        ops.try_acquire_send("/org/bluez/hci0").expect("reacquire");
    }
}
