//! Per-request completion aggregation.
//!
//! One `PendingIo` tracks a logical request across however many
//! sub-requests it was split into. The count starts at 1 (the issuing
//! path's hold), gains 1 per sub-request strictly before dispatch, and
//! loses 1 per sub-request completion plus 1 when issuing finishes. The
//! zero crossing fires the caller's completion exactly once with the first
//! error observed, then releases the shared segment storage and the
//! descriptor slot.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::trace;

use bvd_core::{BvdError, BvdResult, Completion, Segment};

use crate::pool::IoPermit;

pub struct PendingIo {
    count: AtomicUsize,
    first_error: Mutex<Option<BvdError>>,
    done: Mutex<Option<Completion>>,
    /// Keeps the request's segment array alive until the last completion.
    segments: Mutex<Option<Arc<[Segment]>>>,
    permit: Mutex<Option<IoPermit>>,
}

impl PendingIo {
    pub fn new(done: Completion, segments: Arc<[Segment]>, permit: IoPermit) -> Arc<Self> {
        Arc::new(Self {
            count: AtomicUsize::new(1),
            first_error: Mutex::new(None),
            done: Mutex::new(Some(done)),
            segments: Mutex::new(Some(segments)),
            permit: Mutex::new(Some(permit)),
        })
    }

    /// Account for one more in-flight sub-request. Must happen before the
    /// sub-request is dispatched so its completion cannot race the count
    /// to zero.
    pub fn hold(&self) {
        let prev = self.count.fetch_add(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "hold on a drained pending-io");
    }

    /// Record an error; only the first one sticks.
    pub fn fail(&self, err: BvdError) {
        let mut guard = self.first_error.lock().expect("pending-io error poisoned");
        if guard.is_none() {
            trace!(error = %err, "pending-io first error recorded");
            *guard = Some(err);
        }
    }

    pub fn first_error(&self) -> Option<BvdError> {
        self.first_error
            .lock()
            .expect("pending-io error poisoned")
            .clone()
    }

    /// Drop one reference; the zero crossing fires the completion.
    pub fn complete(&self) {
        let prev = self.count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "pending-io count underflow");
        if prev == 1 {
            self.fire();
        }
    }

    fn fire(&self) {
        // Release the shared segment storage before signaling.
        self.segments
            .lock()
            .expect("pending-io segments poisoned")
            .take();

        let result: BvdResult<()> = match self.first_error() {
            Some(err) => Err(err),
            None => Ok(()),
        };
        if let Some(done) = self.done.lock().expect("pending-io done poisoned").take() {
            done(result);
        }

        // Return the descriptor slot only after the caller was signaled.
        self.permit
            .lock()
            .expect("pending-io permit poisoned")
            .take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::IoPool;
    use std::sync::atomic::AtomicUsize;

    fn permit() -> IoPermit {
        IoPool::new(4).acquire().unwrap()
    }

    fn counted() -> (Arc<PendingIo>, Arc<AtomicUsize>, Arc<Mutex<Option<BvdResult<()>>>>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let result = Arc::new(Mutex::new(None));
        let fired2 = Arc::clone(&fired);
        let result2 = Arc::clone(&result);
        let pending = PendingIo::new(
            Box::new(move |r| {
                fired2.fetch_add(1, Ordering::SeqCst);
                *result2.lock().unwrap() = Some(r);
            }),
            Vec::new().into(),
            permit(),
        );
        (pending, fired, result)
    }

    #[test]
    fn completes_exactly_once_without_subrequests() {
        let (pending, fired, result) = counted();
        pending.complete();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(result.lock().unwrap().clone().unwrap(), Ok(()));
    }

    #[test]
    fn waits_for_all_subrequests() {
        let (pending, fired, _) = counted();
        pending.hold();
        pending.hold();
        pending.complete(); // issuing path
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        pending.complete();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        pending.complete();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn tolerates_completion_before_issuing_finishes() {
        let (pending, fired, _) = counted();
        pending.hold();
        pending.complete(); // sub-request done before issuing path exits
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        pending.complete();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn first_error_wins() {
        let (pending, _, result) = counted();
        pending.hold();
        pending.hold();
        pending.fail(BvdError::Device("second sub failed".into()));
        pending.complete();
        pending.fail(BvdError::NoPages);
        pending.complete();
        pending.complete();
        assert_eq!(
            result.lock().unwrap().clone().unwrap(),
            Err(BvdError::Device("second sub failed".into()))
        );
    }

    #[test]
    fn concurrent_completions_fire_once() {
        for _ in 0..64 {
            let (pending, fired, _) = counted();
            let n = 8;
            for _ in 0..n {
                pending.hold();
            }
            let handles: Vec<_> = (0..n)
                .map(|_| {
                    let p = Arc::clone(&pending);
                    std::thread::spawn(move || p.complete())
                })
                .collect();
            pending.complete();
            for h in handles {
                h.join().unwrap();
            }
            assert_eq!(fired.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn permit_returns_to_pool_after_fire() {
        let pool = IoPool::new(1);
        let permit = pool.acquire().unwrap();
        let pending = PendingIo::new(Box::new(|_| {}), Vec::new().into(), permit);
        assert_eq!(pool.in_use(), 1);
        pending.complete();
        assert_eq!(pool.in_use(), 0);
    }
}
