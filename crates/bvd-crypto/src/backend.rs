//! Cipher backends: inline (synchronous, on the submitting thread) and
//! offloaded (bounded queue feeding dedicated worker threads).
//!
//! Both variants speak the same `CipherBackend` contract:
//! - `Completed(result)`: the transform ran synchronously; the unit's
//!   completion callback, if any, has already been invoked with `result`.
//! - `Queued`: the unit was accepted; the callback fires later from a
//!   worker thread. The callback may run before `process` even returns to
//!   the caller, so submitters account for the unit *before* dispatching.
//! - `Busy(unit)`: transient saturation; the unit is handed back untouched
//!   and the submitter retries with bounded backoff.
//! - `Rejected(err)`: hard dispatch failure; the callback was not and will
//!   never be invoked, and the submitter unwinds its own accounting.

use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use bvd_core::{BvdError, BvdResult, Direction, SharedBuf};

use crate::cipherspec::ChainMode;
use crate::sector::DataCipher;
use crate::IV_SIZE;

/// Completion callback for one cipher unit. Invoked from an unspecified
/// execution context; keep it to O(1) bookkeeping.
pub type UnitDone = Box<dyn FnOnce(BvdResult<()>) + Send + 'static>;

/// One sector's worth of work: transform `buf[offset..offset+len]` in place.
pub struct CipherUnit {
    pub dir: Direction,
    pub buf: SharedBuf,
    pub offset: usize,
    pub len: usize,
    pub iv: Option<[u8; IV_SIZE]>,
    pub done: Option<UnitDone>,
}

pub enum ProcessOutcome {
    Completed(BvdResult<()>),
    Queued,
    Busy(CipherUnit),
    Rejected(BvdError),
}

pub trait CipherBackend: Send + Sync {
    fn process(&self, unit: CipherUnit) -> ProcessOutcome;
}

/// Run the transform a unit describes. Shared by both backends.
fn apply_unit(cipher: &DataCipher, mode: ChainMode, unit: &CipherUnit) -> BvdResult<()> {
    let mut guard = unit
        .buf
        .lock()
        .map_err(|_| BvdError::Cipher("unit buffer poisoned".into()))?;
    let end = unit.offset + unit.len;
    if end > guard.len() {
        return Err(BvdError::Cipher(format!(
            "unit range {}..{end} exceeds buffer length {}",
            unit.offset,
            guard.len()
        )));
    }
    let data = &mut guard[unit.offset..end];
    match unit.dir {
        Direction::Write => cipher.encrypt_unit(mode, unit.iv.as_ref(), data),
        Direction::Read => cipher.decrypt_unit(mode, unit.iv.as_ref(), data),
    }
}

/// Synchronous backend: transforms on the caller's thread.
pub struct InlineBackend {
    cipher: DataCipher,
    mode: ChainMode,
}

impl InlineBackend {
    pub fn new(cipher: DataCipher, mode: ChainMode) -> Self {
        Self { cipher, mode }
    }
}

impl CipherBackend for InlineBackend {
    fn process(&self, mut unit: CipherUnit) -> ProcessOutcome {
        let result = apply_unit(&self.cipher, self.mode, &unit);
        if let Some(done) = unit.done.take() {
            done(result.clone());
        }
        ProcessOutcome::Completed(result)
    }
}

/// Asynchronous backend: a bounded dispatch queue drained by dedicated
/// worker threads. A full queue reports `Busy`; a stopped engine reports
/// `Rejected(EngineStopped)`.
pub struct OffloadEngine {
    tx: Mutex<Option<SyncSender<CipherUnit>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl OffloadEngine {
    pub fn new(cipher: DataCipher, mode: ChainMode, workers: usize, queue_depth: usize) -> Self {
        let (tx, rx) = mpsc::sync_channel::<CipherUnit>(queue_depth);
        let rx = Arc::new(Mutex::new(rx));

        let handles = (0..workers.max(1))
            .map(|n| {
                let rx = Arc::clone(&rx);
                let cipher = cipher.clone();
                std::thread::Builder::new()
                    .name(format!("bvd-crypt-{n}"))
                    .spawn(move || worker_loop(n, rx, cipher, mode))
                    .expect("spawning offload worker")
            })
            .collect();

        debug!(workers, queue_depth, "offload engine started");
        Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
        }
    }

    /// Stop accepting units and join the workers after the queue drains.
    /// Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        let tx = self.tx.lock().expect("engine sender lock poisoned").take();
        drop(tx);
        let handles: Vec<_> = self
            .workers
            .lock()
            .expect("engine worker lock poisoned")
            .drain(..)
            .collect();
        for handle in handles {
            if handle.join().is_err() {
                warn!("offload worker panicked during shutdown");
            }
        }
    }
}

impl CipherBackend for OffloadEngine {
    fn process(&self, unit: CipherUnit) -> ProcessOutcome {
        let guard = self.tx.lock().expect("engine sender lock poisoned");
        let Some(tx) = guard.as_ref() else {
            return ProcessOutcome::Rejected(BvdError::EngineStopped);
        };
        match tx.try_send(unit) {
            Ok(()) => ProcessOutcome::Queued,
            Err(TrySendError::Full(unit)) => ProcessOutcome::Busy(unit),
            Err(TrySendError::Disconnected(_)) => {
                ProcessOutcome::Rejected(BvdError::EngineStopped)
            }
        }
    }
}

impl Drop for OffloadEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(n: usize, rx: Arc<Mutex<Receiver<CipherUnit>>>, cipher: DataCipher, mode: ChainMode) {
    loop {
        let unit = {
            let guard = rx.lock().expect("engine receiver lock poisoned");
            guard.recv()
        };
        let Ok(mut unit) = unit else {
            debug!(worker = n, "offload worker draining out");
            return;
        };
        let result = apply_unit(&cipher, mode, &unit);
        if let Some(done) = unit.done.take() {
            done(result);
        }
    }
}

/// Backoff for `Busy` dispatch outcomes: yield first, then sleep with a
/// capped exponential delay.
pub struct DispatchBackoff {
    attempts: u32,
}

impl DispatchBackoff {
    const YIELD_ATTEMPTS: u32 = 16;
    const MAX_SLEEP: Duration = Duration::from_millis(1);

    pub fn new() -> Self {
        Self { attempts: 0 }
    }

    pub fn wait(&mut self) {
        self.attempts += 1;
        if self.attempts <= Self::YIELD_ATTEMPTS {
            std::thread::yield_now();
            return;
        }
        let exp = (self.attempts - Self::YIELD_ATTEMPTS).min(5);
        let delay = Duration::from_micros(50u64 << exp).min(Self::MAX_SLEEP);
        std::thread::sleep(delay);
    }
}

impl Default for DispatchBackoff {
    fn default() -> Self {
        Self::new()
    }
}
