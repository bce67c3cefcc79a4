//! The conversion engine: walks a request's segments one cipher unit at a
//! time, generating the per-sector IV and driving the cipher backend.
//!
//! Two completion disciplines share the dispatch loop:
//! - the write path blocks on a countdown latch until every dispatched
//!   unit has completed, because the destination pages must be stable
//!   before the sub-request reaches the backing device;
//! - the deferred read-decrypt path returns after dispatch and signals a
//!   per-pass callback when the last unit callback fires.

use std::sync::{Arc, Condvar, Mutex};

use bvd_core::{BvdError, BvdResult, Direction, Segment, SharedBuf, SECTOR_SIZE};
use bvd_crypto::{CipherBackend, CipherUnit, DispatchBackoff, IvGen, ProcessOutcome};

/// Position in a segment list, stepping one sector at a time. Units never
/// straddle segments because segment lengths are sector multiples.
struct SegCursor {
    segments: Arc<[Segment]>,
    idx: usize,
    off: usize,
}

impl SegCursor {
    fn new(segments: Arc<[Segment]>) -> Self {
        Self {
            segments,
            idx: 0,
            off: 0,
        }
    }

    fn next_unit(&mut self) -> Option<(SharedBuf, usize)> {
        let seg = self.segments.get(self.idx)?;
        let abs = seg.offset + self.off;
        self.off += SECTOR_SIZE;
        if self.off >= seg.len {
            self.idx += 1;
            self.off = 0;
        }
        Some((Arc::clone(&seg.buf), abs))
    }
}

/// Retry `Busy` outcomes with bounded backoff; every other outcome is
/// returned to the caller.
fn dispatch(backend: &dyn CipherBackend, mut unit: CipherUnit) -> ProcessOutcome {
    let mut backoff = DispatchBackoff::new();
    loop {
        match backend.process(unit) {
            ProcessOutcome::Busy(returned) => {
                unit = returned;
                backoff.wait();
            }
            outcome => return outcome,
        }
    }
}

/// Countdown latch for one blocking conversion pass.
struct Latch {
    state: Mutex<LatchState>,
    drained: Condvar,
}

struct LatchState {
    outstanding: usize,
    first_error: Option<BvdError>,
}

impl Latch {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LatchState {
                outstanding: 0,
                first_error: None,
            }),
            drained: Condvar::new(),
        })
    }

    fn add(&self) {
        self.state.lock().expect("latch poisoned").outstanding += 1;
    }

    fn record(&self, err: BvdError) {
        let mut state = self.state.lock().expect("latch poisoned");
        if state.first_error.is_none() {
            state.first_error = Some(err);
        }
    }

    fn unit_done(&self, result: BvdResult<()>) {
        let mut state = self.state.lock().expect("latch poisoned");
        debug_assert!(state.outstanding > 0, "latch underflow");
        state.outstanding -= 1;
        if let Err(err) = result {
            if state.first_error.is_none() {
                state.first_error = Some(err);
            }
        }
        if state.outstanding == 0 {
            self.drained.notify_all();
        }
    }

    fn wait(&self) -> BvdResult<()> {
        let mut state = self.state.lock().expect("latch poisoned");
        while state.outstanding > 0 {
            state = self.drained.wait(state).expect("latch poisoned");
        }
        match state.first_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Countdown for one deferred pass: fires a callback instead of waking a
/// waiter. Starts with a +1 hold so dispatch-loop completions cannot fire
/// it early; the hold is released once the loop is done issuing.
struct DeferredLatch {
    state: Mutex<LatchState>,
    finish: Mutex<Option<Box<dyn FnOnce(BvdResult<()>) + Send>>>,
}

impl DeferredLatch {
    fn new(finish: Box<dyn FnOnce(BvdResult<()>) + Send>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LatchState {
                outstanding: 1,
                first_error: None,
            }),
            finish: Mutex::new(Some(finish)),
        })
    }

    fn add(&self) {
        self.state.lock().expect("latch poisoned").outstanding += 1;
    }

    fn unit_done(&self, result: BvdResult<()>) {
        let finished = {
            let mut state = self.state.lock().expect("latch poisoned");
            debug_assert!(state.outstanding > 0, "deferred latch underflow");
            state.outstanding -= 1;
            if let Err(err) = result {
                if state.first_error.is_none() {
                    state.first_error = Some(err);
                }
            }
            if state.outstanding == 0 {
                match state.first_error.take() {
                    Some(err) => Some(Err(err)),
                    None => Some(Ok(())),
                }
            } else {
                None
            }
        };
        if let Some(result) = finished {
            if let Some(finish) = self.finish.lock().expect("latch poisoned").take() {
                finish(result);
            }
        }
    }

    fn release_hold(&self) {
        self.unit_done(Ok(()));
    }
}

/// Per-(request, direction) conversion state. The source cursor and sector
/// counter persist across calls so a request split into several
/// sub-requests keeps a continuous sector sequence.
pub struct ConvertCtx {
    src: SegCursor,
    sector: u64,
    dir: Direction,
}

impl ConvertCtx {
    pub fn new(segments: Arc<[Segment]>, start_sector: u64, dir: Direction) -> Self {
        Self {
            src: SegCursor::new(segments),
            sector: start_sector,
            dir,
        }
    }

    /// Sector the next unit will use. Advances once per unit consumed, so
    /// after a partial failure it reflects how far conversion got.
    pub fn sector(&self) -> u64 {
        self.sector
    }

    /// Encrypt the next `dst` worth of source bytes into `dst`, blocking
    /// until every dispatched unit has completed. On return the
    /// destination segments hold stable ciphertext.
    pub fn encrypt_into(
        &mut self,
        dst: &[Segment],
        backend: &dyn CipherBackend,
        ivgen: Option<&IvGen>,
    ) -> BvdResult<()> {
        debug_assert_eq!(self.dir, Direction::Write);
        let latch = Latch::new();
        let mut dst_cursor = SegCursor::new(dst.to_vec().into());

        while let Some((dbuf, doff)) = dst_cursor.next_unit() {
            let Some((sbuf, soff)) = self.src.next_unit() else {
                latch.record(BvdError::Request(
                    "conversion ran past the source segment list".into(),
                ));
                break;
            };

            {
                let src = sbuf.lock().expect("segment buffer poisoned");
                let mut dst = dbuf.lock().expect("page buffer poisoned");
                dst[doff..doff + SECTOR_SIZE]
                    .copy_from_slice(&src[soff..soff + SECTOR_SIZE]);
            }

            let iv = ivgen.map(|g| g.generate(self.sector));
            let latch_ref = Arc::clone(&latch);
            latch.add();
            let unit = CipherUnit {
                dir: Direction::Write,
                buf: dbuf,
                offset: doff,
                len: SECTOR_SIZE,
                iv,
                done: Some(Box::new(move |r| latch_ref.unit_done(r))),
            };

            match dispatch(backend, unit) {
                ProcessOutcome::Completed(Ok(())) | ProcessOutcome::Queued => {
                    self.sector += 1;
                }
                ProcessOutcome::Completed(Err(_)) => break,
                ProcessOutcome::Rejected(err) => {
                    latch.unit_done(Err(err));
                    break;
                }
                ProcessOutcome::Busy(_) => unreachable!("dispatch retries Busy"),
            }
        }

        latch.wait()
    }

    /// Decrypt every unit of this context's segments, invoking `finish`
    /// once all unit callbacks have fired. With an inline backend the
    /// whole pass (including `finish`) runs before this returns; with the
    /// offload engine it returns after dispatch.
    pub fn decrypt_deferred(
        mut self,
        backend: &dyn CipherBackend,
        ivgen: Option<&IvGen>,
        finish: Box<dyn FnOnce(BvdResult<()>) + Send>,
    ) {
        debug_assert_eq!(self.dir, Direction::Read);
        let latch = DeferredLatch::new(finish);

        while let Some((buf, off)) = self.src.next_unit() {
            let iv = ivgen.map(|g| g.generate(self.sector));
            let latch_ref = Arc::clone(&latch);
            latch.add();
            let unit = CipherUnit {
                dir: Direction::Read,
                buf,
                offset: off,
                len: SECTOR_SIZE,
                iv,
                done: Some(Box::new(move |r| latch_ref.unit_done(r))),
            };

            match dispatch(backend, unit) {
                ProcessOutcome::Completed(Ok(())) | ProcessOutcome::Queued => {
                    self.sector += 1;
                }
                ProcessOutcome::Completed(Err(_)) => break,
                ProcessOutcome::Rejected(err) => {
                    latch.unit_done(Err(err));
                    break;
                }
                ProcessOutcome::Busy(_) => unreachable!("dispatch retries Busy"),
            }
        }

        latch.release_hold();
    }
}
