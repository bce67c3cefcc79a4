//! The encrypted mapping: construction, status, request submission, and
//! teardown.
//!
//! A write enters the clone/split loop: allocate what the page pool will
//! give, encrypt exactly that span, hand the ciphertext sub-request to the
//! backing device, repeat. A read passes straight through to the device;
//! its decrypt pass runs later on the deferred queue. Either way the
//! pending-I/O tracker signals the caller exactly once.

use std::sync::Arc;

use tracing::{debug, info};

use bvd_core::{
    params, BackendKind, BvdError, BvdResult, Completion, CryptParams, Direction, IoRequest,
    Segment, TargetOpts, PAGE_SIZE, SECTOR_SIZE,
};
use bvd_crypto::{
    CipherBackend, CipherSpec, DataCipher, InlineBackend, IvGen, OffloadEngine, VolumeKey,
};

use crate::convert::ConvertCtx;
use crate::device::BackingDevice;
use crate::pending::PendingIo;
use crate::pool::{IoPool, PagePool};
use crate::queue::TaskQueue;
use crate::request::SubRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    /// Short readiness indicator.
    Info,
    /// Canonical re-serialization of the construction line.
    Table,
}

struct TargetInner {
    spec: CipherSpec,
    key: VolumeKey,
    iv_offset: u64,
    device_name: String,
    start: u64,
    device: Arc<dyn BackingDevice>,
    ivgen: Option<Arc<IvGen>>,
    backend: Arc<dyn CipherBackend>,
    engine: Option<Arc<OffloadEngine>>,
    pages: Arc<PagePool>,
    ios: Arc<IoPool>,
    decrypt_queue: Arc<TaskQueue>,
}

/// Handle to one encrypted mapping.
pub struct CryptTarget {
    inner: Arc<TargetInner>,
}

impl CryptTarget {
    pub fn new(
        cfg: &CryptParams,
        device: Arc<dyn BackingDevice>,
        opts: &TargetOpts,
    ) -> BvdResult<Self> {
        Self::with_pools(
            cfg,
            device,
            opts,
            PagePool::new(opts.pool_pages),
            IoPool::new(opts.pool_ios),
        )
    }

    pub(crate) fn with_pools(
        cfg: &CryptParams,
        device: Arc<dyn BackingDevice>,
        opts: &TargetOpts,
        pages: Arc<PagePool>,
        ios: Arc<IoPool>,
    ) -> BvdResult<Self> {
        opts.validate()?;
        if let Some(max) = device.max_transfer() {
            if max < SECTOR_SIZE || max % SECTOR_SIZE != 0 {
                return Err(BvdError::Config(format!(
                    "device max transfer {max} is not a positive multiple of {SECTOR_SIZE}"
                )));
            }
        }

        let spec = CipherSpec::parse(&cfg.cipher_spec)?;
        let key = VolumeKey::from_hex(&cfg.key_hex)?;
        let cipher = DataCipher::new(&spec.cipher, &key)?;
        let ivgen = spec
            .ivmode
            .as_ref()
            .map(|mode| IvGen::new(mode, &key, cipher.block_size()))
            .transpose()?
            .map(Arc::new);

        let (backend, engine): (Arc<dyn CipherBackend>, Option<Arc<OffloadEngine>>) =
            match opts.backend {
                BackendKind::Inline => (
                    Arc::new(InlineBackend::new(cipher, spec.chainmode)),
                    None,
                ),
                BackendKind::Offloaded => {
                    let engine = Arc::new(OffloadEngine::new(
                        cipher,
                        spec.chainmode,
                        opts.offload_workers,
                        opts.queue_depth,
                    ));
                    (Arc::clone(&engine) as Arc<dyn CipherBackend>, Some(engine))
                }
            };

        let decrypt_queue = TaskQueue::new("bvd-decrypt", opts.decrypt_workers);

        info!(
            spec = %spec,
            device = %cfg.device,
            start = cfg.start,
            iv_offset = cfg.iv_offset,
            backend = ?opts.backend,
            "crypt mapping created"
        );

        Ok(Self {
            inner: Arc::new(TargetInner {
                spec,
                key,
                iv_offset: cfg.iv_offset,
                device_name: cfg.device.clone(),
                start: cfg.start,
                device,
                ivgen,
                backend,
                engine,
                pages,
                ios,
                decrypt_queue,
            }),
        })
    }

    pub fn status(&self, kind: StatusKind) -> String {
        match kind {
            StatusKind::Info => "ready".to_string(),
            StatusKind::Table => params::render_table(
                &self.inner.spec.to_string(),
                &self.inner.key.to_hex(),
                self.inner.iv_offset,
                &self.inner.device_name,
                self.inner.start,
            ),
        }
    }

    /// Pages currently checked out of the data pool.
    pub fn pages_in_use(&self) -> usize {
        self.inner.pages.in_use()
    }

    /// Submit one logical request. `done` fires exactly once, from an
    /// unspecified context, with the first error observed (or success).
    /// The write path may block this thread on pool allocation and on the
    /// conversion latch.
    pub fn submit(&self, req: IoRequest, done: Completion) {
        if let Err(err) = req.validate() {
            done(Err(err));
            return;
        }
        let permit = match self.inner.ios.acquire() {
            Ok(permit) => permit,
            Err(err) => {
                done(Err(err));
                return;
            }
        };
        let pending = PendingIo::new(done, Arc::clone(&req.segments), permit);

        match req.direction {
            Direction::Read => self.submit_read(&req, &pending),
            Direction::Write => self.submit_write(&req, &pending),
        }

        // Release the issuing path's hold; this may fire the completion
        // right here if every sub-request already finished.
        pending.complete();
    }

    /// Drain-free teardown of the worker machinery. The caller guarantees
    /// no request is in flight. Also runs on drop.
    pub fn shutdown(&self) {
        self.inner.decrypt_queue.shutdown();
        if let Some(engine) = &self.inner.engine {
            engine.shutdown();
        }
        self.inner.pages.close();
        self.inner.ios.close();
    }

    fn submit_read(&self, req: &IoRequest, pending: &Arc<PendingIo>) {
        let inner = &self.inner;
        let mut rel_sectors = 0u64;

        for chunk in chunk_segments(&req.segments, inner.device.max_transfer()) {
            let chunk_len: usize = chunk.iter().map(|s| s.len).sum();
            let sub = SubRequest::aliasing(
                Direction::Read,
                inner.start + req.sector + rel_sectors,
                req.sector + inner.iv_offset + rel_sectors,
                chunk,
            );
            debug!(sector = sub.sector, len = chunk_len, "read sub-request");

            let pending = Arc::clone(pending);
            let queue = Arc::clone(&inner.decrypt_queue);
            let backend = Arc::clone(&inner.backend);
            let ivgen = inner.ivgen.clone();
            pending.hold();
            inner.device.submit(
                sub,
                Box::new(move |sub, result| match result {
                    Err(err) => {
                        pending.fail(err);
                        pending.complete();
                    }
                    Ok(()) => {
                        // Ciphertext arrived; decrypt outside this
                        // completion context.
                        let decrypt_pending = Arc::clone(&pending);
                        let job = Box::new(move || {
                            let ctx = ConvertCtx::new(
                                sub.segment_arc(),
                                sub.iv_sector,
                                Direction::Read,
                            );
                            let finish_pending = Arc::clone(&decrypt_pending);
                            ctx.decrypt_deferred(
                                backend.as_ref(),
                                ivgen.as_deref(),
                                Box::new(move |result| {
                                    if let Err(err) = result {
                                        finish_pending.fail(err);
                                    }
                                    finish_pending.complete();
                                }),
                            );
                        });
                        if queue.submit(job).is_err() {
                            pending.fail(BvdError::Shutdown);
                            pending.complete();
                        }
                    }
                }),
            );

            rel_sectors += (chunk_len / SECTOR_SIZE) as u64;
        }
    }

    fn submit_write(&self, req: &IoRequest, pending: &Arc<PendingIo>) {
        let inner = &self.inner;
        let mut ctx = ConvertCtx::new(
            Arc::clone(&req.segments),
            req.sector + inner.iv_offset,
            Direction::Write,
        );
        let total = req.total_len();
        let max = inner.device.max_transfer().unwrap_or(usize::MAX);
        let mut done_bytes = 0usize;

        while done_bytes < total {
            let span = (total - done_bytes).min(max);
            let mut pages = match inner.pages.alloc_upto(span.div_ceil(PAGE_SIZE)) {
                Ok(pages) => pages,
                Err(err) => {
                    // Already-dispatched sub-requests stand; issuing stops.
                    pending.fail(err);
                    break;
                }
            };
            let covered = span.min(pages.len() * PAGE_SIZE);
            let needed = covered.div_ceil(PAGE_SIZE);
            if pages.len() > needed {
                inner.pages.release(pages.split_off(needed));
            }

            let segments: Vec<Segment> = pages
                .iter()
                .enumerate()
                .map(|(i, page)| {
                    let len = (covered - i * PAGE_SIZE).min(PAGE_SIZE);
                    Segment::new(Arc::clone(page), 0, len)
                })
                .collect();

            if let Err(err) =
                ctx.encrypt_into(&segments, inner.backend.as_ref(), inner.ivgen.as_deref())
            {
                inner.pages.release(pages);
                pending.fail(err);
                break;
            }

            let rel_sectors = (done_bytes / SECTOR_SIZE) as u64;
            let sub = SubRequest::backed(
                Direction::Write,
                inner.start + req.sector + rel_sectors,
                req.sector + inner.iv_offset + rel_sectors,
                segments,
                pages,
            );
            debug!(sector = sub.sector, len = covered, "write sub-request");

            let pending = Arc::clone(pending);
            let pool = Arc::clone(&inner.pages);
            pending.hold();
            inner.device.submit(
                sub,
                Box::new(move |mut sub, result| {
                    // Pages go back to the pool on every completion.
                    sub.release_pages(&pool);
                    if let Err(err) = result {
                        pending.fail(err);
                    }
                    pending.complete();
                }),
            );

            done_bytes += covered;
        }
    }
}

impl std::fmt::Debug for CryptTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptTarget")
            .field("spec", &self.inner.spec)
            .field("device", &self.inner.device_name)
            .field("start", &self.inner.start)
            .finish()
    }
}

impl Drop for CryptTarget {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Split a segment list into chunks of at most `max` bytes, cutting inside
/// segments where necessary. `None` means one chunk covering everything.
fn chunk_segments(segments: &Arc<[Segment]>, max: Option<usize>) -> Vec<Vec<Segment>> {
    let Some(max) = max else {
        return vec![segments.to_vec()];
    };
    let mut chunks = Vec::new();
    let mut current: Vec<Segment> = Vec::new();
    let mut room = max;
    for seg in segments.iter() {
        let mut offset = seg.offset;
        let mut left = seg.len;
        while left > 0 {
            if room == 0 {
                chunks.push(std::mem::take(&mut current));
                room = max;
            }
            let take = left.min(room);
            current.push(Segment::new(Arc::clone(&seg.buf), offset, take));
            offset += take;
            left -= take;
            room -= take;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
