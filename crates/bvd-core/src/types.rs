//! Sectors, memory segments, and logical I/O requests.
//!
//! A logical request carries a list of segments: shared, cheaply cloneable
//! views into reference-counted byte buffers. Sub-requests built by the
//! mapping layer alias these views instead of copying them, so one buffer
//! may be reachable from the caller, from a sub-request in flight, and from
//! a deferred decrypt pass at the same time.

use std::sync::{Arc, Mutex};

use crate::error::{BvdError, BvdResult};

/// One cipher unit: a single 512-byte logical block.
pub const SECTOR_SIZE: usize = 512;

/// Granularity of the data page pool. Eight sectors per page.
pub const PAGE_SIZE: usize = 4096;

/// A reference-counted, lock-guarded byte buffer shared between the caller,
/// sub-requests, and completion contexts.
pub type SharedBuf = Arc<Mutex<Vec<u8>>>;

/// Completion callback delivered exactly once per logical request.
pub type Completion = Box<dyn FnOnce(BvdResult<()>) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// A contiguous byte range inside a shared buffer.
#[derive(Clone)]
pub struct Segment {
    pub buf: SharedBuf,
    pub offset: usize,
    pub len: usize,
}

impl Segment {
    pub fn new(buf: SharedBuf, offset: usize, len: usize) -> Self {
        Self { buf, offset, len }
    }

    /// Wrap an owned byte vector as a single full-length segment.
    pub fn from_vec(data: Vec<u8>) -> Self {
        let len = data.len();
        Self {
            buf: Arc::new(Mutex::new(data)),
            offset: 0,
            len,
        }
    }

    /// Copy this segment's bytes out. Test and diagnostic helper.
    pub fn to_vec(&self) -> Vec<u8> {
        let guard = self.buf.lock().expect("segment buffer poisoned");
        guard[self.offset..self.offset + self.len].to_vec()
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

/// A caller-issued read or write against the encrypted volume.
///
/// `sector` is relative to the start of the virtual volume, not the backing
/// device. Every segment length must be a positive multiple of
/// [`SECTOR_SIZE`] so that a cipher unit never straddles a segment boundary.
pub struct IoRequest {
    pub sector: u64,
    pub direction: Direction,
    pub segments: Arc<[Segment]>,
}

impl IoRequest {
    pub fn new(sector: u64, direction: Direction, segments: Vec<Segment>) -> Self {
        Self {
            sector,
            direction,
            segments: segments.into(),
        }
    }

    /// Build a single-segment request over an owned byte vector.
    pub fn from_vec(sector: u64, direction: Direction, data: Vec<u8>) -> Self {
        Self::new(sector, direction, vec![Segment::from_vec(data)])
    }

    pub fn total_len(&self) -> usize {
        self.segments.iter().map(|s| s.len).sum()
    }

    pub fn total_sectors(&self) -> u64 {
        (self.total_len() / SECTOR_SIZE) as u64
    }

    /// Validate the segment-geometry contract.
    pub fn validate(&self) -> BvdResult<()> {
        if self.segments.is_empty() {
            return Err(BvdError::Request("request has no segments".into()));
        }
        for (i, seg) in self.segments.iter().enumerate() {
            if seg.len == 0 || seg.len % SECTOR_SIZE != 0 {
                return Err(BvdError::Request(format!(
                    "segment {i} length {} is not a positive multiple of {SECTOR_SIZE}",
                    seg.len
                )));
            }
            let buf_len = seg.buf.lock().expect("segment buffer poisoned").len();
            if seg.offset + seg.len > buf_len {
                return Err(BvdError::Request(format!(
                    "segment {i} range {}..{} exceeds buffer length {buf_len}",
                    seg.offset,
                    seg.offset + seg.len
                )));
            }
        }
        Ok(())
    }

    /// Gather all segment bytes into one vector. Test helper.
    pub fn gather(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_len());
        for seg in self.segments.iter() {
            out.extend_from_slice(&seg.to_vec());
        }
        out
    }
}
