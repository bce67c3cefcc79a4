//! Sub-requests: the physically-backed portions of a logical request that
//! are actually handed to the backing device.

use std::sync::Arc;

use bvd_core::{Direction, Segment, SharedBuf};

use crate::pool::PagePool;

/// A device-bound slice of a logical request.
///
/// Read sub-requests alias the caller's segment buffers; write
/// sub-requests own freshly pooled pages holding ciphertext. Either way
/// the segment descriptors are allocated once and shared, never copied
/// per byte.
pub struct SubRequest {
    pub dir: Direction,
    /// Absolute start sector on the backing device.
    pub sector: u64,
    /// Sector number seeding IV generation for this span (logical sector
    /// plus the mapping's IV offset; excludes the device start).
    pub iv_sector: u64,
    segments: Arc<[Segment]>,
    pages: Vec<SharedBuf>,
}

impl SubRequest {
    /// Read-side constructor: borrow views of the caller's buffers.
    pub fn aliasing(dir: Direction, sector: u64, iv_sector: u64, segments: Vec<Segment>) -> Self {
        Self {
            dir,
            sector,
            iv_sector,
            segments: segments.into(),
            pages: Vec::new(),
        }
    }

    /// Write-side constructor: the sub-request owns its pool pages and
    /// returns them when the transfer completes.
    pub fn backed(
        dir: Direction,
        sector: u64,
        iv_sector: u64,
        segments: Vec<Segment>,
        pages: Vec<SharedBuf>,
    ) -> Self {
        Self {
            dir,
            sector,
            iv_sector,
            segments: segments.into(),
            pages,
        }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn segment_arc(&self) -> Arc<[Segment]> {
        Arc::clone(&self.segments)
    }

    pub fn total_len(&self) -> usize {
        self.segments.iter().map(|s| s.len).sum()
    }

    /// Hand owned pages back to the pool. Draining the list makes a second
    /// release a no-op.
    pub fn release_pages(&mut self, pool: &PagePool) {
        if self.pages.is_empty() {
            return;
        }
        pool.release(self.pages.drain(..));
    }
}

impl std::fmt::Debug for SubRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubRequest")
            .field("dir", &self.dir)
            .field("sector", &self.sector)
            .field("len", &self.total_len())
            .field("segments", &self.segments.len())
            .field("pages", &self.pages.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bvd_core::SECTOR_SIZE;

    #[test]
    fn aliasing_sub_shares_buffers() {
        let seg = Segment::from_vec(vec![7u8; SECTOR_SIZE]);
        let buf = Arc::clone(&seg.buf);
        let sub = SubRequest::aliasing(Direction::Read, 10, 2, vec![seg]);
        assert_eq!(sub.total_len(), SECTOR_SIZE);
        assert!(Arc::ptr_eq(&sub.segments()[0].buf, &buf));
    }

    #[test]
    fn release_pages_twice_is_a_noop() {
        let pool = PagePool::new(2);
        let pages = pool.alloc_upto(2).unwrap();
        let segments = pages
            .iter()
            .map(|p| Segment::new(Arc::clone(p), 0, SECTOR_SIZE))
            .collect();
        let mut sub = SubRequest::backed(Direction::Write, 0, 0, segments, pages);

        assert_eq!(pool.in_use(), 2);
        sub.release_pages(&pool);
        assert_eq!(pool.in_use(), 0);
        sub.release_pages(&pool);
        assert_eq!(pool.in_use(), 0);
    }
}
