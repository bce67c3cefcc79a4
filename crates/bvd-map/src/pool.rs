//! Bounded resource pools.
//!
//! Two pools back the mapping layer: a page pool for write-path ciphertext
//! buffers and a descriptor pool bounding pending-I/O objects. Allocation
//! may block the issuing path; freeing never blocks and is safe from any
//! completion context.

use std::sync::{Arc, Condvar, Mutex};

use tracing::debug;

use bvd_core::{BvdError, BvdResult, SharedBuf, PAGE_SIZE};

struct PageState {
    free: Vec<Vec<u8>>,
    in_use: usize,
    /// Total grants remaining; `None` means unlimited. Fault-injection seam
    /// for exercising permanent allocation failure.
    budget: Option<usize>,
    closed: bool,
}

/// Bounded pool of reusable data pages.
///
/// `alloc_upto` hands out up to the requested count but may return fewer
/// under pressure; getting at least one page is success. It blocks only
/// while every page is checked out and some are due to come back.
pub struct PagePool {
    state: Mutex<PageState>,
    available: Condvar,
    capacity: usize,
}

impl PagePool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Self::build(capacity, None)
    }

    pub(crate) fn with_budget(capacity: usize, budget: usize) -> Arc<Self> {
        Self::build(capacity, Some(budget))
    }

    fn build(capacity: usize, budget: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PageState {
                free: Vec::new(),
                in_use: 0,
                budget,
                closed: false,
            }),
            available: Condvar::new(),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.state.lock().expect("page pool poisoned").in_use
    }

    /// Allocate between 1 and `want` pages, blocking while the pool is
    /// fully checked out. Fails with `NoPages` when the pool cannot ever
    /// supply a page, and `Shutdown` once the pool is closed.
    pub fn alloc_upto(&self, want: usize) -> BvdResult<Vec<SharedBuf>> {
        let want = want.max(1);
        let mut state = self.state.lock().expect("page pool poisoned");
        loop {
            if state.closed {
                return Err(BvdError::Shutdown);
            }
            if self.capacity == 0 || state.budget == Some(0) {
                return Err(BvdError::NoPages);
            }
            let available = self.capacity - state.in_use;
            if available == 0 {
                debug!(want, capacity = self.capacity, "page pool drained, waiting");
                state = self.available.wait(state).expect("page pool poisoned");
                continue;
            }
            let mut grant = want.min(available);
            if let Some(budget) = state.budget.as_mut() {
                grant = grant.min(*budget);
                *budget -= grant;
            }
            state.in_use += grant;
            let pages = (0..grant)
                .map(|_| {
                    let mut page = state.free.pop().unwrap_or_default();
                    page.clear();
                    page.resize(PAGE_SIZE, 0);
                    Arc::new(Mutex::new(page))
                })
                .collect();
            return Ok(pages);
        }
    }

    /// Return pages to the pool. Never blocks. A buffer that was already
    /// reclaimed (its backing vector taken) is skipped, so releasing the
    /// same page twice cannot corrupt the accounting.
    pub fn release<I>(&self, bufs: I)
    where
        I: IntoIterator<Item = SharedBuf>,
    {
        let mut returned = 0usize;
        let mut state = self.state.lock().expect("page pool poisoned");
        for buf in bufs {
            let mut guard = buf.lock().expect("page buffer poisoned");
            let page = std::mem::take(&mut *guard);
            if page.capacity() == 0 {
                continue;
            }
            state.free.push(page);
            returned += 1;
        }
        debug_assert!(returned <= state.in_use, "page pool release underflow");
        state.in_use = state.in_use.saturating_sub(returned);
        drop(state);
        if returned > 0 {
            self.available.notify_all();
        }
    }

    /// Close the pool; blocked and future allocations fail with `Shutdown`.
    pub fn close(&self) {
        self.state.lock().expect("page pool poisoned").closed = true;
        self.available.notify_all();
    }
}

struct IoState {
    in_use: usize,
    closed: bool,
}

/// Bounded pool of pending-I/O descriptor slots.
pub struct IoPool {
    state: Mutex<IoState>,
    available: Condvar,
    capacity: usize,
}

/// One descriptor slot, returned on drop.
pub struct IoPermit {
    pool: Arc<IoPool>,
}

impl IoPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(IoState {
                in_use: 0,
                closed: false,
            }),
            available: Condvar::new(),
            capacity,
        })
    }

    pub fn in_use(&self) -> usize {
        self.state.lock().expect("io pool poisoned").in_use
    }

    /// Take one slot, blocking while all are checked out.
    pub fn acquire(self: &Arc<Self>) -> BvdResult<IoPermit> {
        let mut state = self.state.lock().expect("io pool poisoned");
        loop {
            if state.closed {
                return Err(BvdError::Shutdown);
            }
            if self.capacity == 0 {
                return Err(BvdError::NoDescriptors);
            }
            if state.in_use < self.capacity {
                state.in_use += 1;
                return Ok(IoPermit {
                    pool: Arc::clone(self),
                });
            }
            debug!(capacity = self.capacity, "pending-io pool drained, waiting");
            state = self.available.wait(state).expect("io pool poisoned");
        }
    }

    pub fn close(&self) {
        self.state.lock().expect("io pool poisoned").closed = true;
        self.available.notify_all();
    }

    fn release_one(&self) {
        let mut state = self.state.lock().expect("io pool poisoned");
        debug_assert!(state.in_use > 0, "io pool release underflow");
        state.in_use = state.in_use.saturating_sub(1);
        drop(state);
        self.available.notify_one();
    }
}

impl Drop for IoPermit {
    fn drop(&mut self) {
        self.pool.release_one();
    }
}
