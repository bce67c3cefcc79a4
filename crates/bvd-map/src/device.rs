//! The backing-device boundary.
//!
//! The mapping layer hands finished sub-requests to a `BackingDevice` and
//! learns about their fate through a completion callback, which may fire
//! synchronously on the submitting thread or later from any other context.

use std::sync::{Arc, Mutex};

use bvd_core::{BvdError, BvdResult, Direction, SECTOR_SIZE};

use crate::request::SubRequest;

/// Completion callback for one sub-request. The sub-request travels back
/// through it so the mapping layer can reclaim owned pages.
pub type DeviceDone = Box<dyn FnOnce(SubRequest, BvdResult<()>) + Send + 'static>;

pub trait BackingDevice: Send + Sync {
    /// Queue one sub-request. `done` fires exactly once, from an
    /// unspecified context; a dispatched sub-request cannot be canceled.
    fn submit(&self, sub: SubRequest, done: DeviceDone);

    /// Largest transfer this device accepts, in bytes. `None` means
    /// unlimited. Must be a multiple of the sector size.
    fn max_transfer(&self) -> Option<usize> {
        None
    }
}

/// RAM-backed device used by tests, benchmarks, and demos. Completes
/// synchronously on the submitting thread, which doubles as a stress test
/// of the tracker's tolerance for completion-before-issuing-finishes.
pub struct MemDevice {
    data: Mutex<Vec<u8>>,
    max_transfer: Option<usize>,
}

impl MemDevice {
    pub fn new(sectors: u64) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(vec![0u8; sectors as usize * SECTOR_SIZE]),
            max_transfer: None,
        })
    }

    pub fn with_max_transfer(sectors: u64, max_bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(vec![0u8; sectors as usize * SECTOR_SIZE]),
            max_transfer: Some(max_bytes),
        })
    }

    /// Raw bytes currently on the device. Test helper.
    pub fn read_raw(&self, sector: u64, len: usize) -> Vec<u8> {
        let start = sector as usize * SECTOR_SIZE;
        let data = self.data.lock().expect("device data poisoned");
        data[start..start + len].to_vec()
    }

    /// Seed raw (already-encrypted) bytes onto the device. Test helper.
    pub fn write_raw(&self, sector: u64, bytes: &[u8]) {
        let start = sector as usize * SECTOR_SIZE;
        let mut data = self.data.lock().expect("device data poisoned");
        data[start..start + bytes.len()].copy_from_slice(bytes);
    }
}

impl BackingDevice for MemDevice {
    fn submit(&self, sub: SubRequest, done: DeviceDone) {
        let start = sub.sector as usize * SECTOR_SIZE;
        let len = sub.total_len();
        {
            let mut data = self.data.lock().expect("device data poisoned");
            if start + len > data.len() {
                drop(data);
                done(
                    sub,
                    Err(BvdError::Device(format!(
                        "range {start}..{} beyond device end",
                        start + len
                    ))),
                );
                return;
            }
            let mut dev_off = start;
            for seg in sub.segments() {
                let mut buf = seg.buf.lock().expect("segment buffer poisoned");
                match sub.dir {
                    Direction::Write => {
                        data[dev_off..dev_off + seg.len]
                            .copy_from_slice(&buf[seg.offset..seg.offset + seg.len]);
                    }
                    Direction::Read => {
                        buf[seg.offset..seg.offset + seg.len]
                            .copy_from_slice(&data[dev_off..dev_off + seg.len]);
                    }
                }
                dev_off += seg.len;
            }
        }
        done(sub, Ok(()));
    }

    fn max_transfer(&self) -> Option<usize> {
        self.max_transfer
    }
}
