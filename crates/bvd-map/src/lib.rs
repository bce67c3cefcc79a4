//! bvd-map: the transparent encryption mapping layer
//!
//! Sits between a virtual block device and its backing storage, encrypting
//! every write and decrypting every read sector by sector. The upper stack
//! sees an ordinary block target; the backing device only ever sees
//! ciphertext.
//!
//! Pieces, leaves first:
//! - `pool`: bounded page and pending-I/O descriptor pools
//! - `pending`: reference-counted exactly-once completion tracking
//! - `convert`: the per-unit conversion engine over a request's segments
//! - `queue`: the deferred decrypt queue
//! - `request`: sub-requests handed to the backing device
//! - `device`: the backing-device trait and a RAM-backed implementation
//! - `target`: the mapping handle (construct, status, submit, teardown)

pub mod convert;
pub mod device;
pub mod pending;
pub mod pool;
pub mod queue;
pub mod request;
pub mod target;

pub use convert::ConvertCtx;
pub use device::{BackingDevice, DeviceDone, MemDevice};
pub use pending::PendingIo;
pub use pool::{IoPermit, IoPool, PagePool};
pub use queue::TaskQueue;
pub use request::SubRequest;
pub use target::{CryptTarget, StatusKind};
