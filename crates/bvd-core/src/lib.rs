//! bvd-core: shared types for the blockveil encryption mapping layer
//!
//! - `types`: sectors, segments, logical I/O requests, completion callbacks
//! - `params`: construction parameters and their canonical table-line form
//! - `config`: runtime tuning options (pool sizes, worker counts)
//! - `error`: the crate-wide error enum

pub mod config;
pub mod error;
pub mod params;
pub mod types;

pub use config::{load_opts, BackendKind, TargetOpts};
pub use error::{BvdError, BvdResult};
pub use params::CryptParams;
pub use types::{Completion, Direction, IoRequest, Segment, SharedBuf, PAGE_SIZE, SECTOR_SIZE};
