//! bvd-crypto: sector-granular encryption for the blockveil mapping layer
//!
//! Pipeline (write path): plaintext sector → per-sector IV → block cipher in
//! a chaining mode → ciphertext sector handed to the backing device. Reads
//! run the same units in reverse, deferred out of the completion context.
//!
//! Layout:
//! - `cipherspec`: the `cipher-chainmode[-ivmode[:opts]]` grammar
//! - `key`: hex codec and zeroize-on-drop volume key container
//! - `iv`: per-sector IV generation (`plain`, `essiv`)
//! - `sector`: one-unit AES-CBC / AES-ECB transforms
//! - `backend`: the inline backend and the asynchronous offload engine

pub mod backend;
pub mod cipherspec;
pub mod iv;
pub mod key;
pub mod sector;

pub use backend::{
    CipherBackend, CipherUnit, DispatchBackoff, InlineBackend, OffloadEngine, ProcessOutcome,
    UnitDone,
};
pub use cipherspec::{ChainMode, CipherSpec, IvMode};
pub use iv::IvGen;
pub use key::VolumeKey;
pub use sector::DataCipher;

/// AES block size; also the IV length for every supported mapping.
pub const IV_SIZE: usize = 16;
