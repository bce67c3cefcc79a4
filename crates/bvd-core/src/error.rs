use thiserror::Error;

pub type BvdResult<T> = Result<T, BvdError>;

/// Error taxonomy for the mapping layer.
///
/// Variants are `Clone` + `PartialEq` because the first error observed for a
/// logical request is retained ("sticky") and later delivered through the
/// completion callback, possibly on a different thread than the one that
/// recorded it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BvdError {
    #[error("cipher spec error: {0}")]
    CipherSpec(String),

    #[error("key error: {0}")]
    Key(String),

    #[error("IV generator error: {0}")]
    IvGen(String),

    #[error("cipher error: {0}")]
    Cipher(String),

    /// Offload engine transiently saturated. Callers retry dispatch with
    /// bounded backoff; this variant never reaches a completion callback.
    #[error("offload engine busy")]
    EngineBusy,

    #[error("offload engine stopped")]
    EngineStopped,

    #[error("page pool exhausted")]
    NoPages,

    #[error("pending-io descriptors exhausted")]
    NoDescriptors,

    #[error("backing device error: {0}")]
    Device(String),

    #[error("request error: {0}")]
    Request(String),

    #[error("mapping shut down")]
    Shutdown,

    #[error("config error: {0}")]
    Config(String),
}
