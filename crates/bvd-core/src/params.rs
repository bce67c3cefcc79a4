//! Construction parameters for one encrypted mapping.
//!
//! The fields mirror the externally-parsed table line that creates a
//! mapping: `<cipher-chainmode-ivmode> <hexkey|-> <iv_offset> <device>
//! <start>`. Parsing of the cipher spec and key happens in `bvd-crypto`;
//! this type only carries the raw fields and knows the canonical line
//! grammar used by the status query.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptParams {
    /// `cipher-chainmode[-ivmode[:ivopts]]`, e.g. `aes-cbc-essiv:sha256`.
    pub cipher_spec: String,
    /// Hex-encoded key, or `-` for a zero-length key.
    pub key_hex: String,
    /// Added to the logical sector before IV generation.
    pub iv_offset: u64,
    /// Backing-device identifier, kept verbatim for status output.
    pub device: String,
    /// First sector of the mapping on the backing device.
    pub start: u64,
}

impl CryptParams {
    pub fn new(
        cipher_spec: impl Into<String>,
        key_hex: impl Into<String>,
        iv_offset: u64,
        device: impl Into<String>,
        start: u64,
    ) -> Self {
        Self {
            cipher_spec: cipher_spec.into(),
            key_hex: key_hex.into(),
            iv_offset,
            device: device.into(),
            start,
        }
    }
}

/// Render the canonical table line. A zero-length key renders as `-` so the
/// line can be fed back through the same grammar it was created from.
pub fn render_table(
    cipher_spec: &str,
    key_hex: &str,
    iv_offset: u64,
    device: &str,
    start: u64,
) -> String {
    let key = if key_hex.is_empty() { "-" } else { key_hex };
    format!("{cipher_spec} {key} {iv_offset} {device} {start}")
}
