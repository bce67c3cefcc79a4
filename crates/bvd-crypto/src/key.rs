//! Volume key container and hex codec.

use bvd_core::{BvdError, BvdResult};
use zeroize::Zeroize;

/// Raw key bytes for one mapping. Zeroized on drop.
#[derive(Clone)]
pub struct VolumeKey {
    bytes: Vec<u8>,
}

impl VolumeKey {
    /// Parse the hex key field. `-` is the sentinel for a zero-length key.
    pub fn from_hex(raw: &str) -> BvdResult<Self> {
        if raw == "-" {
            return Ok(Self { bytes: Vec::new() });
        }
        let bytes = hex::decode(raw).map_err(BvdError::Key)?;
        Ok(Self { bytes })
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Lowercase hex of the key; empty string for a zero-length key (the
    /// status query substitutes `-`).
    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }
}

impl Drop for VolumeKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for VolumeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeKey")
            .field("len", &self.bytes.len())
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

mod hex {
    pub fn encode(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    pub fn decode(s: &str) -> Result<Vec<u8>, String> {
        if s.len() % 2 != 0 {
            return Err("odd-length hex key".to_string());
        }
        (0..s.len())
            .step_by(2)
            .map(|i| {
                u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| format!("invalid hex key: {e}"))
            })
            .collect()
    }
}
