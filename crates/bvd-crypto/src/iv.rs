//! Per-sector IV generation.
//!
//! `generate` is a pure function of the mapping's fixed parameters and the
//! sector number, so the same sector always gets the same IV for the life
//! of a mapping.

use sha2::{Digest, Sha256};

use bvd_core::{BvdError, BvdResult};

use crate::cipherspec::IvMode;
use crate::key::VolumeKey;
use crate::sector::DataCipher;
use crate::IV_SIZE;

#[derive(Debug)]
pub enum IvGen {
    /// Low 32 bits of the sector number, little-endian, rest zero.
    Plain,
    /// Sector number (64-bit little-endian, zero-padded) encrypted with a
    /// cipher keyed by a digest of the volume key.
    Essiv { salt_cipher: DataCipher },
}

impl IvGen {
    pub fn new(mode: &IvMode, key: &VolumeKey, iv_len: usize) -> BvdResult<Self> {
        match mode {
            IvMode::Plain => Ok(IvGen::Plain),
            IvMode::Essiv { digest } => {
                let salt = match digest.as_str() {
                    "sha256" => Sha256::digest(key.as_bytes()).to_vec(),
                    other => {
                        return Err(BvdError::IvGen(format!(
                            "digest '{other}' unavailable for essiv"
                        )))
                    }
                };
                // A digest wider than the cipher's maximum key is truncated.
                let salt_key = VolumeKey::from_bytes(salt[..salt.len().min(32)].to_vec());
                let salt_cipher = DataCipher::new("aes", &salt_key)
                    .map_err(|e| BvdError::IvGen(format!("essiv salt cipher: {e}")))?;
                if salt_cipher.block_size() != iv_len {
                    return Err(BvdError::IvGen(format!(
                        "essiv salt cipher block size {} does not match IV length {iv_len}",
                        salt_cipher.block_size()
                    )));
                }
                Ok(IvGen::Essiv { salt_cipher })
            }
        }
    }

    pub fn generate(&self, sector: u64) -> [u8; IV_SIZE] {
        let mut iv = [0u8; IV_SIZE];
        match self {
            IvGen::Plain => {
                iv[..4].copy_from_slice(&(sector as u32).to_le_bytes());
            }
            IvGen::Essiv { salt_cipher } => {
                iv[..8].copy_from_slice(&sector.to_le_bytes());
                salt_cipher.encrypt_single_block(&mut iv);
            }
        }
        iv
    }
}
