//! One-unit block cipher transforms.
//!
//! A unit is one logical sector. CBC chains blocks within the unit only;
//! the per-sector IV re-anchors the chain so units are independently
//! decryptable. ECB carries no IV at all.

use aes::cipher::crypto_common::InnerInit;
use aes::cipher::{
    block_padding::NoPadding, generic_array::GenericArray, BlockDecryptMut, BlockEncrypt,
    BlockEncryptMut, InnerIvInit, KeyInit,
};
use aes::{Aes128, Aes192, Aes256};
use bvd_core::{BvdError, BvdResult};

use crate::cipherspec::ChainMode;
use crate::key::VolumeKey;
use crate::IV_SIZE;

/// The data cipher, keyed at construction. Key schedule setup happens once;
/// per-unit chaining state is built from a cheap clone of it.
#[derive(Clone, Debug)]
pub enum DataCipher {
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

macro_rules! with_cipher {
    ($self:expr, |$c:ident| $body:expr) => {
        match $self {
            DataCipher::Aes128($c) => $body,
            DataCipher::Aes192($c) => $body,
            DataCipher::Aes256($c) => $body,
        }
    };
}

impl DataCipher {
    pub fn new(cipher_name: &str, key: &VolumeKey) -> BvdResult<Self> {
        if cipher_name != "aes" {
            return Err(BvdError::CipherSpec(format!(
                "unknown cipher '{cipher_name}'"
            )));
        }
        match key.len() {
            16 => Aes128::new_from_slice(key.as_bytes())
                .map(DataCipher::Aes128)
                .map_err(|e| BvdError::Key(format!("aes-128 key: {e}"))),
            24 => Aes192::new_from_slice(key.as_bytes())
                .map(DataCipher::Aes192)
                .map_err(|e| BvdError::Key(format!("aes-192 key: {e}"))),
            32 => Aes256::new_from_slice(key.as_bytes())
                .map(DataCipher::Aes256)
                .map_err(|e| BvdError::Key(format!("aes-256 key: {e}"))),
            n => Err(BvdError::Key(format!(
                "aes does not support {n}-byte keys (expected 16, 24, or 32)"
            ))),
        }
    }

    pub fn block_size(&self) -> usize {
        IV_SIZE
    }

    /// Encrypt exactly one cipher block in place. Used by the ESSIV salt
    /// cipher, which runs block-at-a-time without chaining.
    pub fn encrypt_single_block(&self, block: &mut [u8; IV_SIZE]) {
        with_cipher!(self, |c| c
            .encrypt_block(GenericArray::from_mut_slice(block.as_mut_slice())));
    }

    pub fn encrypt_unit(
        &self,
        mode: ChainMode,
        iv: Option<&[u8; IV_SIZE]>,
        data: &mut [u8],
    ) -> BvdResult<()> {
        check_unit_len(data.len())?;
        match mode {
            ChainMode::Cbc => {
                let iv = require_iv(iv)?;
                with_cipher!(self, |c| {
                    cbc::Encryptor::inner_iv_init(c.clone(), GenericArray::from_slice(iv))
                        .encrypt_padded_mut::<NoPadding>(data, data.len())
                        .map_err(|e| BvdError::Cipher(format!("cbc encrypt: {e}")))?;
                });
            }
            ChainMode::Ecb => {
                with_cipher!(self, |c| {
                    ecb::Encryptor::inner_init(c.clone())
                        .encrypt_padded_mut::<NoPadding>(data, data.len())
                        .map_err(|e| BvdError::Cipher(format!("ecb encrypt: {e}")))?;
                });
            }
        }
        Ok(())
    }

    pub fn decrypt_unit(
        &self,
        mode: ChainMode,
        iv: Option<&[u8; IV_SIZE]>,
        data: &mut [u8],
    ) -> BvdResult<()> {
        check_unit_len(data.len())?;
        match mode {
            ChainMode::Cbc => {
                let iv = require_iv(iv)?;
                with_cipher!(self, |c| {
                    cbc::Decryptor::inner_iv_init(c.clone(), GenericArray::from_slice(iv))
                        .decrypt_padded_mut::<NoPadding>(data)
                        .map_err(|e| BvdError::Cipher(format!("cbc decrypt: {e}")))?;
                });
            }
            ChainMode::Ecb => {
                with_cipher!(self, |c| {
                    ecb::Decryptor::inner_init(c.clone())
                        .decrypt_padded_mut::<NoPadding>(data)
                        .map_err(|e| BvdError::Cipher(format!("ecb decrypt: {e}")))?;
                });
            }
        }
        Ok(())
    }
}

fn check_unit_len(len: usize) -> BvdResult<()> {
    if len == 0 || len % IV_SIZE != 0 {
        return Err(BvdError::Cipher(format!(
            "unit length {len} is not a positive multiple of the {IV_SIZE}-byte block"
        )));
    }
    Ok(())
}

fn require_iv(iv: Option<&[u8; IV_SIZE]>) -> BvdResult<&[u8; IV_SIZE]> {
    iv.ok_or_else(|| BvdError::Cipher("chained unit submitted without an IV".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cipher(key_len: usize) -> DataCipher {
        let key = VolumeKey::from_bytes((0..key_len as u8).collect());
        DataCipher::new("aes", &key).unwrap()
    }

    #[test]
    fn all_aes_key_sizes_accepted() {
        for len in [16, 24, 32] {
            test_cipher(len);
        }
    }

    #[test]
    fn bad_key_sizes_rejected() {
        for len in [0, 8, 17, 33] {
            let key = VolumeKey::from_bytes(vec![0u8; len]);
            assert!(matches!(
                DataCipher::new("aes", &key),
                Err(BvdError::Key(_))
            ));
        }
    }

    #[test]
    fn cbc_unit_roundtrip() {
        let cipher = test_cipher(32);
        let iv = [7u8; IV_SIZE];
        let original: Vec<u8> = (0..512).map(|i| (i % 251) as u8).collect();

        let mut data = original.clone();
        cipher
            .encrypt_unit(ChainMode::Cbc, Some(&iv), &mut data)
            .unwrap();
        assert_ne!(data, original);
        cipher
            .decrypt_unit(ChainMode::Cbc, Some(&iv), &mut data)
            .unwrap();
        assert_eq!(data, original);
    }

    #[test]
    fn ecb_unit_roundtrip() {
        let cipher = test_cipher(16);
        let original = vec![0x5au8; 512];

        let mut data = original.clone();
        cipher.encrypt_unit(ChainMode::Ecb, None, &mut data).unwrap();
        assert_ne!(data, original);
        cipher.decrypt_unit(ChainMode::Ecb, None, &mut data).unwrap();
        assert_eq!(data, original);
    }

    #[test]
    fn cbc_same_plaintext_different_iv_differs() {
        let cipher = test_cipher(32);
        let mut a = vec![0u8; 512];
        let mut b = vec![0u8; 512];
        cipher
            .encrypt_unit(ChainMode::Cbc, Some(&[1u8; IV_SIZE]), &mut a)
            .unwrap();
        cipher
            .encrypt_unit(ChainMode::Cbc, Some(&[2u8; IV_SIZE]), &mut b)
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn cbc_without_iv_is_an_error() {
        let cipher = test_cipher(32);
        let mut data = vec![0u8; 512];
        assert!(cipher.encrypt_unit(ChainMode::Cbc, None, &mut data).is_err());
    }

    #[test]
    fn ragged_unit_length_rejected() {
        let cipher = test_cipher(32);
        let mut data = vec![0u8; 100];
        assert!(matches!(
            cipher.encrypt_unit(ChainMode::Ecb, None, &mut data),
            Err(BvdError::Cipher(_))
        ));
    }

    #[test]
    fn single_block_encrypt_is_deterministic() {
        let cipher = test_cipher(32);
        let mut a = [3u8; IV_SIZE];
        let mut b = [3u8; IV_SIZE];
        cipher.encrypt_single_block(&mut a);
        cipher.encrypt_single_block(&mut b);
        assert_eq!(a, b);
        assert_ne!(a, [3u8; IV_SIZE]);
    }
}
