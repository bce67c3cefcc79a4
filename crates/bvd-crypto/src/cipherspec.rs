//! Parsing of the `cipher-chainmode[-ivmode[:ivopts]]` spec string.
//!
//! Examples: `aes-cbc-plain`, `aes-cbc-essiv:sha256`, `aes-ecb`.
//! The parsed form re-renders byte-for-byte through `Display`, which is what
//! the status query relies on.

use bvd_core::{BvdError, BvdResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainMode {
    Cbc,
    Ecb,
}

impl ChainMode {
    /// Whether this chaining mode consumes a per-sector IV.
    pub fn needs_iv(&self) -> bool {
        matches!(self, ChainMode::Cbc)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChainMode::Cbc => "cbc",
            ChainMode::Ecb => "ecb",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IvMode {
    /// Low 32 bits of the sector number, little-endian, zero-padded.
    Plain,
    /// Sector number encrypted with a cipher keyed by a digest of the
    /// volume key.
    Essiv { digest: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherSpec {
    /// Block cipher name; only `aes` is registered.
    pub cipher: String,
    pub chainmode: ChainMode,
    pub ivmode: Option<IvMode>,
}

impl CipherSpec {
    pub fn parse(raw: &str) -> BvdResult<Self> {
        let mut parts = raw.splitn(3, '-');
        let cipher = parts
            .next()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| BvdError::CipherSpec("empty cipher spec".into()))?;
        let chainmode = parts
            .next()
            .ok_or_else(|| BvdError::CipherSpec(format!("'{raw}': missing chaining mode")))?;
        let ivmode = parts.next();

        if cipher != "aes" {
            return Err(BvdError::CipherSpec(format!("unknown cipher '{cipher}'")));
        }

        let chainmode = match chainmode {
            "cbc" => ChainMode::Cbc,
            "ecb" => ChainMode::Ecb,
            other => {
                return Err(BvdError::CipherSpec(format!(
                    "unknown chaining mode '{other}'"
                )))
            }
        };

        let ivmode = match (chainmode.needs_iv(), ivmode) {
            (false, None) => None,
            (false, Some(iv)) => {
                return Err(BvdError::CipherSpec(format!(
                    "chaining mode '{}' takes no IV mode, got '{iv}'",
                    chainmode.as_str()
                )))
            }
            (true, None) => {
                return Err(BvdError::CipherSpec(format!(
                    "chaining mode '{}' requires an IV mode",
                    chainmode.as_str()
                )))
            }
            (true, Some(iv)) => Some(Self::parse_ivmode(iv)?),
        };

        Ok(Self {
            cipher: cipher.to_string(),
            chainmode,
            ivmode,
        })
    }

    fn parse_ivmode(raw: &str) -> BvdResult<IvMode> {
        let (name, opts) = match raw.split_once(':') {
            Some((n, o)) => (n, Some(o)),
            None => (raw, None),
        };
        match (name, opts) {
            ("plain", None) => Ok(IvMode::Plain),
            ("plain", Some(_)) => {
                Err(BvdError::CipherSpec("IV mode 'plain' takes no options".into()))
            }
            ("essiv", Some(digest)) if !digest.is_empty() => Ok(IvMode::Essiv {
                digest: digest.to_string(),
            }),
            ("essiv", _) => Err(BvdError::CipherSpec(
                "IV mode 'essiv' requires a digest, e.g. essiv:sha256".into(),
            )),
            (other, _) => Err(BvdError::CipherSpec(format!("unknown IV mode '{other}'"))),
        }
    }
}

impl std::fmt::Display for CipherSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.cipher, self.chainmode.as_str())?;
        match &self.ivmode {
            None => Ok(()),
            Some(IvMode::Plain) => write!(f, "-plain"),
            Some(IvMode::Essiv { digest }) => write!(f, "-essiv:{digest}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cbc_plain() {
        let spec = CipherSpec::parse("aes-cbc-plain").unwrap();
        assert_eq!(spec.cipher, "aes");
        assert_eq!(spec.chainmode, ChainMode::Cbc);
        assert_eq!(spec.ivmode, Some(IvMode::Plain));
    }

    #[test]
    fn parse_cbc_essiv() {
        let spec = CipherSpec::parse("aes-cbc-essiv:sha256").unwrap();
        assert_eq!(
            spec.ivmode,
            Some(IvMode::Essiv {
                digest: "sha256".into()
            })
        );
    }

    #[test]
    fn parse_ecb_without_ivmode() {
        let spec = CipherSpec::parse("aes-ecb").unwrap();
        assert_eq!(spec.chainmode, ChainMode::Ecb);
        assert!(spec.ivmode.is_none());
    }

    #[test]
    fn display_is_canonical() {
        for raw in ["aes-cbc-plain", "aes-cbc-essiv:sha256", "aes-ecb"] {
            let spec = CipherSpec::parse(raw).unwrap();
            assert_eq!(spec.to_string(), raw);
        }
    }

    #[test]
    fn rejects_unknown_cipher() {
        let err = CipherSpec::parse("serpent-cbc-plain").unwrap_err();
        assert!(matches!(err, BvdError::CipherSpec(_)));
    }

    #[test]
    fn rejects_unknown_chainmode() {
        assert!(CipherSpec::parse("aes-xts-plain").is_err());
    }

    #[test]
    fn rejects_cbc_without_ivmode() {
        assert!(CipherSpec::parse("aes-cbc").is_err());
    }

    #[test]
    fn rejects_ecb_with_ivmode() {
        assert!(CipherSpec::parse("aes-ecb-plain").is_err());
    }

    #[test]
    fn rejects_essiv_without_digest() {
        assert!(CipherSpec::parse("aes-cbc-essiv").is_err());
        assert!(CipherSpec::parse("aes-cbc-essiv:").is_err());
    }

    #[test]
    fn rejects_empty_and_truncated() {
        assert!(CipherSpec::parse("").is_err());
        assert!(CipherSpec::parse("aes").is_err());
    }
}
