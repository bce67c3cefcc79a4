//! Runtime tuning options for a mapping (loaded from TOML when embedded in
//! a daemon config, or built programmatically with `Default`).

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{BvdError, BvdResult};

/// Which cipher backend a mapping drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Transform on the submitting thread.
    Inline,
    /// Dispatch units to the asynchronous offload engine.
    Offloaded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetOpts {
    /// Cipher backend selection (default: inline)
    pub backend: BackendKind,
    /// Data page pool capacity, in pages
    pub pool_pages: usize,
    /// Pending-I/O descriptor pool capacity
    pub pool_ios: usize,
    /// Offload engine worker threads (offloaded backend only)
    pub offload_workers: usize,
    /// Offload engine dispatch queue depth; a full queue reports
    /// transient saturation to the submitter
    pub queue_depth: usize,
    /// Deferred decrypt queue worker threads
    pub decrypt_workers: usize,
}

impl Default for TargetOpts {
    fn default() -> Self {
        Self {
            backend: BackendKind::Inline,
            pool_pages: 32,
            pool_ios: 16,
            offload_workers: 2,
            queue_depth: 64,
            decrypt_workers: 1,
        }
    }
}

impl TargetOpts {
    pub fn validate(&self) -> BvdResult<()> {
        if self.pool_ios == 0 {
            return Err(BvdError::Config("pool_ios must be at least 1".into()));
        }
        if self.decrypt_workers == 0 {
            return Err(BvdError::Config("decrypt_workers must be at least 1".into()));
        }
        if self.backend == BackendKind::Offloaded {
            if self.offload_workers == 0 {
                return Err(BvdError::Config(
                    "offload_workers must be at least 1 for the offloaded backend".into(),
                ));
            }
            if self.queue_depth == 0 {
                return Err(BvdError::Config(
                    "queue_depth must be at least 1 for the offloaded backend".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Load options from a TOML file. Missing keys fall back to defaults.
pub fn load_opts(path: &Path) -> BvdResult<TargetOpts> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| BvdError::Config(format!("reading {}: {e}", path.display())))?;
    let opts = parse_opts(&raw)?;
    tracing::debug!(path = %path.display(), backend = ?opts.backend, "loaded mapping options");
    Ok(opts)
}

pub fn parse_opts(raw: &str) -> BvdResult<TargetOpts> {
    let opts: TargetOpts =
        toml::from_str(raw).map_err(|e| BvdError::Config(format!("parsing options: {e}")))?;
    opts.validate()?;
    Ok(opts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let opts = TargetOpts::default();
        assert!(opts.validate().is_ok());
        assert_eq!(opts.backend, BackendKind::Inline);
        assert_eq!(opts.pool_pages, 32);
    }

    #[test]
    fn parse_partial_config_fills_defaults() {
        let opts = parse_opts("backend = \"offloaded\"\npool_pages = 8\n").unwrap();
        assert_eq!(opts.backend, BackendKind::Offloaded);
        assert_eq!(opts.pool_pages, 8);
        assert_eq!(opts.pool_ios, 16);
        assert_eq!(opts.queue_depth, 64);
    }

    #[test]
    fn zero_descriptor_pool_rejected() {
        let err = parse_opts("pool_ios = 0\n").unwrap_err();
        assert!(matches!(err, BvdError::Config(_)));
    }

    #[test]
    fn offloaded_backend_needs_workers() {
        let err = parse_opts("backend = \"offloaded\"\noffload_workers = 0\n").unwrap_err();
        assert!(matches!(err, BvdError::Config(_)));
    }

    #[test]
    fn serialize_roundtrip() {
        let opts = TargetOpts {
            backend: BackendKind::Offloaded,
            pool_pages: 4,
            pool_ios: 2,
            offload_workers: 3,
            queue_depth: 16,
            decrypt_workers: 2,
        };
        let raw = toml::to_string(&opts).unwrap();
        let back = parse_opts(&raw).unwrap();
        assert_eq!(back.pool_pages, 4);
        assert_eq!(back.offload_workers, 3);
        assert_eq!(back.backend, BackendKind::Offloaded);
    }
}
