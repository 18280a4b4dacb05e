use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::planner::is_truthy;

/// Options controlling how a plan is executed.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildOptions {
    /// Number of worker threads.
    pub jobs: usize,
    /// Keep running independent tasks after a failure.
    pub continue_after_errors: bool,
    pub cache: Option<CacheConfig>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            jobs: std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1),
            continue_after_errors: false,
            cache: None,
        }
    }
}

impl BuildOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    pub fn continue_after_errors(mut self, value: bool) -> Self {
        self.continue_after_errors = value;
        self
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.cache = Some(cache);
        self
    }
}

/// Location and policy of the compilation cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Root directory of the object store.
    pub path: Utf8PathBuf,
    /// Size budget in bytes, unlimited when absent.
    #[serde(default)]
    pub limit_size: Option<u64>,
    /// Emit per-task hit and miss notes and a summary.
    #[serde(default)]
    pub remarks: bool,
    /// Extra key material, such as the toolchain identity.
    #[serde(default)]
    pub scope: BTreeMap<String, String>,
    /// Where to write hit and miss counters after a build.
    #[serde(default)]
    pub metrics_path: Option<Utf8PathBuf>,
}

impl CacheConfig {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            path: path.into(),
            limit_size: None,
            remarks: false,
            scope: BTreeMap::new(),
            metrics_path: None,
        }
    }

    pub fn limit_size(mut self, bytes: u64) -> Self {
        self.limit_size = Some(bytes);
        self
    }

    pub fn remarks(mut self, value: bool) -> Self {
        self.remarks = value;
        self
    }

    pub fn scope(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.scope.insert(key.into(), value.into());
        self
    }

    pub fn metrics_path(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.metrics_path = Some(path.into());
        self
    }

    /// Reads the cache configuration from build settings.
    ///
    /// Returns `None` when no cache path is configured. A limit of zero means
    /// no limit.
    pub fn from_build_settings(
        settings: &BTreeMap<String, String>,
    ) -> Result<Option<Self>, CacheError> {
        let Some(path) = settings
            .get("COMPILATION_CACHE_CAS_PATH")
            .filter(|path| !path.trim().is_empty())
        else {
            return Ok(None);
        };

        let mut config = CacheConfig::new(path.trim());

        if let Some(limit) = settings
            .get("COMPILATION_CACHE_LIMIT_SIZE")
            .filter(|limit| !limit.trim().is_empty())
        {
            let bytes = parse_size(limit)?;
            config.limit_size = (bytes > 0).then_some(bytes);
        }

        config.remarks = settings
            .get("COMPILATION_CACHE_ENABLE_DIAGNOSTIC_REMARKS")
            .is_some_and(|value| is_truthy(value));

        if let Some(toolchain) = settings.get("TOOLCHAINS") {
            config.scope.insert("toolchain".into(), toolchain.clone());
        }

        Ok(Some(config))
    }
}

/// Parses a byte count with an optional `K`, `M` or `G` suffix (powers of
/// 1024).
pub fn parse_size(text: &str) -> Result<u64, CacheError> {
    let invalid = || CacheError::InvalidLimit(text.to_string());

    let trimmed = text.trim();
    let (digits, multiplier) = match trimmed.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => {
            let multiplier: u64 = match c.to_ascii_uppercase() {
                'K' => 1 << 10,
                'M' => 1 << 20,
                'G' => 1 << 30,
                _ => return Err(invalid()),
            };
            (&trimmed[..i], multiplier)
        }
        _ => (trimmed, 1),
    };

    digits
        .trim()
        .parse::<u64>()
        .ok()
        .and_then(|value| value.checked_mul(multiplier))
        .ok_or_else(invalid)
}
