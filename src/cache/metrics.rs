use std::sync::atomic::{AtomicU64, Ordering};

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// Hit and miss counters of one build.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheMetrics {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cache_hits: self.hits.load(Ordering::Relaxed),
            cache_misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
}

impl MetricsSnapshot {
    pub fn cacheable(&self) -> u64 {
        self.cache_hits + self.cache_misses
    }

    /// Summary line, e.g. `3 hits / 4 cacheable tasks (75%)`.
    pub fn summary(&self) -> String {
        let total = self.cacheable();
        let percent = if total == 0 {
            0
        } else {
            self.cache_hits * 100 / total
        };

        format!(
            "{} hits / {} cacheable tasks ({}%)",
            self.cache_hits, total, percent
        )
    }

    pub fn write(&self, path: &Utf8Path) -> Result<(), CacheError> {
        if let Some(parent) = path.parent()
            && !parent.as_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string(self)
            .map_err(|e| CacheError::Encode(path.to_owned(), e.to_string()))?;
        std::fs::write(path, json)?;

        Ok(())
    }
}
