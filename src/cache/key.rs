use std::collections::BTreeMap;
use std::fmt::{Debug, Display};
use std::io;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::core::Hash32;
use crate::fingerprint::Fingerprint;
use crate::graph::{BuildPlan, TaskId};

/// Identity of one cached task result.
///
/// Derived from the task fingerprint, the cache scope and the content of every
/// input file, so editing an input misses even though the command line is
/// unchanged.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CacheKey(Hash32);

impl CacheKey {
    pub fn new(
        fingerprint: Fingerprint,
        scope: &BTreeMap<String, String>,
        inputs: &[Option<Hash32>],
    ) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"kumitate-cache-key-v1\0");
        hasher.update(fingerprint.as_hash().as_bytes());

        hasher.update(&(scope.len() as u64).to_le_bytes());
        for (key, value) in scope {
            for part in [key, value] {
                hasher.update(&(part.len() as u64).to_le_bytes());
                hasher.update(part.as_bytes());
            }
        }

        hasher.update(&(inputs.len() as u64).to_le_bytes());
        for input in inputs {
            match input {
                Some(digest) => {
                    hasher.update(&[1]);
                    hasher.update(digest.as_bytes());
                }
                None => {
                    hasher.update(&[0]);
                }
            }
        }

        CacheKey(hasher.finalize().into())
    }

    /// Computes the key of a planned task from the current content of its
    /// input files.
    pub fn for_task(
        plan: &BuildPlan,
        id: TaskId,
        scope: &BTreeMap<String, String>,
    ) -> io::Result<Self> {
        let task = plan.task(id);
        let digests = task
            .inputs()
            .iter()
            .filter_map(|&node| plan.node(node).path())
            .map(input_digest)
            .collect::<io::Result<Vec<_>>>()?;

        Ok(CacheKey::new(task.signature(), scope, &digests))
    }

    pub fn to_hex(self) -> String {
        self.0.to_hex()
    }
}

/// Digest of an input file, `None` for directories and files that do not
/// exist.
fn input_digest(path: &Utf8Path) -> io::Result<Option<Hash32>> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => Hash32::hash_file(path).map(Some),
        Ok(_) => Ok(None),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

impl Debug for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CacheKey({})", self.to_hex())
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint;

    fn sample() -> Fingerprint {
        fingerprint(
            &["cc", "-c", "main.c"],
            &BTreeMap::new(),
            Utf8Path::new("/work"),
            ["/work/main.c"],
            ["/work/main.o"],
        )
    }

    #[test]
    fn test_key_depends_on_input_content() {
        let scope = BTreeMap::new();
        let a = CacheKey::new(sample(), &scope, &[Some(Hash32::hash("int main;"))]);
        let b = CacheKey::new(sample(), &scope, &[Some(Hash32::hash("int main();"))]);
        let c = CacheKey::new(sample(), &scope, &[Some(Hash32::hash("int main;"))]);

        assert_ne!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn test_key_depends_on_scope() {
        let inputs = [None];
        let swift5 = BTreeMap::from([("toolchain".to_string(), "5.10".to_string())]);
        let swift6 = BTreeMap::from([("toolchain".to_string(), "6.0".to_string())]);

        assert_ne!(
            CacheKey::new(sample(), &swift5, &inputs),
            CacheKey::new(sample(), &swift6, &inputs)
        );
    }

    #[test]
    fn test_missing_input_differs_from_empty_file() {
        let scope = BTreeMap::new();
        let missing = CacheKey::new(sample(), &scope, &[None]);
        let empty = CacheKey::new(sample(), &scope, &[Some(Hash32::hash(""))]);

        assert_ne!(missing, empty);
    }
}
