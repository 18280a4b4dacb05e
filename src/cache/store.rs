use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::cache::key::CacheKey;
use crate::core::Hash32;
use crate::error::CacheError;

const INDEX_FILE: &str = "index.cbor";
const OBJECTS_DIR: &str = "objects";
const INDEX_VERSION: u32 = 1;

/// One output file of a cached task, stored as a content-addressed object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredOutput {
    pub path: Utf8PathBuf,
    pub object: Hash32,
    pub size: u64,
}

/// The recorded outputs of one task run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub outputs: Vec<StoredOutput>,
}

impl CacheEntry {
    /// Bytes charged against the size budget.
    pub fn size(&self) -> u64 {
        self.outputs.iter().map(|output| output.size).sum()
    }

    pub(crate) fn objects(&self) -> impl Iterator<Item = Hash32> + '_ {
        self.outputs.iter().map(|output| output.object)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct IndexFile {
    pub version: u32,
    pub clock: u64,
    pub validated: bool,
    pub records: Vec<IndexRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct IndexRecord {
    pub entry: CacheEntry,
    pub last_access: u64,
}

/// Blob storage and index persistence under the cache root.
///
/// This layer does no locking of its own; the cache serializes writers.
#[derive(Debug)]
pub(crate) struct ObjectStore {
    root: Utf8PathBuf,
    temp_counter: AtomicU64,
}

impl ObjectStore {
    pub fn open(root: &Utf8Path) -> io::Result<Self> {
        fs::create_dir_all(root.join(OBJECTS_DIR))?;

        Ok(Self {
            root: root.to_owned(),
            temp_counter: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn object_path(&self, object: Hash32) -> Utf8PathBuf {
        self.root.join(OBJECTS_DIR).join(object.to_hex())
    }

    fn temp_path(&self, dir: &Utf8Path, stem: &str) -> Utf8PathBuf {
        let n = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        dir.join(format!(".tmp-{stem}-{}-{n}", std::process::id()))
    }

    /// Digest and size of a file about to be stored.
    pub fn digest(source: &Utf8Path) -> io::Result<(Hash32, u64)> {
        Ok((Hash32::hash_file(source)?, fs::metadata(source)?.len()))
    }

    /// Copies `source` into the store as `object`. An intact copy that is
    /// already stored is kept; a damaged one is replaced.
    pub fn write(&self, source: &Utf8Path, object: Hash32, size: u64) -> io::Result<StoredOutput> {
        let output = StoredOutput {
            path: source.to_owned(),
            object,
            size,
        };

        if self.check(&output, true).is_err() {
            let temp = self.temp_path(&self.root.join(OBJECTS_DIR), &object.to_hex());
            fs::copy(source, &temp)?;
            fs::rename(&temp, self.object_path(object))?;
        }

        Ok(output)
    }

    /// Copies a stored object back to the location it was produced at.
    pub fn materialize(&self, output: &StoredOutput) -> io::Result<()> {
        if let Some(parent) = output.path.parent() {
            fs::create_dir_all(parent)?;
        }

        // The destination may be a hard link into somebody else's data.
        match fs::remove_file(&output.path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }

        fs::copy(self.object_path(output.object), &output.path)?;
        Ok(())
    }

    /// Checks that the object behind `output` is intact. A deep check also
    /// re-hashes its content.
    pub fn check(&self, output: &StoredOutput, deep: bool) -> Result<(), String> {
        let path = self.object_path(output.object);

        let meta = fs::metadata(&path).map_err(|_| format!("object {} is missing", output.object))?;
        if meta.len() != output.size {
            return Err(format!(
                "object {} has size {}, expected {}",
                output.object,
                meta.len(),
                output.size
            ));
        }

        if deep {
            let actual = Hash32::hash_file(&path).map_err(|e| e.to_string())?;
            if actual != output.object {
                return Err(format!("object {} has digest {actual}", output.object));
            }
        }

        Ok(())
    }

    pub fn remove(&self, object: Hash32) -> io::Result<()> {
        match fs::remove_file(self.object_path(object)) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }

    /// Removes files in the object directory that are not in `keep`,
    /// including temporaries left behind by interrupted writes. Temporaries
    /// of kept objects are still being written and stay.
    pub fn sweep(&self, keep: &HashSet<Hash32>) -> io::Result<usize> {
        let keep: HashSet<String> = keep.iter().map(|object| object.to_hex()).collect();
        let mut removed = 0;

        for item in fs::read_dir(self.root.join(OBJECTS_DIR))? {
            let item = item?;
            let name = item.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };

            let stem = name
                .strip_prefix(".tmp-")
                .and_then(|rest| rest.split('-').next())
                .unwrap_or(name);
            if !keep.contains(stem) && item.file_type()?.is_file() {
                fs::remove_file(item.path())?;
                removed += 1;
            }
        }

        Ok(removed)
    }

    /// Reads the index. `Ok(None)` means there is none yet, `Err` carries a
    /// description of why an existing index could not be used.
    pub fn read_index(&self) -> Result<Option<IndexFile>, String> {
        let path = self.root.join(INDEX_FILE);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.to_string()),
        };

        let index: IndexFile =
            ciborium::from_reader(BufReader::new(file)).map_err(|e| e.to_string())?;
        if index.version != INDEX_VERSION {
            return Err(format!("unsupported index version {}", index.version));
        }

        Ok(Some(index))
    }

    pub fn write_index(&self, clock: u64, validated: bool, records: Vec<IndexRecord>) -> Result<(), CacheError> {
        let path = self.root.join(INDEX_FILE);
        let temp = self.temp_path(&self.root, INDEX_FILE);
        let index = IndexFile {
            version: INDEX_VERSION,
            clock,
            validated,
            records,
        };

        let mut writer = BufWriter::new(File::create(&temp)?);
        ciborium::into_writer(&index, &mut writer)
            .map_err(|e| CacheError::Encode(path.clone(), e.to_string()))?;
        writer.flush()?;
        drop(writer);

        fs::rename(&temp, &path)?;
        Ok(())
    }
}
