//! Content-addressed store of previously computed predictions.
//!
//! Entries are keyed by an md5 of the sequence (plus the canonical JSON
//! parameter encoding for servers whose output depends on parameters) and
//! laid out as `root/<first two hex chars>/<key>` — either an expanded
//! directory or a gzipped tarball next to where the directory would be.
//! Entries are immutable: writers only ever create, and concurrent writers
//! for the same key produce identical content, so last-writer-wins is safe.

use std::fs::File;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rand::Rng;

use crate::error::{QdError, Result};

const FINISH_DATE_INDEX: &str = "finished_date.tsv";
const MAX_FINISH_DATE_TRIES: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheHit {
    Directory(PathBuf),
    Archive(PathBuf),
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stable content key. Parameters are mixed in only when given, using
    /// serde_json's sorted-key object encoding so equal parameter sets
    /// always hash equally.
    pub fn key(sequence: &str, params: Option<&serde_json::Value>) -> String {
        match params {
            Some(p) => format!("{:x}", md5::compute(format!("{}{}", sequence, p))),
            None => format!("{:x}", md5::compute(sequence)),
        }
    }

    fn prefix_dir(&self, key: &str) -> PathBuf {
        self.root.join(&key[..2.min(key.len())])
    }

    pub fn dir_path(&self, key: &str) -> PathBuf {
        self.prefix_dir(key).join(key)
    }

    pub fn archive_path(&self, key: &str) -> PathBuf {
        self.prefix_dir(key).join(format!("{}.tar.gz", key))
    }

    /// An expanded directory is preferred; the archive is only consulted
    /// when the directory is absent.
    pub fn lookup(&self, key: &str) -> Option<CacheHit> {
        let dir = self.dir_path(key);
        if dir.is_dir() {
            return Some(CacheHit::Directory(dir));
        }
        let archive = self.archive_path(key);
        if archive.is_file() {
            return Some(CacheHit::Archive(archive));
        }
        None
    }

    /// Copy or extract the entry into `dest`. Returns false on a miss,
    /// including the case where the stored entry turns out to be unusable
    /// (zero-byte or unextractable archives are deleted on sight).
    pub fn materialize(&self, key: &str, dest: &Path) -> Result<bool> {
        let hit = match self.lookup(key) {
            Some(hit) => hit,
            None => return Ok(false),
        };
        match hit {
            CacheHit::Directory(dir) => {
                if let Err(e) = copy_tree(&dir, dest) {
                    tracing::warn!(key, error = %e, "Failed to copy cached directory");
                    return Ok(false);
                }
                Ok(true)
            }
            CacheHit::Archive(archive) => {
                let size = std::fs::metadata(&archive)
                    .map_err(|e| QdError::io(&archive, e))?
                    .len();
                if size == 0 {
                    let _ = std::fs::remove_file(&archive);
                    return Ok(false);
                }
                let parent = dest
                    .parent()
                    .ok_or_else(|| QdError::Corrupt(format!("no parent for {}", dest.display())))?;
                std::fs::create_dir_all(parent).map_err(|e| QdError::io(parent, e))?;
                if let Err(e) = unpack_tar_gz(&archive, parent) {
                    tracing::warn!(key, error = %e, "Deleting unextractable cache archive");
                    let _ = std::fs::remove_file(&archive);
                    return Ok(false);
                }
                // The tarball is rooted at the key; move it into place.
                let unpacked = parent.join(key);
                if dest.exists() {
                    let _ = std::fs::remove_dir_all(dest);
                }
                std::fs::rename(&unpacked, dest).map_err(|e| QdError::io(&unpacked, e))?;
                Ok(true)
            }
        }
    }

    /// Archive a verified result directory under `key`. Packs into a
    /// sibling temp file first, then renames, so readers never observe a
    /// half-written archive.
    pub fn archive(&self, src: &Path, key: &str) -> Result<()> {
        let prefix = self.prefix_dir(key);
        std::fs::create_dir_all(&prefix).map_err(|e| QdError::io(&prefix, e))?;
        let target = self.archive_path(key);
        let tmp = target.with_file_name(format!("{}.tar.gz.tmp", key));
        pack_tar_gz(src, key, &tmp)?;
        std::fs::rename(&tmp, &target).map_err(|e| QdError::io(&target, e))
    }

    /// Record a completion in the durable finish-date index used for cache
    /// aging. A handful of retries with jittered backoff; failure is
    /// logged and swallowed since the prediction itself already succeeded.
    pub fn record_finish_date(&self, key: &str, seq_len: usize) {
        let path = self.root.join(FINISH_DATE_INDEX);
        let stamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S");
        let line = format!("{}\t{}\t{}\n", stamp, key, seq_len);
        for attempt in 1..=MAX_FINISH_DATE_TRIES {
            let written = std::fs::create_dir_all(&self.root).and_then(|_| {
                use std::io::Write;
                let mut file = std::fs::OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(&path)?;
                file.write_all(line.as_bytes())
            });
            match written {
                Ok(()) => return,
                Err(e) if attempt < MAX_FINISH_DATE_TRIES => {
                    let backoff = rand::thread_rng().gen_range(50..1000);
                    tracing::warn!(key, attempt, error = %e, "Retrying finish-date write");
                    std::thread::sleep(std::time::Duration::from_millis(backoff));
                }
                Err(e) => {
                    tracing::warn!(key, error = %e, "Giving up on finish-date write");
                }
            }
        }
    }
}

/// Recursive directory copy (symlinks are followed).
pub fn copy_tree(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Pack `src` into a gzipped tarball at `out`, rooted at `root_name`.
pub fn pack_tar_gz(src: &Path, root_name: &str, out: &Path) -> Result<()> {
    let file = File::create(out).map_err(|e| QdError::io(out, e))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder
        .append_dir_all(root_name, src)
        .map_err(|e| QdError::io(src, e))?;
    let encoder = builder.into_inner().map_err(|e| QdError::io(out, e))?;
    encoder.finish().map_err(|e| QdError::io(out, e))?;
    Ok(())
}

/// Extract a gzipped tarball into `dest`.
pub fn unpack_tar_gz(archive: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive).map_err(|e| QdError::io(archive, e))?;
    let mut reader = tar::Archive::new(GzDecoder::new(file));
    reader.unpack(dest).map_err(|e| QdError::io(archive, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_stable_and_param_sensitive() {
        let a = CacheStore::key("MKTAYIAK", None);
        let b = CacheStore::key("MKTAYIAK", None);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);

        let params = serde_json::json!({"b": 1, "a": 2});
        let same_params = serde_json::json!({"a": 2, "b": 1});
        let with = CacheStore::key("MKTAYIAK", Some(&params));
        assert_ne!(a, with);
        // Key order in the source must not matter.
        assert_eq!(with, CacheStore::key("MKTAYIAK", Some(&same_params)));
    }

    #[test]
    fn archive_then_materialize_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path().join("cache"));

        let result = dir.path().join("seq_0");
        std::fs::create_dir_all(result.join("Topcons")).unwrap();
        std::fs::write(result.join("Topcons/topcons.top"), "MMMiii").unwrap();

        let key = CacheStore::key("MKT", None);
        cache.archive(&result, &key).unwrap();
        assert!(matches!(cache.lookup(&key), Some(CacheHit::Archive(_))));

        let dest = dir.path().join("out").join("seq_5");
        std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
        assert!(cache.materialize(&key, &dest).unwrap());
        assert_eq!(
            std::fs::read_to_string(dest.join("Topcons/topcons.top")).unwrap(),
            "MMMiii"
        );
    }

    #[test]
    fn directory_hit_takes_priority_and_copies() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path().join("cache"));
        let key = CacheStore::key("GGG", None);

        let entry = cache.dir_path(&key);
        std::fs::create_dir_all(&entry).unwrap();
        std::fs::write(entry.join("out.txt"), "x").unwrap();

        assert!(matches!(cache.lookup(&key), Some(CacheHit::Directory(_))));
        let dest = dir.path().join("seq_0");
        assert!(cache.materialize(&key, &dest).unwrap());
        assert!(dest.join("out.txt").is_file());
    }

    #[test]
    fn zero_byte_archive_is_deleted_and_missed() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path().join("cache"));
        let key = CacheStore::key("AAA", None);
        std::fs::create_dir_all(cache.archive_path(&key).parent().unwrap()).unwrap();
        std::fs::write(cache.archive_path(&key), b"").unwrap();

        let dest = dir.path().join("seq_0");
        assert!(!cache.materialize(&key, &dest).unwrap());
        assert!(!cache.archive_path(&key).exists());
        assert!(cache.lookup(&key).is_none());
    }

    #[test]
    fn miss_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path().join("cache"));
        let dest = dir.path().join("seq_0");
        assert!(!cache.materialize("ffffffffffffffff", &dest).unwrap());
    }

    #[test]
    fn finish_date_index_appends() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path().join("cache"));
        cache.record_finish_date("abcd", 120);
        cache.record_finish_date("ef01", 7);
        let text =
            std::fs::read_to_string(dir.path().join("cache").join("finished_date.tsv")).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("abcd\t120"));
    }
}
