//! Conditional-write object store abstraction and its filesystem backend.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use trellis_core::error::{Result, TrellisError};
use trellis_core::hash::sha256_hex;

/// Write precondition, mirroring HTTP conditional requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// Unconditional overwrite.
    None,
    /// Create only: fail if the object exists (`If-None-Match: *`).
    IfNoneMatch,
    /// Replace only if the stored etag matches (`If-Match`).
    IfMatch(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// Write succeeded; carries the new etag.
    Ok(String),
    /// The precondition did not hold; nothing was written.
    PreconditionFailed,
}

impl PutOutcome {
    pub fn etag(self) -> Result<String> {
        match self {
            PutOutcome::Ok(etag) => Ok(etag),
            PutOutcome::PreconditionFailed => Err(TrellisError::storage(
                "object_put",
                "precondition failed",
            )),
        }
    }

    pub fn is_precondition_failed(&self) -> bool {
        matches!(self, PutOutcome::PreconditionFailed)
    }
}

/// Minimal object-store contract the backend programs against: reads with
/// etags, conditional writes, conditional deletes, and prefix listing.
pub trait ObjectStore: Send {
    /// Fetch an object and its etag; `None` when absent.
    fn get(&self, key: &str) -> Result<Option<(Vec<u8>, String)>>;

    /// Write an object under a precondition.
    fn put(&self, key: &str, body: &[u8], precondition: Precondition) -> Result<PutOutcome>;

    /// Delete an object; with `if_match`, only when the etag still
    /// matches. Returns false when the precondition failed.
    fn delete(&self, key: &str, if_match: Option<&str>) -> Result<bool>;

    /// All keys under a prefix, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    fn boxed_clone(&self) -> Box<dyn ObjectStore>;
}

// In-process serialisation of conditional operations. Cross-process
// mutual exclusion is carried by the lock object protocol above this
// layer, not by the filesystem.
static FS_CAS: Mutex<()> = Mutex::new(());

/// Filesystem-backed object store. Keys map to paths below the root,
/// etags are the SHA-256 of the content, and writes go through a
/// temp-file rename.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<FsObjectStore> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(FsObjectStore { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_path(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        for part in key.split('/') {
            path.push(part);
        }
        path
    }

    fn read_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match std::fs::read(self.key_path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn collect_keys(&self, dir: &Path, rel: &str, out: &mut Vec<String>) -> Result<()> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let child_rel = if rel.is_empty() {
                name.clone()
            } else {
                format!("{rel}/{name}")
            };
            let path = entry.path();
            if path.is_dir() {
                self.collect_keys(&path, &child_rel, out)?;
            } else {
                out.push(child_rel);
            }
        }
        Ok(())
    }
}

impl ObjectStore for FsObjectStore {
    fn get(&self, key: &str) -> Result<Option<(Vec<u8>, String)>> {
        let _guard = FS_CAS.lock();
        Ok(self
            .read_raw(key)?
            .map(|bytes| {
                let etag = sha256_hex(&bytes);
                (bytes, etag)
            }))
    }

    fn put(&self, key: &str, body: &[u8], precondition: Precondition) -> Result<PutOutcome> {
        let _guard = FS_CAS.lock();

        let current = self.read_raw(key)?;
        match &precondition {
            Precondition::None => {}
            Precondition::IfNoneMatch => {
                if current.is_some() {
                    return Ok(PutOutcome::PreconditionFailed);
                }
            }
            Precondition::IfMatch(expected) => match &current {
                Some(bytes) if &sha256_hex(bytes) == expected => {}
                _ => return Ok(PutOutcome::PreconditionFailed),
            },
        }

        let path = self.key_path(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &path)?;
        Ok(PutOutcome::Ok(sha256_hex(body)))
    }

    fn delete(&self, key: &str, if_match: Option<&str>) -> Result<bool> {
        let _guard = FS_CAS.lock();
        let current = self.read_raw(key)?;
        let Some(bytes) = current else {
            return Ok(true);
        };
        if let Some(expected) = if_match {
            if sha256_hex(&bytes) != expected {
                return Ok(false);
            }
        }
        match std::fs::remove_file(self.key_path(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let _guard = FS_CAS.lock();
        let mut keys = Vec::new();
        self.collect_keys(&self.root.clone(), "", &mut keys)?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    fn boxed_clone(&self) -> Box<dyn ObjectStore> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (FsObjectStore, TempDir) {
        let dir = TempDir::new().unwrap();
        (FsObjectStore::open(dir.path()).unwrap(), dir)
    }

    #[test]
    fn test_put_get_roundtrip() {
        let (s, _dir) = store();
        let etag = s
            .put("meta/head.json", b"{}", Precondition::None)
            .unwrap()
            .etag()
            .unwrap();
        let (bytes, read_etag) = s.get("meta/head.json").unwrap().unwrap();
        assert_eq!(bytes, b"{}");
        assert_eq!(etag, read_etag);
        assert!(s.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_if_none_match_create() {
        let (s, _dir) = store();
        assert!(matches!(
            s.put("k", b"a", Precondition::IfNoneMatch).unwrap(),
            PutOutcome::Ok(_)
        ));
        assert!(s
            .put("k", b"b", Precondition::IfNoneMatch)
            .unwrap()
            .is_precondition_failed());
    }

    #[test]
    fn test_if_match_replace() {
        let (s, _dir) = store();
        let etag = s
            .put("k", b"a", Precondition::None)
            .unwrap()
            .etag()
            .unwrap();

        // Stale etag fails after a concurrent overwrite.
        s.put("k", b"b", Precondition::None).unwrap();
        assert!(s
            .put("k", b"c", Precondition::IfMatch(etag))
            .unwrap()
            .is_precondition_failed());

        let (_, current) = s.get("k").unwrap().unwrap();
        assert!(matches!(
            s.put("k", b"c", Precondition::IfMatch(current)).unwrap(),
            PutOutcome::Ok(_)
        ));
    }

    #[test]
    fn test_conditional_delete() {
        let (s, _dir) = store();
        let etag = s
            .put("k", b"a", Precondition::None)
            .unwrap()
            .etag()
            .unwrap();
        s.put("k", b"b", Precondition::None).unwrap();
        assert!(!s.delete("k", Some(&etag)).unwrap());
        let (_, current) = s.get("k").unwrap().unwrap();
        assert!(s.delete("k", Some(&current)).unwrap());
        assert!(s.get("k").unwrap().is_none());
    }

    #[test]
    fn test_list_prefix_sorted() {
        let (s, _dir) = store();
        for key in ["events/ns/b.json", "events/ns/a.json", "claims/ns/x.json"] {
            s.put(key, b"{}", Precondition::None).unwrap();
        }
        let keys = s.list("events/ns/").unwrap();
        assert_eq!(keys, vec!["events/ns/a.json", "events/ns/b.json"]);
    }
}
