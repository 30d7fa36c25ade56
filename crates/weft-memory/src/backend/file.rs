use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::{Location, PayloadBackend};
use crate::error::{MemoryError, MemoryResult};

/// Persistent payload storage, one file per key under a directory.
///
/// File names are the URL-safe base64 of the key, so `scan_prefix` can
/// recover keys from a directory listing. Writes go to a temporary file that
/// is atomically renamed over the target.
///
/// # Concurrent File Access
///
/// Two `FileBackend` instances pointing at the same directory will not
/// corrupt individual payloads (renames are atomic) but can race on
/// overwrite order; give each store its own directory.
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    /// Open (creating if needed) a backend rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> MemoryResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| MemoryError::io(format!("creating {}", dir.display()), e))?;
        tracing::debug!(path = ?dir, "Opened file payload backend");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.bin", URL_SAFE_NO_PAD.encode(key.as_bytes())))
    }

    fn key_for(file_name: &str) -> Option<String> {
        let encoded = file_name.strip_suffix(".bin")?;
        let bytes = URL_SAFE_NO_PAD.decode(encoded).ok()?;
        String::from_utf8(bytes).ok()
    }
}

impl PayloadBackend for FileBackend {
    fn put(&self, key: &str, payload: &[u8]) -> MemoryResult<()> {
        let path = self.path_for(key);
        let tmp_path = path.with_extension("tmp");

        fs::write(&tmp_path, payload).map_err(|e| {
            tracing::error!(path = ?tmp_path, error = %e, "Failed to write payload to temporary file");
            MemoryError::io(format!("writing {}", tmp_path.display()), e)
        })?;

        fs::rename(&tmp_path, &path).map_err(|e| {
            tracing::error!(from = ?tmp_path, to = ?path, error = %e, "Failed to atomically rename payload");
            MemoryError::io(
                format!("renaming {} to {}", tmp_path.display(), path.display()),
                e,
            )
        })?;
        Ok(())
    }

    fn get(&self, key: &str) -> MemoryResult<Option<Vec<u8>>> {
        let path = self.path_for(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(MemoryError::io(format!("reading {}", path.display()), e)),
        }
    }

    fn delete(&self, key: &str) -> MemoryResult<bool> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(MemoryError::io(format!("removing {}", path.display()), e)),
        }
    }

    fn scan_prefix(&self, prefix: &str) -> MemoryResult<Vec<String>> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| MemoryError::io(format!("listing {}", self.dir.display()), e))?;

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| MemoryError::io("reading directory entry", e))?;
            let name = entry.file_name();
            if let Some(key) = name.to_str().and_then(Self::key_for)
                && key.starts_with(prefix)
            {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    fn location(&self) -> Location {
        Location::Disk
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_round_trip_and_persistence() {
        let dir = tempdir().unwrap();
        {
            let backend = FileBackend::open(dir.path()).unwrap();
            backend.put("ref/ref-1", b"payload").unwrap();
        }

        let reopened = FileBackend::open(dir.path()).unwrap();
        assert_eq!(reopened.get("ref/ref-1").unwrap(), Some(b"payload".to_vec()));
        assert_eq!(reopened.location(), Location::Disk);
    }

    #[test]
    fn test_missing_key_is_none() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();
        assert_eq!(backend.get("nope").unwrap(), None);
        assert!(!backend.delete("nope").unwrap());
    }

    #[test]
    fn test_scan_prefix_decodes_names() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();
        backend.put("ref/a", b"1").unwrap();
        backend.put("ref/b", b"2").unwrap();
        backend.put("blob/c", b"3").unwrap();
        // stray files are ignored
        std::fs::write(dir.path().join("README"), b"x").unwrap();

        let mut keys = backend.scan_prefix("ref/").unwrap();
        keys.sort();
        assert_eq!(keys, vec!["ref/a", "ref/b"]);
    }
}
