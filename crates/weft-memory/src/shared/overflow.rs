use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};
use uuid::Uuid;

use weft_core::OverflowConfig;

use super::codec::checksum;
use crate::error::{MemoryError, MemoryResult};

/// Disk tier for shared memory entries evicted from the resident set.
///
/// Each spill is one file named after the SHA-256 of its key plus a random
/// suffix. The directory is created on first spill.
pub struct DiskOverflow {
    dir: PathBuf,
    max_bytes: u64,
    used: AtomicU64,
}

impl DiskOverflow {
    pub fn new(config: &OverflowConfig) -> Self {
        Self {
            dir: config.directory.clone(),
            max_bytes: config.max_disk_bytes,
            used: AtomicU64::new(0),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Write `bytes` for `label` to disk. Fails with
    /// [`MemoryError::CapacityExhausted`] when the disk budget is spent.
    pub async fn spill(&self, label: &str, bytes: &[u8]) -> MemoryResult<PathBuf> {
        let size = bytes.len() as u64;
        let used = self.used_bytes();
        if used + size > self.max_bytes {
            warn!(
                key = label,
                size,
                used,
                limit = self.max_bytes,
                "Disk overflow is full"
            );
            return Err(MemoryError::CapacityExhausted {
                tier: "disk",
                requested: size,
                limit: self.max_bytes,
            });
        }

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| MemoryError::io(format!("creating {}", self.dir.display()), e))?;

        // unique per spill so an overwrite never shares a file with the copy it replaces
        let digest = checksum(label.as_bytes());
        let path = self
            .dir
            .join(format!("{}-{}.spill", &digest[..16], Uuid::new_v4().simple()));
        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, bytes)
            .await
            .map_err(|e| MemoryError::io(format!("writing {}", tmp_path.display()), e))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| MemoryError::io(format!("renaming {}", tmp_path.display()), e))?;

        self.used.fetch_add(size, Ordering::Relaxed);
        debug!(key = label, size, path = ?path, "Spilled entry to disk");
        Ok(path)
    }

    pub async fn load(&self, path: &Path) -> MemoryResult<Vec<u8>> {
        tokio::fs::read(path)
            .await
            .map_err(|e| MemoryError::io(format!("reading {}", path.display()), e))
    }

    /// Remove a spilled file and give its bytes back to the budget.
    pub async fn remove(&self, path: &Path, size: u64) -> MemoryResult<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(MemoryError::io(format!("removing {}", path.display()), e)),
        }
        let _ = self
            .used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                Some(used.saturating_sub(size))
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn overflow(dir: &Path, max: u64) -> DiskOverflow {
        DiskOverflow::new(&OverflowConfig {
            enabled: true,
            directory: dir.join("spill"),
            max_disk_bytes: max,
        })
    }

    #[tokio::test]
    async fn test_spill_load_remove() {
        let dir = tempdir().unwrap();
        let overflow = overflow(dir.path(), 1024);

        let path = overflow.spill("session:s:k", b"spilled").await.unwrap();
        assert!(path.starts_with(dir.path().join("spill")));
        assert_eq!(overflow.used_bytes(), 7);
        assert_eq!(overflow.load(&path).await.unwrap(), b"spilled");

        overflow.remove(&path, 7).await.unwrap();
        assert_eq!(overflow.used_bytes(), 0);
        assert!(!path.exists());
        // removing twice is harmless
        overflow.remove(&path, 7).await.unwrap();
    }

    #[tokio::test]
    async fn test_disk_budget_enforced() {
        let dir = tempdir().unwrap();
        let overflow = overflow(dir.path(), 10);
        overflow.spill("a", &[0u8; 8]).await.unwrap();
        let err = overflow.spill("b", &[0u8; 8]).await.unwrap_err();
        assert!(matches!(
            err,
            MemoryError::CapacityExhausted { tier: "disk", .. }
        ));
    }
}
