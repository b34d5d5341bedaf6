//! Cross-process exclusive locking for directories the agent writes to.
//!
//! A lock is a JSON file (`lock`) carrying metadata about the holder (pid,
//! hostname, acquisition time, an optional owner tag). It is used in two
//! places: the local repository takes one per session directory before
//! adding files or mutating session metadata, and the upload engine takes
//! one alongside a resume marker for the duration of an upload attempt.
//! Both uses are generic over "some directory, locked by one process at a
//! time" — this crate doesn't know which.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const LOCK_FILE: &str = "lock";

/// Information stored in the lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Process ID of the lock holder.
    pub pid: u32,
    /// Hostname where the lock was acquired.
    pub hostname: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// Free-form label identifying what the lock protects (a session-id, a
    /// "{session-id}/{file-id}" upload key, etc).
    pub owner_tag: Option<String>,
}

/// Lock file handle that automatically releases on Drop.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    file: Option<File>,
}

impl LockFile {
    /// Acquire a lock file in the given directory.
    ///
    /// Fails if a lock already exists and is not stale. Use
    /// [`LockFile::is_locked`] first to check, or
    /// [`LockFile::acquire_with_timeout`] for automatic stale-lock handling.
    pub fn acquire(dir: &Path) -> Result<Self> {
        let lock_path = dir.join(LOCK_FILE);

        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create lock dir {}", dir.display()))?;

        if lock_path.exists() {
            let existing = Self::read_lock_info(dir)?;
            bail!(
                "lock already held by pid {} on {} since {} (owner: {:?})",
                existing.pid,
                existing.hostname,
                existing.acquired_at,
                existing.owner_tag
            );
        }

        let info = LockInfo {
            pid: std::process::id(),
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            acquired_at: Utc::now(),
            owner_tag: None,
        };

        write_lock_info_atomic(&lock_path, &info)?;

        Ok(Self {
            path: lock_path,
            file: None,
        })
    }

    /// Acquire a lock, removing it first if it is older than `timeout`.
    pub fn acquire_with_timeout(dir: &Path, timeout: Duration) -> Result<Self> {
        let lock_path = dir.join(LOCK_FILE);

        if lock_path.exists() {
            if let Ok(info) = Self::read_lock_info(dir) {
                let age = Utc::now() - info.acquired_at;
                if age.num_seconds().unsigned_abs() > timeout.as_secs() {
                    fs::remove_file(&lock_path).with_context(|| {
                        format!("failed to remove stale lock {}", lock_path.display())
                    })?;
                } else {
                    bail!(
                        "lock already held by pid {} on {} since {} (age: {:?})",
                        info.pid,
                        info.hostname,
                        info.acquired_at,
                        age
                    );
                }
            } else {
                fs::remove_file(&lock_path).with_context(|| {
                    format!("failed to remove corrupt lock {}", lock_path.display())
                })?;
            }
        }

        Self::acquire(dir)
    }

    /// Release the lock.
    pub fn release(&mut self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)
                .with_context(|| format!("failed to remove lock {}", self.path.display()))?;
        }
        self.file = None;
        Ok(())
    }

    /// Attach an owner tag to an already-held lock.
    pub fn set_owner_tag(&self, owner_tag: &str) -> Result<()> {
        if !self.path.exists() {
            bail!("lock file does not exist at {}", self.path.display());
        }
        let mut info = read_lock_info_from_path(&self.path)?;
        info.owner_tag = Some(owner_tag.to_string());
        write_lock_info_atomic(&self.path, &info)
    }

    /// Whether a lock file is present in `dir`.
    pub fn is_locked(dir: &Path) -> Result<bool> {
        Ok(dir.join(LOCK_FILE).exists())
    }

    /// Read the lock metadata for `dir` without acquiring it.
    pub fn read_lock_info(dir: &Path) -> Result<LockInfo> {
        read_lock_info_from_path(&dir.join(LOCK_FILE))
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

fn write_lock_info_atomic(lock_path: &Path, info: &LockInfo) -> Result<()> {
    let tmp_path = lock_path.with_extension("tmp");
    let json = serde_json::to_string_pretty(info).context("failed to serialize lock info")?;
    {
        let mut file = File::create(&tmp_path)
            .with_context(|| format!("failed to create lock tmp file {}", tmp_path.display()))?;
        file.write_all(json.as_bytes())
            .with_context(|| format!("failed to write lock tmp file {}", tmp_path.display()))?;
        file.sync_all().context("failed to sync lock file")?;
    }
    fs::rename(&tmp_path, lock_path)
        .with_context(|| format!("failed to rename lock file to {}", lock_path.display()))?;
    Ok(())
}

fn read_lock_info_from_path(path: &Path) -> Result<LockInfo> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read lock file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse lock JSON from {}", path.display()))
}

/// Path the lock file would live at for a given directory.
pub fn lock_path(dir: &Path) -> PathBuf {
    dir.join(LOCK_FILE)
}
