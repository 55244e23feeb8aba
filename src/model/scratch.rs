//! Owner-only scratch storage for short-lived plaintext copies.
//!
//! Every [`ScratchFile`] is overwritten with random bytes, synced and removed
//! when dropped, so the erase runs on success, error, panic and task
//! cancellation alike. Overwriting is best-effort: journaling, copy-on-write
//! and wear-levelled storage may keep old blocks.

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rand::RngCore;

use crate::error::Result;
use crate::lock::lock;

const ERASE_CHUNK: usize = 64 * 1024;
const SCRATCH_SUFFIX: &str = ".plain";

/// Directory holding scratch files, created with mode 0700.
#[derive(Debug, Clone)]
pub struct ScratchDir {
    path: PathBuf,
    /// Paths owned by live [`ScratchFile`] guards; `purge` leaves these alone.
    live: Arc<Mutex<HashSet<PathBuf>>>,
}

impl ScratchDir {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        fs::create_dir_all(&path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o700))?;
        }
        Ok(Self {
            path,
            live: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `bytes` to a fresh owner-only file. The returned guard erases it.
    pub fn write(&self, bytes: &[u8]) -> Result<ScratchFile> {
        let path = self
            .path
            .join(format!("{}{SCRATCH_SUFFIX}", uuid::Uuid::new_v4().simple()));

        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        // Guard first so a failed write still erases whatever landed on disk.
        let mut file = options.open(&path)?;
        lock(&self.live).insert(path.clone());
        let guard = ScratchFile {
            path,
            live: Arc::clone(&self.live),
        };
        file.write_all(bytes)?;
        file.sync_all()?;
        Ok(guard)
    }

    /// Regular files currently in the directory.
    pub fn files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        if !self.path.exists() {
            return Ok(files);
        }
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    /// Securely erase every file in the directory except those still held by
    /// a live guard. Returns how many were erased.
    pub fn purge(&self) -> Result<usize> {
        let live = lock(&self.live).clone();
        let mut erased = 0;
        for file in self.files()? {
            if live.contains(&file) {
                tracing::debug!(path = %file.display(), "Scratch file in use, left to its guard");
                continue;
            }
            match secure_erase(&file) {
                Ok(()) => erased += 1,
                Err(e) => {
                    tracing::warn!(path = %file.display(), error = %e, "Failed to erase scratch file");
                }
            }
        }
        Ok(erased)
    }
}

/// A plaintext file that is securely erased on drop.
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
    live: Arc<Mutex<HashSet<PathBuf>>>,
}

impl ScratchFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        match secure_erase(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "Securely erased scratch file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Scratch erase failed");
                let _ = fs::remove_file(&self.path);
            }
        }
        lock(&self.live).remove(&self.path);
    }
}

/// Overwrite a file with random bytes, sync, then remove it.
pub fn secure_erase(path: &Path) -> std::io::Result<()> {
    let len = fs::metadata(path)?.len();
    {
        let mut file = fs::OpenOptions::new().write(true).open(path)?;
        let mut rng = rand::rngs::OsRng;
        let mut chunk = vec![0u8; ERASE_CHUNK];
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(ERASE_CHUNK as u64) as usize;
            rng.fill_bytes(&mut chunk[..n]);
            file.write_all(&chunk[..n])?;
            remaining -= n as u64;
        }
        file.sync_all()?;
    }
    fs::remove_file(path)
}
