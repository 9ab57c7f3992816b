//! This module provides an advisory lock on the store's directory.

use std::{
    fs::{File, OpenOptions},
    path::Path,
};

use crate::sys::unix;

/// Represents an advisory lock on a directory, held until dropped.
pub struct Flock {
    lock_fd: File,
}

impl Flock {
    pub fn lock(db_dir: &Path, lock_filename: &str) -> anyhow::Result<Self> {
        let lock_path = db_dir.join(lock_filename);

        let lock_fd = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)?;

        match unix::try_lock_exclusive(&lock_fd) {
            Ok(_) => Ok(Self { lock_fd }),
            Err(err) => {
                anyhow::bail!("Failed to lock directory {}: {err}", db_dir.display());
            }
        }
    }
}

impl Drop for Flock {
    fn drop(&mut self) {
        if let Err(e) = unix::unlock(&self.lock_fd) {
            tracing::warn!("Failed to unlock directory lock: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Flock;

    #[test]
    fn second_lock_fails_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let first = Flock::lock(dir.path(), "LOCK").unwrap();
        assert!(Flock::lock(dir.path(), "LOCK").is_err());
        drop(first);
        let _again = Flock::lock(dir.path(), "LOCK").unwrap();
    }
}
