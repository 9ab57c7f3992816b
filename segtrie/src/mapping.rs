//! Shared memory mappings of files.
//!
//! All persistent state is accessed through these mappings. Header files are mapped once for the
//! lifetime of the store; id blocks and segments are mapped one region at a time so that growing
//! the store never moves memory that is already in use.

use std::{
    fs::{File, OpenOptions},
    path::Path,
    ptr::NonNull,
    sync::atomic::{AtomicU32, AtomicU64},
};

use crate::{options::SyncMode, sys::unix};

/// A shared, writable mapping of part of a file. Unmapped on drop.
pub struct Mmap {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is plain shared memory. All concurrent access to it goes through atomics
//         or is coordinated by the callers.
unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

impl Mmap {
    /// Map `len` bytes of `file` starting at `offset`. The file must already be large enough.
    pub fn map(file: &File, offset: u64, len: usize) -> std::io::Result<Self> {
        let ptr = unix::map_shared(file, offset, len)?;
        Ok(Mmap { ptr, len })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Flush the mapping according to `mode`.
    pub fn flush(&self, mode: SyncMode) -> std::io::Result<()> {
        match mode {
            SyncMode::None => Ok(()),
            SyncMode::Async => unix::msync(self.ptr, self.len, false),
            SyncMode::Sync => unix::msync(self.ptr, self.len, true),
        }
    }

    /// A reference to the `AtomicU64` at byte `offset`.
    ///
    /// Panics if the offset is misaligned or out of bounds.
    pub fn atomic_u64(&self, offset: usize) -> &AtomicU64 {
        assert!(offset % 8 == 0 && offset + 8 <= self.len);
        // SAFETY: in bounds and aligned (mappings are page aligned). The memory lives as long as
        //         `self`, and is only ever accessed atomically at this offset.
        unsafe { &*(self.ptr.as_ptr().add(offset) as *const AtomicU64) }
    }

    /// A reference to the `AtomicU32` at byte `offset`.
    ///
    /// Panics if the offset is misaligned or out of bounds.
    pub fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        assert!(offset % 4 == 0 && offset + 4 <= self.len);
        // SAFETY: see `atomic_u64`.
        unsafe { &*(self.ptr.as_ptr().add(offset) as *const AtomicU32) }
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        // SAFETY: every reference handed out borrows `self`, so none can outlive it.
        if let Err(e) = unsafe { unix::unmap(self.ptr, self.len) } {
            tracing::error!("munmap failed: {e}");
        }
    }
}

/// A fixed-size file mapped in its entirety. The mapping outlives the file handle.
pub struct MappedFile {
    pub map: Mmap,
}

impl MappedFile {
    /// Open or create the file at `path` with length `len` and map it. Returns whether the file
    /// was created.
    pub fn open(path: &Path, len: usize) -> std::io::Result<(Self, bool)> {
        let created = !path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if file.metadata()?.len() < len as u64 {
            file.set_len(len as u64)?;
        }
        let map = Mmap::map(&file, 0, len)?;
        Ok((MappedFile { map }, created))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn persists_across_remaps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("header");
        {
            let (f, created) = MappedFile::open(&path, 4096).unwrap();
            assert!(created);
            f.map.atomic_u64(8).store(0xdead_beef, Ordering::Relaxed);
            f.map.atomic_u32(16).store(7, Ordering::Relaxed);
            f.map.flush(SyncMode::Sync).unwrap();
        }
        let (f, created) = MappedFile::open(&path, 4096).unwrap();
        assert!(!created);
        assert_eq!(f.map.atomic_u64(8).load(Ordering::Relaxed), 0xdead_beef);
        assert_eq!(f.map.atomic_u32(16).load(Ordering::Relaxed), 7);
    }

    #[test]
    #[should_panic]
    fn misaligned_atomic_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (f, _) = MappedFile::open(&dir.path().join("x"), 4096).unwrap();
        let _ = f.map.atomic_u64(4);
    }
}
