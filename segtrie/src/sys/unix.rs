//! Common Unix definitions.

use std::{fs::File, os::fd::AsRawFd as _, ptr::NonNull};

pub fn try_lock_exclusive(file: &File) -> std::io::Result<()> {
    unsafe {
        if libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

pub fn unlock(file: &File) -> std::io::Result<()> {
    unsafe {
        if libc::flock(file.as_raw_fd(), libc::LOCK_UN) == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

/// Map `len` bytes of `file` starting at `offset` as shared, readable and writable memory.
///
/// `offset` must be a multiple of the page size.
pub fn map_shared(file: &File, offset: u64, len: usize) -> std::io::Result<NonNull<u8>> {
    let ptr = unsafe {
        // SAFETY: unsafe because ffi call. The kernel picks the address, so no existing mapping
        //         is disturbed. The file descriptor is valid for the duration of the call.
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            offset as libc::off_t,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error());
    }
    // UNWRAP: mmap never returns null on success.
    Ok(NonNull::new(ptr as *mut u8).unwrap())
}

/// Unmap a region returned by [`map_shared`].
///
/// # Safety
///
/// No references into the region may outlive this call.
pub unsafe fn unmap(ptr: NonNull<u8>, len: usize) -> std::io::Result<()> {
    if libc::munmap(ptr.as_ptr() as *mut libc::c_void, len) == -1 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Flush a mapped region to its file, waiting for completion if `wait` is set.
pub fn msync(ptr: NonNull<u8>, len: usize, wait: bool) -> std::io::Result<()> {
    let flags = if wait { libc::MS_SYNC } else { libc::MS_ASYNC };
    unsafe {
        // SAFETY: unsafe because ffi call. msync does not touch the contents of the region and
        //         fails cleanly if the range is not mapped.
        if libc::msync(ptr.as_ptr() as *mut libc::c_void, len, flags) == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}
