//! POSIX shared-memory segments
//!
//! One named segment per pod, created by the host agent at admission and
//! mapped by both the pod (writer) and the agent (RDMA registration). The
//! pod never learns more than the name; sizing comes from the segment
//! itself.

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use std::ffi::c_void;
use std::fs::File;
use std::num::NonZeroUsize;
use std::os::fd::OwnedFd;
use std::ptr::NonNull;

/// Fixed width of the segment name on the registry wire (NUL padded).
pub const SEGMENT_NAME_LEN: usize = 256;

/// Segment name for a pod, derived from its OS process id.
pub fn segment_name(pid: u32) -> String {
    format!("shm-{}", pid)
}

/// A named, page-backed shared memory object mapped read-write.
pub struct SharedSegment {
    name: String,
    len: usize,
    ptr: NonNull<c_void>,
    _fd: OwnedFd,
}

unsafe impl Send for SharedSegment {}

impl SharedSegment {
    /// Create (or reopen) the named segment and size it to `len` bytes.
    pub fn create(name: &str, len: usize) -> Result<Self> {
        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::from_bits_truncate(0o666),
        )
        .with_context(|| format!("failed to create shared memory object {}", name))?;

        nix::unistd::ftruncate(&fd, len as libc::off_t)
            .with_context(|| format!("failed to size {} to {} bytes", name, len))?;

        Self::map(name, len, fd)
    }

    /// Open an existing segment, taking its size from the object itself.
    pub fn open(name: &str) -> Result<Self> {
        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty())
            .with_context(|| format!("failed to open shared memory object {}", name))?;

        let file = File::from(fd);
        let len = file
            .metadata()
            .with_context(|| format!("failed to stat {}", name))?
            .len() as usize;

        Self::map(name, len, OwnedFd::from(file))
    }

    fn map(name: &str, len: usize, fd: OwnedFd) -> Result<Self> {
        let length = NonZeroUsize::new(len)
            .with_context(|| format!("shared memory object {} has zero size", name))?;

        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
        }
        .with_context(|| format!("failed to map shared memory object {}", name))?;

        Ok(Self {
            name: name.to_string(),
            len,
            ptr,
            _fd: fd,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr() as *mut u8
    }

    /// Copy `data` to the start of the segment, NUL-terminated when there
    /// is room for it.
    pub fn write_bytes(&self, data: &[u8]) -> Result<()> {
        anyhow::ensure!(
            data.len() <= self.len,
            "payload of {} bytes exceeds segment size {}",
            data.len(),
            self.len
        );
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.as_mut_ptr(), data.len());
            if data.len() < self.len {
                *self.as_mut_ptr().add(data.len()) = 0;
            }
        }
        Ok(())
    }

    /// Copy out the first `n` bytes of the segment.
    pub fn read_bytes(&self, n: usize) -> Vec<u8> {
        let n = n.min(self.len);
        let mut out = vec![0u8; n];
        unsafe {
            std::ptr::copy_nonoverlapping(self.as_mut_ptr() as *const u8, out.as_mut_ptr(), n);
        }
        out
    }

    /// Remove the name from the namespace. A segment already unlinked (or
    /// never created) is not an error.
    pub fn unlink(&self) -> Result<()> {
        match shm_unlink(self.name.as_str()) {
            Ok(()) | Err(Errno::ENOENT) => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("failed to unlink shared memory {}", self.name))
            }
        }
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr, self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_name(tag: &str) -> String {
        format!("shm-test-{}-{}", tag, std::process::id())
    }

    #[test]
    fn name_follows_pid() {
        assert_eq!(segment_name(1234), "shm-1234");
        assert_eq!(segment_name(u32::MAX), format!("shm-{}", u32::MAX));
    }

    #[test]
    fn create_sizes_and_reopens() {
        let name = test_name("size");
        let seg = SharedSegment::create(&name, 1024).unwrap();
        assert_eq!(seg.len(), 1024);

        let reopened = SharedSegment::open(&name).unwrap();
        assert_eq!(reopened.len(), 1024);

        seg.unlink().unwrap();
    }

    #[test]
    fn writer_and_reader_share_contents() {
        let name = test_name("rw");
        let writer = SharedSegment::create(&name, 512).unwrap();
        let reader = SharedSegment::open(&name).unwrap();

        writer.write_bytes(b"hello").unwrap();
        let seen = reader.read_bytes(6);
        assert_eq!(&seen, b"hello\0");

        writer.unlink().unwrap();
    }

    #[test]
    fn unlink_tolerates_missing_object() {
        let name = test_name("unlink");
        let seg = SharedSegment::create(&name, 64).unwrap();
        seg.unlink().unwrap();
        // Second unlink hits ENOENT and is still fine.
        seg.unlink().unwrap();
    }

    #[test]
    fn oversized_write_is_rejected() {
        let name = test_name("bounds");
        let seg = SharedSegment::create(&name, 16).unwrap();
        assert!(seg.write_bytes(&[0u8; 32]).is_err());
        seg.unlink().unwrap();
    }
}
