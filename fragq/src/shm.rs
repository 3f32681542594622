//! Shared memory segments backed by `/dev/shm`.

use std::ffi::CString;
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use std::path::Path;
use std::ptr::NonNull;

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, mmap_anonymous, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::{close, ftruncate};

/// A mapped shared memory region.
///
/// Named segments are backed by `/dev/shm` and can be attached by other
/// processes; anonymous segments are process-private (shared only with
/// forked children) and exist so single-process jobs can lay out the
/// same structures without touching the filesystem.
pub struct SharedSegment {
    ptr: NonNull<u8>,
    size: usize,
    name: Option<CString>,
    fd: Option<RawFd>,
    is_owner: bool,
}

unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Create a new named segment. The caller becomes the owner and the
    /// segment is unlinked when the owner is dropped.
    ///
    /// # Safety
    /// The caller must ensure no other process is using this name.
    pub unsafe fn create<P: AsRef<Path>>(path: P, size: usize) -> io::Result<Self> {
        let name = path_to_cstring(path)?;

        let fd = shm_open(
            name.as_c_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| io::Error::from_raw_os_error(e as i32))?;

        let raw_fd = fd.as_raw_fd();

        if let Err(e) = ftruncate(&fd, size as i64) {
            let _ = close(raw_fd);
            let _ = shm_unlink(name.as_c_str());
            return Err(io::Error::from_raw_os_error(e as i32));
        }

        let ptr = match unsafe {
            mmap(
                None,
                non_zero(size)?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
        } {
            Ok(p) => p,
            Err(e) => {
                let _ = close(raw_fd);
                let _ = shm_unlink(name.as_c_str());
                return Err(io::Error::from_raw_os_error(e as i32));
            }
        };

        // Fresh segments are zero-filled by ftruncate; queue headers rely
        // on that for their null offsets.
        Ok(Self {
            ptr: unsafe { NonNull::new_unchecked(ptr.as_ptr().cast()) },
            size,
            name: Some(name),
            fd: Some(fd.into_raw_fd()),
            is_owner: true,
        })
    }

    /// Attach to an existing named segment.
    ///
    /// # Safety
    /// The segment must have been created with at least `size` bytes and
    /// a compatible layout.
    pub unsafe fn open<P: AsRef<Path>>(path: P, size: usize) -> io::Result<Self> {
        let name = path_to_cstring(path)?;

        let fd = shm_open(name.as_c_str(), OFlag::O_RDWR, Mode::empty())
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;

        let raw_fd = fd.as_raw_fd();

        let ptr = match unsafe {
            mmap(
                None,
                non_zero(size)?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
        } {
            Ok(p) => p,
            Err(e) => {
                let _ = close(raw_fd);
                return Err(io::Error::from_raw_os_error(e as i32));
            }
        };

        Ok(Self {
            ptr: unsafe { NonNull::new_unchecked(ptr.as_ptr().cast()) },
            size,
            name: Some(name),
            fd: Some(raw_fd),
            is_owner: false,
        })
    }

    /// Create an anonymous shared mapping (zero-filled).
    pub fn anon(size: usize) -> io::Result<Self> {
        let ptr = unsafe {
            mmap_anonymous(
                None,
                non_zero(size)?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED | MapFlags::MAP_ANONYMOUS,
            )
        }
        .map_err(|e| io::Error::from_raw_os_error(e as i32))?;

        Ok(Self {
            ptr: unsafe { NonNull::new_unchecked(ptr.as_ptr().cast()) },
            size,
            name: None,
            fd: None,
            is_owner: true,
        })
    }

    /// Base pointer of the mapping.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Size of the mapping in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Convert an in-segment pointer to an offset from the base.
    #[inline]
    pub fn offset_of(&self, ptr: *const u8) -> u64 {
        debug_assert!(ptr as usize >= self.ptr.as_ptr() as usize);
        (ptr as usize - self.ptr.as_ptr() as usize) as u64
    }

    /// Convert an offset to a pointer within the segment.
    ///
    /// # Safety
    /// `off` must be within the segment.
    #[inline]
    pub unsafe fn ptr_at(&self, off: u64) -> *mut u8 {
        debug_assert!((off as usize) < self.size);
        unsafe { self.ptr.as_ptr().add(off as usize) }
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(
                NonNull::new_unchecked(self.ptr.as_ptr() as *mut _),
                self.size,
            );
            if let Some(fd) = self.fd {
                let _ = close(fd);
            }
            if self.is_owner {
                if let Some(name) = &self.name {
                    let _ = shm_unlink(name.as_c_str());
                }
            }
        }
    }
}

fn non_zero(size: usize) -> io::Result<NonZeroUsize> {
    NonZeroUsize::new(size)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "size must be non-zero"))
}

fn path_to_cstring<P: AsRef<Path>>(path: P) -> io::Result<CString> {
    let path_str = path.as_ref().to_str().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "path contains invalid UTF-8")
    })?;

    let name = if path_str.starts_with('/') {
        path_str.to_string()
    } else {
        format!("/{}", path_str)
    };

    CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains null byte"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_open() {
        let name = format!("/fragq_shm_test_{}", std::process::id());
        let size = 4096;

        unsafe {
            let seg1 = SharedSegment::create(&name, size).unwrap();
            assert_eq!(seg1.size(), size);

            std::ptr::write_volatile(seg1.as_ptr(), 0x5a_u8);

            let seg2 = SharedSegment::open(&name, size).unwrap();
            assert_eq!(std::ptr::read_volatile(seg2.as_ptr()), 0x5a);

            drop(seg2);
            drop(seg1);
        }
    }

    #[test]
    fn anon_zeroed() {
        let seg = SharedSegment::anon(8192).unwrap();
        let p = seg.as_ptr();
        for i in (0..8192).step_by(512) {
            assert_eq!(unsafe { std::ptr::read_volatile(p.add(i)) }, 0);
        }
    }

    #[test]
    fn offsets_round_trip() {
        let seg = SharedSegment::anon(4096).unwrap();
        let p = unsafe { seg.ptr_at(128) };
        assert_eq!(seg.offset_of(p), 128);
    }
}
