//! POSIX shared-memory maps with explicit lifecycle control.
//!
//! A [`SharedMemoryMap`] owns one mapping of a shared memory object: a
//! named object under `/dev/shm` (`shm_open`) or an anonymous one
//! (`memfd_create`) whose descriptor travels to the peer over a Unix
//! socket. Whether the backing object is unlinked at close time is decided
//! by the owning context shortly before drop, not baked in at creation.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

// OS-level code is never modeled by loom; use the std atomics directly.
use std::sync::atomic::{AtomicBool, Ordering};

use crate::region::Region;

/// How `create_or_open` obtained the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateDisposition {
    /// The object did not exist; it was created and sized by this call.
    CreatedNew,
    /// The object existed; its current size was adopted.
    OpenedExisting,
}

/// A mapped shared-memory object.
#[derive(Debug)]
pub struct SharedMemoryMap {
    ptr: *mut u8,
    len: usize,
    fd: OwnedFd,
    /// Portable object name (`Host_Mlos.GlobalMemory` form), if any.
    name: Option<String>,
    cleanup_on_close: AtomicBool,
}

unsafe impl Send for SharedMemoryMap {}
unsafe impl Sync for SharedMemoryMap {}

/// `shm_open` names must start with exactly one slash.
fn os_name(name: &str) -> io::Result<CString> {
    if name.is_empty() || name.contains('/') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid shared memory name: {name:?}"),
        ));
    }
    CString::new(format!("/{name}")).map_err(|_| io::ErrorKind::InvalidInput.into())
}

fn shm_open(name: &str, oflag: libc::c_int) -> io::Result<OwnedFd> {
    let c_name = os_name(name)?;
    let fd = unsafe { libc::shm_open(c_name.as_ptr(), oflag, 0o600 as libc::mode_t) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn fd_size(fd: RawFd) -> io::Result<usize> {
    let mut stat = unsafe { std::mem::zeroed::<libc::stat>() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(stat.st_size as usize)
}

impl SharedMemoryMap {
    /// Create a new named object; fails with `AlreadyExists` if present.
    pub fn create_new(name: &str, size: usize) -> io::Result<Self> {
        let fd = shm_open(name, libc::O_CREAT | libc::O_EXCL | libc::O_RDWR)?;
        Self::map_created(fd, Some(name.to_string()), size)
    }

    /// Create the object if absent, open it otherwise.
    ///
    /// `size` only applies when the object is created; an existing
    /// object keeps its current size.
    pub fn create_or_open(name: &str, size: usize) -> io::Result<(Self, CreateDisposition)> {
        match shm_open(name, libc::O_CREAT | libc::O_EXCL | libc::O_RDWR) {
            Ok(fd) => {
                let map = Self::map_created(fd, Some(name.to_string()), size)?;
                tracing::debug!(name, size, "created shared memory map");
                Ok((map, CreateDisposition::CreatedNew))
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                let map = Self::open_existing(name)?;
                Ok((map, CreateDisposition::OpenedExisting))
            }
            Err(err) => Err(err),
        }
    }

    /// Open an existing named object; fails with `NotFound` if absent.
    ///
    /// The mapping size is recovered from the object itself.
    pub fn open_existing(name: &str) -> io::Result<Self> {
        let fd = shm_open(name, libc::O_RDWR)?;
        let size = fd_size(fd.as_raw_fd())?;
        Self::map_fd(fd, Some(name.to_string()), size)
    }

    /// Create an anonymous object (no filesystem name).
    ///
    /// `id` labels the memfd for diagnostics and descriptor exchange;
    /// it never touches the filesystem.
    pub fn create_anonymous(id: &str, size: usize) -> io::Result<Self> {
        let c_id = CString::new(id).map_err(|_| io::ErrorKind::InvalidInput)?;
        let fd = unsafe { libc::memfd_create(c_id.as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        tracing::debug!(id, size, "created anonymous shared memory");
        Self::map_created(fd, None, size)
    }

    /// Wrap a descriptor delivered by the peer; size comes from `fstat`.
    pub fn open_from_descriptor(id: &str, fd: OwnedFd) -> io::Result<Self> {
        let size = fd_size(fd.as_raw_fd())?;
        tracing::debug!(id, size, "mapped shared memory from received descriptor");
        Self::map_fd(fd, None, size)
    }

    fn map_created(fd: OwnedFd, name: Option<String>, size: usize) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "size must be > 0",
            ));
        }
        if unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Self::map_fd(fd, name, size)
    }

    fn map_fd(fd: OwnedFd, name: Option<String>, size: usize) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "shared memory object is empty",
            ));
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            len: size,
            fd,
            name,
            cleanup_on_close: AtomicBool::new(false),
        })
    }

    /// Region view of the mapping.
    #[inline]
    pub fn region(&self) -> Region {
        unsafe { Region::from_raw(self.ptr, self.len) }
    }

    /// Mapping size in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the mapping is empty (never the case after construction).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The portable object name, if this map is name-backed.
    #[inline]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Raw descriptor, for passing to a peer process.
    #[inline]
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Arrange for the backing name to be unlinked when this map drops.
    ///
    /// The last detaching process flips this right before teardown.
    pub fn set_cleanup_on_close(&self, cleanup: bool) {
        self.cleanup_on_close.store(cleanup, Ordering::Relaxed);
    }

    /// Unmap now; optionally unlink the backing name.
    pub fn close(self, cleanup_on_close: bool) {
        self.set_cleanup_on_close(cleanup_on_close);
        // Teardown itself happens in Drop.
    }
}

impl Drop for SharedMemoryMap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }

        if self.cleanup_on_close.load(Ordering::Relaxed) {
            if let Some(name) = &self.name {
                if let Ok(c_name) = os_name(name) {
                    unsafe { libc::shm_unlink(c_name.as_ptr()) };
                }
                tracing::debug!(name = %name, "unlinked shared memory object");
            }
        }
    }
}
