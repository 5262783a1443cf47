//! Inotify sentinel file announcing agent (re)starts.
//!
//! The target creates a well-known directory and an empty sentinel file
//! inside it. On startup the agent opens the sentinel; the resulting
//! `IN_OPEN` event tells the target to (re)send its shared-memory
//! descriptors. If the sentinel is deleted out from under us
//! (`IN_DELETE_SELF`), it is recreated and the watch re-armed.
//!
//! Aborting a blocked [`WatchFile::wait`] is done by closing the inotify
//! descriptor from another thread; the blocked `read` observes `EBADF`
//! and returns an error.

use std::ffi::CString;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};

const INVALID_FD: i32 = -1;

/// A sentinel file plus the inotify instance watching it.
pub struct WatchFile {
    /// Swapped to `INVALID_FD` by `abort`; `wait` snapshots it per read.
    notify_fd: AtomicI32,
    directory: PathBuf,
    file_path: PathBuf,
}

impl WatchFile {
    /// Create the directory and sentinel file, and set up inotify.
    pub fn new(directory: &Path, file_name: &str) -> io::Result<Self> {
        std::fs::create_dir_all(directory)?;

        let notify_fd = unsafe { libc::inotify_init() };
        if notify_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let watch = Self {
            notify_fd: AtomicI32::new(notify_fd),
            directory: directory.to_path_buf(),
            file_path: directory.join(file_name),
        };
        watch.create_sentinel()?;
        Ok(watch)
    }

    /// Path of the sentinel the agent is expected to open.
    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    /// Block until the sentinel is opened by another process.
    ///
    /// Re-arms itself when the sentinel is deleted. Returns an error when
    /// the wait has been aborted or inotify fails.
    pub fn wait(&self) -> io::Result<()> {
        let notify_fd = self.notify_fd.load(Ordering::Acquire);
        if notify_fd == INVALID_FD {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }

        let mut watch_descriptor = INVALID_FD;
        // Room for a couple of events with names.
        let mut events = [0u8; 2 * (std::mem::size_of::<libc::inotify_event>() + 256)];

        loop {
            if watch_descriptor == INVALID_FD {
                // Recreate the sentinel before arming so a fresh agent
                // start cannot slip between delete and re-arm.
                self.create_sentinel()?;

                let c_path = path_cstring(&self.file_path)?;
                watch_descriptor = unsafe {
                    libc::inotify_add_watch(
                        notify_fd,
                        c_path.as_ptr(),
                        libc::IN_OPEN | libc::IN_DELETE_SELF,
                    )
                };
                if watch_descriptor == INVALID_FD {
                    return Err(io::Error::last_os_error());
                }
            }

            let length = unsafe {
                libc::read(
                    notify_fd,
                    events.as_mut_ptr() as *mut libc::c_void,
                    events.len(),
                )
            };
            if length < 0 {
                return Err(io::Error::last_os_error());
            }
            if self.notify_fd.load(Ordering::Acquire) == INVALID_FD {
                // Aborted while blocked in read.
                return Err(io::Error::from_raw_os_error(libc::EBADF));
            }

            let mut cursor = 0usize;
            while cursor < length as usize {
                // The kernel packs events back to back; copy the header
                // out rather than assume the buffer is aligned for it.
                let event = unsafe {
                    std::ptr::read_unaligned(
                        events.as_ptr().add(cursor) as *const libc::inotify_event
                    )
                };

                if event.mask & libc::IN_OPEN != 0 {
                    unsafe { libc::inotify_rm_watch(notify_fd, watch_descriptor) };
                    tracing::debug!(path = %self.file_path.display(), "watch file opened");
                    return Ok(());
                }
                if event.mask & libc::IN_DELETE_SELF != 0 {
                    // Sentinel gone; drop the stale watch and re-arm.
                    unsafe { libc::inotify_rm_watch(notify_fd, watch_descriptor) };
                    watch_descriptor = INVALID_FD;
                }

                cursor += std::mem::size_of::<libc::inotify_event>() + event.len as usize;
            }
        }
    }

    /// Abort a concurrent [`WatchFile::wait`]. Thread safe.
    pub fn abort(&self) {
        let fd = self.notify_fd.swap(INVALID_FD, Ordering::AcqRel);
        if fd != INVALID_FD {
            unsafe { libc::close(fd) };
        }
    }

    fn create_sentinel(&self) -> io::Result<()> {
        // Recreate the directory too; an overzealous cleaner may have
        // removed it together with the sentinel.
        std::fs::create_dir_all(&self.directory)?;

        // Create-then-close before arming the watch, so our own open does
        // not count as an agent arrival.
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.file_path)
        {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl Drop for WatchFile {
    fn drop(&mut self) {
        self.abort();
        let _ = std::fs::remove_file(&self.file_path);
        let _ = std::fs::remove_dir(&self.directory);
    }
}

fn path_cstring(path: &Path) -> io::Result<CString> {
    use std::os::unix::ffi::OsStrExt;
    CString::new(path.as_os_str().as_bytes()).map_err(|_| ErrorKind::InvalidInput.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn open_by_peer_wakes_the_waiter() {
        let dir = tempfile::tempdir().unwrap();
        let watch = Arc::new(WatchFile::new(dir.path(), "mlos.opened").unwrap());

        let waiter = {
            let watch = watch.clone();
            std::thread::spawn(move || watch.wait())
        };

        std::thread::sleep(Duration::from_millis(100));
        let _ = std::fs::File::open(watch.file_path()).unwrap();

        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn deleted_sentinel_is_recreated_and_rearmed() {
        let dir = tempfile::tempdir().unwrap();
        let watch = Arc::new(WatchFile::new(dir.path(), "mlos.opened").unwrap());
        let path = watch.file_path().to_path_buf();

        let waiter = {
            let watch = watch.clone();
            std::thread::spawn(move || watch.wait())
        };

        std::thread::sleep(Duration::from_millis(100));
        std::fs::remove_file(&path).unwrap();

        // Give the waiter time to observe the delete and re-arm.
        let mut recreated = false;
        for _ in 0..50 {
            std::thread::sleep(Duration::from_millis(20));
            if path.exists() {
                recreated = true;
                break;
            }
        }
        assert!(recreated, "sentinel was not recreated");

        let _ = std::fs::File::open(&path).unwrap();
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn abort_unblocks_the_waiter_with_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let watch = Arc::new(WatchFile::new(dir.path(), "mlos.opened").unwrap());

        let waiter = {
            let watch = watch.clone();
            std::thread::spawn(move || watch.wait())
        };

        std::thread::sleep(Duration::from_millis(100));
        watch.abort();

        assert!(waiter.join().unwrap().is_err());
    }
}
