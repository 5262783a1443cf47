//! Named counting semaphores used as the channel sleep/wake primitive.
//!
//! The semaphore carries no protocol state: a waiter always re-checks the
//! channel after waking, and cancellation is done by storing the channel's
//! terminate flag and signaling once per waiter. `sem_open` names live in
//! a shared namespace, so both processes reach the same object by name.

use std::ffi::CString;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

/// A named POSIX semaphore.
#[derive(Debug)]
pub struct NamedSemaphore {
    sem: *mut libc::sem_t,
    name: String,
    cleanup_on_close: AtomicBool,
}

// sem_post/sem_wait are async-signal-safe and thread-safe on a shared sem_t.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

fn os_name(name: &str) -> io::Result<CString> {
    if name.is_empty() || name.contains('/') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid semaphore name: {name:?}"),
        ));
    }
    CString::new(format!("/{name}")).map_err(|_| io::ErrorKind::InvalidInput.into())
}

impl NamedSemaphore {
    /// Create the semaphore if absent, open it otherwise. Initial count 0.
    pub fn create_or_open(name: &str) -> io::Result<Self> {
        let c_name = os_name(name)?;
        let sem = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT,
                0o600 as libc::c_uint,
                0 as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(io::Error::last_os_error());
        }
        tracing::debug!(name, "opened named semaphore");
        Ok(Self {
            sem,
            name: name.to_string(),
            cleanup_on_close: AtomicBool::new(false),
        })
    }

    /// Open an existing semaphore; fails with `NotFound` if absent.
    pub fn open_existing(name: &str) -> io::Result<Self> {
        let c_name = os_name(name)?;
        let sem = unsafe { libc::sem_open(c_name.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            sem,
            name: name.to_string(),
            cleanup_on_close: AtomicBool::new(false),
        })
    }

    /// Increment the count, waking one waiter if any.
    pub fn signal(&self) -> io::Result<()> {
        if unsafe { libc::sem_post(self.sem) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Block until the count is positive, then decrement it.
    ///
    /// May block indefinitely; callers cancel by setting their own
    /// terminate flag and signaling once per waiter.
    pub fn wait(&self) -> io::Result<()> {
        loop {
            if unsafe { libc::sem_wait(self.sem) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    /// The semaphore's portable name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Arrange for the name to be unlinked when this handle drops.
    pub fn set_cleanup_on_close(&self, cleanup: bool) {
        self.cleanup_on_close.store(cleanup, Ordering::Relaxed);
    }

    /// Close now; optionally unlink the name.
    pub fn close(self, cleanup_on_close: bool) {
        self.set_cleanup_on_close(cleanup_on_close);
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        unsafe { libc::sem_close(self.sem) };

        if self.cleanup_on_close.load(Ordering::Relaxed) {
            if let Ok(c_name) = os_name(&self.name) {
                unsafe { libc::sem_unlink(c_name.as_ptr()) };
            }
            tracing::debug!(name = %self.name, "unlinked named semaphore");
        }
    }
}
