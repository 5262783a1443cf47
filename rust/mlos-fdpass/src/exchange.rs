//! Request/response protocol for passing shared-memory descriptors.
//!
//! Every message is a single `sendmsg`: the iov payload carries the
//! region name (requests) or a one-byte status (responses), and the
//! ancillary data carries at most one descriptor. A positive-length
//! response without ancillary data means "region not known".

use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::Mutex;

/// Region names on the wire are capped well below any real name length.
const MAX_NAME_LEN: usize = 255;

/// Response status bytes.
const STATUS_KNOWN: u8 = 1;
const STATUS_UNKNOWN: u8 = 0;

/// Ancillary buffer sized for exactly one `int` descriptor; the header
/// field only forces `cmsghdr` alignment.
#[repr(C)]
union CmsgBuf {
    _hdr: core::mem::ManuallyDrop<libc::cmsghdr>,
    buf: [u8; 64],
}

fn send_with_fd(socket: RawFd, payload: &[u8], fd: Option<RawFd>) -> io::Result<()> {
    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    let mut msg = unsafe { std::mem::zeroed::<libc::msghdr>() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    let mut cmsg_buf = CmsgBuf { buf: [0; 64] };
    if let Some(fd) = fd {
        msg.msg_control = unsafe { cmsg_buf.buf.as_mut_ptr() } as *mut libc::c_void;
        msg.msg_controllen = unsafe { libc::CMSG_SPACE(4) } as _;

        let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
        unsafe {
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(4) as _;
            std::ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut libc::c_int, fd);
        }
    }

    let sent = unsafe { libc::sendmsg(socket, &msg, 0) };
    if sent < 0 {
        return Err(io::Error::last_os_error());
    }
    if sent as usize != payload.len() {
        return Err(io::Error::new(
            ErrorKind::WriteZero,
            "short descriptor-exchange send",
        ));
    }
    Ok(())
}

fn recv_with_fd(socket: RawFd, buf: &mut [u8]) -> io::Result<(usize, Option<OwnedFd>)> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };

    let mut cmsg_buf = CmsgBuf { buf: [0; 64] };
    let mut msg = unsafe { std::mem::zeroed::<libc::msghdr>() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = unsafe { cmsg_buf.buf.as_mut_ptr() } as *mut libc::c_void;
    msg.msg_controllen = unsafe { libc::CMSG_SPACE(4) } as _;

    let received = unsafe { libc::recvmsg(socket, &mut msg, 0) };
    if received < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut fd = None;
    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    if !cmsg.is_null() {
        let hdr = unsafe { &*cmsg };
        if hdr.cmsg_level == libc::SOL_SOCKET
            && hdr.cmsg_type == libc::SCM_RIGHTS
            && hdr.cmsg_len as usize == unsafe { libc::CMSG_LEN(4) } as usize
        {
            let raw = unsafe { std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::c_int) };
            fd = Some(unsafe { OwnedFd::from_raw_fd(raw) });
        }
    }

    Ok((received as usize, fd))
}

fn check_name(name: &str) -> io::Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("invalid region name: {name:?}"),
        ));
    }
    Ok(())
}

// ── client ─────────────────────────────────────────────────────────────────

/// Target-side connection to the agent's descriptor-exchange socket.
#[derive(Debug)]
pub struct FdExchangeClient {
    stream: UnixStream,
}

impl FdExchangeClient {
    /// Connect to the agent. A refused connection is reported, not fatal;
    /// callers fall back to running detached.
    pub fn connect(path: &Path) -> io::Result<Self> {
        let stream = UnixStream::connect(path)?;
        tracing::debug!(path = %path.display(), "connected to descriptor exchange");
        Ok(Self { stream })
    }

    /// Ask the peer for the descriptor backing `name`.
    ///
    /// `Ok(None)` means the peer answered but does not know the region.
    pub fn get_fd(&self, name: &str) -> io::Result<Option<OwnedFd>> {
        check_name(name)?;
        send_with_fd(self.stream.as_raw_fd(), name.as_bytes(), None)?;

        let mut reply = [0u8; 8];
        let (len, fd) = recv_with_fd(self.stream.as_raw_fd(), &mut reply)?;
        if len == 0 {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                "descriptor exchange peer closed",
            ));
        }
        Ok(fd)
    }

    /// Hand the peer the descriptor backing `name`.
    pub fn send_fd(&self, name: &str, fd: RawFd) -> io::Result<()> {
        check_name(name)?;
        send_with_fd(self.stream.as_raw_fd(), name.as_bytes(), Some(fd))
    }
}

// ── server ─────────────────────────────────────────────────────────────────

/// Name → descriptor table kept by the serving side.
#[derive(Default)]
pub struct FdRegistry {
    inner: Mutex<HashMap<String, OwnedFd>>,
}

impl FdRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a descriptor for `name`, replacing any previous one.
    pub fn insert(&self, name: String, fd: OwnedFd) {
        self.inner.lock().unwrap().insert(name, fd);
    }

    /// True if a descriptor for `name` is known.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.lock().unwrap().contains_key(name)
    }

    fn raw_fd_of(&self, name: &str) -> Option<RawFd> {
        self.inner.lock().unwrap().get(name).map(|fd| fd.as_raw_fd())
    }
}

/// Listening side of the exchange (embedded by the agent; shipped here so
/// both ends of the protocol are exercised in-tree).
pub struct FdExchangeListener {
    listener: UnixListener,
}

impl FdExchangeListener {
    /// Bind the well-known socket, replacing any stale socket file.
    pub fn bind(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        let listener = UnixListener::bind(path)?;
        tracing::debug!(path = %path.display(), "descriptor exchange listening");
        Ok(Self { listener })
    }

    /// Accept one connection and serve it until the peer hangs up.
    pub fn serve_next(&self, registry: &FdRegistry) -> io::Result<()> {
        let (stream, _) = self.listener.accept()?;
        serve_connection(&stream, registry)
    }
}

fn serve_connection(stream: &UnixStream, registry: &FdRegistry) -> io::Result<()> {
    let socket = stream.as_raw_fd();
    let mut buf = [0u8; MAX_NAME_LEN + 1];

    loop {
        let (len, fd) = recv_with_fd(socket, &mut buf)?;
        if len == 0 {
            return Ok(());
        }

        let name = match std::str::from_utf8(&buf[..len]) {
            Ok(name) => name.to_string(),
            Err(_) => {
                tracing::warn!("descriptor exchange request with non-utf8 name, dropping");
                continue;
            }
        };

        match fd {
            Some(fd) => {
                // Registration: remember the descriptor, no reply expected.
                tracing::debug!(name = %name, "registered descriptor");
                registry.insert(name, fd);
            }
            None => {
                // Query: reply with the descriptor when known.
                match registry.raw_fd_of(&name) {
                    Some(raw) => send_with_fd(socket, &[STATUS_KNOWN], Some(raw))?,
                    None => send_with_fd(socket, &[STATUS_UNKNOWN], None)?,
                }
            }
        }
    }
}
