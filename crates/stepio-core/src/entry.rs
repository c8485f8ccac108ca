//! Completion keys, completion events and backend operations.
//!
//! These are the *lingua franca* between the service, the backends and the
//! socket primitives.

use std::os::unix::io::RawFd;

/// Completion key: identifies what a completion event belongs to.
///
/// For real I/O the key is the address of the issuing
/// [`Descriptor`](crate::descriptor::Descriptor), stored in io_uring's
/// `user_data` field for zero-lookup routing. The top of the range is
/// reserved for events that carry no descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Key(pub u64);

impl Key {
    /// Posted by `Service::shutdown()`. Never dispatched to a hook.
    pub const SHUTDOWN: Self = Self(u64::MAX);
    /// The backend's wake fd fired: posted events are waiting.
    pub const WAKE: Self = Self(u64::MAX - 1);

    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize as u64)
    }

    #[inline]
    pub fn as_ptr<T>(self) -> *mut T {
        self.0 as usize as *mut T
    }

    /// True for keys that do not name a descriptor.
    #[inline]
    pub fn is_reserved(self) -> bool {
        self.0 >= Self::WAKE.0
    }
}

/// One completed (or posted) event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub key: Key,
    /// Syscall return value, or negative errno.
    pub result: i32,
    /// Backend-specific flags (CQE flags, poll revents).
    pub flags: u32,
}

impl Event {
    pub const EMPTY: Self = Self { key: Key(0), result: 0, flags: 0 };

    #[inline]
    pub fn new(key: Key, result: i32, flags: u32) -> Self {
        Self { key, result, flags }
    }

    #[inline]
    pub fn shutdown() -> Self {
        Self::new(Key::SHUTDOWN, 0, 0)
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.key == Key::SHUTDOWN
    }
}

/// A pending operation handed to a backend after the fast path said `EAGAIN`.
///
/// Buffers are raw pointers: the issuing primitive's caller guarantees they
/// stay valid and unmoved until the completion is delivered.
#[derive(Debug, Clone, Copy)]
pub enum Op {
    /// `recv(fd, buf, len, flags)`; result is bytes received.
    Recv { fd: RawFd, buf: *mut u8, len: u32, flags: i32 },
    /// `send(fd, buf, len, flags)`; result is bytes sent.
    Send { fd: RawFd, buf: *const u8, len: u32, flags: i32 },
    /// `accept4(fd, NULL, NULL, SOCK_NONBLOCK | SOCK_CLOEXEC)`; result is the new fd.
    Accept { fd: RawFd },
    /// `sendmsg(fd, msg, flags)`; `msg` and its iovec array belong to the
    /// issuing context.
    SendMsg { fd: RawFd, msg: *const libc::msghdr, flags: i32 },
    /// `recvmsg(fd, msg, flags)`.
    RecvMsg { fd: RawFd, msg: *mut libc::msghdr, flags: i32 },
    /// Wait for `POLLOUT` (non-blocking connect in progress); result is revents.
    Writable { fd: RawFd },
}

impl Op {
    pub fn fd(&self) -> RawFd {
        match *self {
            Op::Recv { fd, .. }
            | Op::Send { fd, .. }
            | Op::SendMsg { fd, .. }
            | Op::RecvMsg { fd, .. }
            | Op::Accept { fd }
            | Op::Writable { fd } => fd,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Op::Recv { .. } => "recv",
            Op::Send { .. } => "send",
            Op::SendMsg { .. } => "sendmsg",
            Op::RecvMsg { .. } => "recvmsg",
            Op::Accept { .. } => "accept",
            Op::Writable { .. } => "writable",
        }
    }
}
