//! stepio error types.
//!
//! Two families: [`Error`] for failures returned directly to the caller
//! (the completion facility itself, synchronous socket helpers), and
//! [`ErrorCode`] for outcomes recorded on an operation context.

use std::ffi::CStr;
use std::fmt;

/// Outcome code of a completed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// errno from a socket call or a backend completion.
    Os(i32),
    /// `EAI_*` code from name resolution.
    Resolve(i32),
}

impl ErrorCode {
    #[inline]
    pub fn raw(self) -> i32 {
        match self {
            Self::Os(e) | Self::Resolve(e) => e,
        }
    }

    /// The calling thread's current errno.
    #[inline]
    pub fn last_os_error() -> Self {
        Self::Os(errno())
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Os(e) => write!(f, "{}", std::io::Error::from_raw_os_error(e)),
            Self::Resolve(e) => {
                let msg = unsafe { CStr::from_ptr(libc::gai_strerror(e)) };
                write!(f, "resolve: {} (code {})", msg.to_string_lossy(), e)
            }
        }
    }
}

#[derive(Debug)]
pub enum Error {
    /// Creating the completion facility failed.
    Setup(i32),
    /// Waiting on the completion facility failed.
    Wait(i32),
    /// Handing a request to the completion facility failed.
    Submit(i32),
    /// Submission queue is full.
    QueueFull,
    /// An operation completed with an error (from `check_error`).
    Op(ErrorCode),
    /// OS error with errno from a synchronous call.
    Os(i32),
}

impl Error {
    #[inline]
    pub fn last_os_error() -> Self {
        Self::Os(errno())
    }

    /// Code to record on a context when this error stops a primitive from
    /// starting.
    pub fn code(&self) -> ErrorCode {
        match *self {
            Self::Setup(e) | Self::Wait(e) | Self::Submit(e) | Self::Os(e) => ErrorCode::Os(e),
            Self::QueueFull => ErrorCode::Os(libc::EAGAIN),
            Self::Op(code) => code,
        }
    }

    /// True for failures of the completion facility itself.
    pub fn is_system(&self) -> bool {
        matches!(self, Self::Setup(_) | Self::Wait(_) | Self::Submit(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Setup(e) => write!(f, "completion facility setup: errno {}", e),
            Self::Wait(e) => write!(f, "completion wait: errno {}", e),
            Self::Submit(e) => write!(f, "submit: errno {}", e),
            Self::QueueFull => write!(f, "submission queue full"),
            Self::Op(code) => write!(f, "operation failed: {}", code),
            Self::Os(e) => write!(f, "OS error: {}", std::io::Error::from_raw_os_error(*e)),
        }
    }
}

impl std::error::Error for Error {}

impl From<ErrorCode> for Error {
    fn from(code: ErrorCode) -> Self {
        Self::Op(code)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// errno of the last failed libc call on this thread.
#[inline]
pub fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}
