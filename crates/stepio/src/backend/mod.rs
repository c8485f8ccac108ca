//! Completion facility backends.
//!
//! | Backend      | Mechanism                                  |
//! |--------------|--------------------------------------------|
//! | UringBackend | io_uring SQEs, one CQE per operation       |
//! | PollBackend  | `poll(2)` readiness, then retry the syscall |

mod poll;

pub use poll::PollBackend;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod uring;
        pub use uring::UringBackend;
    }
}

use crate::config::{BackendKind, ServiceConfig};
use stepio_core::backend::Backend;
use stepio_core::error::Result;
use stepio_core::{kinfo, kwarn};

use std::os::unix::io::RawFd;

/// Build the backend `config` asks for, watching `wake_fd` for posted events.
pub fn create(config: &ServiceConfig, wake_fd: RawFd) -> Result<Box<dyn Backend>> {
    let backend: Box<dyn Backend> = match config.backend {
        BackendKind::Poll => Box::new(PollBackend::new(wake_fd)),
        BackendKind::Uring => uring(config, wake_fd)?,
        BackendKind::Auto => match uring(config, wake_fd) {
            Ok(b) => b,
            Err(e) => {
                kwarn!("io_uring unavailable ({}), falling back to poll", e);
                Box::new(PollBackend::new(wake_fd))
            }
        },
    };
    kinfo!("service: backend={}", backend.name());
    Ok(backend)
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        fn uring(config: &ServiceConfig, wake_fd: RawFd) -> Result<Box<dyn Backend>> {
            Ok(Box::new(UringBackend::new(config.ring_entries, wake_fd)?))
        }
    } else {
        fn uring(_config: &ServiceConfig, _wake_fd: RawFd) -> Result<Box<dyn Backend>> {
            Err(stepio_core::error::Error::Setup(libc::ENOSYS))
        }
    }
}
