//! OS completion facility abstraction.
//!
//! A `Backend` accepts pending operations and reports their completions.
//! The service owns exactly one backend and is its only user.
//!
//! # Implementors
//!
//! - `UringBackend` (default): io_uring. Pending operations become SQEs whose
//!   `user_data` is the completion key.
//! - `PollBackend` (fallback): keeps pending operations in a list and retries
//!   them when `poll(2)` reports readiness. For kernels or sandboxes where
//!   io_uring setup is refused.
//!
//! Both watch a wake fd (an eventfd owned by the service) and report
//! [`Key::WAKE`] when it fires, so events posted from other threads reach
//! the drain loop.

use crate::entry::{Event, Key, Op};
use crate::error::Result;

use std::os::unix::io::RawFd;

/// Async I/O submission and completion.
///
/// **Contract:** `submit()` never blocks. `wait(.., true)` blocks until at
/// least one event is ready; it may return `Ok(0)` after an interrupted or
/// empty wakeup, and the caller simply waits again. `wait(.., false)` only
/// harvests what is already complete.
pub trait Backend {
    /// Short name for logs ("io_uring", "poll").
    fn name(&self) -> &'static str;

    /// Associate a socket with the facility. Called once per socket.
    fn register(&mut self, _fd: RawFd) -> Result<()> {
        Ok(())
    }

    /// Queue one pending operation. Its completion will carry `key`.
    ///
    /// `Err(QueueFull)` if the backend cannot take more work right now.
    fn submit(&mut self, key: Key, op: Op) -> Result<()>;

    /// Write up to `events.len()` completions, in the order the facility
    /// reports them. With `block`, wait until there is at least one.
    fn wait(&mut self, events: &mut [Event], block: bool) -> Result<usize>;

    /// Operations submitted but not yet reported.
    fn inflight(&self) -> usize;
}
