//! Posted events.
//!
//! Events that do not come from the OS completion facility (service
//! shutdown, name resolution finished on another thread) are pushed onto a
//! lock-free queue, and an eventfd is bumped so a blocked `wait()` returns.
//! Multiple posts before the service drains coalesce into one wakeup
//! (eventfd counter semantics).

use crossbeam_queue::SegQueue;
use stepio_core::entry::{Event, Key};
use stepio_core::error::{errno, Error, Result};

use std::os::unix::io::RawFd;
use std::sync::Arc;

pub struct PostQueue {
    queue: SegQueue<Event>,
    fd: RawFd,
}

impl PostQueue {
    /// Create the queue and its eventfd (`EFD_NONBLOCK | EFD_CLOEXEC`).
    pub fn new() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(Error::Setup(errno()));
        }
        Ok(Self { queue: SegQueue::new(), fd })
    }

    /// The eventfd the backend watches.
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Queue `event` and wake the service.
    pub fn post(&self, event: Event) -> Result<()> {
        self.queue.push(event);
        self.notify()
    }

    #[inline]
    pub fn pop(&self) -> Option<Event> {
        self.queue.pop()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn notify(&self) -> Result<()> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let e = errno();
            // Counter saturated: a wakeup is already pending.
            if e == libc::EAGAIN {
                return Ok(());
            }
            return Err(Error::Os(e));
        }
        Ok(())
    }
}

impl Drop for PostQueue {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd); }
            self.fd = -1;
        }
    }
}

/// Reset an eventfd counter after it fired. Nothing to read is fine.
pub(crate) fn drain_eventfd(fd: RawFd) {
    let mut val: u64 = 0;
    unsafe {
        libc::read(fd, &mut val as *mut u64 as *mut libc::c_void, std::mem::size_of::<u64>());
    }
}

/// Thread-safe handle onto a service's post queue.
///
/// The service itself is single-threaded; this is how other threads
/// reach it.
#[derive(Clone)]
pub struct Remote {
    queue: Arc<PostQueue>,
}

impl Remote {
    pub(crate) fn new(queue: Arc<PostQueue>) -> Self {
        Self { queue }
    }

    /// Ask the service to stop: its drain loop observes one shutdown event.
    pub fn shutdown(&self) -> Result<()> {
        self.queue.post(Event::shutdown())
    }

    /// Deliver a completion for the descriptor named by `key`.
    pub(crate) fn complete(&self, key: Key, result: i32) -> Result<()> {
        self.queue.post(Event::new(key, result, 0))
    }
}

impl std::fmt::Debug for Remote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Remote").field("fd", &self.queue.fd()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter(fd: RawFd) -> Option<u64> {
        let mut val: u64 = 0;
        let n = unsafe { libc::read(fd, &mut val as *mut u64 as *mut libc::c_void, 8) };
        if n == 8 { Some(val) } else { None }
    }

    #[test]
    fn test_post_wakes_and_orders() {
        let q = PostQueue::new().unwrap();
        q.post(Event::new(Key(1), 10, 0)).unwrap();
        q.post(Event::shutdown()).unwrap();

        // Two posts coalesce into one readable counter.
        assert_eq!(counter(q.fd()), Some(2));
        assert_eq!(counter(q.fd()), None);

        assert_eq!(q.pop(), Some(Event::new(Key(1), 10, 0)));
        assert!(q.pop().unwrap().is_shutdown());
        assert!(q.is_empty());
    }

    #[test]
    fn test_remote_from_other_thread() {
        let q = Arc::new(PostQueue::new().unwrap());
        let remote = Remote::new(q.clone());
        std::thread::spawn(move || remote.shutdown().unwrap()).join().unwrap();
        assert!(q.pop().unwrap().is_shutdown());
        drain_eventfd(q.fd());
        assert_eq!(counter(q.fd()), None);
    }
}
