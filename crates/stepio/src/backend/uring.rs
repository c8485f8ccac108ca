//! `UringBackend`: default `Backend` implementation.
//!
//! One SQE per pending operation, `user_data` = completion key. SQEs are
//! queued by `submit()` and handed to the kernel by the next `wait()`.
//! No SQPOLL, no fixed files, no fixed buffers.
//!
//! The wake eventfd is watched with a one-shot `PollAdd` tagged
//! [`Key::WAKE`], re-armed on the first `wait()` after it fires.

use stepio_core::backend::Backend;
use stepio_core::entry::{Event, Key, Op};
use stepio_core::error::{Error, Result};
use stepio_core::ktrace;

use crate::waker::drain_eventfd;

use io_uring::{opcode, squeue, types, IoUring};

use std::os::unix::io::RawFd;

pub struct UringBackend {
    ring: IoUring,
    wake_fd: RawFd,
    wake_armed: bool,
    inflight: usize,
}

impl UringBackend {
    /// `entries` must be a power of two.
    pub fn new(entries: u32, wake_fd: RawFd) -> Result<Self> {
        let ring = IoUring::builder()
            .build(entries)
            .map_err(|e| Error::Setup(e.raw_os_error().unwrap_or(-1)))?;
        Ok(Self { ring, wake_fd, wake_armed: false, inflight: 0 })
    }

    fn build_sqe(op: Op) -> squeue::Entry {
        match op {
            Op::Recv { fd, buf, len, flags } => {
                opcode::Recv::new(types::Fd(fd), buf, len).flags(flags).build()
            }
            Op::Send { fd, buf, len, flags } => {
                opcode::Send::new(types::Fd(fd), buf, len)
                    .flags(flags | libc::MSG_NOSIGNAL)
                    .build()
            }
            Op::SendMsg { fd, msg, flags } => {
                opcode::SendMsg::new(types::Fd(fd), msg)
                    .flags((flags | libc::MSG_NOSIGNAL) as u32)
                    .build()
            }
            Op::RecvMsg { fd, msg, flags } => {
                opcode::RecvMsg::new(types::Fd(fd), msg).flags(flags as u32).build()
            }
            Op::Accept { fd } => {
                opcode::Accept::new(types::Fd(fd), std::ptr::null_mut(), std::ptr::null_mut())
                    .flags(libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC)
                    .build()
            }
            Op::Writable { fd } => {
                opcode::PollAdd::new(types::Fd(fd), libc::POLLOUT as u32).build()
            }
        }
    }

    /// Push one SQE. If the SQ is full, hand what is queued to the kernel
    /// and try once more.
    fn push(&mut self, sqe: &squeue::Entry) -> Result<()> {
        unsafe {
            if self.ring.submission().push(sqe).is_ok() {
                return Ok(());
            }
        }
        self.ring
            .submit()
            .map_err(|e| Error::Submit(e.raw_os_error().unwrap_or(-1)))?;
        unsafe {
            self.ring.submission().push(sqe).map_err(|_| Error::QueueFull)
        }
    }

    fn arm_wake(&mut self) -> Result<()> {
        if self.wake_armed {
            return Ok(());
        }
        let sqe = opcode::PollAdd::new(types::Fd(self.wake_fd), libc::POLLIN as u32)
            .build()
            .user_data(Key::WAKE.0);
        self.push(&sqe)?;
        self.wake_armed = true;
        Ok(())
    }
}

impl Backend for UringBackend {
    fn name(&self) -> &'static str {
        "io_uring"
    }

    fn submit(&mut self, key: Key, op: Op) -> Result<()> {
        let sqe = Self::build_sqe(op).user_data(key.0);
        self.push(&sqe)?;
        self.inflight += 1;
        ktrace!("uring: queued {} fd={} key={:#x}", op.name(), op.fd(), key.0);
        Ok(())
    }

    fn wait(&mut self, events: &mut [Event], block: bool) -> Result<usize> {
        self.arm_wake()?;

        let res = if block && self.ring.completion().is_empty() {
            self.ring.submit_and_wait(1)
        } else {
            self.ring.submit()
        };
        match res {
            Ok(_) => {}
            // Interrupted, or the CQ needs draining before more can be
            // submitted; either way harvest what is there.
            Err(e) if matches!(e.raw_os_error(), Some(libc::EINTR) | Some(libc::EBUSY)) => {}
            Err(e) => return Err(Error::Wait(e.raw_os_error().unwrap_or(-1))),
        }

        let mut n = 0;
        let mut cq = self.ring.completion();
        while n < events.len() {
            let Some(cqe) = cq.next() else { break };
            let key = Key(cqe.user_data());
            if key == Key::WAKE {
                drain_eventfd(self.wake_fd);
                self.wake_armed = false;
            } else {
                self.inflight = self.inflight.saturating_sub(1);
            }
            events[n] = Event::new(key, cqe.result(), cqe.flags());
            n += 1;
        }
        Ok(n)
    }

    fn inflight(&self) -> usize {
        self.inflight
    }
}
