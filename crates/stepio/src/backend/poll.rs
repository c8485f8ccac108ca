//! `PollBackend`: readiness-based fallback.
//!
//! Pending operations are kept in submission order. Each `wait()` polls
//! their fds plus the wake fd, retries the syscall for every ready entry and
//! reports the ones that finished. Completion order follows submission order
//! among entries ready in the same round.

use stepio_core::backend::Backend;
use stepio_core::entry::{Event, Key, Op};
use stepio_core::error::{errno, Error, Result};
use stepio_core::ktrace;

use crate::waker::drain_eventfd;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use std::os::unix::io::{BorrowedFd, RawFd};

struct Pending {
    key: Key,
    op: Op,
}

pub struct PollBackend {
    wake_fd: RawFd,
    pending: Vec<Pending>,
}

impl PollBackend {
    pub fn new(wake_fd: RawFd) -> Self {
        Self { wake_fd, pending: Vec::new() }
    }

    fn interest(op: &Op) -> PollFlags {
        match op {
            Op::Recv { .. } | Op::RecvMsg { .. } | Op::Accept { .. } => PollFlags::POLLIN,
            Op::Send { .. } | Op::SendMsg { .. } | Op::Writable { .. } => PollFlags::POLLOUT,
        }
    }

    /// Retry `op` after its fd reported `revents`. `None` if it would still
    /// block.
    fn attempt(op: &Op, revents: PollFlags) -> Option<i32> {
        let ret = unsafe {
            match *op {
                Op::Recv { fd, buf, len, flags } => {
                    libc::recv(fd, buf as *mut libc::c_void, len as usize, flags) as i32
                }
                Op::Send { fd, buf, len, flags } => {
                    libc::send(fd, buf as *const libc::c_void, len as usize, flags | libc::MSG_NOSIGNAL) as i32
                }
                Op::SendMsg { fd, msg, flags } => libc::sendmsg(fd, msg, flags | libc::MSG_NOSIGNAL) as i32,
                Op::RecvMsg { fd, msg, flags } => libc::recvmsg(fd, msg, flags) as i32,
                Op::Accept { fd } => libc::accept4(
                    fd,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                ),
                Op::Writable { .. } => return Some(revents.bits() as i32),
            }
        };
        if ret >= 0 {
            return Some(ret);
        }
        match errno() {
            e if e == libc::EAGAIN || e == libc::EWOULDBLOCK || e == libc::EINTR => None,
            e => Some(-e),
        }
    }
}

impl Backend for PollBackend {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn submit(&mut self, key: Key, op: Op) -> Result<()> {
        ktrace!("poll: queued {} fd={} key={:#x}", op.name(), op.fd(), key.0);
        self.pending.push(Pending { key, op });
        Ok(())
    }

    fn wait(&mut self, events: &mut [Event], block: bool) -> Result<usize> {
        let mut fds: Vec<PollFd<'_>> = Vec::with_capacity(self.pending.len() + 1);
        // The fds stay open while their operations are pending.
        unsafe {
            fds.push(PollFd::new(BorrowedFd::borrow_raw(self.wake_fd), PollFlags::POLLIN));
            for p in &self.pending {
                fds.push(PollFd::new(BorrowedFd::borrow_raw(p.op.fd()), Self::interest(&p.op)));
            }
        }

        let timeout = if block { PollTimeout::NONE } else { PollTimeout::ZERO };
        match poll(&mut fds, timeout) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(0),
            Err(e) => return Err(Error::Wait(e as i32)),
        }

        let revents: Vec<PollFlags> = fds
            .iter()
            .map(|fd| fd.revents().unwrap_or(PollFlags::empty()))
            .collect();
        drop(fds);

        let mut n = 0;
        let mut idx = 0;
        let mut slot = 1;
        while idx < self.pending.len() && n < events.len() {
            let ready = revents[slot];
            slot += 1;
            if ready.is_empty() {
                idx += 1;
                continue;
            }
            match Self::attempt(&self.pending[idx].op, ready) {
                Some(result) => {
                    let done = self.pending.remove(idx);
                    events[n] = Event::new(done.key, result, ready.bits() as u32);
                    n += 1;
                }
                None => idx += 1,
            }
        }

        if !revents[0].is_empty() && n < events.len() {
            drain_eventfd(self.wake_fd);
            events[n] = Event::new(Key::WAKE, 0, 0);
            n += 1;
        }
        Ok(n)
    }

    fn inflight(&self) -> usize {
        self.pending.len()
    }
}
