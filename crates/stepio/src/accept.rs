//! Accept a connection and receive its first data.
//!
//! ```text
//!   accept ──► OnAccept ──receive──► OnReceive ──► Finished
//!                 │                      │
//!                 └── accept failed ─────┴── receive failed (socket closed)
//! ```
//!
//! Like [`ResolveAndConnect`](crate::connect::ResolveAndConnect), this is a
//! resumable operation over two child contexts and a context for its owner.

use crate::net::{AcceptContext, Socket};

use stepio_core::context::{Context, OpContext};
use stepio_core::descriptor::{hook_of, Completion, Next};
use stepio_core::error::ErrorCode;
use stepio_core::resumable::{as_resumable, Bound, Resumable};
use stepio_core::{impl_context, kdebug};

use std::ops::Deref;
use std::ptr::NonNull;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    OnAccept,
    OnReceive,
    Finished,
}

/// Accept one connection, then receive into the caller's buffer. The
/// outcome's `transferred` is the size of that first read; zero means the
/// peer closed without sending.
pub struct AcceptAndReceive {
    state: State,
    accept_ctx: Bound<AcceptContext>,
    recv_ctx: Bound<OpContext>,
    sock: Option<Socket>,
    buf: *mut u8,
    len: usize,
    outcome: OpContext,
    owner: Option<NonNull<dyn Completion>>,
    sync: bool,
}

impl Default for AcceptAndReceive {
    fn default() -> Self {
        Self::new()
    }
}

impl AcceptAndReceive {
    pub fn new() -> Self {
        Self {
            state: State::Finished,
            accept_ctx: Bound::new(AcceptContext::new()),
            recv_ctx: Bound::new(OpContext::new()),
            sock: None,
            buf: std::ptr::null_mut(),
            len: 0,
            outcome: OpContext::new(),
            owner: None,
            sync: true,
        }
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.state == State::Finished
    }

    /// The accepted socket, after success.
    pub fn take_socket(&mut self) -> Option<Socket> {
        self.sock.take()
    }

    fn finish(&mut self, error: Option<ErrorCode>, transferred: usize) -> Next {
        self.state = State::Finished;
        match error {
            Some(code) => {
                if let Some(mut sock) = self.sock.take() {
                    sock.close();
                }
                self.outcome.fail(code);
            }
            None => self.outcome.succeed(transferred, 0),
        }
        if self.sync {
            return Next::Done;
        }
        match self.owner {
            Some(owner) => Next::Complete(owner),
            None => Next::Done,
        }
    }
}

impl Resumable for AcceptAndReceive {
    fn step(&mut self) -> Next {
        loop {
            match self.state {
                State::OnAccept => {
                    if let Some(code) = self.accept_ctx.status() {
                        return self.finish(Some(code), 0);
                    }
                    self.sock = self.accept_ctx.take_socket();
                    self.state = State::OnReceive;
                    // The caller keeps `buf` alive until the outcome is delivered.
                    let buf: &mut [u8] = if self.buf.is_null() {
                        &mut []
                    } else {
                        unsafe { std::slice::from_raw_parts_mut(self.buf, self.len) }
                    };
                    let Some(sock) = self.sock.as_ref() else {
                        return self.finish(Some(ErrorCode::Os(libc::EBADF)), 0);
                    };
                    if !unsafe { sock.receive(buf, 0, &mut self.recv_ctx) } {
                        self.sync = false;
                        return Next::Done;
                    }
                }
                State::OnReceive => {
                    if let Some(code) = self.recv_ctx.status() {
                        kdebug!("accept: first receive failed: {}", code);
                        return self.finish(Some(code), 0);
                    }
                    let n = self.recv_ctx.transferred();
                    return self.finish(None, n);
                }
                State::Finished => {
                    debug_assert!(false, "accept-and-receive stepped after finishing");
                    return Next::Done;
                }
            }
        }
    }
}

impl Deref for AcceptAndReceive {
    type Target = OpContext;

    fn deref(&self) -> &OpContext {
        &self.outcome
    }
}

impl Completion for AcceptAndReceive {
    fn complete(&mut self) -> Next {
        Next::Done
    }
}

impl_context!(AcceptAndReceive);

impl std::fmt::Debug for AcceptAndReceive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceptAndReceive")
            .field("state", &self.state)
            .field("outcome", &self.outcome.status())
            .finish()
    }
}

/// Accept on `listener`, then receive the connection's first data into
/// `buf`. The accepted socket is left in the context
/// ([`AcceptAndReceive::take_socket`]); it is closed if the receive fails.
///
/// # Safety
///
/// If this returns `false`, `buf` and `ctx` must stay alive and unmoved
/// until the completion has been dispatched.
pub unsafe fn accept_and_receive<C: Context<AcceptAndReceive>>(
    listener: &Socket,
    buf: &mut [u8],
    ctx: &mut C,
) -> bool {
    let hook = hook_of(ctx);
    let ar = ctx.get_mut();
    debug_assert!(ar.is_finished(), "accept-and-receive restarted while running");
    ar.state = State::OnAccept;
    ar.buf = buf.as_mut_ptr();
    ar.len = buf.len();
    ar.sock = None;
    ar.outcome.init(hook);
    ar.owner = Some(hook);
    ar.sync = true;

    // Not pending, so following a move is safe.
    let me = as_resumable(ar);
    ar.accept_ctx.rebind(me);
    ar.recv_ctx.rebind(me);

    if !listener.accept(&mut ar.accept_ctx) {
        ar.sync = false;
        return false;
    }
    let next = ar.step();
    debug_assert!(next.is_done());
    ar.sync
}
