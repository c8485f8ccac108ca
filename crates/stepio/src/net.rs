//! # Non-blocking sockets and their async primitives
//!
//! Every primitive follows the same contract:
//!
//! - `true`: finished before returning. The context holds the outcome and no
//!   completion will be dispatched for this call. This covers immediate
//!   success, immediate failure, and failure to start (the backend refused
//!   the request).
//! - `false`: pending. The service will run the context's hook exactly once
//!   when it completes.
//!
//! The socket is non-blocking, so each primitive tries the syscall first and
//! only hands the operation to the backend on `EAGAIN` / `EINPROGRESS`.
//!
//! ```ignore
//! self.state = State::OnRecv;
//! if !unsafe { sock.receive(&mut self.buf, 0, &mut self.io) } {
//!     return Next::Done;   // resumed by the service
//! }
//! // fast path: self.io already holds the outcome
//! ```

use crate::addr::SockAddr;
use crate::service::Service;

use stepio_core::context::{Context, OpContext};
use stepio_core::descriptor::{hook_of, Completion, Next};
use stepio_core::entry::{Key, Op};
use stepio_core::error::{errno, Error, ErrorCode, Result};
use stepio_core::{impl_context, kdebug, ktrace};

use std::io::{IoSlice, IoSliceMut};
use std::mem;
use std::ops::Deref;
use std::os::unix::io::RawFd;

#[inline]
fn would_block(e: i32) -> bool {
    e == libc::EAGAIN || e == libc::EWOULDBLOCK || e == libc::EINTR
}

#[inline]
fn clamp_len(len: usize) -> u32 {
    len.min(u32::MAX as usize) as u32
}

/// An owned, non-blocking OS socket registered with a [`Service`].
///
/// Move-only. Closed on drop or by [`close`](Socket::close).
pub struct Socket {
    fd: RawFd,
    service: Service,
}

impl Socket {
    /// `socket(family, socktype | SOCK_NONBLOCK | SOCK_CLOEXEC, protocol)`,
    /// registered with `service`.
    pub fn new(service: &Service, family: i32, socktype: i32, protocol: i32) -> Result<Self> {
        let fd = unsafe {
            libc::socket(family, socktype | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, protocol)
        };
        if fd < 0 {
            return Err(Error::last_os_error());
        }
        Self::from_raw(service, fd)
    }

    /// Take ownership of an already non-blocking `fd`. It is closed if
    /// registration fails.
    pub fn from_raw(service: &Service, fd: RawFd) -> Result<Self> {
        let sock = Self { fd, service: service.clone() };
        service.register(fd)?;
        Ok(sock)
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.fd >= 0
    }

    pub fn service(&self) -> &Service {
        &self.service
    }

    /// Close now. Closing twice is a no-op.
    pub fn close(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd); }
            self.fd = -1;
        }
    }

    pub fn bind(&self, addr: &SockAddr) -> Result<()> {
        let ret = unsafe { libc::bind(self.fd, addr.as_ptr(), addr.len()) };
        if ret != 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    pub fn listen(&self, backlog: i32) -> Result<()> {
        let ret = unsafe { libc::listen(self.fd, backlog) };
        if ret != 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    /// `setsockopt(level, name, value)`.
    pub fn set_option<T: Copy>(&self, level: i32, name: i32, value: &T) -> Result<()> {
        let ret = unsafe {
            libc::setsockopt(
                self.fd,
                level,
                name,
                value as *const T as *const libc::c_void,
                mem::size_of::<T>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    /// Like [`set_option`](Socket::set_option), reporting failure as `false`.
    pub fn try_set_option<T: Copy>(&self, level: i32, name: i32, value: &T) -> bool {
        match self.set_option(level, name, value) {
            Ok(()) => true,
            Err(e) => {
                kdebug!("socket {}: setsockopt({}, {}) failed: {}", self.fd, level, name, e);
                false
            }
        }
    }

    /// `shutdown(how)`: `libc::SHUT_RD`, `SHUT_WR` or `SHUT_RDWR`.
    pub fn shutdown(&self, how: i32) -> Result<()> {
        let ret = unsafe { libc::shutdown(self.fd, how) };
        if ret != 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    pub fn local_addr(&self) -> Result<SockAddr> {
        self.name_of(libc::getsockname)
    }

    pub fn peer_addr(&self) -> Result<SockAddr> {
        self.name_of(libc::getpeername)
    }

    fn name_of(
        &self,
        f: unsafe extern "C" fn(i32, *mut libc::sockaddr, *mut libc::socklen_t) -> i32,
    ) -> Result<SockAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let ret = unsafe { f(self.fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
        if ret != 0 {
            return Err(Error::last_os_error());
        }
        Ok(unsafe { SockAddr::from_raw(&storage as *const _ as *const libc::sockaddr, len) })
    }

    /// Pending `SO_ERROR`, cleared by reading it.
    pub fn take_error(&self) -> Result<i32> {
        so_error(self.fd).map_err(|code| Error::Os(code.raw()))
    }

    /// Hand `op` to the backend. A refused submission is a synchronous
    /// failure.
    fn pend(&self, ctx: &mut OpContext, key: Key, op: Op) -> bool {
        match self.service.submit(key, op) {
            Ok(()) => {
                ctx.descriptor_mut().mark_pending();
                ktrace!("socket {}: {} pending", self.fd, op.name());
                false
            }
            Err(e) => {
                kdebug!("socket {}: {} could not start: {}", self.fd, op.name(), e);
                ctx.fail(e.code());
                true
            }
        }
    }

    // ── Primitives ──

    /// Receive into `buf`. `transferred == 0` with no error means the peer
    /// closed its sending side.
    ///
    /// # Safety
    ///
    /// If this returns `false`, `buf` and `ctx` must stay alive and unmoved
    /// until the completion has been dispatched.
    pub unsafe fn receive<C: Context<OpContext>>(&self, buf: &mut [u8], flags: i32, ctx: &mut C) -> bool {
        let hook = hook_of(ctx);
        let op = ctx.get_mut();
        let key = op.init(hook);

        let len = clamp_len(buf.len());
        let ret = libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, len as usize, flags);
        if ret >= 0 {
            op.succeed(ret as usize, 0);
            return true;
        }
        let e = errno();
        if !would_block(e) {
            op.fail(ErrorCode::Os(e));
            return true;
        }
        self.pend(op, key, Op::Recv { fd: self.fd, buf: buf.as_mut_ptr(), len, flags })
    }

    /// Send from `buf`. May transfer fewer bytes than `buf.len()`.
    ///
    /// # Safety
    ///
    /// If this returns `false`, `buf` and `ctx` must stay alive and unmoved
    /// until the completion has been dispatched.
    pub unsafe fn send<C: Context<OpContext>>(&self, buf: &[u8], flags: i32, ctx: &mut C) -> bool {
        let hook = hook_of(ctx);
        let op = ctx.get_mut();
        let key = op.init(hook);

        let len = clamp_len(buf.len());
        let ret = libc::send(
            self.fd,
            buf.as_ptr() as *const libc::c_void,
            len as usize,
            flags | libc::MSG_NOSIGNAL,
        );
        if ret >= 0 {
            op.succeed(ret as usize, 0);
            return true;
        }
        let e = errno();
        if !would_block(e) {
            op.fail(ErrorCode::Os(e));
            return true;
        }
        self.pend(op, key, Op::Send { fd: self.fd, buf: buf.as_ptr(), len, flags })
    }

    /// Gather-send `bufs` in order with one `sendmsg`. May transfer fewer
    /// bytes than their total.
    ///
    /// # Safety
    ///
    /// If this returns `false`, `bufs`, the memory they point at, and `ctx`
    /// must stay alive and unmoved until the completion has been dispatched.
    pub unsafe fn send_vectored<C: Context<MsgContext>>(
        &self,
        bufs: &[IoSlice<'_>],
        flags: i32,
        ctx: &mut C,
    ) -> bool {
        let hook = hook_of(ctx);
        let mc = ctx.get_mut();
        let key = mc.start(hook, bufs.as_ptr() as *mut libc::iovec, bufs.len());

        let ret = libc::sendmsg(self.fd, &mc.msg, flags | libc::MSG_NOSIGNAL);
        if ret >= 0 {
            mc.op.succeed(ret as usize, 0);
            return true;
        }
        let e = errno();
        if !would_block(e) {
            mc.op.fail(ErrorCode::Os(e));
            return true;
        }
        let msg = &mc.msg as *const libc::msghdr;
        self.pend(&mut mc.op, key, Op::SendMsg { fd: self.fd, msg, flags })
    }

    /// Scatter-receive into `bufs` in order with one `recvmsg`.
    /// `transferred == 0` with no error means the peer closed its sending
    /// side.
    ///
    /// # Safety
    ///
    /// As for [`send_vectored`](Socket::send_vectored).
    pub unsafe fn receive_vectored<C: Context<MsgContext>>(
        &self,
        bufs: &mut [IoSliceMut<'_>],
        flags: i32,
        ctx: &mut C,
    ) -> bool {
        let hook = hook_of(ctx);
        let mc = ctx.get_mut();
        let key = mc.start(hook, bufs.as_mut_ptr() as *mut libc::iovec, bufs.len());

        let ret = libc::recvmsg(self.fd, &mut mc.msg, flags);
        if ret >= 0 {
            mc.op.succeed(ret as usize, 0);
            return true;
        }
        let e = errno();
        if !would_block(e) {
            mc.op.fail(ErrorCode::Os(e));
            return true;
        }
        let msg = &mut mc.msg as *mut libc::msghdr;
        self.pend(&mut mc.op, key, Op::RecvMsg { fd: self.fd, msg, flags })
    }

    /// Connect to `addr`, then send `data` once connected. The outcome's
    /// `transferred` is how much of `data` went out; the caller sends the
    /// rest.
    ///
    /// # Safety
    ///
    /// If this returns `false`, `data` and `ctx` must stay alive and unmoved
    /// until the completion has been dispatched.
    pub unsafe fn connect_and_send<C: Context<ConnectContext>>(
        &self,
        addr: &SockAddr,
        data: &[u8],
        ctx: &mut C,
    ) -> bool {
        let hook = hook_of(ctx);
        let cc = ctx.get_mut();
        let key = cc.start(hook, self.fd, data);

        let ret = libc::connect(self.fd, addr.as_ptr(), addr.len());
        if ret == 0 {
            cc.send_initial();
            return true;
        }
        let e = errno();
        if e != libc::EINPROGRESS && !would_block(e) {
            cc.op.fail(ErrorCode::Os(e));
            return true;
        }
        self.pend(&mut cc.op, key, Op::Writable { fd: self.fd })
    }

    /// [`connect_and_send`](Socket::connect_and_send) with nothing to send.
    ///
    /// # Safety
    ///
    /// As for `connect_and_send`.
    pub unsafe fn connect<C: Context<ConnectContext>>(&self, addr: &SockAddr, ctx: &mut C) -> bool {
        self.connect_and_send(addr, &[], ctx)
    }

    /// Accept one connection on a listening socket. The new socket is
    /// registered with the same service; take it with
    /// [`AcceptContext::take_socket`].
    ///
    /// # Safety
    ///
    /// If this returns `false`, `ctx` must stay alive and unmoved until the
    /// completion has been dispatched.
    pub unsafe fn accept<C: Context<AcceptContext>>(&self, ctx: &mut C) -> bool {
        let hook = hook_of(ctx);
        let ac = ctx.get_mut();
        let key = ac.start(hook, &self.service);

        let fd = libc::accept4(
            self.fd,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        );
        if fd >= 0 {
            ac.adopt(fd);
            return true;
        }
        let e = errno();
        if !would_block(e) {
            ac.op.fail(ErrorCode::Os(e));
            return true;
        }
        self.pend(&mut ac.op, key, Op::Accept { fd: self.fd })
    }

    /// Tear down the connection in both directions. Always synchronous;
    /// a socket that is not connected counts as already disconnected.
    pub fn disconnect<C: Context<OpContext>>(&self, ctx: &mut C) -> bool {
        let hook = hook_of(ctx);
        let op = ctx.get_mut();
        op.init(hook);
        let ret = unsafe { libc::shutdown(self.fd, libc::SHUT_RDWR) };
        if ret == 0 {
            op.succeed(0, 0);
            return true;
        }
        match errno() {
            libc::ENOTCONN => op.succeed(0, 0),
            e => op.fail(ErrorCode::Os(e)),
        }
        true
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket").field("fd", &self.fd).finish()
    }
}

fn so_error(fd: RawFd) -> std::result::Result<i32, ErrorCode> {
    let mut err: i32 = 0;
    let mut len = mem::size_of::<i32>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut i32 as *mut libc::c_void,
            &mut len,
        )
    };
    if ret != 0 {
        return Err(ErrorCode::last_os_error());
    }
    Ok(err)
}

// ── Connect ──

/// Context for [`Socket::connect_and_send`].
///
/// Its hook finishes the connect: checks `SO_ERROR`, then sends the
/// initial data. Failures of either step become the outcome.
#[derive(Debug)]
pub struct ConnectContext {
    op: OpContext,
    fd: RawFd,
    data: *const u8,
    len: usize,
}

impl Default for ConnectContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectContext {
    pub const fn new() -> Self {
        Self { op: OpContext::new(), fd: -1, data: std::ptr::null(), len: 0 }
    }

    fn start(&mut self, owner: std::ptr::NonNull<dyn Completion>, fd: RawFd, data: &[u8]) -> Key {
        let key = self.op.init(owner);
        self.fd = fd;
        self.data = data.as_ptr();
        self.len = data.len();
        key
    }

    /// Record a failure for a connect that was never issued.
    pub(crate) fn fail(&mut self, code: ErrorCode) {
        self.op.fail(code);
    }

    fn fixup(&mut self) {
        if self.op.has_error() {
            return;
        }
        match so_error(self.fd) {
            Ok(0) => self.send_initial(),
            Ok(e) => self.op.fail(ErrorCode::Os(e)),
            Err(code) => self.op.fail(code),
        }
    }

    fn send_initial(&mut self) {
        if self.len == 0 {
            self.op.succeed(0, 0);
            return;
        }
        let ret = unsafe {
            libc::send(self.fd, self.data as *const libc::c_void, self.len, libc::MSG_NOSIGNAL)
        };
        if ret >= 0 {
            self.op.succeed(ret as usize, 0);
            return;
        }
        match errno() {
            // Connected but the send buffer is full; nothing went out.
            e if would_block(e) => self.op.succeed(0, 0),
            e => self.op.fail(ErrorCode::Os(e)),
        }
    }
}

impl Deref for ConnectContext {
    type Target = OpContext;

    fn deref(&self) -> &OpContext {
        &self.op
    }
}

impl Completion for ConnectContext {
    fn complete(&mut self) -> Next {
        self.op.record();
        self.fixup();
        Next::Done
    }
}

impl_context!(ConnectContext);

// ── Vectored ──

/// Context for [`Socket::send_vectored`] and [`Socket::receive_vectored`].
/// Holds the `msghdr` the kernel reads while the call is pending.
pub struct MsgContext {
    op: OpContext,
    msg: libc::msghdr,
}

impl Default for MsgContext {
    fn default() -> Self {
        Self::new()
    }
}

impl MsgContext {
    pub fn new() -> Self {
        Self { op: OpContext::new(), msg: unsafe { mem::zeroed() } }
    }

    fn start(&mut self, owner: std::ptr::NonNull<dyn Completion>, iov: *mut libc::iovec, count: usize) -> Key {
        let key = self.op.init(owner);
        self.msg = unsafe { mem::zeroed() };
        self.msg.msg_iov = iov;
        self.msg.msg_iovlen = count as _;
        key
    }
}

impl Deref for MsgContext {
    type Target = OpContext;

    fn deref(&self) -> &OpContext {
        &self.op
    }
}

impl Completion for MsgContext {
    fn complete(&mut self) -> Next {
        self.op.record();
        Next::Done
    }
}

impl_context!(MsgContext);

impl std::fmt::Debug for MsgContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsgContext")
            .field("op", &self.op)
            .field("iovlen", &self.msg.msg_iovlen)
            .finish()
    }
}

// ── Accept ──

/// Context for [`Socket::accept`].
#[derive(Debug, Default)]
pub struct AcceptContext {
    op: OpContext,
    service: Option<Service>,
    accepted: Option<Socket>,
}

impl AcceptContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn start(&mut self, owner: std::ptr::NonNull<dyn Completion>, service: &Service) -> Key {
        self.accepted = None;
        self.service = Some(service.clone());
        self.op.init(owner)
    }

    fn adopt(&mut self, fd: RawFd) {
        let Some(service) = self.service.as_ref() else {
            unsafe { libc::close(fd); }
            self.op.fail(ErrorCode::Os(libc::EBADF));
            return;
        };
        match Socket::from_raw(service, fd) {
            Ok(sock) => {
                self.accepted = Some(sock);
                self.op.succeed(0, 0);
            }
            Err(e) => self.op.fail(e.code()),
        }
    }

    /// The accepted connection, once the accept succeeded.
    pub fn take_socket(&mut self) -> Option<Socket> {
        self.accepted.take()
    }
}

impl Deref for AcceptContext {
    type Target = OpContext;

    fn deref(&self) -> &OpContext {
        &self.op
    }
}

impl Completion for AcceptContext {
    fn complete(&mut self) -> Next {
        self.op.record();
        if !self.op.has_error() {
            self.adopt(self.op.transferred() as RawFd);
        }
        Next::Done
    }
}

impl_context!(AcceptContext);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendKind, ServiceConfig};
    use stepio_core::backend::Backend;
    use stepio_core::entry::Event;
    use stepio_core::resumable::{as_resumable, Bound, Resumable};

    use std::io::{Read, Write};
    use std::net::{SocketAddr, TcpListener, TcpStream};

    fn poll_service() -> Service {
        Service::with_config(&ServiceConfig::new().backend(BackendKind::Poll)).unwrap()
    }

    fn tcp(svc: &Service) -> Socket {
        Socket::new(svc, libc::AF_INET, libc::SOCK_STREAM, 0).unwrap()
    }

    /// A connected (client socket, server stream) pair over loopback.
    fn connected(svc: &Service) -> (Socket, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = SockAddr::from_std(listener.local_addr().unwrap());
        let sock = tcp(svc);
        let mut ctx = Box::new(ConnectContext::new());
        if !unsafe { sock.connect(&addr, &mut *ctx) } {
            while ctx.is_pending() {
                assert!(svc.run_one().unwrap());
            }
        }
        ctx.check_error().unwrap();
        let (server, _) = listener.accept().unwrap();
        (sock, server)
    }

    fn closed_port() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    #[test]
    fn test_receive_fast_path_when_data_ready() {
        let svc = poll_service();
        let (sock, mut server) = connected(&svc);
        server.write_all(b"ready").unwrap();
        // Give loopback a moment to deliver.
        std::thread::sleep(std::time::Duration::from_millis(10));

        let mut ctx = Box::new(OpContext::new());
        let mut buf = [0u8; 16];
        assert!(unsafe { sock.receive(&mut buf, 0, &mut *ctx) });
        assert!(!ctx.is_pending());
        assert_eq!(ctx.transferred(), 5);
        assert_eq!(&buf[..5], b"ready");
        assert_eq!(svc.inflight(), 0);
    }

    #[test]
    fn test_receive_pending_completes_once() {
        let svc = poll_service();
        let (sock, mut server) = connected(&svc);

        let mut ctx = Box::new(OpContext::new());
        let mut buf = [0u8; 16];
        assert!(!unsafe { sock.receive(&mut buf, 0, &mut *ctx) });
        assert!(ctx.is_pending());
        assert_eq!(svc.inflight(), 1);

        server.write_all(b"later").unwrap();
        assert!(svc.run_one().unwrap());
        assert!(!ctx.is_pending());
        assert_eq!(ctx.transferred(), 5);
        assert_eq!(svc.inflight(), 0);
    }

    #[test]
    fn test_receive_after_peer_half_close() {
        let svc = poll_service();
        let (sock, server) = connected(&svc);

        let mut ctx = Box::new(OpContext::new());
        let mut buf = [0u8; 16];
        let sync = unsafe { sock.receive(&mut buf, 0, &mut *ctx) };
        server.shutdown(std::net::Shutdown::Write).unwrap();
        if !sync {
            assert!(svc.run_one().unwrap());
        }
        assert!(!ctx.has_error());
        assert_eq!(ctx.transferred(), 0);

        // Stays at EOF.
        assert!(unsafe { sock.receive(&mut buf, 0, &mut *ctx) });
        assert_eq!(ctx.transferred(), 0);
    }

    #[test]
    fn test_send_and_shutdown_write() {
        let svc = poll_service();
        let (sock, mut server) = connected(&svc);

        let mut ctx = Box::new(OpContext::new());
        let msg = b"hello over loopback";
        assert!(unsafe { sock.send(msg, 0, &mut *ctx) });
        assert_eq!(ctx.transferred(), msg.len());
        sock.shutdown(libc::SHUT_WR).unwrap();

        let mut got = Vec::new();
        server.read_to_end(&mut got).unwrap();
        assert_eq!(got, msg);
    }

    #[test]
    fn test_connect_and_send_delivers_data() {
        let svc = poll_service();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = SockAddr::from_std(listener.local_addr().unwrap());
        let sock = tcp(&svc);
        sock.bind(&SockAddr::unspecified(libc::AF_INET).unwrap()).unwrap();

        let mut ctx = Box::new(ConnectContext::new());
        let data = b"GET / HTTP/1.0\r\n\r\n";
        if !unsafe { sock.connect_and_send(&addr, data, &mut *ctx) } {
            assert!(svc.run_one().unwrap());
        }
        ctx.check_error().unwrap();
        assert_eq!(ctx.transferred(), data.len());
        assert_eq!(sock.peer_addr().unwrap(), addr);

        let (mut server, _) = listener.accept().unwrap();
        let mut buf = vec![0u8; data.len()];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[..], &data[..]);
    }

    #[test]
    fn test_connect_refused() {
        let svc = poll_service();
        let addr = SockAddr::from_std(closed_port());
        let sock = tcp(&svc);
        let mut ctx = Box::new(ConnectContext::new());
        if !unsafe { sock.connect_and_send(&addr, b"x", &mut *ctx) } {
            assert!(svc.run_one().unwrap());
        }
        assert_eq!(ctx.status(), Some(ErrorCode::Os(libc::ECONNREFUSED)));
        assert_eq!(ctx.transferred(), 0);
    }

    #[test]
    fn test_send_vectored_gathers_in_order() {
        let svc = poll_service();
        let (sock, mut server) = connected(&svc);

        let mut ctx = Box::new(MsgContext::new());
        let bufs = [IoSlice::new(b"GET / "), IoSlice::new(b""), IoSlice::new(b"HTTP/1.1")];
        if !unsafe { sock.send_vectored(&bufs, 0, &mut *ctx) } {
            assert!(svc.run_one().unwrap());
        }
        ctx.check_error().unwrap();
        assert_eq!(ctx.transferred(), 14);

        let mut got = [0u8; 14];
        server.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"GET / HTTP/1.1");
    }

    #[test]
    fn test_receive_vectored_pending_scatters() {
        let svc = poll_service();
        let (sock, mut server) = connected(&svc);

        let mut ctx = Box::new(MsgContext::new());
        let mut head = [0u8; 4];
        let mut body = [0u8; 16];
        let mut bufs = [IoSliceMut::new(&mut head), IoSliceMut::new(&mut body)];
        assert!(!unsafe { sock.receive_vectored(&mut bufs, 0, &mut *ctx) });
        assert_eq!(svc.inflight(), 1);

        server.write_all(b"HEADbody").unwrap();
        assert!(svc.run_one().unwrap());
        assert!(!ctx.is_pending());
        assert_eq!(ctx.transferred(), 8);
        drop(bufs);
        assert_eq!(&head, b"HEAD");
        assert_eq!(&body[..4], b"body");

        // Peer done: reads as EOF.
        drop(server);
        let mut bufs = [IoSliceMut::new(&mut body)];
        if !unsafe { sock.receive_vectored(&mut bufs, 0, &mut *ctx) } {
            assert!(svc.run_one().unwrap());
        }
        assert!(!ctx.has_error());
        assert_eq!(ctx.transferred(), 0);
    }

    #[test]
    fn test_accept_pending_then_connection() {
        let svc = poll_service();
        let listener = tcp(&svc);
        listener.set_option(libc::SOL_SOCKET, libc::SO_REUSEADDR, &1i32).unwrap();
        listener.bind(&SockAddr::from_std("127.0.0.1:0".parse().unwrap())).unwrap();
        listener.listen(16).unwrap();
        let addr = listener.local_addr().unwrap().to_std().unwrap();

        let mut ctx = Box::new(AcceptContext::new());
        assert!(!unsafe { listener.accept(&mut *ctx) });

        let client = TcpStream::connect(addr).unwrap();
        assert!(svc.run_one().unwrap());
        ctx.check_error().unwrap();
        let conn = ctx.take_socket().unwrap();
        assert!(conn.is_open());
        assert_eq!(conn.peer_addr().unwrap().to_std(), Some(client.local_addr().unwrap()));
        assert!(ctx.take_socket().is_none());
    }

    #[test]
    fn test_disconnect_not_connected_is_ok() {
        let svc = poll_service();
        let sock = tcp(&svc);
        let mut ctx = OpContext::new();
        assert!(sock.disconnect(&mut ctx));
        assert!(!ctx.has_error());
    }

    #[test]
    fn test_options() {
        let svc = poll_service();
        let sock = tcp(&svc);
        assert!(sock.try_set_option(libc::IPPROTO_TCP, libc::TCP_NODELAY, &1i32));
        assert!(!sock.try_set_option(libc::SOL_SOCKET, -1, &1i32));
        assert!(sock.set_option(libc::SOL_SOCKET, -1, &1i32).is_err());
    }

    #[test]
    fn test_close_is_idempotent() {
        let svc = poll_service();
        let mut sock = tcp(&svc);
        sock.close();
        sock.close();
        assert!(!sock.is_open());
        assert_eq!(sock.fd(), -1);
    }

    /// Backend whose queue is always full.
    struct FullBackend;

    impl Backend for FullBackend {
        fn name(&self) -> &'static str {
            "full"
        }
        fn submit(&mut self, _key: Key, _op: Op) -> Result<()> {
            Err(Error::QueueFull)
        }
        fn wait(&mut self, _events: &mut [Event], _block: bool) -> Result<usize> {
            Ok(0)
        }
        fn inflight(&self) -> usize {
            0
        }
    }

    #[test]
    fn test_failure_to_start_is_synchronous() {
        let svc = Service::with_backend(|_| Ok(Box::new(FullBackend) as Box<dyn Backend>)).unwrap();
        let (sock, _server) = adopted_pair(&svc);

        let mut ctx = Box::new(OpContext::new());
        let mut buf = [0u8; 8];
        assert!(unsafe { sock.receive(&mut buf, 0, &mut *ctx) });
        assert!(!ctx.is_pending());
        assert_eq!(ctx.status(), Some(ErrorCode::Os(libc::EAGAIN)));
    }

    /// Connected pair made with blocking std sockets, then adopted.
    fn adopted_pair(svc: &Service) -> (Socket, TcpStream) {
        use std::os::unix::io::IntoRawFd;
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        client.set_nonblocking(true).unwrap();
        let (server, _) = listener.accept().unwrap();
        (Socket::from_raw(svc, client.into_raw_fd()).unwrap(), server)
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Echo {
        Start,
        OnRecv,
        Finished,
    }

    /// Receives until EOF, counting how often it was resumed.
    struct Drain {
        state: Echo,
        sock: Socket,
        io: Bound<OpContext>,
        buf: [u8; 4],
        total: usize,
    }

    impl Resumable for Drain {
        fn step(&mut self) -> Next {
            loop {
                match self.state {
                    Echo::Start => {
                        self.state = Echo::OnRecv;
                        if !unsafe { self.sock.receive(&mut self.buf, 0, &mut self.io) } {
                            return Next::Done;
                        }
                    }
                    Echo::OnRecv => {
                        if self.io.has_error() || self.io.transferred() == 0 {
                            self.state = Echo::Finished;
                            return Next::Done;
                        }
                        self.total += self.io.transferred();
                        self.state = Echo::Start;
                    }
                    Echo::Finished => return Next::Done,
                }
            }
        }
    }

    #[test]
    fn test_resumable_read_loop_stops_at_eof() {
        let svc = poll_service();
        let (sock, mut server) = connected(&svc);
        let mut op = Box::new(Drain {
            state: Echo::Start,
            sock,
            io: Bound::new(OpContext::new()),
            buf: [0; 4],
            total: 0,
        });
        let me = as_resumable(&mut *op);
        op.io.bind(me);

        op.step();
        assert_eq!(op.state, Echo::OnRecv);

        server.write_all(b"0123456789").unwrap();
        server.shutdown(std::net::Shutdown::Write).unwrap();
        while op.state != Echo::Finished {
            assert!(svc.run_one().unwrap());
        }
        assert_eq!(op.total, 10);
        assert!(!op.io.has_error());
        assert_eq!(svc.inflight(), 0);
    }
}
