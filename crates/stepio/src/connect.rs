//! Resolve-and-connect with fallback.
//!
//! ```text
//!   OnStart ──resolve──► OnResolve ──► Attempt ──connect_and_send──► OnConnect ──► Finished
//!                            │            ▲                              │
//!                            │            └──── failed, more candidates ─┘
//!                            └── resolution failed ─────────────────────────────► Finished
//! ```
//!
//! `ResolveAndConnect` is both a resumable operation (its two child contexts
//! resume it) and a context (its owner embeds it, usually as
//! `Bound<ResolveAndConnect>`). When it finishes after having suspended, its
//! last `step()` hands the owner's hook back to the dispatcher.

use crate::addr::{AddrList, Candidate, SockAddr};
use crate::net::{ConnectContext, Socket};
use crate::resolve::{resolve, ResolveContext};
use crate::service::Service;

use stepio_core::context::{Context, OpContext};
use stepio_core::descriptor::{hook_of, Completion, Next};
use stepio_core::error::{Error, ErrorCode, Result};
use stepio_core::resumable::{as_resumable, Bound, Resumable};
use stepio_core::{impl_context, kdebug};

use std::ops::Deref;
use std::ptr::NonNull;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    OnStart,
    OnResolve,
    Attempt,
    OnConnect,
    Finished,
}

/// Resolve a name, then connect to each candidate in order until one
/// accepts. The outcome is the successful connect's, or the last
/// candidate's failure, or the resolution failure.
pub struct ResolveAndConnect {
    state: State,
    service: Option<Service>,
    host: String,
    port: String,
    data: *const u8,
    len: usize,
    resolve_ctx: Bound<ResolveContext>,
    connect_ctx: Bound<ConnectContext>,
    addrs: AddrList,
    cursor: usize,
    attempts: usize,
    sock: Option<Socket>,
    outcome: OpContext,
    owner: Option<NonNull<dyn Completion>>,
    sync: bool,
}

impl Default for ResolveAndConnect {
    fn default() -> Self {
        Self::new()
    }
}

impl ResolveAndConnect {
    pub fn new() -> Self {
        Self {
            state: State::Finished,
            service: None,
            host: String::new(),
            port: String::new(),
            data: std::ptr::null(),
            len: 0,
            resolve_ctx: Bound::new(ResolveContext::new()),
            connect_ctx: Bound::new(ConnectContext::new()),
            addrs: AddrList::default(),
            cursor: 0,
            attempts: 0,
            sock: None,
            outcome: OpContext::new(),
            owner: None,
            sync: true,
        }
    }

    /// Candidates tried so far.
    #[inline]
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.state == State::Finished
    }

    /// The connected socket, after success.
    pub fn take_socket(&mut self) -> Option<Socket> {
        self.sock.take()
    }

    /// Candidates from the last resolution.
    pub fn addrs(&self) -> &AddrList {
        &self.addrs
    }

    fn begin(&mut self, owner: NonNull<dyn Completion>, service: &Service, data: &[u8], state: State) {
        debug_assert!(self.is_finished(), "resolve-and-connect restarted while running");
        self.state = state;
        self.service = Some(service.clone());
        self.data = data.as_ptr();
        self.len = data.len();
        self.cursor = 0;
        self.attempts = 0;
        self.sock = None;
        self.outcome.init(owner);
        self.owner = Some(owner);
        self.sync = true;

        // Nothing is pending between runs, so the children may follow a move.
        let me = as_resumable(self);
        self.resolve_ctx.rebind(me);
        self.connect_ctx.rebind(me);
    }

    /// Run the first leg inline. `true` if it already finished.
    fn launch(&mut self) -> bool {
        let next = self.step();
        debug_assert!(next.is_done());
        self.sync
    }

    /// Socket for `cand`, bound to its family's wildcard address.
    fn open(&self, cand: &Candidate) -> Result<Socket> {
        let service = match self.service.as_ref() {
            Some(s) => s,
            None => return Err(Error::Os(libc::EBADF)),
        };
        let sock = Socket::new(service, cand.family, cand.socktype, cand.protocol)?;
        if let Some(any) = SockAddr::unspecified(cand.family) {
            sock.bind(&any)?;
        }
        Ok(sock)
    }

    fn finish(&mut self, error: Option<ErrorCode>, transferred: usize, flags: u32) -> Next {
        self.state = State::Finished;
        match error {
            Some(code) => self.outcome.fail_after(code, transferred, flags),
            None => self.outcome.succeed(transferred, flags),
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

impl Resumable for ResolveAndConnect {
    fn step(&mut self) -> Next {
        loop {
            match self.state {
                State::OnStart => {
                    self.state = State::OnResolve;
                    let Some(service) = self.service.clone() else {
                        return self.finish(Some(ErrorCode::Os(libc::EBADF)), 0, 0);
                    };
                    if !unsafe { resolve(&service, &self.host, &self.port, None, &mut self.resolve_ctx) } {
                        self.sync = false;
                        return Next::Done;
                    }
                }
                State::OnResolve => {
                    if let Some(code) = self.resolve_ctx.status() {
                        kdebug!("connect: resolving {}:{} failed: {}", self.host, self.port, code);
                        return self.finish(Some(code), 0, 0);
                    }
                    self.addrs = self.resolve_ctx.take_result();
                    if self.addrs.is_empty() {
                        return self.finish(Some(ErrorCode::Resolve(libc::EAI_NONAME)), 0, 0);
                    }
                    self.cursor = 0;
                    self.state = State::Attempt;
                }
                State::Attempt => {
                    let Some(cand) = self.addrs.get(self.cursor).copied() else {
                        return self.finish(Some(ErrorCode::Resolve(libc::EAI_NONAME)), 0, 0);
                    };
                    self.attempts += 1;
                    self.state = State::OnConnect;
                    match self.open(&cand) {
                        Ok(sock) => self.sock = Some(sock),
                        Err(e) => {
                            self.connect_ctx.fail(e.code());
                            continue;
                        }
                    }
                    // The caller keeps `data` alive until the outcome is delivered.
                    let data: &[u8] = if self.data.is_null() {
                        &[]
                    } else {
                        unsafe { std::slice::from_raw_parts(self.data, self.len) }
                    };
                    let Some(sock) = self.sock.as_ref() else { continue };
                    if !unsafe { sock.connect_and_send(&cand.addr, data, &mut self.connect_ctx) } {
                        self.sync = false;
                        return Next::Done;
                    }
                }
                State::OnConnect => {
                    let transferred = self.connect_ctx.transferred();
                    let flags = self.connect_ctx.flags();
                    if let Some(code) = self.connect_ctx.status() {
                        kdebug!(
                            "connect: candidate {}/{} ({}) failed: {}",
                            self.cursor + 1,
                            self.addrs.len(),
                            self.addrs.get(self.cursor).map(|c| c.addr.to_string()).unwrap_or_default(),
                            code
                        );
                        if let Some(mut sock) = self.sock.take() {
                            sock.close();
                        }
                        if self.cursor + 1 >= self.addrs.len() {
                            return self.finish(Some(code), transferred, flags);
                        }
                        self.cursor += 1;
                        self.state = State::Attempt;
                        continue;
                    }
                    return self.finish(None, transferred, flags);
                }
                State::Finished => {
                    debug_assert!(false, "resolve-and-connect stepped after finishing");
                    return Next::Done;
                }
            }
        }
    }
}

impl Deref for ResolveAndConnect {
    type Target = OpContext;

    fn deref(&self) -> &OpContext {
        &self.outcome
    }
}

impl Completion for ResolveAndConnect {
    /// The outcome was recorded by the final `step()`.
    fn complete(&mut self) -> Next {
        Next::Done
    }
}

impl_context!(ResolveAndConnect);

impl std::fmt::Debug for ResolveAndConnect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolveAndConnect")
            .field("state", &self.state)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("attempts", &self.attempts)
            .field("outcome", &self.outcome.status())
            .finish()
    }
}

/// Resolve `host` / `port`, connect to the first candidate that accepts,
/// and send `data` on it. The connected socket is left in the context
/// ([`ResolveAndConnect::take_socket`]).
///
/// # Safety
///
/// If this returns `false`, `data` and `ctx` must stay alive and unmoved
/// until the completion has been dispatched.
pub unsafe fn connect_and_send<C: Context<ResolveAndConnect>>(
    service: &Service,
    host: &str,
    port: &str,
    data: &[u8],
    ctx: &mut C,
) -> bool {
    let hook = hook_of(ctx);
    let rc = ctx.get_mut();
    rc.host.clear();
    rc.host.push_str(host);
    rc.port.clear();
    rc.port.push_str(port);
    rc.addrs = AddrList::default();
    rc.begin(hook, service, data, State::OnStart);
    rc.launch()
}

/// [`connect_and_send`] with nothing to send.
///
/// # Safety
///
/// As for `connect_and_send`.
pub unsafe fn connect<C: Context<ResolveAndConnect>>(
    service: &Service,
    host: &str,
    port: &str,
    ctx: &mut C,
) -> bool {
    connect_and_send(service, host, port, &[], ctx)
}

/// [`connect_and_send`] over an already resolved list. An empty list fails
/// like a resolution that found nothing.
///
/// # Safety
///
/// As for `connect_and_send`.
pub unsafe fn connect_and_send_addrs<C: Context<ResolveAndConnect>>(
    service: &Service,
    addrs: AddrList,
    data: &[u8],
    ctx: &mut C,
) -> bool {
    let hook = hook_of(ctx);
    let rc = ctx.get_mut();
    rc.host.clear();
    rc.port.clear();
    rc.begin(hook, service, data, State::OnResolve);
    rc.resolve_ctx.preset(addrs);
    rc.launch()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendKind, ServiceConfig};

    use std::io::Read;
    use std::net::{SocketAddr, TcpListener};

    fn poll_service() -> Service {
        Service::with_config(&ServiceConfig::new().backend(BackendKind::Poll)).unwrap()
    }

    fn closed_port() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    fn drive(svc: &Service, rc: &ResolveAndConnect) {
        while !rc.is_finished() {
            assert!(svc.run_one().unwrap());
        }
    }

    #[test]
    fn test_falls_back_to_last_candidate() {
        let svc = poll_service();
        let live = TcpListener::bind("127.0.0.1:0").unwrap();
        let addrs: AddrList = [closed_port(), closed_port(), live.local_addr().unwrap()]
            .into_iter()
            .collect();

        let mut rc = Box::new(ResolveAndConnect::new());
        let data = b"hello";
        if !unsafe { connect_and_send_addrs(&svc, addrs.clone(), data, &mut *rc) } {
            drive(&svc, &rc);
        }
        assert!(!rc.has_error(), "{:?}", rc.status());
        assert_eq!(rc.attempts(), 3);
        assert_eq!(rc.transferred(), data.len());

        let sock = rc.take_socket().unwrap();
        assert_eq!(sock.peer_addr().unwrap().to_std(), Some(live.local_addr().unwrap()));
        let (mut server, _) = live.accept().unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, data);
    }

    #[test]
    fn test_all_candidates_fail() {
        let svc = poll_service();
        let addrs: AddrList = [closed_port(), closed_port()].into_iter().collect();

        let mut rc = Box::new(ResolveAndConnect::new());
        if !unsafe { connect_and_send_addrs(&svc, addrs, b"x", &mut *rc) } {
            drive(&svc, &rc);
        }
        assert_eq!(rc.status(), Some(ErrorCode::Os(libc::ECONNREFUSED)));
        assert_eq!(rc.attempts(), 2);
        assert_eq!(rc.transferred(), 0);
        assert!(rc.take_socket().is_none());
    }

    #[test]
    fn test_empty_list_fails_like_resolution() {
        let svc = poll_service();
        let mut rc = Box::new(ResolveAndConnect::new());
        assert!(unsafe { connect_and_send_addrs(&svc, AddrList::default(), b"", &mut *rc) });
        assert_eq!(rc.status(), Some(ErrorCode::Resolve(libc::EAI_NONAME)));
        assert_eq!(rc.attempts(), 0);
        assert!(rc.take_socket().is_none());
    }

    #[test]
    fn test_resolution_failure_creates_no_socket() {
        let svc = poll_service();
        let mut rc = Box::new(ResolveAndConnect::new());
        if !unsafe { connect(&svc, "127.0.0.1", "stepio-no-such-service", &mut *rc) } {
            drive(&svc, &rc);
        }
        assert!(rc.has_error());
        assert_eq!(rc.attempts(), 0);
        assert!(rc.take_socket().is_none());
    }

    #[test]
    fn test_numeric_name_connects() {
        let svc = poll_service();
        let live = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = live.local_addr().unwrap().port().to_string();

        let mut rc = Box::new(ResolveAndConnect::new());
        if !unsafe { connect(&svc, "127.0.0.1", &port, &mut *rc) } {
            drive(&svc, &rc);
        }
        rc.check_error().unwrap();
        assert_eq!(rc.attempts(), 1);
        assert_eq!(rc.addrs().len(), 1);
        assert!(rc.take_socket().is_some());
    }

    #[test]
    fn test_reusable_after_finish() {
        let svc = poll_service();
        let mut rc = Box::new(ResolveAndConnect::new());
        let addrs: AddrList = [closed_port()].into_iter().collect();
        if !unsafe { connect_and_send_addrs(&svc, addrs, b"", &mut *rc) } {
            drive(&svc, &rc);
        }
        assert!(rc.has_error());

        let live = TcpListener::bind("127.0.0.1:0").unwrap();
        let addrs: AddrList = [live.local_addr().unwrap()].into_iter().collect();
        if !unsafe { connect_and_send_addrs(&svc, addrs, b"", &mut *rc) } {
            drive(&svc, &rc);
        }
        assert!(!rc.has_error());
        assert_eq!(rc.attempts(), 1);
    }

    fn open_fds() -> usize {
        std::fs::read_dir("/proc/self/fd").unwrap().count()
    }

    #[test]
    fn test_failed_candidates_closed_before_next_attempt() {
        let svc = poll_service();
        let live = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut targets: Vec<SocketAddr> = (0..64).map(|_| closed_port()).collect();
        targets.push(live.local_addr().unwrap());
        let addrs: AddrList = targets.into_iter().collect();

        let mut rc = Box::new(ResolveAndConnect::new());
        let before = open_fds();
        if !unsafe { connect_and_send_addrs(&svc, addrs, b"", &mut *rc) } {
            drive(&svc, &rc);
        }
        let after = open_fds();
        rc.check_error().unwrap();
        assert_eq!(rc.attempts(), 65);

        // Only the connected socket remains. Other tests may hold a few fds
        // of their own at either sample, far fewer than 64 leaked ones.
        assert!(after <= before + 1 + 24, "fds before={} after={}", before, after);
        let sock = rc.take_socket().unwrap();
        drop(sock);
        assert!(open_fds() <= before + 24);
    }

    #[test]
    fn test_unusable_candidate_counts_as_failed_attempt() {
        let svc = poll_service();
        let live = TcpListener::bind("127.0.0.1:0").unwrap();
        let live_addr = live.local_addr().unwrap();
        let unusable = Candidate { family: -1, ..Candidate::tcp(live_addr) };
        let addrs = AddrList::new(vec![unusable, Candidate::tcp(live_addr)]);

        let mut rc = Box::new(ResolveAndConnect::new());
        if !unsafe { connect_and_send_addrs(&svc, addrs, b"ok", &mut *rc) } {
            drive(&svc, &rc);
        }
        rc.check_error().unwrap();
        assert_eq!(rc.attempts(), 2);
        assert_eq!(rc.transferred(), 2);
        let sock = rc.take_socket().unwrap();
        assert_eq!(sock.peer_addr().unwrap().to_std(), Some(live_addr));
    }

    #[test]
    fn test_unusable_last_candidate_reports_socket_error() {
        let svc = poll_service();
        let unusable = Candidate { family: -1, ..Candidate::tcp(closed_port()) };
        let mut rc = Box::new(ResolveAndConnect::new());
        assert!(unsafe { connect_and_send_addrs(&svc, AddrList::new(vec![unusable]), b"", &mut *rc) });
        assert!(matches!(rc.status(), Some(ErrorCode::Os(_))));
        assert_eq!(rc.attempts(), 1);
        assert!(rc.take_socket().is_none());
    }

    #[test]
    fn test_reusable_after_move() {
        let svc = poll_service();
        let mut rc = Box::new(ResolveAndConnect::new());
        let addrs: AddrList = [closed_port()].into_iter().collect();
        if !unsafe { connect_and_send_addrs(&svc, addrs, b"", &mut *rc) } {
            drive(&svc, &rc);
        }
        assert!(rc.has_error());

        // Finished, so it may move; the next run follows it.
        let mut moved = Box::new(*rc);
        let live = TcpListener::bind("127.0.0.1:0").unwrap();
        let addrs: AddrList = [closed_port(), live.local_addr().unwrap()].into_iter().collect();
        if !unsafe { connect_and_send_addrs(&svc, addrs, b"", &mut *moved) } {
            drive(&svc, &moved);
        }
        moved.check_error().unwrap();
        assert_eq!(moved.attempts(), 2);
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Phase {
        Start,
        OnConnect,
        Finished,
    }

    /// Owner embedding the compound operation as a bound context.
    struct Client {
        phase: Phase,
        svc: Service,
        addrs: AddrList,
        rc: Bound<ResolveAndConnect>,
        resumes: usize,
    }

    impl Resumable for Client {
        fn step(&mut self) -> Next {
            loop {
                match self.phase {
                    Phase::Start => {
                        self.phase = Phase::OnConnect;
                        let addrs = self.addrs.clone();
                        if !unsafe { connect_and_send_addrs(&self.svc, addrs, b"", &mut self.rc) } {
                            return Next::Done;
                        }
                    }
                    Phase::OnConnect => {
                        self.resumes += 1;
                        self.phase = Phase::Finished;
                        return Next::Done;
                    }
                    Phase::Finished => unreachable!("stepped after finishing"),
                }
            }
        }
    }

    #[test]
    fn test_owner_resumed_once_after_async_fallback() {
        let svc = poll_service();
        let live = TcpListener::bind("127.0.0.1:0").unwrap();
        let addrs: AddrList = [closed_port(), live.local_addr().unwrap()].into_iter().collect();

        let mut client = Box::new(Client {
            phase: Phase::Start,
            svc: svc.clone(),
            addrs,
            rc: Bound::new(ResolveAndConnect::new()),
            resumes: 0,
        });
        let me = as_resumable(&mut *client);
        client.rc.bind(me);

        client.step();
        while client.phase != Phase::Finished {
            assert!(svc.run_one().unwrap());
        }
        assert_eq!(client.resumes, 1);
        assert!(!client.rc.has_error());
        assert_eq!(client.rc.attempts(), 2);
        assert_eq!(client.addrs.holders(), 2);
    }
}
