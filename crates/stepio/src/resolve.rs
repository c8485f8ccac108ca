//! Name resolution.
//!
//! Numeric hosts and services resolve inline (`AI_NUMERICHOST |
//! AI_NUMERICSERV`), which is the fast path. Anything else runs
//! `getaddrinfo` on a short-lived thread; the thread leaves its result in a
//! slot shared with the context and posts a completion keyed by the
//! context's descriptor, so the hook runs on the service thread like any
//! other completion.

use crate::addr::AddrList;
use crate::service::Service;

use stepio_core::context::{Context, OpContext};
use stepio_core::descriptor::{hook_of, Completion, Next};
use stepio_core::error::{errno, ErrorCode};
use stepio_core::{impl_context, kdebug, kerror, ktrace};

use std::ffi::CString;
use std::ops::Deref;
use std::sync::{Arc, Mutex};

type Lookup = std::result::Result<AddrList, ErrorCode>;

/// `getaddrinfo` hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hints {
    pub family: i32,
    pub socktype: i32,
    pub protocol: i32,
    pub flags: i32,
}

impl Default for Hints {
    /// Any family, stream sockets.
    fn default() -> Self {
        Self {
            family: libc::AF_UNSPEC,
            socktype: libc::SOCK_STREAM,
            protocol: 0,
            flags: 0,
        }
    }
}

/// Context for [`resolve`]: the outcome plus the candidate list.
#[derive(Debug, Default)]
pub struct ResolveContext {
    op: OpContext,
    result: AddrList,
    slot: Option<Arc<Mutex<Option<Lookup>>>>,
}

impl ResolveContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Candidates from the last successful resolution.
    pub fn result(&self) -> &AddrList {
        &self.result
    }

    pub fn take_result(&mut self) -> AddrList {
        std::mem::take(&mut self.result)
    }

    /// Complete with an already resolved list.
    pub(crate) fn preset(&mut self, list: AddrList) {
        self.slot = None;
        self.finish(Ok(list));
    }

    fn finish(&mut self, lookup: Lookup) {
        match lookup {
            Ok(list) => {
                self.result = list;
                self.op.succeed(0, 0);
            }
            Err(code) => {
                self.result = AddrList::default();
                self.op.fail(code);
            }
        }
    }
}

impl Deref for ResolveContext {
    type Target = OpContext;

    fn deref(&self) -> &OpContext {
        &self.op
    }
}

impl Completion for ResolveContext {
    fn complete(&mut self) -> Next {
        let staged = self
            .slot
            .take()
            .and_then(|slot| slot.lock().ok().and_then(|mut s| s.take()));
        match staged {
            Some(lookup) => self.finish(lookup),
            None => self.finish(Err(ErrorCode::Resolve(libc::EAI_FAIL))),
        }
        Next::Done
    }
}

impl_context!(ResolveContext);

/// Resolve `host` / `port` into candidate endpoints.
///
/// Returns `true` if resolved (or failed) inline, `false` if the lookup runs
/// in the background and the context's hook will be dispatched by `service`.
/// An empty `host` means the local wildcard.
///
/// # Safety
///
/// If this returns `false`, `ctx` must stay alive and unmoved until the
/// completion has been dispatched.
pub unsafe fn resolve<C: Context<ResolveContext>>(
    service: &Service,
    host: &str,
    port: &str,
    hints: Option<&Hints>,
    ctx: &mut C,
) -> bool {
    let hook = hook_of(ctx);
    let rc = ctx.get_mut();
    let key = rc.op.init(hook);
    rc.result = AddrList::default();
    rc.slot = None;
    let hints = hints.copied().unwrap_or_default();

    if host.contains('\0') || port.contains('\0') {
        rc.finish(Err(ErrorCode::Resolve(libc::EAI_NONAME)));
        return true;
    }

    match lookup(host, port, &hints, libc::AI_NUMERICHOST | libc::AI_NUMERICSERV) {
        Ok(list) => {
            rc.finish(Ok(list));
            return true;
        }
        // Not numeric: needs a real lookup.
        Err(ErrorCode::Resolve(libc::EAI_NONAME)) => {}
        Err(code) => {
            rc.finish(Err(code));
            return true;
        }
    }

    let slot = Arc::new(Mutex::new(None));
    let remote = service.remote();
    let staged = slot.clone();
    let (h, p) = (host.to_string(), port.to_string());
    let spawned = std::thread::Builder::new()
        .name("stepio-resolve".into())
        .spawn(move || {
            let res = lookup(&h, &p, &hints, 0);
            ktrace!("resolve: {}:{} -> {:?}", h, p, res.as_ref().map(|l| l.len()));
            if let Ok(mut s) = staged.lock() {
                *s = Some(res);
            }
            if let Err(e) = remote.complete(key, 0) {
                kerror!("resolve: posting completion for {}:{} failed: {}", h, p, e);
            }
        });

    match spawned {
        Ok(_) => {
            rc.slot = Some(slot);
            rc.op.descriptor_mut().mark_pending();
            false
        }
        Err(e) => {
            kdebug!("resolve: could not start lookup thread: {}", e);
            rc.finish(Err(ErrorCode::Os(e.raw_os_error().unwrap_or(libc::EAGAIN))));
            true
        }
    }
}

/// Blocking `getaddrinfo`.
fn lookup(host: &str, port: &str, hints: &Hints, extra_flags: i32) -> Lookup {
    let c_host = CString::new(host).map_err(|_| ErrorCode::Resolve(libc::EAI_NONAME))?;
    let c_port = CString::new(port).map_err(|_| ErrorCode::Resolve(libc::EAI_SERVICE))?;

    let mut ai: libc::addrinfo = unsafe { std::mem::zeroed() };
    ai.ai_family = hints.family;
    ai.ai_socktype = hints.socktype;
    ai.ai_protocol = hints.protocol;
    ai.ai_flags = hints.flags | extra_flags;

    let host_ptr = if host.is_empty() { std::ptr::null() } else { c_host.as_ptr() };
    let port_ptr = if port.is_empty() { std::ptr::null() } else { c_port.as_ptr() };
    let mut res: *mut libc::addrinfo = std::ptr::null_mut();

    let rc = unsafe { libc::getaddrinfo(host_ptr, port_ptr, &ai, &mut res) };
    if rc != 0 {
        if rc == libc::EAI_SYSTEM {
            return Err(ErrorCode::Os(errno()));
        }
        return Err(ErrorCode::Resolve(rc));
    }
    let list = unsafe { AddrList::from_addrinfo(res) };
    unsafe { libc::freeaddrinfo(res) };
    Ok(list)
}
