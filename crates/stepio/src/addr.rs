//! Socket addresses and resolved candidate lists.

use std::fmt;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::Arc;

/// A raw socket address of any family, as the kernel sees it.
#[derive(Clone, Copy)]
pub struct SockAddr {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
}

impl SockAddr {
    /// Copy `len` bytes of a kernel-provided address.
    ///
    /// # Safety
    ///
    /// `addr` must point to at least `len` readable bytes.
    pub unsafe fn from_raw(addr: *const libc::sockaddr, len: libc::socklen_t) -> Self {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let len = (len as usize).min(mem::size_of::<libc::sockaddr_storage>());
        std::ptr::copy_nonoverlapping(addr as *const u8, &mut storage as *mut _ as *mut u8, len);
        Self { storage, len: len as libc::socklen_t }
    }

    /// The wildcard address of `family`, port 0. Used to bind a socket
    /// before connecting it.
    pub fn unspecified(family: i32) -> Option<Self> {
        match family {
            libc::AF_INET => Some(Self::from_std(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)))),
            libc::AF_INET6 => Some(Self::from_std(SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0)))),
            _ => None,
        }
    }

    pub fn from_std(addr: SocketAddr) -> Self {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let len = match addr {
            SocketAddr::V4(v4) => {
                let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_port = v4.port().to_be();
                sin.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
                mem::size_of::<libc::sockaddr_in>()
            }
            SocketAddr::V6(v6) => {
                let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = v6.port().to_be();
                sin6.sin6_flowinfo = v6.flowinfo();
                sin6.sin6_addr.s6_addr = v6.ip().octets();
                sin6.sin6_scope_id = v6.scope_id();
                mem::size_of::<libc::sockaddr_in6>()
            }
        };
        Self { storage, len: len as libc::socklen_t }
    }

    /// `None` for families other than IPv4/IPv6.
    pub fn to_std(&self) -> Option<SocketAddr> {
        match self.family() {
            libc::AF_INET => {
                let sin = unsafe { &*(&self.storage as *const _ as *const libc::sockaddr_in) };
                let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
                Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
            }
            libc::AF_INET6 => {
                let sin6 = unsafe { &*(&self.storage as *const _ as *const libc::sockaddr_in6) };
                Some(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                    u16::from_be(sin6.sin6_port),
                    sin6.sin6_flowinfo,
                    sin6.sin6_scope_id,
                )))
            }
            _ => None,
        }
    }

    #[inline]
    pub fn family(&self) -> i32 {
        self.storage.ss_family as i32
    }

    #[inline]
    pub fn as_ptr(&self) -> *const libc::sockaddr {
        &self.storage as *const _ as *const libc::sockaddr
    }

    #[inline]
    pub fn len(&self) -> libc::socklen_t {
        self.len
    }
}

impl From<SocketAddr> for SockAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::from_std(addr)
    }
}

impl PartialEq for SockAddr {
    fn eq(&self, other: &Self) -> bool {
        let a = unsafe { std::slice::from_raw_parts(self.as_ptr() as *const u8, self.len as usize) };
        let b = unsafe { std::slice::from_raw_parts(other.as_ptr() as *const u8, other.len as usize) };
        a == b
    }
}

impl Eq for SockAddr {}

impl fmt::Debug for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_std() {
            Some(addr) => write!(f, "{}", addr),
            None => write!(f, "<family {}>", self.family()),
        }
    }
}

impl fmt::Display for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One endpoint to try: what `socket()` needs plus where to connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub family: i32,
    pub socktype: i32,
    pub protocol: i32,
    pub addr: SockAddr,
}

impl Candidate {
    /// A TCP candidate for `addr`.
    pub fn tcp(addr: SocketAddr) -> Self {
        let addr = SockAddr::from_std(addr);
        Self {
            family: addr.family(),
            socktype: libc::SOCK_STREAM,
            protocol: libc::IPPROTO_TCP,
            addr,
        }
    }
}

/// Ordered, immutable candidate list produced by resolution.
///
/// Cheap to clone; the list is freed when the last holder drops it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddrList {
    items: Option<Arc<[Candidate]>>,
}

impl AddrList {
    pub fn new(items: Vec<Candidate>) -> Self {
        if items.is_empty() {
            return Self { items: None };
        }
        Self { items: Some(items.into()) }
    }

    /// Build from `getaddrinfo` output. Entries without an address are
    /// skipped.
    ///
    /// # Safety
    ///
    /// `head` must be null or a list returned by `getaddrinfo` that has not
    /// been freed.
    pub unsafe fn from_addrinfo(head: *const libc::addrinfo) -> Self {
        let mut items = Vec::new();
        let mut cur = head;
        while !cur.is_null() {
            let ai = &*cur;
            if !ai.ai_addr.is_null() {
                items.push(Candidate {
                    family: ai.ai_family,
                    socktype: ai.ai_socktype,
                    protocol: ai.ai_protocol,
                    addr: SockAddr::from_raw(ai.ai_addr, ai.ai_addrlen),
                });
            }
            cur = ai.ai_next;
        }
        Self::new(items)
    }

    pub fn as_slice(&self) -> &[Candidate] {
        match &self.items {
            Some(items) => items,
            None => &[],
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_none()
    }

    #[inline]
    pub fn get(&self, i: usize) -> Option<&Candidate> {
        self.as_slice().get(i)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Candidate> {
        self.as_slice().iter()
    }

    /// Holders of this list, this one included. Zero for an empty list.
    pub fn holders(&self) -> usize {
        self.items.as_ref().map_or(0, Arc::strong_count)
    }
}

impl FromIterator<SocketAddr> for AddrList {
    fn from_iter<I: IntoIterator<Item = SocketAddr>>(iter: I) -> Self {
        Self::new(iter.into_iter().map(Candidate::tcp).collect())
    }
}
