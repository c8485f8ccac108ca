//! # stepio: Completion service, backends and socket primitives
//!
//! This crate provides the runtime pieces for the protocol defined in
//! `stepio-core`.
//!
//! ## Default stack
//!
//! | Concern              | Default              | Alternative            |
//! |----------------------|----------------------|------------------------|
//! | Completion facility  | UringBackend         | PollBackend (fallback) |
//! | Cross-thread posting | PostQueue (eventfd)  |                        |
//! | Name resolution      | getaddrinfo thread   | numeric inline         |
//!
//! ## Modules
//!
//! - `config` - `ServiceConfig` with env overrides
//! - `waker` - posted events and the `Remote` handle
//! - `backend` - io_uring and poll backends
//! - `service` - the completion multiplexer
//! - `addr` - socket addresses and candidate lists
//! - `net` - non-blocking sockets and their async primitives
//! - `resolve` - name resolution
//! - `connect` - resolve-and-connect with fallback
//! - `accept` - accept-and-receive

pub mod config;
pub mod waker;
pub mod backend;
pub mod service;
pub mod addr;
pub mod net;
pub mod resolve;
pub mod connect;
pub mod accept;

pub use config::{BackendKind, ServiceConfig};
pub use waker::Remote;
pub use service::Service;
pub use addr::{AddrList, Candidate, SockAddr};
pub use net::{AcceptContext, ConnectContext, MsgContext, Socket};
pub use resolve::{resolve, Hints, ResolveContext};
pub use connect::ResolveAndConnect;
pub use accept::{accept_and_receive, AcceptAndReceive};
