//! # stepio-core: Types and traits for resumable-operation I/O
//!
//! This crate defines the protocol every stepio component speaks.
//! It contains no backend code; `stepio` provides the io_uring/poll
//! backends, the completion service and the socket primitives.
//!
//! ## The model
//!
//! ```text
//!   Resumable::step()  ──issue primitive with Bound<Ctx>──►  Socket
//!        ▲                                                    │
//!        │ true: fall through (fast path)                     │ false: pending
//!        │                                                    ▼
//!   Next::Resume ◄── Bound::complete() ◄── Descriptor ◄── Service::run_*()
//! ```
//!
//! - A [`Descriptor`](descriptor::Descriptor) is the token the OS facility
//!   reports back; its address is the completion [`Key`](entry::Key).
//! - An [`OpContext`](context::OpContext) wraps a descriptor and records the
//!   outcome (error, bytes transferred, flags).
//! - A [`Bound`](resumable::Bound) context additionally remembers which
//!   [`Resumable`](resumable::Resumable) operation to resume.
//! - Hooks and steps return [`Next`](descriptor::Next); the dispatcher runs
//!   the chain on its own frame so no two `&mut` to one operation overlap.
//!
//! Nothing here allocates per operation: contexts are plain fields of the
//! operation that owns them.
//!
//! ## Modules
//!
//! - `entry` - completion keys, events, backend operations
//! - `descriptor` - completion descriptor, completion hook, continuation
//! - `context` - operation context and the `Context<T>` access trait
//! - `resumable` - resumable operations and bound contexts
//! - `backend` - OS completion facility abstraction
//! - `error` - error types
//! - `kprint` - leveled stderr logging macros
//! - `env` - environment variable utilities

pub mod entry;
pub mod descriptor;
pub mod context;
pub mod resumable;
pub mod backend;
pub mod error;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use entry::{Event, Key, Op};
pub use descriptor::{hook_of, Completion, Descriptor, Next};
pub use context::{Context, OpContext};
pub use resumable::{as_resumable, Bound, Resumable};
pub use backend::Backend;
pub use error::{Error, ErrorCode, Result};
pub use env::{env_get, env_get_bool, env_get_str};
