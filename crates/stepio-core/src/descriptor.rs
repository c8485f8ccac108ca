//! Completion descriptor, completion hook and continuation.
//!
//! A [`Descriptor`] plays the role an `OVERLAPPED` plays for IOCP: the
//! backend is handed its address (as a [`Key`]) and reports it back when
//! the operation finishes. The descriptor remembers which [`Completion`]
//! hook owns it; the service records the raw result into the descriptor
//! and runs that hook.
//!
//! Hooks never call into their owning operation directly. They return a
//! [`Next`] and the dispatcher runs it, so a context embedded in an
//! operation is never mutably borrowed at the same time as the operation.

use crate::entry::Key;
use crate::resumable::Resumable;

use std::ptr::NonNull;

/// Completion hook, invoked once per delivered completion.
pub trait Completion {
    /// Record the outcome and say what runs next.
    fn complete(&mut self) -> Next;
}

/// What the dispatcher runs after a hook or a step returns.
#[derive(Debug, Clone, Copy)]
pub enum Next {
    Done,
    /// Call `step()` on this operation.
    Resume(NonNull<dyn Resumable>),
    /// Call `complete()` on this hook (a compound operation finished).
    Complete(NonNull<dyn Completion>),
}

impl Next {
    #[inline]
    pub fn is_done(&self) -> bool {
        matches!(self, Next::Done)
    }

    /// Run continuations until one returns [`Next::Done`].
    ///
    /// # Safety
    ///
    /// Every operation and hook reached through the chain must be alive, at
    /// the address it was bound with, and not borrowed elsewhere.
    pub unsafe fn run(self) {
        let mut next = self;
        loop {
            next = match next {
                Next::Done => return,
                Next::Resume(mut op) => op.as_mut().step(),
                Next::Complete(mut hook) => hook.as_mut().complete(),
            };
        }
    }
}

/// Erase a concrete context into the hook pointer stored in its descriptor.
///
/// Pass the *outermost* context (e.g. the `Bound<..>` wrapper), so the
/// descriptor runs the wrapper's hook rather than the inner one.
#[inline]
pub fn hook_of<C: Completion + 'static>(ctx: &mut C) -> NonNull<dyn Completion> {
    let hook: &mut (dyn Completion + 'static) = ctx;
    NonNull::from(hook)
}

/// The token for one in-flight request.
///
/// Must not move while pending: its address is the completion key.
#[derive(Debug, Default)]
pub struct Descriptor {
    result: i32,
    flags: u32,
    pending: bool,
    owner: Option<NonNull<dyn Completion>>,
}

impl Descriptor {
    pub const fn new() -> Self {
        Self { result: 0, flags: 0, pending: false, owner: None }
    }

    /// Reset for a new request owned by `owner`. Returns the completion key.
    pub fn arm(&mut self, owner: NonNull<dyn Completion>) -> Key {
        debug_assert!(!self.pending, "descriptor re-armed while a completion is outstanding");
        self.result = 0;
        self.flags = 0;
        self.owner = Some(owner);
        self.key()
    }

    #[inline]
    pub fn key(&self) -> Key {
        Key::from_ptr(self as *const Self)
    }

    /// The request was accepted by the backend; a completion will follow.
    #[inline]
    pub fn mark_pending(&mut self) {
        self.pending = true;
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Raw result as reported by the backend (value or negative errno).
    #[inline]
    pub fn result(&self) -> i32 {
        self.result
    }

    #[inline]
    pub fn flags(&self) -> u32 {
        self.flags
    }

    #[inline]
    pub fn owner(&self) -> Option<NonNull<dyn Completion>> {
        self.owner
    }

    /// Record a completion for the descriptor named by `key` and return
    /// the hook that must run next.
    ///
    /// # Safety
    ///
    /// `key` must be the key of a live, pending descriptor.
    pub unsafe fn deliver(key: Key, result: i32, flags: u32) -> Option<NonNull<dyn Completion>> {
        let desc = key.as_ptr::<Descriptor>();
        debug_assert!((*desc).pending, "completion delivered for a descriptor that is not pending");
        (*desc).result = result;
        (*desc).flags = flags;
        (*desc).pending = false;
        (*desc).owner
    }
}
