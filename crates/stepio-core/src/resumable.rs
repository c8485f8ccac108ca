//! Resumable operations and bound contexts.
//!
//! A resumable operation is an explicit state machine: a resume-point enum
//! plus whatever locals must survive a suspension, all stored in the
//! operation itself. Its `step()` is re-entrant and picks up at the last
//! recorded resume point.
//!
//! ```ignore
//! fn step(&mut self) -> Next {
//!     loop {
//!         match self.state {
//!             State::Start => {
//!                 self.state = State::OnRecv;          // record next point first
//!                 if !unsafe { self.sock.receive(&mut self.buf, 0, &mut self.ctx) } {
//!                     return Next::Done;               // pending: resumed later
//!                 }                                    // fast path: fall through
//!             }
//!             State::OnRecv => { /* read self.ctx */ return Next::Done; }
//!         }
//!     }
//! }
//! ```
//!
//! A [`Bound`] context is how an operation embeds child I/O: its completion
//! hook records the child's outcome, then resumes the operation.

use crate::context::Context;
use crate::descriptor::{Completion, Next};

use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

/// A unit of logic that can suspend at well-defined points.
pub trait Resumable {
    /// Advance from the current resume point until the next suspension
    /// or a terminal state.
    fn step(&mut self) -> Next;
}

/// Erase an operation into the back-reference a [`Bound`] context stores.
#[inline]
pub fn as_resumable<R: Resumable + 'static>(op: &mut R) -> NonNull<dyn Resumable> {
    let op: &mut (dyn Resumable + 'static) = op;
    NonNull::from(op)
}

/// A context bound to the operation it resumes.
///
/// The back-reference is set once with [`bind`](Bound::bind), after the
/// owning operation has reached its final address, and never reassigned.
/// The operation must outlive the context; declaring the context as a
/// field of that operation guarantees this.
#[derive(Debug, Default)]
pub struct Bound<C> {
    inner: C,
    op: Option<NonNull<dyn Resumable>>,
}

impl<C> Bound<C> {
    pub const fn new(inner: C) -> Self {
        Self { inner, op: None }
    }

    /// Attach the owning operation. Binding again to the same operation is a
    /// no-op; binding to a different one is a bug.
    pub fn bind(&mut self, op: NonNull<dyn Resumable>) {
        debug_assert!(
            self.op.map_or(true, |cur| std::ptr::addr_eq(cur.as_ptr(), op.as_ptr())),
            "bound context re-bound to a different operation"
        );
        self.op = Some(op);
    }

    /// Attach to `op` even if bound elsewhere before, for an owner that
    /// moved since its last run. The context must have no completion
    /// outstanding.
    pub fn rebind(&mut self, op: NonNull<dyn Resumable>) {
        self.op = Some(op);
    }

    #[inline]
    pub fn is_bound(&self) -> bool {
        self.op.is_some()
    }

    pub fn into_inner(self) -> C {
        self.inner
    }
}

impl<C> Deref for Bound<C> {
    type Target = C;

    #[inline]
    fn deref(&self) -> &C {
        &self.inner
    }
}

impl<C> DerefMut for Bound<C> {
    #[inline]
    fn deref_mut(&mut self) -> &mut C {
        &mut self.inner
    }
}

impl<C: Completion> Completion for Bound<C> {
    fn complete(&mut self) -> Next {
        let inner = self.inner.complete();
        debug_assert!(inner.is_done(), "inner context of a Bound tried to continue on its own");
        match self.op {
            Some(op) => Next::Resume(op),
            None => {
                debug_assert!(false, "completion delivered to an unbound context");
                Next::Done
            }
        }
    }
}

impl<T, C: Context<T>> Context<T> for Bound<C> {
    #[inline]
    fn get(&self) -> &T {
        self.inner.get()
    }

    #[inline]
    fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::OpContext;
    use crate::descriptor::{hook_of, Descriptor};
    use crate::entry::Key;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum State {
        Start,
        OnFirst,
        OnSecond,
        Finished,
    }

    /// Issues two fake I/Os; the first completes inline, the second pends.
    struct TwoStep {
        state: State,
        ctx: Bound<OpContext>,
        visits: Vec<(State, usize)>,
        pending_key: Option<Key>,
    }

    impl TwoStep {
        fn new() -> Box<Self> {
            let mut op = Box::new(Self {
                state: State::Start,
                ctx: Bound::new(OpContext::new()),
                visits: Vec::new(),
                pending_key: None,
            });
            let me = as_resumable(&mut *op);
            op.ctx.bind(me);
            op
        }

        fn issue(&mut self, inline: Option<usize>) -> bool {
            let hook = hook_of(&mut self.ctx);
            let key = self.ctx.init(hook);
            match inline {
                Some(n) => {
                    self.ctx.succeed(n, 0);
                    true
                }
                None => {
                    self.ctx.descriptor_mut().mark_pending();
                    self.pending_key = Some(key);
                    false
                }
            }
        }
    }

    impl Resumable for TwoStep {
        fn step(&mut self) -> Next {
            loop {
                self.visits.push((self.state, self.ctx.transferred()));
                match self.state {
                    State::Start => {
                        self.state = State::OnFirst;
                        if !self.issue(Some(5)) {
                            return Next::Done;
                        }
                    }
                    State::OnFirst => {
                        self.state = State::OnSecond;
                        if !self.issue(None) {
                            return Next::Done;
                        }
                    }
                    State::OnSecond => {
                        self.state = State::Finished;
                        return Next::Done;
                    }
                    State::Finished => unreachable!("stepped after termination"),
                }
            }
        }
    }

    #[test]
    fn test_fast_path_falls_through_without_yielding() {
        let mut op = TwoStep::new();
        assert!(op.step().is_done());
        // Start -> OnFirst ran in one call; suspended at OnSecond.
        assert_eq!(op.visits, vec![(State::Start, 0), (State::OnFirst, 5)]);
        assert_eq!(op.state, State::OnSecond);
        assert!(op.ctx.is_pending());
    }

    #[test]
    fn test_bound_hook_resumes_exactly_once_at_recorded_point() {
        let mut op = TwoStep::new();
        op.step();
        let key = op.pending_key.take().unwrap();

        let hook = unsafe { Descriptor::deliver(key, 64, 0) }.unwrap();
        unsafe { Next::Complete(hook).run() };

        assert_eq!(op.state, State::Finished);
        assert_eq!(op.visits.len(), 3);
        assert_eq!(op.visits[2], (State::OnSecond, 64));
    }

    #[test]
    fn test_bind_same_operation_twice() {
        let mut op = TwoStep::new();
        let me = as_resumable(&mut *op);
        op.ctx.bind(me);
        assert!(op.ctx.is_bound());
    }

    #[test]
    fn test_bound_exposes_inner_context() {
        fn transferred<C: Context<OpContext>>(c: &C) -> usize {
            c.get().transferred()
        }
        let mut b = Bound::new(OpContext::new());
        b.succeed(11, 0);
        assert_eq!(transferred(&b), 11);
        assert!(!b.is_bound());
    }
}
