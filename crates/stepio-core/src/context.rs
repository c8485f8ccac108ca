//! Operation context: a descriptor plus the outcome of one primitive.

use crate::descriptor::{Completion, Descriptor, Next};
use crate::entry::Key;
use crate::error::{Error, ErrorCode, Result};

use std::ptr::NonNull;

/// Per-call state holding the outcome of one asynchronous primitive.
///
/// Lifecycle: `init` immediately before issuing, written exactly once by
/// the completion path (inline on the fast path, or by `complete()` when
/// the service delivers it), read by the owner afterwards.
#[derive(Debug, Default)]
pub struct OpContext {
    desc: Descriptor,
    error: Option<ErrorCode>,
    transferred: usize,
    flags: u32,
}

impl OpContext {
    pub const fn new() -> Self {
        Self { desc: Descriptor::new(), error: None, transferred: 0, flags: 0 }
    }

    /// Reset the outcome and arm the descriptor for `owner`.
    pub fn init(&mut self, owner: NonNull<dyn Completion>) -> Key {
        debug_assert!(!self.desc.is_pending(), "context re-issued before its completion arrived");
        self.error = None;
        self.transferred = 0;
        self.flags = 0;
        self.desc.arm(owner)
    }

    #[inline]
    pub fn descriptor(&self) -> &Descriptor {
        &self.desc
    }

    #[inline]
    pub fn descriptor_mut(&mut self) -> &mut Descriptor {
        &mut self.desc
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.desc.is_pending()
    }

    #[inline]
    pub fn status(&self) -> Option<ErrorCode> {
        self.error
    }

    #[inline]
    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// `Err(Error::Op(code))` if the operation completed with an error.
    pub fn check_error(&self) -> Result<()> {
        match self.error {
            Some(code) => Err(Error::Op(code)),
            None => Ok(()),
        }
    }

    #[inline]
    pub fn transferred(&self) -> usize {
        self.transferred
    }

    #[inline]
    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn succeed(&mut self, transferred: usize, flags: u32) {
        self.error = None;
        self.transferred = transferred;
        self.flags = flags;
    }

    pub fn fail(&mut self, code: ErrorCode) {
        self.fail_after(code, 0, 0);
    }

    /// Failure that still moved some bytes (e.g. a piggy-backed send).
    pub fn fail_after(&mut self, code: ErrorCode, transferred: usize, flags: u32) {
        self.error = Some(code);
        self.transferred = transferred;
        self.flags = flags;
    }

    /// Translate the descriptor's raw result into the outcome fields.
    pub fn record(&mut self) {
        let res = self.desc.result();
        if res < 0 {
            self.fail(ErrorCode::Os(-res));
        } else {
            self.succeed(res as usize, self.desc.flags());
        }
    }
}

impl Completion for OpContext {
    fn complete(&mut self) -> Next {
        self.record();
        Next::Done
    }
}

/// Access to a context of type `T` inside a (possibly wrapped) context.
///
/// Primitives are generic over `C: Context<T>` so they can arm the
/// descriptor with the outermost hook (`C`) while filling in `T`.
pub trait Context<T>: Completion + 'static {
    fn get(&self) -> &T;
    fn get_mut(&mut self) -> &mut T;
}

/// Implement the reflexive `Context<T> for T`.
#[macro_export]
macro_rules! impl_context {
    ($($ty:ty),* $(,)?) => {
        $(
            impl $crate::context::Context<$ty> for $ty {
                #[inline]
                fn get(&self) -> &$ty {
                    self
                }

                #[inline]
                fn get_mut(&mut self) -> &mut $ty {
                    self
                }
            }
        )*
    };
}

impl_context!(OpContext);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::hook_of;

    fn pending(ctx: &mut Box<OpContext>) -> Key {
        let owner = hook_of(&mut **ctx);
        let key = ctx.init(owner);
        ctx.descriptor_mut().mark_pending();
        key
    }

    #[test]
    fn test_record_success() {
        let mut ctx = Box::new(OpContext::new());
        let key = pending(&mut ctx);
        let hook = unsafe { Descriptor::deliver(key, 128, 0) }.unwrap();
        unsafe { Next::Complete(hook).run() };
        assert!(!ctx.has_error());
        assert_eq!(ctx.transferred(), 128);
        assert!(ctx.check_error().is_ok());
    }

    #[test]
    fn test_record_error() {
        let mut ctx = Box::new(OpContext::new());
        let key = pending(&mut ctx);
        let hook = unsafe { Descriptor::deliver(key, -libc::ECONNRESET, 0) }.unwrap();
        unsafe { Next::Complete(hook).run() };
        assert_eq!(ctx.status(), Some(ErrorCode::Os(libc::ECONNRESET)));
        assert_eq!(ctx.transferred(), 0);
        assert!(matches!(ctx.check_error(), Err(Error::Op(ErrorCode::Os(e))) if e == libc::ECONNRESET));
    }

    #[test]
    fn test_init_clears_previous_outcome() {
        let mut ctx = Box::new(OpContext::new());
        ctx.fail_after(ErrorCode::Os(libc::EPIPE), 10, 1);
        let owner = hook_of(&mut *ctx);
        ctx.init(owner);
        assert!(!ctx.has_error());
        assert_eq!(ctx.transferred(), 0);
        assert_eq!(ctx.flags(), 0);
    }

    #[test]
    fn test_reflexive_context() {
        fn touch<C: Context<OpContext>>(c: &mut C) {
            c.get_mut().succeed(3, 0);
        }
        let mut ctx = OpContext::new();
        touch(&mut ctx);
        assert_eq!(ctx.get().transferred(), 3);
    }
}
