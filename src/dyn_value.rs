//! Type erasure helpers used by the interpreter (see [`crate::eff`]).
//!
//! `Eff<E, A, R>` is a GADT-shaped algebra: a `Chain` node's continuation
//! produces an effect whose success type can differ at every step. Rust has
//! no GADTs, so the interpreter's continuation stack (`Frame`, in
//! [`crate::interpreter`]) erases the in-flight success value behind a
//! type-erased box and the public, fully-typed `Eff<E, A, R>` wrapper
//! downcasts back at the boundary. Frames are pushed and popped in strict
//! LIFO order by the same code that produced them, so the downcasts here can
//! never observe the wrong concrete type; see `interpreter::run` for the
//! invariant.

use std::any::Any;

/// A type-erased success value flowing through the interpreter.
pub(crate) type AnyValue = Box<dyn AnyClone>;

/// Object-safe `Any + Clone`.
///
/// A fiber's result may be observed by more than one caller: multiple
/// `join`/`await` subscribers, or `Await::get` calls made after the cell has
/// already been populated (see `sync::Await`). A type-erased value can't be
/// cloned without knowing its concrete type, so every success value that
/// flows through the interpreter is required to implement `Clone` and is
/// boxed behind this trait rather than plain `Any`. This is a deliberate,
/// uniform simplification over splitting erased values into Clone/non-Clone
/// paths; see `DESIGN.md`.
pub(crate) trait AnyClone: Any {
    fn clone_box(&self) -> Box<dyn AnyClone>;
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Any + Clone> AnyClone for T {
    fn clone_box(&self) -> Box<dyn AnyClone> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

impl Clone for Box<dyn AnyClone> {
    fn clone(&self) -> Self {
        self.as_ref().clone_box()
    }
}

pub(crate) fn boxed<T: Any + Clone>(value: T) -> AnyValue {
    Box::new(value)
}

/// Downcasts an erased value back to its concrete type, consuming it.
///
/// # Panics
///
/// Panics if `T` doesn't match the value's concrete type. This should be
/// unreachable in practice: every `AnyValue` on the continuation stack was
/// put there by the same combinator that pops it, so the type always
/// matches by construction.
pub(crate) fn downcast<T: 'static>(value: AnyValue) -> T {
    let any = value.into_any();
    match any.downcast::<T>() {
        Ok(value) => *value,
        Err(_) => unreachable!(
            "interpreter stack discipline guarantees frames only ever see the type that pushed them"
        ),
    }
}

/// Borrowing counterpart of [`downcast`], used by `Access` to read the
/// current environment without consuming it.
pub(crate) fn downcast_ref<T: 'static>(value: &AnyValue) -> &T {
    match value.as_any().downcast_ref::<T>() {
        Some(value) => value,
        None => unreachable!(
            "interpreter env-stack discipline guarantees every Access site sees the R that Provide/unsafe_run installed"
        ),
    }
}
