#![deny(missing_docs)]
#![feature(error_generic_member_access)]

//! Error handling for the flatwire crates.
//!
//! Every failure in the runtime is a [`FlatError`]. Format errors, contract violations and
//! capacity errors are raised as soon as the offending structure is touched and are never
//! retried. The validator is the only component that reports problems as a value instead of an
//! error, see `flatwire::validate`.

mod ext;

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::fmt::{Debug, Display, Formatter};
use std::ops::Deref;
use std::{fmt, io};

pub use ext::*;

/// A string that can be used as an error message.
#[derive(Debug)]
pub struct ErrString(Cow<'static, str>);

impl<T> From<T> for ErrString
where
    T: Into<Cow<'static, str>>,
{
    fn from(msg: T) -> Self {
        Self(msg.into())
    }
}

impl AsRef<str> for ErrString {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for ErrString {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for ErrString {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// The top-level error type for flatwire.
#[derive(thiserror::Error)]
#[non_exhaustive]
pub enum FlatError {
    /// An index or byte range was outside of a buffer.
    #[error("index {0} out of bounds from {1} to {2}\nBacktrace:\n{3}")]
    OutOfBounds(usize, usize, usize, Backtrace),
    /// The bytes do not describe a well-formed FlatBuffer.
    #[error("invalid format: {0}\nBacktrace:\n{1}")]
    InvalidFormat(ErrString, Backtrace),
    /// An attempt was made to mutate an object or collection that does not allow it.
    #[error("not mutable: {0}\nBacktrace:\n{1}")]
    NotMutable(ErrString, Backtrace),
    /// An operation that violates the contract of the object it was invoked on.
    #[error("invalid operation: {0}\nBacktrace:\n{1}")]
    InvalidOperation(ErrString, Backtrace),
    /// A pinned buffer was used after it had been released.
    #[error("buffer accessed after release\nBacktrace:\n{0}")]
    Disposed(Backtrace),
    /// A write needed more space than the output buffer had.
    #[error("buffer too small: required {0} bytes but only {1} are available\nBacktrace:\n{2}")]
    BufferTooSmall(usize, usize, Backtrace),
    /// A schema description is inconsistent.
    #[error("invalid schema: {0}\nBacktrace:\n{1}")]
    InvalidSchema(ErrString, Backtrace),
    /// An argument was invalid.
    #[error("{0}\nBacktrace:\n{1}")]
    InvalidArgument(ErrString, Backtrace),
    /// A value did not have the type its field declares.
    #[error("expected type: {0} but instead got {1}\nBacktrace:\n{2}")]
    MismatchedTypes(ErrString, ErrString, Backtrace),
    /// An assertion failed.
    #[error("{0}\nBacktrace:\n{1}")]
    AssertionFailed(ErrString, Backtrace),
    /// A wrapper for other errors, carrying additional context.
    #[error("{0}: {1}")]
    Context(ErrString, Box<FlatError>),
    /// A wrapper for UTF-8 decoding errors.
    #[error(transparent)]
    Utf8Error(#[from] std::str::Utf8Error),
    /// A wrapper for IO errors.
    #[error(transparent)]
    IOError(#[from] io::Error),
}

impl FlatError {
    /// Adds additional context to an error.
    pub fn with_context<T: Into<ErrString>>(self, msg: T) -> Self {
        FlatError::Context(msg.into(), Box::new(self))
    }

    /// Returns the innermost error, skipping over any context wrappers.
    pub fn root_cause(&self) -> &FlatError {
        match self {
            FlatError::Context(_, inner) => inner.root_cause(),
            other => other,
        }
    }

    /// Returns true if this error (ignoring context) is a format error.
    pub fn is_format_error(&self) -> bool {
        matches!(self.root_cause(), FlatError::InvalidFormat(..))
    }

    /// Returns true if this error (ignoring context) reports a failed mutation.
    pub fn is_not_mutable(&self) -> bool {
        matches!(self.root_cause(), FlatError::NotMutable(..))
    }
}

impl Debug for FlatError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// A type alias for Results that return [`FlatError`]s as their error type.
pub type FlatResult<T> = Result<T, FlatError>;

/// A trait for unwrapping a result or option, panicking with a [`FlatError`] on failure.
pub trait FlatExpect {
    /// The type of the value being expected.
    type Output;

    /// Returns the value, or panics with the given message and the underlying error as context.
    ///
    /// Only for invariants that cannot fail once the surrounding code has checked its inputs.
    fn flat_expect(self, msg: &str) -> Self::Output;
}

impl<T, E> FlatExpect for Result<T, E>
where
    E: Into<FlatError>,
{
    type Output = T;

    #[inline(always)]
    #[allow(clippy::panic)]
    fn flat_expect(self, msg: &str) -> Self::Output {
        self.map_err(|err| err.into())
            .unwrap_or_else(|e| crate::flat_panic!(e.with_context(msg.to_string())))
    }
}

impl<T> FlatExpect for Option<T> {
    type Output = T;

    #[inline(always)]
    #[allow(clippy::panic)]
    fn flat_expect(self, msg: &str) -> Self::Output {
        self.unwrap_or_else(|| {
            let err = FlatError::AssertionFailed(msg.to_string().into(), Backtrace::capture());
            crate::flat_panic!(err)
        })
    }
}

/// Construct a new [`FlatError`].
#[macro_export]
macro_rules! flat_err {
    (OutOfBounds: $idx:expr, $start:expr, $stop:expr) => {{
        use std::backtrace::Backtrace;
        $crate::__private::must_use(
            $crate::FlatError::OutOfBounds($idx, $start, $stop, Backtrace::capture())
        )
    }};
    (BufferTooSmall: $required:expr, $available:expr) => {{
        use std::backtrace::Backtrace;
        $crate::__private::must_use(
            $crate::FlatError::BufferTooSmall($required, $available, Backtrace::capture())
        )
    }};
    (Disposed) => {{
        use std::backtrace::Backtrace;
        $crate::__private::must_use($crate::FlatError::Disposed(Backtrace::capture()))
    }};
    (MismatchedTypes: $expected:literal, $actual:expr) => {{
        use std::backtrace::Backtrace;
        $crate::__private::must_use(
            $crate::FlatError::MismatchedTypes($expected.into(), $actual.to_string().into(), Backtrace::capture())
        )
    }};
    (MismatchedTypes: $expected:expr, $actual:expr) => {{
        use std::backtrace::Backtrace;
        $crate::__private::must_use(
            $crate::FlatError::MismatchedTypes($expected.to_string().into(), $actual.to_string().into(), Backtrace::capture())
        )
    }};
    (Context: $msg:literal, $err:expr) => {{
        $crate::__private::must_use(
            $crate::FlatError::Context($msg.into(), Box::new($err))
        )
    }};
    ($variant:ident: $fmt:literal $(, $arg:expr)* $(,)?) => {{
        use std::backtrace::Backtrace;
        $crate::__private::must_use(
            $crate::FlatError::$variant(format!($fmt, $($arg),*).into(), Backtrace::capture())
        )
    }};
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::flat_err!(InvalidArgument: $fmt, $($arg),*)
    };
}

/// Constructs a new [`FlatError`] and returns it as an `Err` from the enclosing function.
#[macro_export]
macro_rules! flat_bail {
    ($($tt:tt)+) => {
        return Err($crate::flat_err!($($tt)+))
    };
}

/// Panics with a [`FlatError`] constructed from the arguments.
///
/// Only for states that are unreachable by construction.
#[macro_export]
macro_rules! flat_panic {
    (OutOfBounds: $idx:expr, $start:expr, $stop:expr) => {{
        $crate::flat_panic!($crate::flat_err!(OutOfBounds: $idx, $start, $stop))
    }};
    ($variant:ident: $fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::flat_panic!($crate::flat_err!($variant: $fmt, $($arg),*))
    };
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::flat_panic!($crate::flat_err!($fmt, $($arg),*))
    };
    ($err:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {{
        let err: $crate::FlatError = $err;
        panic!("{}", err.with_context(format!($fmt, $($arg),*)))
    }};
    ($err:expr) => {{
        let err: $crate::FlatError = $err;
        panic!("{}", err)
    }};
}

#[doc(hidden)]
pub mod __private {
    #[doc(hidden)]
    #[inline]
    #[cold]
    #[must_use]
    pub const fn must_use(error: crate::FlatError) -> crate::FlatError {
        error
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn fails() -> FlatResult<()> {
        flat_bail!(InvalidFormat: "vtable length {} is odd", 5)
    }

    #[test]
    fn bail_builds_variant() {
        let err = fails().unwrap_err();
        assert!(err.is_format_error());
        assert!(err.to_string().contains("vtable length 5 is odd"));
    }

    #[test]
    fn context_keeps_root_cause() {
        let err = flat_err!(NotMutable: "vector is read-only").with_context("setting index 3");
        assert!(err.is_not_mutable());
        assert!(err.to_string().starts_with("setting index 3"));
    }

    #[test]
    fn context_ext_wraps_only_errors() {
        assert!(Ok::<_, FlatError>(1).context(|| "unused").is_ok());
        let err = fails().context(|| format!("reading table {}", 2)).unwrap_err();
        assert!(err.is_format_error());
        assert!(err.to_string().starts_with("reading table 2"));
    }

    #[test]
    fn out_of_bounds_message() {
        let err = flat_err!(OutOfBounds: 12, 0, 8);
        assert!(err.to_string().starts_with("index 12 out of bounds from 0 to 8"));
    }

    #[test]
    #[should_panic]
    fn expect_panics_on_none() {
        let value: Option<u8> = None;
        value.flat_expect("value must be present");
    }
}
