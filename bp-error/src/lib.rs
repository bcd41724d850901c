#![deny(missing_docs)]

//! This crate defines error & result types for the BP storage engine.
//! It also contains a variety of useful macros for error handling.

mod ext;

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::fmt::{Debug, Display, Formatter};
use std::ops::Deref;
use std::{env, fmt, io};

pub use ext::*;

/// A string that can be used as an error message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrString(Cow<'static, str>);

#[allow(clippy::fallible_impl_from)]
impl<T> From<T> for ErrString
where
    T: Into<Cow<'static, str>>,
{
    #[allow(clippy::panic)]
    fn from(msg: T) -> Self {
        if env::var("BP_PANIC_ON_ERR")
            .map(|v| v == "1" || v == "true")
            .unwrap_or(false)
        {
            panic!("{}\nBacktrace:\n{}", msg.into(), Backtrace::capture());
        } else {
            Self(msg.into())
        }
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

/// The top-level error type for the BP storage engine.
#[derive(thiserror::Error)]
#[non_exhaustive]
pub enum BpError {
    /// The dataset was written with a version or byte order this build cannot read.
    #[error("incompatible format: {0}\nBacktrace:\n{1}")]
    IncompatibleFormat(ErrString, Box<Backtrace>),
    /// The dataset, or one of its files, did not appear within the deadline.
    #[error("not found: {0}\nBacktrace:\n{1}")]
    NotFound(ErrString, Box<Backtrace>),
    /// A transport returned fewer bytes than requested.
    #[error(
        "short read on {subfile} at offset {offset}: expected {expected} bytes, got {actual}"
    )]
    IoTruncated {
        /// The subfile (or file name) that was being read.
        subfile: ErrString,
        /// The absolute byte offset of the read.
        offset: u64,
        /// The number of bytes requested.
        expected: u64,
        /// The number of bytes the transport produced.
        actual: u64,
    },
    /// A block uses a codec that is not compiled into this build.
    #[error("unsupported codec {0}\nBacktrace:\n{1}")]
    UnsupportedCodec(ErrString, Box<Backtrace>),
    /// The caller violated a precondition of the API or of the engine's state machine.
    #[error("{0}\nBacktrace:\n{1}")]
    InvalidArgument(ErrString, Box<Backtrace>),
    /// A communicator operation failed.
    #[error("communicator error: {0}\nBacktrace:\n{1}")]
    Comm(ErrString, Box<Backtrace>),
    /// An index or length was out of bounds.
    #[error("index {0} out of bounds from {1} to {2}\nBacktrace:\n{3}")]
    OutOfBounds(usize, usize, usize, Box<Backtrace>),
    /// A generic error.
    #[error("{0}\nBacktrace:\n{1}")]
    Generic(ErrString, Box<Backtrace>),
    /// A wrapper for other errors, carrying additional context.
    #[error("{0}: {1}")]
    Context(ErrString, #[source] Box<BpError>),
    /// A wrapper for IO errors.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// A wrapper for errors from the flexbuffers serializer.
    #[cfg(feature = "flexbuffers")]
    #[error(transparent)]
    FlexbufferSerialization(#[from] flexbuffers::SerializationError),
    /// A wrapper for errors from the flexbuffers deserializer.
    #[cfg(feature = "flexbuffers")]
    #[error(transparent)]
    FlexbufferDeserialization(#[from] flexbuffers::DeserializationError),
    /// A wrapper for errors from the serde_json crate.
    #[cfg(feature = "serde")]
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl BpError {
    /// Adds additional context to an error.
    pub fn with_context<T: Into<ErrString>>(self, msg: T) -> Self {
        BpError::Context(msg.into(), Box::new(self))
    }

    /// The innermost error, skipping any [`BpError::Context`] wrappers.
    pub fn root_cause(&self) -> &BpError {
        match self {
            BpError::Context(_, inner) => inner.root_cause(),
            other => other,
        }
    }

    /// Whether the root cause of this error is a missing dataset or file.
    pub fn is_not_found(&self) -> bool {
        matches!(self.root_cause(), BpError::NotFound(..))
    }
}

impl Debug for BpError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// A type alias for Results that return BpErrors as their error type.
pub type BpResult<T> = Result<T, BpError>;

/// A trait for unwrapping a BpResult.
pub trait BpUnwrap {
    /// The type of the value being unwrapped.
    type Output;

    /// Returns the value of the result if it is Ok, otherwise panics with the error.
    /// Should be called only in contexts where the error condition represents a bug (programmer error).
    fn bp_unwrap(self) -> Self::Output;
}

impl<T, E> BpUnwrap for Result<T, E>
where
    E: Into<BpError>,
{
    type Output = T;

    #[inline(always)]
    fn bp_unwrap(self) -> Self::Output {
        self.map_err(|err| err.into())
            .unwrap_or_else(|err| bp_panic!(err))
    }
}

/// A trait for expect-ing a BpResult or an Option.
pub trait BpExpect {
    /// The type of the value being expected.
    type Output;

    /// Returns the value of the result if it is Ok, otherwise panics with the error.
    /// Should be called only in contexts where the error condition represents a bug (programmer error).
    fn bp_expect(self, msg: &str) -> Self::Output;
}

impl<T, E> BpExpect for Result<T, E>
where
    E: Into<BpError>,
{
    type Output = T;

    #[inline(always)]
    fn bp_expect(self, msg: &str) -> Self::Output {
        self.map_err(|err| err.into())
            .unwrap_or_else(|e| bp_panic!(e.with_context(msg.to_string())))
    }
}

impl<T> BpExpect for Option<T> {
    type Output = T;

    #[inline(always)]
    fn bp_expect(self, msg: &str) -> Self::Output {
        self.unwrap_or_else(|| {
            let err = BpError::Generic(msg.to_string().into(), Box::new(Backtrace::capture()));
            bp_panic!(err)
        })
    }
}

/// A convenient macro for creating a BpError.
#[macro_export]
macro_rules! bp_err {
    (IncompatibleFormat: $($tts:tt)*) => {{
        use std::backtrace::Backtrace;
        $crate::BpError::IncompatibleFormat(
            format!($($tts)*).into(),
            Box::new(Backtrace::capture()),
        )
    }};
    (NotFound: $($tts:tt)*) => {{
        use std::backtrace::Backtrace;
        $crate::BpError::NotFound(format!($($tts)*).into(), Box::new(Backtrace::capture()))
    }};
    (UnsupportedCodec: $($tts:tt)*) => {{
        use std::backtrace::Backtrace;
        $crate::BpError::UnsupportedCodec(
            format!($($tts)*).into(),
            Box::new(Backtrace::capture()),
        )
    }};
    (InvalidArgument: $($tts:tt)*) => {{
        use std::backtrace::Backtrace;
        $crate::BpError::InvalidArgument(
            format!($($tts)*).into(),
            Box::new(Backtrace::capture()),
        )
    }};
    (Comm: $($tts:tt)*) => {{
        use std::backtrace::Backtrace;
        $crate::BpError::Comm(format!($($tts)*).into(), Box::new(Backtrace::capture()))
    }};
    (OutOfBounds: $idx:expr, $start:expr, $stop:expr) => {{
        use std::backtrace::Backtrace;
        $crate::BpError::OutOfBounds($idx, $start, $stop, Box::new(Backtrace::capture()))
    }};
    (IoTruncated: $subfile:expr, $offset:expr, $expected:expr, $actual:expr) => {{
        $crate::BpError::IoTruncated {
            subfile: $subfile.into(),
            offset: $offset,
            expected: $expected,
            actual: $actual,
        }
    }};
    (Context: $msg:literal, $err:expr) => {{
        $crate::BpError::Context($msg.into(), Box::new($err))
    }};
    ($fmt:literal $(, $arg:expr)* $(,)?) => {{
        use std::backtrace::Backtrace;
        $crate::BpError::Generic(
            format!($fmt, $($arg),*).into(),
            Box::new(Backtrace::capture()),
        )
    }};
}

/// A convenient macro for returning a BpError.
#[macro_export]
macro_rules! bp_bail {
    ($($tt:tt)+) => {
        return Err($crate::bp_err!($($tt)+))
    };
}

/// A convenient macro for panicking with a BpError in the presence of a programmer error
/// (e.g., an invariant has been violated).
#[macro_export]
macro_rules! bp_panic {
    (OutOfBounds: $idx:expr, $start:expr, $stop:expr) => {{
        $crate::bp_panic!($crate::bp_err!(OutOfBounds: $idx, $start, $stop))
    }};
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::bp_panic!($crate::bp_err!($fmt, $($arg),*))
    };
    ($err:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {{
        let err: $crate::BpError = $err;
        panic!("{}", err.with_context(format!($fmt, $($arg),*)))
    }};
    ($err:expr) => {{
        let err: $crate::BpError = $err;
        panic!("{}", err)
    }};
}
