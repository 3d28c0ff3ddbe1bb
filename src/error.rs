// Copyright 2022-2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error and verification traits

use std::error::Error;
use std::fmt;
use std::io;
use std::rc::Rc;

#[cfg(feature = "serde")]
use serde::Deserialize;
#[cfg(feature = "serde")]
use serde::Serialize;

/// Enum for possible decoder errors.
///
/// All variants are terminal for the operation that returned them. Checksum
/// mismatches are not errors; they are counted by [`Decoder`].
///
/// [`Decoder`]: crate::decoder::Decoder
#[non_exhaustive]
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Debug)]
pub enum DecodeError {
    /// A variant that indicates a format error in the input stream.
    Format(FormatError),
    /// A variant that indicates a (premature) end of the input stream.
    StreamEnded,
    /// Errors other than end-of-file reported by the byte source.
    Source(SourceError),
    /// Decoder errors due to invalid configuration.
    Config(VerifyError),
}

impl DecodeError {
    /// Constructs an error object that indicates the end of input stream.
    pub const fn stream_ended() -> Self {
        Self::StreamEnded
    }

    /// Returns true if error is due to the end of input.
    ///
    /// `StreamEnded` error is the usual way a stream finishes when the
    /// total number of samples is not recorded in the headers.
    pub const fn is_stream_ended(&self) -> bool {
        match self {
            Self::StreamEnded => true,
            Self::Format(_) | Self::Source(_) | Self::Config(_) => false,
        }
    }

    /// Converts an I/O error from the byte source.
    ///
    /// `UnexpectedEof` is mapped to [`DecodeError::StreamEnded`].
    pub(crate) fn from_io(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Self::StreamEnded
        } else {
            Self::Source(SourceError::from_io_error(e))
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Format(e) => e.fmt(f),
            Self::StreamEnded => write!(f, "input stream ended prematurely"),
            Self::Source(e) => e.fmt(f),
            Self::Config(e) => e.fmt(f),
        }
    }
}

impl Error for DecodeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Format(e) => Some(e),
            Self::Source(e) => Some(e),
            Self::Config(e) => Some(e),
            Self::StreamEnded => None,
        }
    }
}

impl From<FormatError> for DecodeError {
    fn from(e: FormatError) -> Self {
        Self::Format(e)
    }
}

impl From<SourceError> for DecodeError {
    fn from(e: SourceError) -> Self {
        Self::Source(e)
    }
}

impl From<VerifyError> for DecodeError {
    fn from(e: VerifyError) -> Self {
        Self::Config(e)
    }
}

/// An error type for input format error.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
#[allow(clippy::module_name_repetitions)]
pub struct FormatError {
    /// Byte offset from the start of the source where the error was found.
    location_in_bytes: u64,
    /// Message that described the reason.
    message: String,
}

impl FormatError {
    /// Constructs new `FormatError`.
    ///
    /// # Examples
    ///
    /// ```
    /// # use wvdec::error::*;
    /// let err = FormatError::new(64, "unsupported version");
    /// assert_eq!(
    ///     format!("{}", err),
    ///     "input format error detected at byte 64. (reason=unsupported version)"
    /// );
    /// ```
    pub fn new(location_in_bytes: u64, message: &str) -> Self {
        Self {
            location_in_bytes,
            message: message.to_owned(),
        }
    }

    /// Returns the byte offset where the error was detected.
    pub const fn location(&self) -> u64 {
        self.location_in_bytes
    }

    /// Returns the reason of the error.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "input format error detected at byte {}. (reason={})",
            self.location_in_bytes, self.message
        )
    }
}

impl Error for FormatError {}

/// Struct that wraps I/O errors from the byte source.
#[derive(Clone, Debug)]
#[allow(clippy::module_name_repetitions)]
pub struct SourceError {
    reason: SourceErrorReason,
}

impl SourceError {
    /// Constructs `SourceError` from an [`io::Error`].
    ///
    /// # Examples
    ///
    /// ```
    /// # use wvdec::error::*;
    /// # use std::io;
    /// let err = SourceError::from_io_error(io::Error::new(io::ErrorKind::Other, "oh no!"));
    /// assert_eq!(
    ///     format!("{}", err),
    ///     "error occurred while reading the source. reason: I/O error: oh no!."
    /// );
    /// ```
    pub fn from_io_error<E: Error + 'static>(e: E) -> Self {
        Self {
            reason: SourceErrorReason::IO(Some(Rc::new(e))),
        }
    }

    /// Returns the reason of the error.
    pub const fn reason(&self) -> &SourceErrorReason {
        &self.reason
    }
}

/// Enum covering possible error reasons from the byte source.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum SourceErrorReason {
    /// Other IO-related error.
    IO(Option<Rc<dyn Error + 'static>>),
}

impl Error for SourceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        None
    }
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "error occurred while reading the source. reason: {}.",
            self.reason
        )
    }
}

impl fmt::Display for SourceErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IO(Some(cause)) => {
                write!(f, "I/O error: {cause}")
            }
            Self::IO(None) => {
                write!(f, "unknown I/O error")
            }
        }
    }
}

/// Error object returned when config integrity verification failed.
///
/// This error maintains a path to the component that is actually erroneous
/// in the nested components.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
#[allow(clippy::module_name_repetitions)]
pub struct VerifyError {
    components: Vec<String>,
    reason: String,
}

impl VerifyError {
    /// Makes verification error for an invalid variable `component`.
    ///
    /// # Examples
    ///
    /// ```
    /// # use wvdec::error::*;
    /// let err = VerifyError::new("resync_limit", "must be positive");
    /// assert_eq!(
    ///     format!("{}", err),
    ///     "verification error: `resync_limit` is not valid. reason: must be positive"
    /// );
    /// ```
    pub fn new(component: &str, reason: &str) -> Self {
        Self {
            components: vec![component.to_owned()],
            reason: reason.to_owned(),
        }
    }

    /// Prepends the name of an enclosing component to the error location.
    ///
    /// # Examples
    ///
    /// ```
    /// # use wvdec::error::*;
    /// let err = VerifyError::new("resync_limit", "must be positive");
    /// let err = err.within("decoder");
    /// assert_eq!(
    ///     format!("{}", err),
    ///     "verification error: `decoder.resync_limit` is not valid. reason: must be positive"
    /// );
    /// ```
    #[must_use]
    pub fn within(self, component: &str) -> Self {
        let mut components = self.components;
        let reason = self.reason;
        components.push(component.to_owned());
        Self { components, reason }
    }

    /// Gets dot-separated path string for the error location.
    pub fn path(&self) -> String {
        let mut path = String::new();
        for (i, name) in self.components.iter().rev().enumerate() {
            if i != 0 {
                path.push('.');
            }
            path.push_str(name);
        }
        path
    }
}

impl Error for VerifyError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        None
    }
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "verification error: `{}` is not valid. reason: {}",
            self.path(),
            self.reason
        )
    }
}

/// A wrapper that ensures that the inner `T` is verified and unchanged.
///
/// `Verified<T>` can be obtained via [`Verify::into_verified`].
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct Verified<T>(T);

impl<T> std::ops::Deref for Verified<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.0
    }
}

/// Trait for verifiable structs.
pub trait Verify: Sized + seal_verify::Sealed {
    /// Verifies there's no internal data inconsistency.
    ///
    /// # Errors
    ///
    /// Returns `VerifyError` if there's an invalid variable.
    ///
    /// # Examples
    ///
    /// [`config::Decoder`] implements `Verify`.
    ///
    /// [`config::Decoder`]: crate::config::Decoder
    ///
    /// ```
    /// # use wvdec::error::*;
    /// # use wvdec::config::Decoder;
    /// let mut config = Decoder::default();
    /// config.bitstream_buffer_size = 0;  // invalid setting
    /// assert!(config.verify().is_err());
    ///
    /// config.bitstream_buffer_size = 4096; // valid setting
    /// assert!(config.verify().is_ok());
    /// ```
    fn verify(&self) -> Result<(), VerifyError>;

    /// Wraps into `Verified` to indicate that the data is already verified.
    ///
    /// # Errors
    ///
    /// Returns the original input and `VerifyError` if `verify` failed.
    fn into_verified(self) -> Result<Verified<Self>, (Self, VerifyError)> {
        let result = self.verify();
        if let Err(e) = result {
            Err((self, e))
        } else {
            Ok(Verified(self))
        }
    }
}

/// A wrapping function to make it compatible with "?" operator.
pub(crate) fn verify_macro_impl(cond: bool, varname: &str, msg: &str) -> Result<(), VerifyError> {
    if !cond {
        return Err(VerifyError::new(varname, msg));
    }
    Ok(())
}

/// Checks if `$cond` is true and do `return Err(...)` if so.
///
/// An error object `VerifyErr` is constructed using `$varname` and
/// `$msg` that are formatted using the extra args (`$args`).
macro_rules! verify_true {
    ($varname:literal, $cond:expr, $msg:literal, $($args: expr),*) => {
        crate::error::verify_macro_impl(
            $cond,
            &format!($varname, $($args),*),
            &format!($msg, $($args),*),
        )
    };
    ($varname:literal, $cond:expr, $msg:literal) => {
        verify_true!($varname, $cond, $msg,)
    }
}
pub(crate) use verify_true;

/// Checks if `$actual` is in the range, and emits err with default msgs if not.
///
/// An error is constructed using the same way as [`verify_true`].
macro_rules! verify_range {
    ($varname: literal, $actual:expr, $lowlimit:tt ..= $highlimit:tt) => {
        verify_range!($varname, $actual, ($lowlimit)..)
            .and_then(|()| verify_range!($varname, $actual, ..=($highlimit)))
    };
    ($varname: literal, $actual:expr, $lowlimit:tt ..) => {{
        #[allow(unused_parens)]
        let limit = $lowlimit;
        verify_true!(
            $varname,
            $actual >= limit,
            "must be greater than or equal to {limit}"
        )
    }};
    ($varname: literal, $actual:expr, ..= $highlimit:tt) => {{
        #[allow(unused_parens)]
        let limit = $highlimit;
        verify_true!(
            $varname,
            $actual <= limit,
            "must be less than or equal to {limit}"
        )
    }};
}
pub(crate) use verify_range;

mod seal_verify {
    pub trait Sealed {}

    impl Sealed for crate::config::Decoder {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eof_is_mapped_to_stream_ended() {
        let err = DecodeError::from_io(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"));
        assert!(err.is_stream_ended());

        let err = DecodeError::from_io(io::Error::new(io::ErrorKind::Other, "broken pipe"));
        assert!(!err.is_stream_ended());
        assert!(matches!(err, DecodeError::Source(_)));
    }

    #[test]
    fn io_errors_keep_their_cause() {
        let err = DecodeError::from_io(io::Error::new(io::ErrorKind::Other, "disk gone"));
        let DecodeError::Source(source) = err else {
            panic!("expected a source error");
        };
        assert!(matches!(source.reason(), SourceErrorReason::IO(Some(_))));
        assert_eq!(
            source.to_string(),
            "error occurred while reading the source. reason: I/O error: disk gone."
        );
    }

    #[test]
    fn verify_error_path() {
        let err = VerifyError::new("resync_limit", "must be positive")
            .within("decoder")
            .within("root");
        assert_eq!(err.path(), "root.decoder.resync_limit");
    }

    #[test]
    fn format_error_is_exposed_as_source() {
        let err: DecodeError = FormatError::new(3, "bad").into();
        assert!(err.source().is_some());
        assert_eq!(format!("{err}"), "input format error detected at byte 3. (reason=bad)");
    }
}
