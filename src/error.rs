//! Error types.
//!
//! Internally the crate works with `anyhow` (`Res<T>`). Anything that crosses the public API is
//! converted into an [`Error`] that carries an [`ErrorType`] so callers can tell a broken input
//! batch apart from a tampered document.

use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display, Formatter};

/// Result type used inside the crate.
pub(crate) type Res<T> = anyhow::Result<T>;

/// Result type returned from public functions.
pub type Result<T> = std::result::Result<T, Error>;

/// The category of a public error.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// A record is missing a required field or carries a value that cannot be parsed. The whole
    /// batch is rejected.
    InputContractViolation,
    /// The masking token namespace collided with the document or was exhausted.
    MaskingConflict,
    /// A document contains a masking token that the mask map does not know about.
    UnmaskMismatch,
    /// The transformed document does not reconcile with the document that was sent out.
    ReconciliationDiscrepancy,
    /// The external transform failed or timed out.
    Transform,
    /// The configuration or the home directory is missing or invalid.
    Config,
    /// Reading or writing run files failed.
    Storage,
}

serde_plain::derive_display_from_serialize!(ErrorType);

/// A public error: an `anyhow` chain tagged with an [`ErrorType`].
pub struct Error {
    error_type: ErrorType,
    inner: anyhow::Error,
}

impl Error {
    pub(crate) fn new(error_type: ErrorType, inner: anyhow::Error) -> Self {
        Self { error_type, inner }
    }

    /// Shorthand for building an error from a message.
    pub(crate) fn msg(error_type: ErrorType, message: impl Display) -> Self {
        Self::new(error_type, anyhow::anyhow!("{message}"))
    }

    pub fn error_type(&self) -> ErrorType {
        self.error_type
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} error: {:?}", self.error_type, self.inner)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // The alternate form prints the whole context chain.
        write!(f, "{}: {:#}", self.error_type, self.inner)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

/// Converts an internal `Res<T>` into a public `Result<T>`.
pub(crate) trait IntoResult<T> {
    fn pub_result(self, error_type: ErrorType) -> Result<T>;
}

impl<T> IntoResult<T> for Res<T> {
    fn pub_result(self, error_type: ErrorType) -> Result<T> {
        self.map_err(|e| match e.downcast::<Error>() {
            // Keep the more specific type if one was already assigned further down.
            Ok(typed) => typed,
            Err(e) => Error::new(error_type, e),
        })
    }
}
