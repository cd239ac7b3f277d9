//! Error types shared by the connection, message and recipient handles.
//!
//! Every failure carries an [`ErrorKind`] mirroring the submission engine's
//! error codes, the human readable text the engine (or this crate) produced,
//! and the [`Subject`] that failed.

use core::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Code used for failures raised by this crate rather than by the engine.
pub const LOCAL_CODE: i32 = 255;

/// Classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    OutOfMemory,
    IllegalState,
    IllegalArgument,
    Security,
    Io,
    Service,
    EmailAddress,
    /// A native object could not be allocated.
    LocalBinding,
    /// A mutator was called on a recipient that is bound to a message.
    LockedObject,
    /// An engine code outside the documented set.
    Unknown(i32),
}

impl ErrorKind {
    /// Map an engine error code onto a kind.
    #[must_use]
    pub const fn from_code(code: i32) -> Self {
        match code {
            1 => Self::OutOfMemory,
            2 => Self::IllegalState,
            3 => Self::IllegalArgument,
            4 => Self::Security,
            5 => Self::Io,
            6 => Self::Service,
            7 => Self::EmailAddress,
            LOCAL_CODE => Self::LocalBinding,
            other => Self::Unknown(other),
        }
    }

    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::OutOfMemory => 1,
            Self::IllegalState => 2,
            Self::IllegalArgument => 3,
            Self::Security => 4,
            Self::Io => 5,
            Self::Service => 6,
            Self::EmailAddress => 7,
            Self::LocalBinding | Self::LockedObject => LOCAL_CODE,
            Self::Unknown(code) => code,
        }
    }

    /// Returns `true` if the failure never reached the engine.
    #[must_use]
    pub const fn is_local(self) -> bool {
        matches!(self, Self::LocalBinding | Self::LockedObject)
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => f.write_str("out of memory"),
            Self::IllegalState => f.write_str("illegal state"),
            Self::IllegalArgument => f.write_str("illegal argument"),
            Self::Security => f.write_str("security"),
            Self::Io => f.write_str("i/o"),
            Self::Service => f.write_str("service"),
            Self::EmailAddress => f.write_str("email address"),
            Self::LocalBinding => f.write_str("local binding failure"),
            Self::LockedObject => f.write_str("locked object"),
            Self::Unknown(code) => write!(f, "unknown ({code})"),
        }
    }
}

/// The kind of handle an error was reported on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subject {
    Connection,
    Message,
    Recipient,
}

impl Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connection => "connection",
            Self::Message => "message",
            Self::Recipient => "recipient",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{subject} error ({kind}): {message}")]
pub struct Error {
    subject: Subject,
    kind: ErrorKind,
    message: String,
}

impl Error {
    pub fn new(subject: Subject, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            subject,
            kind,
            message: message.into(),
        }
    }

    /// Build an error from the `(code, text)` pair the engine reported.
    #[must_use]
    pub fn from_engine(subject: Subject, code: i32, message: impl Into<String>) -> Self {
        Self::new(subject, ErrorKind::from_code(code), message)
    }

    pub(crate) fn allocation(subject: Subject) -> Self {
        Self::new(
            subject,
            ErrorKind::LocalBinding,
            format!("unable to allocate a native {subject} object"),
        )
    }

    pub(crate) fn locked(subject: Subject) -> Self {
        Self::new(subject, ErrorKind::LockedObject, "Cannot modify locked object")
    }

    pub(crate) fn illegal_state(subject: Subject, message: impl Into<String>) -> Self {
        Self::new(subject, ErrorKind::IllegalState, message)
    }

    #[must_use]
    pub const fn subject(&self) -> Subject {
        self.subject
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub const fn code(&self) -> i32 {
        self.kind.code()
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Reject text the engine cannot receive as a C string.
pub(crate) fn check_text(subject: Subject, field: &str, value: &str) -> Result<()> {
    if value.as_bytes().contains(&0) {
        return Err(Error::new(
            subject,
            ErrorKind::IllegalArgument,
            format!("{field} must not contain NUL bytes"),
        ));
    }

    Ok(())
}

/// How failures surface at the boundary of a host.
///
/// The handles always return [`Result`]; a policy only decides what the
/// caller sees. With [`Policy::Raise`] the error is propagated; with
/// [`Policy::ReturnSentinel`] the failure becomes `false` and the detail is
/// available through the handle's `last_error()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    Raise,
    #[default]
    ReturnSentinel,
}

impl Policy {
    #[must_use]
    pub const fn from_flag(always_throw: bool) -> Self {
        if always_throw {
            Self::Raise
        } else {
            Self::ReturnSentinel
        }
    }

    /// Apply the policy to an operation that has no value of its own.
    ///
    /// # Errors
    /// Only with [`Policy::Raise`], returning the operation's error.
    pub fn check<T>(self, result: Result<T>) -> Result<bool> {
        self.value(result).map(|value| value.is_some())
    }

    /// Apply the policy to an operation producing a value.
    ///
    /// # Errors
    /// Only with [`Policy::Raise`], returning the operation's error.
    pub fn value<T>(self, result: Result<T>) -> Result<Option<T>> {
        match (self, result) {
            (_, Ok(value)) => Ok(Some(value)),
            (Self::Raise, Err(err)) => Err(err),
            (Self::ReturnSentinel, Err(_)) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_codes_round_trip() {
        for code in 1..=7 {
            assert_eq!(ErrorKind::from_code(code).code(), code);
        }

        assert_eq!(ErrorKind::from_code(42), ErrorKind::Unknown(42));
        assert_eq!(ErrorKind::Unknown(42).code(), 42);
    }

    #[test]
    fn local_kinds_share_the_binding_code() {
        assert_eq!(ErrorKind::LocalBinding.code(), LOCAL_CODE);
        assert_eq!(ErrorKind::LockedObject.code(), LOCAL_CODE);
        assert!(ErrorKind::LockedObject.is_local());
        assert!(!ErrorKind::Io.is_local());
    }

    #[test]
    fn display() {
        let err = Error::locked(Subject::Recipient);
        assert_eq!(
            err.to_string(),
            "recipient error (locked object): Cannot modify locked object"
        );

        let err = Error::from_engine(Subject::Connection, 5, "Connection refused");
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(err.to_string(), "connection error (i/o): Connection refused");
    }

    #[test]
    fn nul_bytes_are_rejected() {
        assert!(check_text(Subject::Message, "job id", "job-1").is_ok());

        let err = check_text(Subject::Message, "job id", "job\0-1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalArgument);
    }

    #[test]
    fn policy() {
        let failure = || -> Result<()> { Err(Error::locked(Subject::Recipient)) };

        assert_eq!(Policy::ReturnSentinel.check(failure()), Ok(false));
        assert_eq!(Policy::ReturnSentinel.check(Ok(())), Ok(true));
        assert_eq!(Policy::Raise.check(Ok(())), Ok(true));
        assert_eq!(
            Policy::Raise.check(failure()).unwrap_err().kind(),
            ErrorKind::LockedObject
        );

        assert_eq!(Policy::ReturnSentinel.value::<u8>(Ok(3)), Ok(Some(3)));
        assert_eq!(Policy::from_flag(true), Policy::Raise);
        assert_eq!(Policy::from_flag(false), Policy::ReturnSentinel);
    }
}
