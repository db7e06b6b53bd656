use std::fmt::{Display, Formatter};

use serde_repr::{Deserialize_repr, Serialize_repr};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Broad classes of failure, used to pick the generic message shown to users.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    Encryption,
    Validation,
    Persistence,
    Internal,
}

impl ErrorKind {
    /// The generic, user-facing description of this class of failure.
    pub fn generic_message(&self) -> &'static str {
        match self {
            Self::Connection => "Unable to communicate with another terminal",
            Self::Encryption => "A cryptographic operation failed",
            Self::Validation => "The requested operation is not allowed",
            Self::Persistence => "The storage service reported a failure",
            Self::Internal => "An unexpected internal error occurred",
        }
    }
}

/// Machine-stable error codes. The hundreds digit identifies the [`ErrorKind`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u16)]
pub enum Code {
    Unreachable = 100,
    Dropped = 101,
    Timeout = 102,
    Bind = 103,
    ListenerClosed = 104,

    Cipher = 200,
    Key = 201,
    Signature = 202,
    Hmac = 203,
    Authentication = 204,

    WrongState = 300,
    MalformedMessage = 301,
    UnknownCommand = 302,
    MaxPreferences = 303,
    UnknownChoice = 304,
    UnknownVoter = 305,
    BadgeInUse = 306,
    NoPostAvailable = 307,
    Unauthorized = 308,
    NoPendingChallenge = 309,
    DuplicateChoice = 310,
    AlreadyVoted = 311,

    Storage = 400,

    UnexpectedValue = 500,
    Invariant = 501,
}

impl Code {
    pub fn kind(&self) -> ErrorKind {
        match *self as u16 / 100 {
            1 => ErrorKind::Connection,
            2 => ErrorKind::Encryption,
            3 => ErrorKind::Validation,
            4 => ErrorKind::Persistence,
            _ => ErrorKind::Internal,
        }
    }
}

impl Display for Code {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "E{}", *self as u16)
    }
}

/// The single failure type of every fallible operation in the crate.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Connection error {0}: {1}")]
    Connection(Code, String),
    #[error("Encryption error {0}: {1}")]
    Encryption(Code, String),
    #[error("Validation error {0}: {1}")]
    Validation(Code, String),
    #[error("Persistence error {0}: {1}")]
    Persistence(Code, String),
    #[error("Internal error {0}: {1}")]
    Internal(Code, String),
}

impl Error {
    /// Build an error of the kind implied by `code`.
    pub fn new(code: Code, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match code.kind() {
            ErrorKind::Connection => Self::Connection(code, detail),
            ErrorKind::Encryption => Self::Encryption(code, detail),
            ErrorKind::Validation => Self::Validation(code, detail),
            ErrorKind::Persistence => Self::Persistence(code, detail),
            ErrorKind::Internal => Self::Internal(code, detail),
        }
    }

    pub fn wrong_state(detail: impl Into<String>) -> Self {
        Self::new(Code::WrongState, detail)
    }

    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::new(Code::MalformedMessage, detail)
    }

    pub fn unreachable(addr: impl Display, reason: impl Display) -> Self {
        Self::new(Code::Unreachable, format!("{addr}: {reason}"))
    }

    pub fn code(&self) -> Code {
        match self {
            Self::Connection(code, _)
            | Self::Encryption(code, _)
            | Self::Validation(code, _)
            | Self::Persistence(code, _)
            | Self::Internal(code, _) => *code,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.code().kind()
    }

    pub fn generic_message(&self) -> &'static str {
        self.kind().generic_message()
    }

    /// The detailed description of this particular failure.
    pub fn specific_message(&self) -> &str {
        match self {
            Self::Connection(_, detail)
            | Self::Encryption(_, detail)
            | Self::Validation(_, detail)
            | Self::Persistence(_, detail)
            | Self::Internal(_, detail) => detail,
        }
    }

    pub fn is_connection(&self) -> bool {
        self.kind() == ErrorKind::Connection
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind as IoKind;
        let code = match err.kind() {
            IoKind::TimedOut | IoKind::WouldBlock => Code::Timeout,
            IoKind::ConnectionRefused | IoKind::NotFound | IoKind::AddrNotAvailable => {
                Code::Unreachable
            }
            IoKind::AddrInUse => Code::Bind,
            _ => Code::Dropped,
        };
        Self::new(code, err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Self::new(Code::Timeout, err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::malformed(err.to_string())
    }
}

impl From<data_encoding::DecodeError> for Error {
    fn from(err: data_encoding::DecodeError) -> Self {
        Self::malformed(err.to_string())
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Self::malformed(err.to_string())
    }
}

impl From<rsa::Error> for Error {
    fn from(err: rsa::Error) -> Self {
        Self::new(Code::Cipher, err.to_string())
    }
}

impl From<argon2::Error> for Error {
    fn from(err: argon2::Error) -> Self {
        Self::new(Code::Hmac, err.to_string())
    }
}
