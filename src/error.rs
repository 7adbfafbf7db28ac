//! The error type returned by session operations.

use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::network::codec::CodecError;
use crate::network::messages::ErrorCode;
use crate::sessions::state::Phase;

/// This enum contains all errors this library can return. Most API functions will generally
/// return a [`Result<(), ArenaError>`].
///
/// None of these are fatal to the process: at worst they mean "this session ends".
///
/// [`Result<(), ArenaError>`]: std::result::Result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArenaError {
    /// Tried to host or join while the shared session state is already online.
    AlreadyOnline,
    /// The operation needs an online session, but the session was never started,
    /// was disbanded, or has expired.
    NotOnline,
    /// A configuration value is out of range.
    InvalidConfig {
        /// The offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
    /// The host refused the join request.
    JoinRejected {
        /// The rejection code sent by the host.
        code: ErrorCode,
    },
    /// The host did not answer the join request within the join timeout.
    JoinTimedOut,
    /// The requested action is not valid in the session's current phase.
    WrongPhase {
        /// The phase the action requires.
        expected: Phase,
        /// The phase the session is actually in.
        actual: Phase,
    },
    /// A socket could not be bound or configured.
    Socket {
        /// A description of the socket error.
        context: String,
    },
    /// A message could not be encoded or decoded.
    Codec(CodecError),
}

impl Display for ArenaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArenaError::AlreadyOnline => {
                write!(f, "An arena session is already online.")
            }
            ArenaError::NotOnline => write!(f, "No arena session is online."),
            ArenaError::InvalidConfig { field, reason } => {
                write!(f, "Invalid arena config field `{}`: {}", field, reason)
            }
            ArenaError::JoinRejected { code } => {
                write!(f, "The host rejected the join request: {}", code)
            }
            ArenaError::JoinTimedOut => {
                write!(f, "The host did not answer the join request in time.")
            }
            ArenaError::WrongPhase { expected, actual } => {
                write!(
                    f,
                    "Action requires phase {} but the session is in phase {}",
                    expected, actual
                )
            }
            ArenaError::Socket { context } => write!(f, "Socket error: {}", context),
            ArenaError::Codec(err) => write!(f, "Codec error: {}", err),
        }
    }
}

impl Error for ArenaError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ArenaError::Codec(err) => Some(err),
            _ => None,
        }
    }
}

impl From<CodecError> for ArenaError {
    fn from(err: CodecError) -> Self {
        ArenaError::Codec(err)
    }
}

impl From<std::io::Error> for ArenaError {
    fn from(err: std::io::Error) -> Self {
        ArenaError::Socket {
            context: err.to_string(),
        }
    }
}
