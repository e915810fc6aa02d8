use std::error::Error;
use std::fmt::{self, Display};

/// Every variant carries its own envelope code so the dispatch boundary
/// never has to re-derive one from a string match.
#[derive(Debug)]
pub enum PlatformError {
    /// Unknown request type.
    UnknownType(String),
    /// Missing/invalid/expired token or role mismatch.
    InvalidToken(&'static str),
    /// Bad credentials on login.
    BadCredentials,
    /// Duplicate login for an identity that already has an active session.
    DuplicateLogin,
    /// Registering a (username, role) that already exists.
    DuplicateRegistration(String),
    /// Manifest schema violation, unsafe path, bad score, bad chunk sequence, ...
    Validation(String),
    /// Room, game, upload or download session not found.
    NotFound(String),
    /// Version/port/room conflict.
    Conflict(String),
    /// Handshake, start_game, or inactivity timeout.
    Timeout(&'static str),
    /// Anything else; message is logged but not necessarily surfaced verbatim.
    Internal(String),
}

impl PlatformError {
    pub fn code(&self) -> u16 {
        match self {
            PlatformError::UnknownType(_) => 100,
            PlatformError::InvalidToken(_) | PlatformError::BadCredentials => 101,
            PlatformError::DuplicateLogin => 101,
            PlatformError::NotFound(_) => 103,
            PlatformError::DuplicateRegistration(_) => 104,
            PlatformError::Conflict(_) => 104,
            PlatformError::Validation(_) => 101,
            PlatformError::Timeout(_) => 408,
            PlatformError::Internal(_) => 199,
        }
    }
}

impl Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformError::UnknownType(t) => write!(f, "unknown type: {t}"),
            PlatformError::InvalidToken(reason) => write!(f, "invalid token: {reason}"),
            PlatformError::BadCredentials => write!(f, "bad credentials"),
            PlatformError::DuplicateLogin => write!(f, "duplicate login"),
            PlatformError::DuplicateRegistration(who) => write!(f, "username exists: {who}"),
            PlatformError::Validation(msg) => write!(f, "{msg}"),
            PlatformError::NotFound(what) => write!(f, "not found: {what}"),
            PlatformError::Conflict(msg) => write!(f, "{msg}"),
            PlatformError::Timeout(what) => write!(f, "timeout: {what}"),
            PlatformError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl Error for PlatformError {}

impl From<sqlx::Error> for PlatformError {
    fn from(err: sqlx::Error) -> Self {
        PlatformError::Internal(err.to_string())
    }
}

impl From<std::io::Error> for PlatformError {
    fn from(err: std::io::Error) -> Self {
        PlatformError::Internal(err.to_string())
    }
}
