use std::{fmt, io};

/// Errors produced while building requests, reading bodies, or settling a
/// query.
///
/// Structural problems (bad header names, bodies on GET/HEAD, bad redirect
/// statuses) are returned synchronously from constructors. Everything that
/// happens once a request is on the wire is only ever delivered through the
/// pending result.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid character in header field name: {0:?}")]
    InvalidHeaderName(String),

    #[error("body not allowed for GET or HEAD requests")]
    BodyNotAllowed,

    #[error("already read")]
    AlreadyRead,

    #[error("invalid redirect status code: {0}")]
    InvalidRedirectStatus(u16),

    #[error("unsupported body type: {0}")]
    UnsupportedBody(&'static str),

    #[error("could not read form data body as {0}")]
    FormDataRead(&'static str),

    #[error("failed to read blob: {0}")]
    Read(#[from] io::Error),

    /// The body text is not valid JSON.
    #[error("failed to parse body as JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("network request failed")]
    Network,

    #[error("network request timed out")]
    Timeout,

    #[error("user aborted")]
    Abort,

    /// The transport completed but the response was not usable JSON.
    #[error("unknown server answer [invalid JSON]")]
    Json,

    #[error("completion hook failed: {0}")]
    Hook(anyhow::Error),
}

/// Stable tag for programmatic matching on [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Argument,
    AlreadyRead,
    Range,
    Type,
    Read,
    Parse,
    Network,
    Timeout,
    Abort,
    Json,
    Hook,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Argument => "argument",
            ErrorKind::AlreadyRead => "already-read",
            ErrorKind::Range => "range",
            ErrorKind::Type => "type",
            ErrorKind::Read => "read",
            ErrorKind::Parse => "parse",
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Abort => "abort",
            ErrorKind::Json => "json",
            ErrorKind::Hook => "hook",
        }
    }

    /// Numeric code shared by every error of this kind.
    pub fn code(&self) -> u16 {
        match self {
            ErrorKind::Network => 1,
            ErrorKind::Timeout => 2,
            ErrorKind::Abort => 3,
            ErrorKind::Json => 100,
            ErrorKind::Hook => 101,
            ErrorKind::Argument => 200,
            ErrorKind::AlreadyRead => 201,
            ErrorKind::Range => 202,
            ErrorKind::Type => 203,
            ErrorKind::Read => 204,
            ErrorKind::Parse => 205,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidHeaderName(_) | Error::BodyNotAllowed => ErrorKind::Argument,
            Error::AlreadyRead => ErrorKind::AlreadyRead,
            Error::InvalidRedirectStatus(_) => ErrorKind::Range,
            Error::UnsupportedBody(_) | Error::FormDataRead(_) => ErrorKind::Type,
            Error::Read(_) => ErrorKind::Read,
            Error::Parse(_) => ErrorKind::Parse,
            Error::Network => ErrorKind::Network,
            Error::Timeout => ErrorKind::Timeout,
            Error::Abort => ErrorKind::Abort,
            Error::Json => ErrorKind::Json,
            Error::Hook(_) => ErrorKind::Hook,
        }
    }

    pub fn code(&self) -> u16 {
        self.kind().code()
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
