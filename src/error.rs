//! Error type shared by every layer of the server
//!
//! All fallible operations return [`Result`]. An [`Error`] carries a coarse
//! [`ErrorKind`] (used by the HTTP layer to pick a status code), the name of
//! the operation that failed and the underlying cause, if any.

use std::borrow::Cow;
use std::fmt;

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Broad classification of failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The caller supplied something malformed
    InvalidInput,

    /// The requested entity does not exist
    NotFound,

    /// Credentials missing or rejected
    Unauthorized,

    /// The write collides with existing state
    Conflict,

    /// A deadline elapsed
    Timeout,

    /// Transient remote failure (database gone, sink down, ...)
    Unavailable,

    /// Anything else
    Internal,

    /// The configuration is inconsistent or incomplete
    InvalidConfig,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Internal => "internal",
            ErrorKind::InvalidConfig => "invalid_config",
        }
    }

    /// Whether a retry of the same operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::Unavailable)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error with kind, operation label and optional cause
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    op: Cow<'static, str>,
    message: String,
    source: Option<BoxError>,
}

impl Error {
    pub fn new(kind: ErrorKind, op: impl Into<Cow<'static, str>>, message: impl Into<String>) -> Self {
        Self {
            kind,
            op: op.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Attach the underlying cause
    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn invalid_input(op: impl Into<Cow<'static, str>>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, op, message)
    }

    pub fn not_found(op: impl Into<Cow<'static, str>>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, op, message)
    }

    pub fn unavailable(op: impl Into<Cow<'static, str>>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, op, message)
    }

    pub fn internal(op: impl Into<Cow<'static, str>>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, op, message)
    }

    pub fn invalid_config(op: impl Into<Cow<'static, str>>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidConfig, op, message)
    }

    pub fn timeout(op: impl Into<Cow<'static, str>>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, op, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn op(&self) -> &str {
        &self.op
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Map a sqlx error onto the matching kind
    #[cfg(feature = "storage-sqlite")]
    pub fn from_sqlx(op: impl Into<Cow<'static, str>>, err: sqlx::Error) -> Self {
        let (kind, message) = match &err {
            sqlx::Error::RowNotFound => (ErrorKind::NotFound, "no rows found".to_string()),
            sqlx::Error::PoolTimedOut => {
                (ErrorKind::Timeout, "timed out acquiring a connection".to_string())
            }
            sqlx::Error::PoolClosed => (ErrorKind::Unavailable, "connection pool closed".to_string()),
            sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
                (ErrorKind::Unavailable, "database connection failed".to_string())
            }
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                (ErrorKind::Conflict, "duplicate key".to_string())
            }
            sqlx::Error::Database(db) => (ErrorKind::Internal, db.message().to_string()),
            other => (ErrorKind::Internal, other.to_string()),
        };
        Self::new(kind, op, message).with_source(err)
    }

    /// Map an outbound HTTP client error
    pub fn from_reqwest(op: impl Into<Cow<'static, str>>, err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ErrorKind::Timeout
        } else if err.is_decode() || err.is_builder() {
            ErrorKind::InvalidInput
        } else {
            ErrorKind::Unavailable
        };
        Self::new(kind, op, "request failed").with_source(err)
    }

    /// Map a non-success HTTP status returned by a remote endpoint
    pub fn from_status(op: impl Into<Cow<'static, str>>, status: u16, body: &str) -> Self {
        let kind = match status {
            401 | 403 => ErrorKind::Unauthorized,
            404 => ErrorKind::NotFound,
            409 => ErrorKind::Conflict,
            408 => ErrorKind::Timeout,
            400..=499 => ErrorKind::InvalidInput,
            _ => ErrorKind::Unavailable,
        };
        let mut snippet: String = body.chars().take(256).collect();
        if snippet.len() < body.len() {
            snippet.push_str("...");
        }
        Self::new(kind, op, format!("remote returned status {status}: {snippet}"))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.op, self.kind, self.message)?;
        if let Some(source) = &self.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::new(ErrorKind::Internal, "serde_json", "serialization failed").with_source(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
            _ => ErrorKind::Unavailable,
        };
        Error::new(kind, "io", "I/O failure").with_source(err)
    }
}
