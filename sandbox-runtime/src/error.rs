use std::fmt;

/// Errors returned by sandbox runtime operations.
#[derive(Debug)]
pub enum Error {
    /// Authentication failure (invalid, missing, or deactivated credential).
    Auth(String),
    /// Caller lacks the permission required for the operation.
    Forbidden(String),
    /// Container runtime failure.
    Container(String),
    /// Invalid input or configuration.
    Validation(String),
    /// Referenced template does not exist in the catalog.
    TemplateNotFound(String),
    /// Referenced sandbox does not exist.
    SandboxNotFound(String),
    /// Referenced session does not exist.
    SessionNotFound(String),
    /// Operation not legal in the entity's current state.
    Conflict(String),
    /// Session is not in a state that permits activation.
    SessionNotReady(String),
    /// Persistence layer failure (I/O, connectivity, serialization).
    Storage(String),
    /// Auxiliary service provider failure.
    Provider(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Auth(msg) => write!(f, "auth error: {msg}"),
            Error::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            Error::Container(msg) => write!(f, "container runtime error: {msg}"),
            Error::Validation(msg) => write!(f, "validation error: {msg}"),
            Error::TemplateNotFound(msg) => write!(f, "template not found: {msg}"),
            Error::SandboxNotFound(msg) => write!(f, "sandbox not found: {msg}"),
            Error::SessionNotFound(msg) => write!(f, "session not found: {msg}"),
            Error::Conflict(msg) => write!(f, "conflict: {msg}"),
            Error::SessionNotReady(msg) => write!(f, "session not ready: {msg}"),
            Error::Storage(msg) => write!(f, "storage error: {msg}"),
            Error::Provider(msg) => write!(f, "provider error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Whether this error means "the referenced entity does not exist".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::TemplateNotFound(_) | Error::SandboxNotFound(_) | Error::SessionNotFound(_)
        )
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Provider(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
