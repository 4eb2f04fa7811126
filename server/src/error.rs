use thiserror::Error;

/// Error taxonomy shared by the server core and the clients.
///
/// `Connection` is the only class the readiness helpers retry; everything
/// else surfaces to the caller unchanged.
#[derive(Debug, Error, Clone)]
pub enum Error {
    /// Malformed parameters or missing required fields; recoverable at the
    /// call site
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// An asset could not be found; fatal to the load, the server stays up
    #[error("file not found: {0}")]
    FileNotFound(String),
    /// An asset exists but could not be read
    #[error("file read error: {0}")]
    FileRead(String),
    /// A backend library failed
    #[error("external error: {0}")]
    External(String),
    /// The remote transport is unreachable
    #[error("connection error: {0}")]
    Connection(String),
    /// The remote server returned a structured error, surfaced verbatim
    #[error("bad status: {0}")]
    BadStatus(String),
    /// Unexpected internal state
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            Error::Connection(err.to_string())
        } else if err.is_decode() {
            Error::BadStatus(err.to_string())
        } else {
            Error::External(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_class_and_message() {
        let err = Error::InvalidArgument("no model specified".into());
        assert_eq!(err.to_string(), "invalid argument: no model specified");
        let err = Error::Connection("refused".into());
        assert_eq!(err.to_string(), "connection error: refused");
    }
}
