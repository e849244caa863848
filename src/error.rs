use thiserror::Error;

/// Failure class of an engine error.
///
/// The continuous server decides between retrying, backing off and giving up
/// based on this classification alone, so every [`Error`] maps to exactly one
/// kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad configuration or unresolvable address, detected before any socket is opened.
    Setup,
    /// Binding or listening failed, usually port contention.
    Listen,
    /// Accepting a control or data connection failed or timed out.
    Accept,
    /// The peer sent an unexpected, malformed or incompatible control message.
    Handshake,
    /// A send or receive failed while the test was running.
    DataPath,
    /// Unrecoverable: resource exhaustion or the consecutive failure ceiling.
    Fatal,
    /// The engine was stopped through its handle.
    Cancelled,
}

impl ErrorKind {
    /// Negative status code for this failure class.
    ///
    /// These values are stable and shared with callers that still speak in
    /// integer status codes.
    pub fn status(self) -> i32 {
        match self {
            ErrorKind::Listen => -1,
            ErrorKind::Accept => -2,
            ErrorKind::Handshake => -3,
            ErrorKind::DataPath => -4,
            ErrorKind::Setup => -5,
            ErrorKind::Fatal => -6,
            ErrorKind::Cancelled => -7,
        }
    }

    /// Whether a continuous server may reset and serve the next client after this failure.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            ErrorKind::Listen | ErrorKind::Accept | ErrorKind::Handshake | ErrorKind::DataPath
        )
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Listen on {addr} failed: {source}")]
    Listen {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Accept failed: {0}")]
    Accept(String),

    #[error("Connect to {addr} failed: {message}")]
    Connect { addr: String, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Data path error on stream {stream_id}: {message}")]
    DataPath { stream_id: usize, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Giving up after {failures} consecutive failed sessions, last: {last}")]
    TooManyFailures { failures: u32, last: Box<Error> },

    #[error("Invalid engine state: {0}")]
    InvalidState(String),

    #[error("Test cancelled")]
    Cancelled,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Setup,
            Error::Listen { .. } => ErrorKind::Listen,
            Error::Accept(_) | Error::Connect { .. } => ErrorKind::Accept,
            Error::Protocol(_) | Error::Json(_) => ErrorKind::Handshake,
            Error::DataPath { .. } | Error::Io(_) => ErrorKind::DataPath,
            Error::TooManyFailures { .. } | Error::InvalidState(_) => ErrorKind::Fatal,
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Shorthand for `self.kind().status()`.
    pub fn status(&self) -> i32 {
        self.kind().status()
    }

    pub(crate) fn connect(addr: impl std::fmt::Display, err: impl std::fmt::Display) -> Self {
        Error::Connect {
            addr: addr.to_string(),
            message: err.to_string(),
        }
    }

    pub(crate) fn data_path(stream_id: usize, err: impl std::fmt::Display) -> Self {
        Error::DataPath {
            stream_id,
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_status_codes_are_distinct_and_negative() {
        let kinds = [
            ErrorKind::Setup,
            ErrorKind::Listen,
            ErrorKind::Accept,
            ErrorKind::Handshake,
            ErrorKind::DataPath,
            ErrorKind::Fatal,
            ErrorKind::Cancelled,
        ];
        let codes: HashSet<i32> = kinds.iter().map(|k| k.status()).collect();
        assert_eq!(codes.len(), kinds.len());
        assert!(codes.iter().all(|c| *c < 0));
        assert_eq!(ErrorKind::Listen.status(), -1);
        assert_eq!(ErrorKind::Accept.status(), -2);
    }

    #[test]
    fn test_error_classification() {
        let listen = Error::Listen {
            addr: "0.0.0.0:5201".into(),
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        assert_eq!(listen.kind(), ErrorKind::Listen);
        assert_eq!(Error::Accept("timeout".into()).kind(), ErrorKind::Accept);
        assert_eq!(Error::Protocol("bad".into()).kind(), ErrorKind::Handshake);
        assert_eq!(
            Error::connect("10.0.0.1:5201", "refused").kind(),
            ErrorKind::Accept
        );
        assert_eq!(Error::Config("bad".into()).kind(), ErrorKind::Setup);
        assert_eq!(
            Error::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe)).kind(),
            ErrorKind::DataPath
        );
        let fatal = Error::TooManyFailures {
            failures: 5,
            last: Box::new(Error::Cancelled),
        };
        assert_eq!(fatal.kind(), ErrorKind::Fatal);
        assert_eq!(fatal.status(), -6);
    }

    #[test]
    fn test_recoverable_classes() {
        assert!(ErrorKind::Listen.is_recoverable());
        assert!(ErrorKind::Accept.is_recoverable());
        assert!(ErrorKind::Handshake.is_recoverable());
        assert!(ErrorKind::DataPath.is_recoverable());
        assert!(!ErrorKind::Setup.is_recoverable());
        assert!(!ErrorKind::Fatal.is_recoverable());
        assert!(!ErrorKind::Cancelled.is_recoverable());
    }
}
