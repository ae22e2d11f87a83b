use std::fmt;

use strum_macros::Display;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Copy, Clone, Display, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Timeout,
    Connection,
    Application,
    Middleware,
    Serialization,
    Network,
    Other,
}

/// the error type used across the whole framework.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

impl Error {
    pub fn new<E: ToString>(kind: ErrorKind, err: E) -> Error {
        Error {
            kind,
            message: err.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::new(ErrorKind::Other, s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::new(ErrorKind::Other, s)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::new(ErrorKind::Network, err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::new(ErrorKind::Serialization, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_preserved() {
        let err = Error::new(ErrorKind::Timeout, "request 7 timed out");
        assert_eq!(ErrorKind::Timeout, err.kind());
        assert_eq!("Timeout: request 7 timed out", err.to_string());
    }

    #[test]
    fn from_string_is_other() {
        let err = Error::from("boom".to_owned());
        assert_eq!(ErrorKind::Other, err.kind());
    }
}
