use std::fmt::Display;

use strum_macros::{Display, EnumString};
use thiserror::Error as ThisError;

/// The broad category of an [`Error`].
#[derive(Debug, Copy, Clone, Display, PartialEq, Eq, EnumString)]
pub enum ErrorKind {
    /// Connect, send or receive failed at the transport.
    Network,
    /// Inbound bytes did not form a valid message.
    Protocol,
    /// Bad configuration or construction arguments.
    Config,
    /// The resource has already been closed.
    Closed,
    Other,
}

#[derive(Debug, Clone, ThisError)]
#[error("{kind} error: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new<E: Display>(kind: ErrorKind, err: E) -> Self {
        Error {
            kind,
            message: err.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for Error {
    fn from(message: String) -> Self {
        Error {
            kind: ErrorKind::Other,
            message,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::new(ErrorKind::Network, err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::new(ErrorKind::Config, err)
    }
}
