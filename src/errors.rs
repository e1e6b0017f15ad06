//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug, Clone)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// The channel never reached the open state.
    Connection(String),
    /// The channel closed before an expected reply arrived.
    ConnectionClosed(String),
    /// A send was attempted while the channel was not open.
    NotOpen,
    /// An inbound payload failed to parse.
    MalformedMessage(String),
    /// The server sent an explicit error message.
    ServerReported(String),
    /// Caller-supplied input failed validation before anything was sent.
    InvalidInput(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Connection(msg) => write!(f, "connection failed: {msg}"),
            Self::ConnectionClosed(msg) => write!(f, "connection closed: {msg}"),
            Self::NotOpen => write!(f, "connection is not open"),
            Self::MalformedMessage(msg) => write!(f, "malformed message: {msg}"),
            Self::ServerReported(msg) => write!(f, "server error: {msg}"),
            Self::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
