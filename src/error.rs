//! Error types for the audit tool

use std::io;
use thiserror::Error;

/// Result type for audit operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the audit workers
#[derive(Error, Debug)]
pub enum Error {
  /// IO error
  #[error("IO error: {0}")]
  Io(io::Error),

  /// Configuration error, fatal at startup
  #[error("Configuration error: {0}")]
  Config(String),

  /// Capture device error
  #[error("Capture error: {0}")]
  Capture(String),

  /// Certificate error
  #[error("Certificate error: {0}")]
  Certificate(String),

  /// TLS error
  #[error("TLS error: {0}")]
  Tls(String),

  /// Proxy error
  #[error("Proxy error: {0}")]
  Proxy(String),

  /// Invalid request
  #[error("Invalid request: {0}")]
  InvalidRequest(String),
}

impl Error {
  /// Create a configuration error and log it
  pub fn config(msg: impl Into<String>) -> Self {
    let error = Error::Config(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a capture error and log it
  pub fn capture(msg: impl Into<String>) -> Self {
    let error = Error::Capture(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a certificate error and log it
  pub fn certificate(msg: impl Into<String>) -> Self {
    let error = Error::Certificate(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a TLS error and log it
  pub fn tls(msg: impl Into<String>) -> Self {
    let error = Error::Tls(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a proxy error and log it
  pub fn proxy(msg: impl Into<String>) -> Self {
    let error = Error::Proxy(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create an invalid request error and log it
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::error!("{}", error);
    error
  }
}

impl From<io::Error> for Error {
  fn from(value: io::Error) -> Self {
    Error::Io(value)
  }
}

impl From<pcap::Error> for Error {
  fn from(value: pcap::Error) -> Self {
    Error::Capture(value.to_string())
  }
}
