//! Error types for frame distribution.
//!
//! Every failure in the relay maps onto one [`RelayError`] variant. The
//! variants follow the recovery taxonomy the engines act on:
//!
//! - **Source errors** (`SourceNotFound`, `SourceNotReady`, `SourceLost`,
//!   `ShapeChanged`): handled locally by the publisher engine, which goes back
//!   to opening the stream.
//! - **Peer loss** is not an error: a send to a vanished subscriber returns
//!   [`SendOutcome::PeerGone`](crate::transport::SendOutcome::PeerGone), that
//!   subscriber is evicted and the others keep receiving frames.
//! - **Message errors** (`MalformedHeader`, `ShortMessage`, `Codec`,
//!   `ConnectionClosed`): the subscriber engine drops the connection and
//!   reconnects.
//! - **Transport errors** (`Transport`, `Io`): fatal for the worker that hit
//!   them unless shutdown is already in progress.
//! - **Worker errors** (`Worker`): a worker task panicked or was aborted.
//!
//! ```rust
//! use framerelay::RelayError;
//!
//! let error = RelayError::source_not_found("cam0");
//! assert!(error.is_retryable());
//! for suggestion in error.recovery_suggestions() {
//!     println!("  - {}", suggestion);
//! }
//! ```

use thiserror::Error;

/// Result type alias for relay operations.
pub type Result<T, E = RelayError> = std::result::Result<T, E>;

/// Main error type for relay operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RelayError {
    #[error("Image stream '{name}' not found")]
    SourceNotFound { name: String },

    #[error("Image stream '{name}' exists but is not initialized by its writer")]
    SourceNotReady { name: String },

    #[error("Image stream '{name}' changed shape or element type")]
    ShapeChanged { name: String },

    #[error("Image stream '{name}' lost: {reason}")]
    SourceLost { name: String, reason: String },

    #[error("Malformed frame header: {details}")]
    MalformedHeader { details: String },

    #[error("Message of {len} bytes is shorter than the {expected} byte frame header")]
    ShortMessage { len: usize, expected: usize },

    #[error("Codec error: {details}")]
    Codec {
        details: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Connection closed by {endpoint}")]
    ConnectionClosed { endpoint: String },

    #[error("Transport error during {operation}")]
    Transport {
        operation: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    #[error("Worker '{worker}' stopped abnormally: {reason}")]
    Worker { worker: String, reason: String },

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            RelayError::SourceNotFound { .. } => true,
            RelayError::SourceNotReady { .. } => true,
            RelayError::ShapeChanged { .. } => true,
            RelayError::SourceLost { .. } => true,
            RelayError::MalformedHeader { .. } => true,
            RelayError::ShortMessage { .. } => true,
            RelayError::Codec { .. } => true,
            RelayError::ConnectionClosed { .. } => true,
            RelayError::Transport { .. } => false,
            RelayError::Config { .. } => false,
            RelayError::Worker { .. } => false,
            RelayError::Io(_) => false,
        }
    }

    /// Returns whether a subscriber engine should drop its connection and
    /// reconnect after this error instead of exiting.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            RelayError::MalformedHeader { .. }
                | RelayError::ShortMessage { .. }
                | RelayError::Codec { .. }
                | RelayError::ConnectionClosed { .. }
        )
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            RelayError::SourceNotFound { .. } => vec![
                "Start the producer that creates the image stream",
                "Check the stream name spelling",
            ],
            RelayError::SourceNotReady { .. } => {
                vec!["Wait for the producer to finish initializing the stream"]
            }
            RelayError::ShapeChanged { .. } => {
                vec!["No action needed, the stream is rebuilt with the new shape"]
            }
            RelayError::SourceLost { .. } => vec![
                "Check whether the producer process exited",
                "Restart the producer, the publisher reopens the stream automatically",
            ],
            RelayError::MalformedHeader { .. } | RelayError::ShortMessage { .. } => vec![
                "Verify publisher and subscriber use the same wire format version",
                "Check for a proxy or firewall altering traffic",
            ],
            RelayError::Codec { .. } => vec![
                "Verify the compression settings are supported by both ends",
                "Check for data corruption in transit",
            ],
            RelayError::ConnectionClosed { .. } => vec![
                "Check that the publisher is running",
                "The subscriber reconnects automatically",
            ],
            RelayError::Transport { .. } => vec![
                "Check the bind address and port are available",
                "Verify network connectivity to the publisher",
            ],
            RelayError::Config { .. } => vec![
                "Review the configuration file",
                "Check value ranges in the documentation",
            ],
            RelayError::Worker { .. } => vec![
                "Check the logs for the panic message",
                "Restart the publisher or subscriber",
            ],
            RelayError::Io(_) => vec!["Check file and socket permissions"],
        }
    }

    /// Helper constructor for missing image streams.
    pub fn source_not_found(name: impl Into<String>) -> Self {
        RelayError::SourceNotFound { name: name.into() }
    }

    /// Helper constructor for image streams not yet initialized.
    pub fn source_not_ready(name: impl Into<String>) -> Self {
        RelayError::SourceNotReady { name: name.into() }
    }

    /// Helper constructor for lost image streams.
    pub fn source_lost(name: impl Into<String>, reason: impl Into<String>) -> Self {
        RelayError::SourceLost { name: name.into(), reason: reason.into() }
    }

    /// Helper constructor for header decoding failures.
    pub fn malformed_header(details: impl Into<String>) -> Self {
        RelayError::MalformedHeader { details: details.into() }
    }

    /// Helper constructor for codec failures.
    pub fn codec(details: impl Into<String>) -> Self {
        RelayError::Codec { details: details.into(), source: None }
    }

    /// Helper constructor for codec failures with source.
    pub fn codec_with_source(
        details: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        RelayError::Codec { details: details.into(), source: Some(source) }
    }

    /// Helper constructor for closed connections.
    pub fn connection_closed(endpoint: impl Into<String>) -> Self {
        RelayError::ConnectionClosed { endpoint: endpoint.into() }
    }

    /// Helper constructor for transport errors.
    pub fn transport(operation: impl Into<String>) -> Self {
        RelayError::Transport { operation: operation.into(), source: None }
    }

    /// Helper constructor for transport errors with source.
    pub fn transport_with_source(
        operation: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        RelayError::Transport { operation: operation.into(), source: Some(source) }
    }

    /// Helper constructor for abnormal worker exits.
    pub fn worker(worker: impl Into<String>, reason: impl Into<String>) -> Self {
        RelayError::Worker { worker: worker.into(), reason: reason.into() }
    }

    /// Helper constructor for configuration errors.
    pub fn config(reason: impl Into<String>) -> Self {
        RelayError::Config { reason: reason.into() }
    }
}

impl From<serde_yaml_ng::Error> for RelayError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        RelayError::Config { reason: err.to_string() }
    }
}
