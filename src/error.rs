//! Error types for the kadabra-fleet LSP runtime.
//!
//! Errors are split by layer: [`TransportError`] for the `Content-Length`
//! framing on the subprocess pipes, and [`LspError`] for everything a caller
//! of the client or manager can observe. Every [`LspError`] maps onto a
//! JSON-RPC / LSP error code through [`LspError::code`].

use std::time::Duration;

use thiserror::Error;

use crate::lsp::protocol::{ResponseError, error_codes};

/// Errors related to the framed transport on the language server pipes.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The header block of a frame could not be understood.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),

    /// A frame announced a body larger than the reader accepts.
    #[error("frame of {length} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Announced body length.
        length: usize,
        /// Maximum accepted body length.
        max: usize,
    },

    /// Failed to serialize an outbound message.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error during transport operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether the reader can skip the offending frame and keep going.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::InvalidFormat(_) | Self::FrameTooLarge { .. })
    }
}

/// Errors related to LSP client and manager operations.
#[derive(Debug, Error)]
pub enum LspError {
    /// The language server configuration failed validation.
    #[error("invalid language server configuration: {0}")]
    InvalidConfig(String),

    /// The language server process failed to start.
    #[error("failed to start language server '{command}': {source}")]
    ServerStartFailed {
        /// The command that was launched.
        command: String,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A standard pipe of the spawned process could not be captured.
    #[error("failed to capture {0} of language server")]
    PipeUnavailable(&'static str),

    /// `start` was called on a client that already started.
    #[error("language server already started")]
    AlreadyStarted,

    /// The operation requires a started language server process.
    #[error("language server not started")]
    NotStarted,

    /// The client has been closed.
    #[error("language server client is closed")]
    Closed,

    /// The language server is not initialized.
    #[error("language server not initialized")]
    NotInitialized,

    /// `initialize` was called on a client that already initialized.
    #[error("client already initialized")]
    AlreadyInitialized,

    /// The language server has been shut down.
    #[error("language server is shut down")]
    ShutDown,

    /// There is no stdin pipe to write to.
    #[error("stdin not available")]
    StdinUnavailable,

    /// The language server returned an error response.
    #[error("language server error: {0}")]
    Server(ResponseError),

    /// A request to the language server timed out.
    #[error("language server request timed out after {0:?}")]
    Timeout(Duration),

    /// The connection closed before a response arrived.
    #[error("connection to language server closed")]
    ConnectionClosed,

    /// Failed to encode params or decode a result.
    #[error("failed to convert language server payload: {0}")]
    Json(#[from] serde_json::Error),

    /// Transport-level failure while writing a message.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Invalid position in document.
    #[error("invalid position: line {line}, column {column}")]
    InvalidPosition {
        /// The line number.
        line: u32,
        /// The column number.
        column: u32,
    },

    /// A path could not be turned into a `file://` URI.
    #[error("invalid document path: {0}")]
    InvalidPath(String),

    /// The language is already registered with the manager.
    #[error("language {0} already registered")]
    LanguageAlreadyRegistered(String),

    /// The language is not registered with the manager.
    #[error("language {0} not registered")]
    LanguageNotRegistered(String),

    /// The manager has been closed.
    #[error("language server manager is closed")]
    ManagerClosed,

    /// Initialization failed and the manager evicted the client so the next
    /// attempt starts a fresh server.
    #[error("initialization of {language} failed, will retry: {source}")]
    RetryScheduled {
        /// Language whose client was evicted.
        language: String,
        /// The initialize error.
        source: Box<LspError>,
    },
}

impl LspError {
    /// JSON-RPC / LSP error code for this error.
    pub fn code(&self) -> i64 {
        match self {
            Self::InvalidConfig(_) | Self::InvalidPosition { .. } | Self::InvalidPath(_) => {
                error_codes::INVALID_PARAMS
            }
            Self::NotInitialized => error_codes::SERVER_NOT_INITIALIZED,
            Self::Server(err) => err.code,
            Self::Timeout(_) => error_codes::REQUEST_CANCELLED,
            Self::Json(_) => error_codes::PARSE_ERROR,
            Self::RetryScheduled { source, .. } => source.code(),
            _ => error_codes::INTERNAL_ERROR,
        }
    }

    /// Whether the manager absorbed this failure into its restart budget.
    pub fn is_retry_scheduled(&self) -> bool {
        matches!(self, Self::RetryScheduled { .. })
    }
}

impl From<ResponseError> for LspError {
    fn from(err: ResponseError) -> Self {
        Self::Server(err)
    }
}
