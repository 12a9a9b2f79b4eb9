//! Language server runtime.
//!
//! # Architecture
//!
//! - `codec`: `Content-Length` framing on the subprocess pipes
//! - `protocol`: JSON-RPC 2.0 envelopes and error codes
//! - `types`: client capabilities and path/position conversions
//! - `client`: one language server process and its lifecycle
//! - `manager`: per-language registry, health checks and bounded restarts
//!
//! # Usage
//!
//! ```no_run
//! use kadabra_fleet::config::LanguageServerConfig;
//! use kadabra_fleet::lsp::{LspManager, LspResult, Url};
//!
//! # async fn run(root_uri: Url, params: lsp_types::HoverParams) -> LspResult<()> {
//! let manager = LspManager::new();
//! manager.register_language(&LanguageServerConfig::for_language("go")).await?;
//! let client = manager.initialize_client("go", Some(root_uri)).await?;
//! let hover = client.hover(params).await?;
//! manager.close().await;
//! # let _ = hover;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod manager;
pub mod protocol;
pub mod types;

use crate::error::LspError;

/// Result type for LSP operations.
pub type LspResult<T> = std::result::Result<T, LspError>;

pub use client::{ClientState, LspClient};
pub use manager::LspManager;

pub use lsp_types::{
    CompletionResponse, GotoDefinitionResponse, Hover, InitializeResult, Location, Position,
    TextDocumentIdentifier, TextDocumentPositionParams, Url,
};
