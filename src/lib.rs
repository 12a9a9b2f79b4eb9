//! Kadabra Fleet
//!
//! A supervised, multi-language LSP client runtime. It launches language
//! servers as subprocesses, speaks JSON-RPC 2.0 over their standard pipes,
//! drives the initialize/shutdown lifecycle, and keeps one client per
//! language alive behind health checks and a bounded restart budget.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐  register / get / initialize   ┌──────────────────┐
//! │     Caller      │───────────────────────────────►│    LspManager    │
//! └─────────────────┘                                │ (health, restart)│
//!                                                    └────────┬─────────┘
//!                                               one per language
//!                                                    ┌────────▼─────────┐
//!                                                    │    LspClient     │
//!                                                    └────────┬─────────┘
//!                                                             │ Content-Length
//!                                                             │ framed JSON-RPC
//!                                                    ┌────────▼─────────┐
//!                                                    │ Language server  │
//!                                                    │   (subprocess)   │
//!                                                    └──────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`config`] - Per-language launch and supervision settings
//! - [`error`] - Error types for the entire library
//! - [`lsp`] - Transport, client lifecycle and the manager
//!
//! # Example
//!
//! ```ignore
//! use kadabra_fleet::{LanguageServerConfig, LspManager};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manager = LspManager::new();
//!     manager
//!         .register_language(&LanguageServerConfig::for_language("rust"))
//!         .await?;
//!
//!     let client = manager.initialize_client("rust", Some(root_uri)).await?;
//!     let references = client.references(params).await?;
//!
//!     manager.close().await;
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// Allow some pedantic lints that are too strict
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod error;
pub mod lsp;

// Re-export commonly used types at the crate root
pub use config::LanguageServerConfig;
pub use error::{LspError, TransportError};
pub use lsp::{LspClient, LspManager, LspResult};
