//! Kadabra Fleet - Entry Point
//!
//! Command-line front end for the language server runtime: list the built-in
//! language defaults, probe a server's initialize handshake, or run a single
//! completion/hover/definition/references request.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kadabra_fleet::config::supported_languages;
use kadabra_fleet::lsp::types::{path_to_url, to_lsp_position};
use kadabra_fleet::{LanguageServerConfig, LspClient, LspManager};
use lsp_types::{
    CompletionParams, GotoDefinitionParams, HoverParams, PartialResultParams, ReferenceContext,
    ReferenceParams, TextDocumentIdentifier, TextDocumentPositionParams, WorkDoneProgressParams,
};
use serde_json::Value;
use tracing::{Level, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Supervised LSP client runtime.
#[derive(Parser, Debug)]
#[command(name = "kadabra-fleet")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Log level: trace, debug, info, warn, error.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List supported languages and their default server command lines.
    Languages,

    /// Start a language server and print its initialize result.
    Probe {
        #[command(flatten)]
        server: ServerArgs,
    },

    /// Run one request at a 1-indexed position and print the result.
    Query {
        /// Request to send.
        #[arg(value_enum)]
        operation: Operation,

        /// Document to query.
        file: PathBuf,

        /// Line number (1-indexed).
        line: u32,

        /// Column number (1-indexed).
        column: u32,

        #[command(flatten)]
        server: ServerArgs,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Operation {
    Completion,
    Hover,
    Definition,
    References,
}

/// Which server to run and how, layered over the per-language defaults.
#[derive(clap::Args, Debug)]
struct ServerArgs {
    /// Language identifier (go, python, rust, ...).
    #[arg(short, long)]
    language: String,

    /// Workspace root directory.
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Language server command, replacing the default.
    #[arg(long)]
    server_command: Option<String>,

    /// Argument for the language server; repeat for several.
    #[arg(long = "server-arg", allow_hyphen_values = true)]
    server_args: Vec<String>,

    /// Environment override as KEY=VALUE; repeat for several.
    #[arg(long = "env", value_parser = parse_env_var)]
    env: Vec<(String, String)>,

    /// Timeout for the initialize handshake, in seconds.
    #[arg(long)]
    init_timeout_secs: Option<u64>,

    /// Timeout for every other request, in seconds.
    #[arg(long)]
    request_timeout_secs: Option<u64>,

    /// Restart budget for failed initializations.
    #[arg(long)]
    max_restarts: Option<u32>,
}

impl Args {
    /// Parses the log level string into a tracing Level.
    fn parse_log_level(&self) -> Result<Level> {
        match self.log_level.to_lowercase().as_str() {
            "trace" => Ok(Level::TRACE),
            "debug" => Ok(Level::DEBUG),
            "info" => Ok(Level::INFO),
            "warn" => Ok(Level::WARN),
            "error" => Ok(Level::ERROR),
            other => anyhow::bail!("invalid log level: {}", other),
        }
    }
}

impl ServerArgs {
    /// Defaults for the language with the command-line overrides merged in.
    fn to_config(&self) -> LanguageServerConfig {
        let mut config = LanguageServerConfig::for_language(&self.language);
        config.merge(&LanguageServerConfig {
            command: self.server_command.clone().unwrap_or_default(),
            args: self.server_args.clone(),
            env: self.env.iter().cloned().collect(),
            init_timeout: self
                .init_timeout_secs
                .map_or(Duration::ZERO, Duration::from_secs),
            request_timeout: self
                .request_timeout_secs
                .map_or(Duration::ZERO, Duration::from_secs),
            ..LanguageServerConfig::default()
        });
        // An explicit 0 disables restarts, which merge cannot express.
        if let Some(max_restarts) = self.max_restarts {
            config.max_restarts = max_restarts;
        }
        config
    }
}

fn parse_env_var(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {raw:?}")),
    }
}

/// Initializes the tracing subscriber for logging.
fn init_tracing(level: Level, json: bool) -> Result<()> {
    // Respect RUST_LOG, defaulting to the requested level for this crate
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("kadabra_fleet={level}")));

    // Logs go to stderr; stdout carries command output
    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_current_span(false),
            )
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()
    };
    result.context("failed to initialize tracing subscriber")?;

    Ok(())
}

/// Registers the language and drives initialization, retrying while the
/// manager still has restart budget.
async fn connect(manager: &LspManager, server: &ServerArgs) -> Result<Arc<LspClient>> {
    let config = server.to_config();
    manager
        .register_language(&config)
        .await
        .with_context(|| format!("failed to register language {}", server.language))?;

    let root = path_to_url(&server.workspace).context("failed to resolve workspace")?;
    info!(
        language = %server.language,
        command = %config.command,
        workspace = %root,
        "initializing language server"
    );

    loop {
        match manager.initialize_client(&server.language, Some(root.clone())).await {
            Ok(client) => return Ok(client),
            Err(e) if e.is_retry_scheduled() => {
                warn!(language = %server.language, error = %e, "retrying initialization");
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to initialize {} language server", server.language)
                });
            }
        }
    }
}

async fn query(
    client: &LspClient,
    operation: Operation,
    file: &std::path::Path,
    line: u32,
    column: u32,
) -> Result<Value> {
    let position = TextDocumentPositionParams {
        text_document: TextDocumentIdentifier {
            uri: path_to_url(file).context("failed to resolve document")?,
        },
        position: to_lsp_position(line, column)?,
    };

    let value = match operation {
        Operation::Completion => serde_json::to_value(
            client
                .completion(CompletionParams {
                    text_document_position: position,
                    work_done_progress_params: WorkDoneProgressParams::default(),
                    partial_result_params: PartialResultParams::default(),
                    context: None,
                })
                .await?,
        )?,
        Operation::Hover => serde_json::to_value(
            client
                .hover(HoverParams {
                    text_document_position_params: position,
                    work_done_progress_params: WorkDoneProgressParams::default(),
                })
                .await?,
        )?,
        Operation::Definition => serde_json::to_value(
            client
                .definition(GotoDefinitionParams {
                    text_document_position_params: position,
                    work_done_progress_params: WorkDoneProgressParams::default(),
                    partial_result_params: PartialResultParams::default(),
                })
                .await?,
        )?,
        Operation::References => serde_json::to_value(
            client
                .references(ReferenceParams {
                    text_document_position: position,
                    work_done_progress_params: WorkDoneProgressParams::default(),
                    partial_result_params: PartialResultParams::default(),
                    context: ReferenceContext {
                        include_declaration: true,
                    },
                })
                .await?,
        )?,
    };
    Ok(value)
}

async fn run(command: Command) -> Result<()> {
    let (server, operation) = match command {
        Command::Languages => {
            for language in supported_languages() {
                let config = LanguageServerConfig::for_language(language);
                println!("{language:<12} {} {}", config.command, config.args.join(" "));
            }
            return Ok(());
        }
        Command::Probe { server } => (server, None),
        Command::Query {
            operation,
            file,
            line,
            column,
            server,
        } => (server, Some((operation, file, line, column))),
    };

    let manager = LspManager::new();
    let outcome = async {
        let client = connect(&manager, &server).await?;
        match operation {
            None => serde_json::to_value(client.initialize_result())
                .context("failed to encode initialize result"),
            Some((operation, file, line, column)) => {
                query(&client, operation, &file, line, column).await
            }
        }
    }
    .await;
    manager.close().await;

    println!("{}", serde_json::to_string_pretty(&outcome?)?);
    Ok(())
}

/// Main entry point.
#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = args.parse_log_level()?;
    init_tracing(log_level, args.log_json)?;

    run(args.command).await
}
