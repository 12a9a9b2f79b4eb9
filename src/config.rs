//! Per-language server configuration.
//!
//! A [`LanguageServerConfig`] describes how to launch one language server and
//! how the manager should supervise it. Configurations are cloned whenever
//! they are handed to a client or stored by the manager, so a caller mutating
//! its own copy never affects running state.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::{Value, json};

use crate::error::LspError;

/// Command sentinel for configurations that never spawn a process.
///
/// The manager skips `start` for clients with this command; useful for
/// exercising registry and restart behaviour without a real server.
pub const MOCK_COMMAND: &str = "mock-lsp";

const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_MAX_RESTARTS: u32 = 3;

/// Languages with built-in launch defaults.
const SUPPORTED_LANGUAGES: [&str; 8] = [
    "go",
    "python",
    "typescript",
    "javascript",
    "rust",
    "java",
    "cpp",
    "c",
];

/// Configuration for a single language server.
///
/// `Default` is the all-zero value, which doubles as the empty override for
/// [`merge`](Self::merge).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LanguageServerConfig {
    /// Language identifier (e.g. "go", "python").
    pub language: String,
    /// Executable that starts the language server.
    pub command: String,
    /// Arguments passed to the command.
    pub args: Vec<String>,
    /// Environment overrides applied on top of the inherited environment.
    pub env: HashMap<String, String>,
    /// `initializationOptions` sent when the caller supplies none.
    pub initialization_options: Option<Value>,
    /// Upper bound for the `initialize` round-trip.
    pub init_timeout: Duration,
    /// Upper bound for every other request.
    pub request_timeout: Duration,
    pub enable_completion: bool,
    pub enable_hover: bool,
    pub enable_definition: bool,
    pub enable_references: bool,
    /// Whether the manager may restart the server after failures.
    pub auto_restart: bool,
    /// Consecutive restarts allowed before the server is left failed.
    pub max_restarts: u32,
    /// Period of the manager's health check; zero disables it.
    pub health_check_interval: Duration,
}

impl LanguageServerConfig {
    /// Returns the defaults for `language`.
    ///
    /// Unknown languages get the global defaults with an empty command, which
    /// fails [`validate`](Self::validate) until a command is supplied.
    pub fn for_language(language: &str) -> Self {
        let (command, args, initialization_options) = launch_defaults(language);
        Self {
            language: language.to_string(),
            command: command.to_string(),
            args: args.iter().map(|arg| (*arg).to_string()).collect(),
            env: HashMap::new(),
            initialization_options,
            init_timeout: DEFAULT_INIT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            enable_completion: true,
            enable_hover: true,
            enable_definition: true,
            enable_references: true,
            auto_restart: true,
            max_restarts: DEFAULT_MAX_RESTARTS,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
        }
    }

    /// Checks the configuration invariants.
    ///
    /// ## Errors
    /// Returns [`LspError::InvalidConfig`] naming the first violated rule.
    pub fn validate(&self) -> Result<(), LspError> {
        if self.language.is_empty() {
            return Err(LspError::InvalidConfig(
                "language identifier is required".to_string(),
            ));
        }
        if self.command.is_empty() {
            return Err(LspError::InvalidConfig(
                "language server command is required".to_string(),
            ));
        }
        if self.init_timeout.is_zero() {
            return Err(LspError::InvalidConfig(
                "initialization timeout must be positive".to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(LspError::InvalidConfig(
                "request timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Overlays every present field of `other` onto `self`.
    ///
    /// Strings and argument lists replace when non-empty, durations and the
    /// restart limit when non-zero, initialization options when set. The
    /// environment is merged key by key. Boolean toggles are left alone.
    pub fn merge(&mut self, other: &LanguageServerConfig) {
        if !other.language.is_empty() {
            self.language.clone_from(&other.language);
        }
        if !other.command.is_empty() {
            self.command.clone_from(&other.command);
        }
        if !other.args.is_empty() {
            self.args.clone_from(&other.args);
        }
        for (key, value) in &other.env {
            self.env.insert(key.clone(), value.clone());
        }
        if other.initialization_options.is_some() {
            self.initialization_options
                .clone_from(&other.initialization_options);
        }
        if !other.init_timeout.is_zero() {
            self.init_timeout = other.init_timeout;
        }
        if !other.request_timeout.is_zero() {
            self.request_timeout = other.request_timeout;
        }
        if other.max_restarts > 0 {
            self.max_restarts = other.max_restarts;
        }
        if !other.health_check_interval.is_zero() {
            self.health_check_interval = other.health_check_interval;
        }
    }

    /// Whether this configuration uses the [`MOCK_COMMAND`] sentinel.
    pub fn is_mock(&self) -> bool {
        self.command == MOCK_COMMAND
    }
}

/// Languages that [`LanguageServerConfig::for_language`] knows how to launch.
pub fn supported_languages() -> &'static [&'static str] {
    &SUPPORTED_LANGUAGES
}

const NO_ARGS: &[&str] = &[];
const GOPLS_ARGS: &[&str] = &["serve"];
const STDIO_ARGS: &[&str] = &["--stdio"];

fn launch_defaults(language: &str) -> (&'static str, &'static [&'static str], Option<Value>) {
    match language {
        "go" => (
            "gopls",
            GOPLS_ARGS,
            Some(json!({
                "usePlaceholders": true,
                "completeUnimported": true,
            })),
        ),
        "python" => (
            "pylsp",
            NO_ARGS,
            Some(json!({
                "pylsp": {
                    "plugins": {
                        "pycodestyle": { "enabled": false },
                        "pylint": { "enabled": false },
                    }
                }
            })),
        ),
        "typescript" | "javascript" => ("typescript-language-server", STDIO_ARGS, None),
        "rust" => ("rust-analyzer", NO_ARGS, None),
        "java" => ("jdtls", NO_ARGS, None),
        "cpp" | "c" => ("clangd", NO_ARGS, None),
        _ => ("", NO_ARGS, None),
    }
}
