//! Common test helpers and utilities.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use kadabra_fleet::LanguageServerConfig;
use kadabra_fleet::lsp::Url;
use kadabra_fleet::lsp::types::path_to_url;
use tempfile::TempDir;

/// Command that is guaranteed not to exist on the test machine.
pub const MISSING_COMMAND: &str = "kadabra-fleet-test-no-such-server";

/// Config for a server that only echoes its input back.
///
/// `cat` reflects every request as a message carrying both `id` and
/// `method`, which the client must never take for a response, so the
/// initialize handshake runs into `init_timeout`.
pub fn echo_config(language: &str) -> LanguageServerConfig {
    LanguageServerConfig {
        command: "cat".to_string(),
        args: Vec::new(),
        init_timeout: Duration::from_millis(300),
        request_timeout: Duration::from_millis(300),
        health_check_interval: Duration::ZERO,
        initialization_options: None,
        ..LanguageServerConfig::for_language(language)
    }
}

/// Config whose executable cannot be launched.
pub fn missing_config(language: &str) -> LanguageServerConfig {
    LanguageServerConfig {
        command: MISSING_COMMAND.to_string(),
        health_check_interval: Duration::ZERO,
        ..LanguageServerConfig::for_language(language)
    }
}

/// Config running `script` with `sh -c` and the given environment.
pub fn shell_config(language: &str, script: &str, env: &[(&str, &str)]) -> LanguageServerConfig {
    LanguageServerConfig {
        command: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        env: env
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect::<HashMap<_, _>>(),
        ..echo_config(language)
    }
}

/// Temporary workspace with a single source file.
pub struct TestWorkspace {
    pub dir: TempDir,
}

impl TestWorkspace {
    /// ## Panics
    /// if the temporary directory cannot be created
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        std::fs::write(dir.path().join("main.go"), "package main\n\nfunc main() {}\n")
            .expect("failed to write main.go");
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// ## Panics
    /// if the workspace path cannot be converted
    pub fn root_uri(&self) -> Url {
        path_to_url(self.path()).expect("workspace uri")
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
