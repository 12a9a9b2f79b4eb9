//! LSP client implementation.
//!
//! An [`LspClient`] owns exactly one language server process: its three
//! standard pipes, the table correlating in-flight request ids with their
//! waiting callers, and the initialize/shutdown state machine.
//!
//! # Example
//!
//! ```ignore
//! use kadabra_fleet::config::LanguageServerConfig;
//! use kadabra_fleet::lsp::client::LspClient;
//!
//! let client = LspClient::new(&LanguageServerConfig::for_language("go"))?;
//! client.start().await?;
//! let result = client.initialize(Some(root_uri), None).await?;
//! client.initialized().await?;
//! let hover = client.hover(params).await?;
//! client.shutdown().await?;
//! client.exit().await?;
//! client.close().await;
//! ```

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use lsp_types::{
    ClientInfo, CompletionParams, CompletionResponse, GotoDefinitionParams,
    GotoDefinitionResponse, Hover, HoverParams, InitializeParams, InitializeResult,
    InitializedParams, Location, ReferenceParams, TraceValue, Url, WorkspaceFolder,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::LanguageServerConfig;
use crate::error::LspError;

use super::LspResult;
use super::codec::{FrameReader, FrameWriter};
use super::protocol::{self, Incoming, Notification, Request, RequestId, Response};
use super::types::client_capabilities;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// In-flight requests keyed by id; shared by senders and the reader task.
#[derive(Default)]
struct Pending {
    waiters: HashMap<RequestId, oneshot::Sender<Response>>,
    /// Set once the reader has stopped; no response can arrive afterwards.
    closed: bool,
}

type PendingTable = Arc<Mutex<Pending>>;

/// Lifecycle of an [`LspClient`].
///
/// ```text
/// Created -> Started -> Initializing -> Initialized -> ShuttingDown -> Shutdown
///                                                                         |
///                        (any state) ----------- close() ------------> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Constructed; no process yet.
    Created,
    /// Process running, transport wired.
    Started,
    /// `initialize` request in flight.
    Initializing,
    /// Handshake complete; data operations allowed.
    Initialized,
    /// `shutdown` request in flight.
    ShuttingDown,
    /// Server acknowledged `shutdown`.
    Shutdown,
    /// Process killed and pipes closed.
    Closed,
}

/// Client for a single language server process.
pub struct LspClient {
    config: LanguageServerConfig,
    state: Mutex<ClientState>,
    next_id: AtomicU64,
    pending: PendingTable,
    /// Serializes writers; also held while `start` wires the transport.
    writer: tokio::sync::Mutex<Option<FrameWriter<BoxedWriter>>>,
    process: Mutex<Option<Child>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    server: Mutex<Option<InitializeResult>>,
}

impl std::fmt::Debug for LspClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LspClient")
            .field("language", &self.config.language)
            .field("command", &self.config.command)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes its correlation-table entry when the request finishes, times out
/// or is dropped.
struct PendingEntry<'a> {
    table: &'a PendingTable,
    id: RequestId,
}

impl<'a> PendingEntry<'a> {
    fn register(
        table: &'a PendingTable,
        id: RequestId,
        tx: oneshot::Sender<Response>,
    ) -> LspResult<Self> {
        let mut pending = lock(table);
        if pending.closed {
            return Err(LspError::ConnectionClosed);
        }
        pending.waiters.insert(id, tx);
        Ok(Self { table, id })
    }
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        lock(self.table).waiters.remove(&self.id);
    }
}

impl LspClient {
    /// Creates a client for `config`. No process is spawned until
    /// [`start`](Self::start).
    /// ## Errors
    /// Returns [`LspError::InvalidConfig`] if the configuration is invalid.
    pub fn new(config: &LanguageServerConfig) -> LspResult<Self> {
        config.validate()?;
        Ok(Self {
            config: config.clone(),
            state: Mutex::new(ClientState::Created),
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(Pending::default())),
            writer: tokio::sync::Mutex::new(None),
            process: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            server: Mutex::new(None),
        })
    }

    /// Language this client serves.
    pub fn language(&self) -> &str {
        &self.config.language
    }

    /// Configuration this client was created with.
    pub fn config(&self) -> &LanguageServerConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClientState {
        *lock(&self.state)
    }

    /// Capabilities and server info from a successful `initialize`.
    pub fn initialize_result(&self) -> Option<InitializeResult> {
        lock(&self.server).clone()
    }

    /// Whether `start` has ever succeeded (or the client was closed).
    pub fn is_started(&self) -> bool {
        self.state() != ClientState::Created
    }

    /// Whether the initialize handshake completed.
    pub fn is_initialized(&self) -> bool {
        matches!(
            self.state(),
            ClientState::Initialized | ClientState::ShuttingDown | ClientState::Shutdown
        )
    }

    /// Whether the server was shut down or the client closed.
    pub fn is_shutdown(&self) -> bool {
        matches!(self.state(), ClientState::Shutdown | ClientState::Closed)
    }

    /// Spawns the language server and starts the background reader.
    ///
    /// The process inherits this process's environment plus the configured
    /// overrides.
    /// ## Errors
    /// Fails if the client was already started or closed, if the executable
    /// cannot be launched, or if a pipe cannot be captured.
    pub async fn start(&self) -> LspResult<()> {
        let mut writer = self.writer.lock().await;
        match self.state() {
            ClientState::Created => {}
            ClientState::Closed => return Err(LspError::Closed),
            _ => return Err(LspError::AlreadyStarted),
        }

        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| LspError::ServerStartFailed {
            command: self.config.command.clone(),
            source,
        })?;

        let (stdin, stdout, stderr) =
            match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
                (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
                (stdin, stdout, _) => {
                    let missing = if stdin.is_none() {
                        "stdin"
                    } else if stdout.is_none() {
                        "stdout"
                    } else {
                        "stderr"
                    };
                    let _ = child.start_kill();
                    return Err(LspError::PipeUnavailable(missing));
                }
            };

        info!(
            language = %self.config.language,
            command = %self.config.command,
            pid = ?child.id(),
            "started language server"
        );

        self.spawn_reader(stdout);
        self.spawn_task(drain_stderr(
            stderr,
            self.cancel.clone(),
            self.config.language.clone(),
        ));

        {
            let mut state = lock(&self.state);
            if *state == ClientState::Closed {
                let _ = child.start_kill();
                return Err(LspError::Closed);
            }
            *state = ClientState::Started;
            *lock(&self.process) = Some(child);
        }
        *writer = Some(FrameWriter::new(Box::new(stdin)));
        Ok(())
    }

    /// Sends the `initialize` request and returns the server's reply.
    ///
    /// `initialization_options` falls back to the configured payload when
    /// `None`. Failures are not retried here. The caller still has to send
    /// [`initialized`](Self::initialized) afterwards.
    /// ## Errors
    /// Fails if the client is not started, already initialized, or the
    /// request fails or exceeds the configured initialization timeout.
    pub async fn initialize(
        &self,
        root_uri: Option<Url>,
        initialization_options: Option<Value>,
    ) -> LspResult<InitializeResult> {
        {
            let mut state = lock(&self.state);
            match *state {
                ClientState::Started => *state = ClientState::Initializing,
                ClientState::Created => return Err(LspError::NotStarted),
                ClientState::Closed => return Err(LspError::Closed),
                ClientState::Initializing
                | ClientState::Initialized
                | ClientState::ShuttingDown
                | ClientState::Shutdown => return Err(LspError::AlreadyInitialized),
            }
        }

        let params = self.initialize_params(root_uri, initialization_options);
        let result: LspResult<InitializeResult> = self
            .send_request("initialize", Some(params), self.config.init_timeout)
            .await;

        let mut state = lock(&self.state);
        match result {
            Ok(result) if *state == ClientState::Initializing => {
                *state = ClientState::Initialized;
                info!(
                    language = %self.config.language,
                    server = ?result.server_info.as_ref().map(|info| &info.name),
                    "language server initialized"
                );
                *lock(&self.server) = Some(result.clone());
                Ok(result)
            }
            Ok(_) => Err(LspError::Closed),
            Err(e) => {
                if *state == ClientState::Initializing {
                    *state = ClientState::Started;
                }
                Err(e)
            }
        }
    }

    /// Sends the `initialized` notification.
    /// ## Errors
    pub async fn initialized(&self) -> LspResult<()> {
        self.send_notification("initialized", Some(InitializedParams {}))
            .await
    }

    /// Sends the `shutdown` request. A second call after a successful
    /// shutdown returns immediately.
    /// ## Errors
    pub async fn shutdown(&self) -> LspResult<()> {
        let previous = {
            let mut state = lock(&self.state);
            match *state {
                ClientState::ShuttingDown | ClientState::Shutdown | ClientState::Closed => {
                    return Ok(());
                }
                _ => std::mem::replace(&mut *state, ClientState::ShuttingDown),
            }
        };

        let result: LspResult<Value> = self
            .send_request("shutdown", None::<()>, self.config.request_timeout)
            .await;

        let mut state = lock(&self.state);
        let in_progress = *state == ClientState::ShuttingDown;
        match result {
            Ok(_) => {
                if in_progress {
                    *state = ClientState::Shutdown;
                }
                Ok(())
            }
            Err(e) => {
                if in_progress {
                    *state = previous;
                }
                Err(e)
            }
        }
    }

    /// Sends the `exit` notification; the server is expected to terminate.
    /// ## Errors
    pub async fn exit(&self) -> LspResult<()> {
        self.send_notification::<()>("exit", None).await
    }

    /// Requests completions at a position.
    /// ## Errors
    /// Returns [`LspError::NotInitialized`] before the handshake completes.
    pub async fn completion(
        &self,
        params: CompletionParams,
    ) -> LspResult<Option<CompletionResponse>> {
        self.ensure_ready()?;
        self.send_request(
            "textDocument/completion",
            Some(params),
            self.config.request_timeout,
        )
        .await
    }

    /// Requests hover information at a position.
    /// ## Errors
    /// Returns [`LspError::NotInitialized`] before the handshake completes.
    pub async fn hover(&self, params: HoverParams) -> LspResult<Option<Hover>> {
        self.ensure_ready()?;
        self.send_request(
            "textDocument/hover",
            Some(params),
            self.config.request_timeout,
        )
        .await
    }

    /// Requests the definition of the symbol at a position.
    /// ## Errors
    /// Returns [`LspError::NotInitialized`] before the handshake completes.
    pub async fn definition(
        &self,
        params: GotoDefinitionParams,
    ) -> LspResult<Option<GotoDefinitionResponse>> {
        self.ensure_ready()?;
        self.send_request(
            "textDocument/definition",
            Some(params),
            self.config.request_timeout,
        )
        .await
    }

    /// Finds references to the symbol at a position.
    /// ## Errors
    /// Returns [`LspError::NotInitialized`] before the handshake completes.
    pub async fn references(&self, params: ReferenceParams) -> LspResult<Vec<Location>> {
        self.ensure_ready()?;
        let locations: Option<Vec<Location>> = self
            .send_request(
                "textDocument/references",
                Some(params),
                self.config.request_timeout,
            )
            .await?;
        Ok(locations.unwrap_or_default())
    }

    /// Kills the process, closes the pipes and joins background tasks.
    ///
    /// Safe to call from any state and more than once.
    pub async fn close(&self) {
        let previous = std::mem::replace(&mut *lock(&self.state), ClientState::Closed);
        if previous != ClientState::Closed {
            debug!(language = %self.config.language, ?previous, "closing language server client");
        }

        self.cancel.cancel();

        let child = lock(&self.process).take();
        if let Some(mut child) = child {
            let _ = child.start_kill();
            match child.wait().await {
                Ok(status) => {
                    info!(language = %self.config.language, %status, "language server exited");
                }
                Err(e) => {
                    warn!(language = %self.config.language, error = %e, "failed to reap language server");
                }
            }
        }

        self.writer.lock().await.take();

        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for task in tasks {
            let _ = task.await;
        }
    }

    #[allow(deprecated)]
    fn initialize_params(
        &self,
        root_uri: Option<Url>,
        initialization_options: Option<Value>,
    ) -> InitializeParams {
        let workspace_folders = root_uri.as_ref().map(|uri| {
            let name = uri
                .path_segments()
                .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
                .unwrap_or("workspace")
                .to_string();
            vec![WorkspaceFolder {
                uri: uri.clone(),
                name,
            }]
        });

        InitializeParams {
            process_id: Some(std::process::id()),
            root_uri,
            initialization_options: initialization_options
                .or_else(|| self.config.initialization_options.clone()),
            capabilities: client_capabilities(&self.config),
            trace: Some(TraceValue::Off),
            workspace_folders,
            client_info: Some(ClientInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
            ..Default::default()
        }
    }

    fn ensure_ready(&self) -> LspResult<()> {
        match self.state() {
            ClientState::Initialized => Ok(()),
            ClientState::Created | ClientState::Started | ClientState::Initializing => {
                Err(LspError::NotInitialized)
            }
            ClientState::ShuttingDown | ClientState::Shutdown => Err(LspError::ShutDown),
            ClientState::Closed => Err(LspError::Closed),
        }
    }

    pub(crate) fn next_request_id(&self) -> RequestId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn pending_requests(&self) -> usize {
        lock(&self.pending).waiters.len()
    }

    async fn send_request<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<P>,
        timeout: Duration,
    ) -> LspResult<R> {
        let params = params.map(serde_json::to_value).transpose()?;
        let id = self.next_request_id();

        let (tx, rx) = oneshot::channel();
        let _entry = PendingEntry::register(&self.pending, id, tx)?;

        debug!(language = %self.config.language, id, method, "sending request");
        self.write_message(&Request::new(id, method, params)).await?;

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(LspError::ConnectionClosed),
            Err(_) => {
                warn!(language = %self.config.language, id, method, ?timeout, "request timed out");
                return Err(LspError::Timeout(timeout));
            }
        };

        trace!(language = %self.config.language, id, "received response");
        let result = response.into_result()?;
        Ok(serde_json::from_value(result)?)
    }

    async fn send_notification<P: Serialize>(
        &self,
        method: &str,
        params: Option<P>,
    ) -> LspResult<()> {
        let params = params.map(serde_json::to_value).transpose()?;
        debug!(language = %self.config.language, method, "sending notification");
        self.write_message(&Notification::new(method, params)).await
    }

    async fn write_message<T: Serialize>(&self, message: &T) -> LspResult<()> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(LspError::StdinUnavailable)?;
        writer.write_message(message).await?;
        Ok(())
    }

    fn spawn_reader<R>(&self, reader: R)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        self.spawn_task(read_loop(
            reader,
            Arc::clone(&self.pending),
            self.cancel.clone(),
            self.config.language.clone(),
        ));
    }

    fn spawn_task<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        lock(&self.tasks).push(tokio::spawn(task));
    }

    /// Wires an in-memory transport in place of a process.
    #[cfg(test)]
    pub(crate) async fn attach<R, W>(&self, reader: R, writer: W)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut slot = self.writer.lock().await;
        self.spawn_reader(reader);
        *lock(&self.state) = ClientState::Started;
        *slot = Some(FrameWriter::new(Box::new(writer)));
    }
}

impl Drop for LspClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Reads frames until EOF, a fatal transport error or cancellation, then
/// drops every pending sender so waiting callers fail promptly.
async fn read_loop<R: AsyncRead + Unpin>(
    reader: R,
    pending: PendingTable,
    cancel: CancellationToken,
    language: String,
) {
    let mut frames = FrameReader::new(reader);
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = frames.read_frame() => frame,
        };
        match frame {
            Ok(Some(body)) => dispatch(&pending, &body, &language),
            Ok(None) => {
                debug!(language = %language, "language server closed stdout");
                break;
            }
            Err(e) if e.is_recoverable() => {
                warn!(language = %language, error = %e, "skipping malformed frame");
            }
            Err(e) => {
                debug!(language = %language, error = %e, "language server reader stopped");
                break;
            }
        }
    }
    let mut table = lock(&pending);
    table.closed = true;
    table.waiters.clear();
}

fn dispatch(pending: &PendingTable, body: &[u8], language: &str) {
    match protocol::classify(body) {
        Ok(Incoming::Response(response)) => {
            let id = response.id;
            let waiter = lock(pending).waiters.remove(&id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(response);
                }
                None => debug!(language, id, "dropping response without pending request"),
            }
        }
        Ok(Incoming::ServerRequest { id, method }) => {
            debug!(language, %id, method = %method, "discarding server request");
        }
        Ok(Incoming::Notification { method }) => {
            trace!(language, method = %method, "discarding server notification");
        }
        Err(e) => warn!(language, error = %e, "skipping unparseable message"),
    }
}

async fn drain_stderr<R: AsyncRead + Unpin>(stderr: R, cancel: CancellationToken, language: String) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => debug!(language = %language, "stderr: {line}"),
                Ok(None) | Err(_) => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lsp::protocol::{ResponseError, error_codes};
    use lsp_types::{
        PartialResultParams, Position, ReferenceContext, TextDocumentIdentifier,
        TextDocumentPositionParams, WorkDoneProgressParams,
    };
    use serde_json::json;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    fn test_config() -> LanguageServerConfig {
        LanguageServerConfig {
            command: "fake-ls".to_string(),
            request_timeout: Duration::from_secs(5),
            ..LanguageServerConfig::for_language("go")
        }
    }

    fn position_params() -> TextDocumentPositionParams {
        TextDocumentPositionParams {
            text_document: TextDocumentIdentifier {
                uri: Url::parse("file:///work/main.go").unwrap(),
            },
            position: Position::new(3, 7),
        }
    }

    fn hover_params() -> HoverParams {
        HoverParams {
            text_document_position_params: position_params(),
            work_done_progress_params: WorkDoneProgressParams::default(),
        }
    }

    fn completion_params() -> CompletionParams {
        CompletionParams {
            text_document_position: position_params(),
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
            context: None,
        }
    }

    fn definition_params() -> GotoDefinitionParams {
        GotoDefinitionParams {
            text_document_position_params: position_params(),
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        }
    }

    fn reference_params() -> ReferenceParams {
        ReferenceParams {
            text_document_position: position_params(),
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
            context: ReferenceContext {
                include_declaration: true,
            },
        }
    }

    /// Server side of an in-memory connection.
    struct FakeServer {
        incoming: FrameReader<DuplexStream>,
        outgoing: DuplexStream,
    }

    impl FakeServer {
        async fn next_message(&mut self) -> Value {
            let body = self.incoming.read_frame().await.unwrap().unwrap();
            serde_json::from_slice(&body).unwrap()
        }

        async fn next_request(&mut self) -> Request {
            serde_json::from_value(self.next_message().await).unwrap()
        }

        async fn send(&mut self, message: &impl Serialize) {
            FrameWriter::new(&mut self.outgoing)
                .write_message(message)
                .await
                .unwrap();
        }

        async fn reply(&mut self, id: RequestId, result: Value) {
            self.send(&Response::success(id, result)).await;
        }
    }

    async fn connected(config: &LanguageServerConfig) -> (LspClient, FakeServer) {
        let client = LspClient::new(config).unwrap();
        let (client_out, server_in) = tokio::io::duplex(64 * 1024);
        let (server_out, client_in) = tokio::io::duplex(64 * 1024);
        client.attach(client_in, client_out).await;
        let server = FakeServer {
            incoming: FrameReader::new(server_in),
            outgoing: server_out,
        };
        (client, server)
    }

    async fn initialized(config: &LanguageServerConfig) -> (LspClient, FakeServer) {
        let (client, mut server) = connected(config).await;
        let handshake = async {
            let request = server.next_request().await;
            assert_eq!(request.method, "initialize");
            server
                .reply(
                    request.id,
                    json!({
                        "capabilities": { "hoverProvider": true },
                        "serverInfo": { "name": "fake-ls", "version": "0.1.0" }
                    }),
                )
                .await;
        };
        let (result, ()) = tokio::join!(client.initialize(None, None), handshake);
        result.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_request_ids_start_at_one() {
        let client = LspClient::new(&test_config()).unwrap();
        assert_eq!(client.next_request_id(), 1);
        assert_eq!(client.next_request_id(), 2);
        assert_eq!(client.next_request_id(), 3);
    }

    #[tokio::test]
    async fn test_request_ids_unique_under_concurrency() {
        let client = Arc::new(LspClient::new(&test_config()).unwrap());
        let handles: Vec<_> = (0..64)
            .map(|_| {
                let client = Arc::clone(&client);
                tokio::spawn(async move { client.next_request_id() })
            })
            .collect();

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.sort_unstable();
        assert_eq!(ids, (1..=64).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_write_without_process_fails() {
        let client = LspClient::new(&test_config()).unwrap();
        let err = client
            .write_message(&Notification::new("exit", None))
            .await
            .unwrap_err();
        assert!(matches!(err, LspError::StdinUnavailable));
        assert!(err.to_string().contains("stdin not available"));
    }

    #[tokio::test]
    async fn test_data_operations_require_initialize() {
        let client = LspClient::new(&test_config()).unwrap();

        let errors = [
            client.completion(completion_params()).await.unwrap_err(),
            client.hover(hover_params()).await.unwrap_err(),
            client.definition(definition_params()).await.unwrap_err(),
            client.references(reference_params()).await.unwrap_err(),
        ];
        for err in errors {
            assert_eq!(err.code(), error_codes::SERVER_NOT_INITIALIZED);
            assert!(err.to_string().contains("not initialized"));
        }
        assert_eq!(client.next_request_id(), 1, "no request may be issued");
    }

    #[tokio::test]
    async fn test_initialize_requires_start() {
        let client = LspClient::new(&test_config()).unwrap();
        let err = client.initialize(None, None).await.unwrap_err();
        assert!(matches!(err, LspError::NotStarted));
        assert_eq!(client.state(), ClientState::Created);
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let config = LanguageServerConfig {
            command: String::new(),
            ..test_config()
        };
        assert!(matches!(
            LspClient::new(&config),
            Err(LspError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_initialize_handshake() {
        let (client, mut server) = connected(&test_config()).await;
        let root = Url::parse("file:///work/project").unwrap();

        let handshake = async {
            let request = server.next_request().await;
            assert_eq!(request.id, 1);
            assert_eq!(request.method, "initialize");
            let params = request.params.unwrap();
            assert_eq!(params["processId"], std::process::id());
            assert_eq!(params["rootUri"], "file:///work/project");
            assert_eq!(params["workspaceFolders"][0]["name"], "project");
            assert_eq!(params["initializationOptions"]["usePlaceholders"], true);
            assert_eq!(
                params["capabilities"]["textDocument"]["completion"]["completionItem"]
                    ["snippetSupport"],
                true
            );
            server
                .reply(
                    request.id,
                    json!({
                        "capabilities": { "hoverProvider": true },
                        "serverInfo": { "name": "fake-ls", "version": "0.1.0" }
                    }),
                )
                .await;
        };

        let (result, ()) = tokio::join!(client.initialize(Some(root), None), handshake);
        let result = result.unwrap();
        assert_eq!(result.server_info.unwrap().name, "fake-ls");
        assert!(result.capabilities.hover_provider.is_some());
        assert_eq!(client.state(), ClientState::Initialized);
        assert!(client.is_initialized());
        assert_eq!(
            client.initialize_result().unwrap().server_info.unwrap().version.as_deref(),
            Some("0.1.0")
        );
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_caller_initialization_options_win() {
        let (client, mut server) = connected(&test_config()).await;
        let handshake = async {
            let request = server.next_request().await;
            let params = request.params.unwrap();
            assert_eq!(params["initializationOptions"], json!({"custom": 1}));
            server
                .reply(request.id, json!({ "capabilities": {} }))
                .await;
        };
        let (result, ()) = tokio::join!(
            client.initialize(None, Some(json!({"custom": 1}))),
            handshake
        );
        result.unwrap();
    }

    #[tokio::test]
    async fn test_initialize_twice_fails() {
        let (client, _server) = initialized(&test_config()).await;
        let err = client.initialize(None, None).await.unwrap_err();
        assert!(matches!(err, LspError::AlreadyInitialized));
        assert!(err.to_string().contains("already initialized"));
    }

    #[tokio::test]
    async fn test_failed_initialize_can_be_retried() {
        let (client, mut server) = connected(&test_config()).await;
        let failing = async {
            let request = server.next_request().await;
            server
                .send(&Response::failure(
                    request.id,
                    ResponseError::new(error_codes::INTERNAL_ERROR, "workspace not loaded"),
                ))
                .await;
        };
        let (result, ()) = tokio::join!(client.initialize(None, None), failing);
        let err = result.unwrap_err();
        assert_eq!(err.code(), error_codes::INTERNAL_ERROR);
        assert_eq!(client.state(), ClientState::Started);

        let succeeding = async {
            let request = server.next_request().await;
            assert_eq!(request.id, 2);
            server.reply(request.id, json!({ "capabilities": {} })).await;
        };
        let (result, ()) = tokio::join!(client.initialize(None, None), succeeding);
        result.unwrap();
        assert!(client.is_initialized());
    }

    #[tokio::test]
    async fn test_initialized_notification_has_no_id() {
        let (client, mut server) = initialized(&test_config()).await;
        client.initialized().await.unwrap();
        let message = server.next_message().await;
        assert_eq!(message["method"], "initialized");
        assert!(message.get("id").is_none());
        assert_eq!(message["params"], json!({}));
    }

    #[tokio::test]
    async fn test_out_of_order_responses_are_correlated() {
        let (client, mut server) = initialized(&test_config()).await;

        let serve = async {
            let first = server.next_request().await;
            let second = server.next_request().await;
            let (hover, references) = if first.method == "textDocument/hover" {
                (first, second)
            } else {
                (second, first)
            };
            assert_eq!(references.method, "textDocument/references");

            server
                .reply(
                    references.id,
                    json!([{
                        "uri": "file:///work/lib.go",
                        "range": {
                            "start": { "line": 1, "character": 0 },
                            "end": { "line": 1, "character": 4 }
                        }
                    }]),
                )
                .await;
            server
                .reply(
                    hover.id,
                    json!({ "contents": { "kind": "markdown", "value": "func Add(a, b int) int" } }),
                )
                .await;
        };

        let (hover, references, ()) = tokio::join!(
            client.hover(hover_params()),
            client.references(reference_params()),
            serve
        );

        let hover = hover.unwrap().unwrap();
        match hover.contents {
            lsp_types::HoverContents::Markup(markup) => {
                assert_eq!(markup.value, "func Add(a, b int) int");
            }
            other => panic!("unexpected hover contents: {other:?}"),
        }
        let references = references.unwrap();
        assert_eq!(references.len(), 1);
        assert!(references[0].uri.as_str().ends_with("lib.go"));
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_completion_and_definition_results() {
        let (client, mut server) = initialized(&test_config()).await;

        let serve = async {
            let request = server.next_request().await;
            assert_eq!(request.method, "textDocument/completion");
            server
                .reply(
                    request.id,
                    json!({ "isIncomplete": false, "items": [{ "label": "Println" }] }),
                )
                .await;

            let request = server.next_request().await;
            assert_eq!(request.method, "textDocument/definition");
            assert_eq!(request.params.unwrap()["position"], json!({"line": 3, "character": 7}));
            server
                .reply(
                    request.id,
                    json!({
                        "uri": "file:///work/fmt.go",
                        "range": {
                            "start": { "line": 10, "character": 5 },
                            "end": { "line": 10, "character": 12 }
                        }
                    }),
                )
                .await;
        };

        let requests = async {
            let completion = client.completion(completion_params()).await.unwrap();
            let definition = client.definition(definition_params()).await.unwrap();
            (completion, definition)
        };
        let ((completion, definition), ()) = tokio::join!(requests, serve);

        match completion.unwrap() {
            CompletionResponse::List(list) => {
                assert!(!list.is_incomplete);
                assert_eq!(list.items[0].label, "Println");
            }
            CompletionResponse::Array(items) => panic!("expected list, got {items:?}"),
        }
        match definition.unwrap() {
            GotoDefinitionResponse::Scalar(location) => {
                assert_eq!(location.range.start, Position::new(10, 5));
            }
            other => panic!("expected single location, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_null_results() {
        let (client, mut server) = initialized(&test_config()).await;
        let serve = async {
            for _ in 0..2 {
                let request = server.next_request().await;
                server.reply(request.id, Value::Null).await;
            }
        };
        let requests = async {
            let hover = client.hover(hover_params()).await.unwrap();
            let references = client.references(reference_params()).await.unwrap();
            (hover, references)
        };
        let ((hover, references), ()) = tokio::join!(requests, serve);
        assert!(hover.is_none());
        assert!(references.is_empty());
    }

    #[tokio::test]
    async fn test_server_error_surfaces_with_code() {
        let (client, mut server) = initialized(&test_config()).await;
        let serve = async {
            let request = server.next_request().await;
            server
                .send(&Response::failure(
                    request.id,
                    ResponseError::new(error_codes::CONTENT_MODIFIED, "content modified"),
                ))
                .await;
        };
        let (result, ()) = tokio::join!(client.hover(hover_params()), serve);
        match result.unwrap_err() {
            LspError::Server(err) => {
                assert_eq!(err.code, error_codes::CONTENT_MODIFIED);
                assert_eq!(err.message, "content modified");
            }
            other => panic!("expected server error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_and_unsolicited_messages_are_skipped() {
        let (client, mut server) = initialized(&test_config()).await;
        let serve = async {
            let request = server.next_request().await;
            server
                .outgoing
                .write_all(b"Content-Length: 3\r\n\r\nabc")
                .await
                .unwrap();
            server
                .outgoing
                .write_all(b"Content-Length: oops\r\n\r\n")
                .await
                .unwrap();
            server
                .send(&Notification::new(
                    "window/logMessage",
                    Some(json!({"type": 3, "message": "indexing"})),
                ))
                .await;
            // A server request reusing our id must not be taken as the reply.
            server
                .send(&Request::new(
                    request.id,
                    "workspace/configuration",
                    Some(json!({})),
                ))
                .await;
            server
                .reply(request.id, json!({ "contents": "plain text" }))
                .await;
        };
        let (hover, ()) = tokio::join!(client.hover(hover_params()), serve);
        let hover = hover.unwrap().unwrap();
        assert!(matches!(hover.contents, lsp_types::HoverContents::Scalar(_)));
    }

    #[tokio::test]
    async fn test_non_utf8_header_keeps_connection_alive() {
        let (client, mut server) = initialized(&test_config()).await;
        let serve = async {
            let request = server.next_request().await;
            server
                .outgoing
                .write_all(b"X-Trace: \xff\xfe\r\n")
                .await
                .unwrap();
            server
                .reply(request.id, json!({ "contents": "after garbage" }))
                .await;
        };
        let (hover, ()) = tokio::join!(client.hover(hover_params()), serve);
        assert!(hover.unwrap().is_some());
        assert_eq!(client.state(), ClientState::Initialized);
    }

    #[tokio::test]
    async fn test_unknown_response_id_is_ignored() {
        let (client, mut server) = initialized(&test_config()).await;
        let serve = async {
            let request = server.next_request().await;
            server.reply(request.id + 100, json!({"contents": "wrong"})).await;
            server.reply(request.id, json!({"contents": "right"})).await;
        };
        let (hover, ()) = tokio::join!(client.hover(hover_params()), serve);
        match hover.unwrap().unwrap().contents {
            lsp_types::HoverContents::Scalar(lsp_types::MarkedString::String(text)) => {
                assert_eq!(text, "right");
            }
            other => panic!("unexpected contents: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_cleans_pending_entry() {
        let config = LanguageServerConfig {
            request_timeout: Duration::from_millis(50),
            ..test_config()
        };
        let (client, mut server) = initialized(&config).await;
        let (result, _) = tokio::join!(client.hover(hover_params()), server.next_request());
        assert!(matches!(result, Err(LspError::Timeout(_))));
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_dropped_request_cleans_pending_entry() {
        let (client, _server) = initialized(&test_config()).await;
        let outcome =
            tokio::time::timeout(Duration::from_millis(20), client.hover(hover_params())).await;
        assert!(outcome.is_err());
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_server_eof_fails_waiting_requests() {
        let (client, mut server) = initialized(&test_config()).await;
        let serve = async {
            server.next_request().await;
            drop(server);
        };
        let (result, ()) = tokio::join!(client.hover(hover_params()), serve);
        assert!(matches!(result, Err(LspError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (client, mut server) = initialized(&test_config()).await;
        let serve = async {
            let request = server.next_request().await;
            assert_eq!(request.method, "shutdown");
            assert!(request.params.is_none());
            server.reply(request.id, Value::Null).await;
        };
        let (result, ()) = tokio::join!(client.shutdown(), serve);
        result.unwrap();
        assert!(client.is_shutdown());

        client.shutdown().await.unwrap();
        // initialize = 1, shutdown = 2; the second shutdown sent nothing.
        assert_eq!(client.next_request_id(), 3);

        let err = client.hover(hover_params()).await.unwrap_err();
        assert!(matches!(err, LspError::ShutDown));
    }

    #[tokio::test]
    async fn test_exit_is_a_notification() {
        let (client, mut server) = initialized(&test_config()).await;
        client.exit().await.unwrap();
        let message = server.next_message().await;
        assert_eq!(message["method"], "exit");
        assert!(message.get("id").is_none());
        assert!(message.get("params").is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (client, _server) = initialized(&test_config()).await;
        client.close().await;
        client.close().await;

        assert_eq!(client.state(), ClientState::Closed);
        assert!(!client.is_initialized());
        assert!(matches!(
            client.write_message(&Notification::new("exit", None)).await,
            Err(LspError::StdinUnavailable)
        ));
        assert!(matches!(
            client.initialize(None, None).await,
            Err(LspError::Closed)
        ));
        assert!(matches!(client.start().await, Err(LspError::Closed)));
    }

    #[tokio::test]
    async fn test_close_unblocks_waiting_request() {
        let (client, _server) = initialized(&test_config()).await;
        let client = Arc::new(client);

        let waiting = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.hover(hover_params()).await })
        };
        while client.pending_requests() == 0 {
            tokio::task::yield_now().await;
        }

        client.close().await;
        let result = waiting.await.unwrap();
        assert!(matches!(result, Err(LspError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_close_before_start() {
        let client = LspClient::new(&test_config()).unwrap();
        client.close().await;
        assert!(client.is_shutdown());
    }
}
