//! Manager for language server clients.
//!
//! [`LspManager`] keeps one configuration and at most one live
//! [`LspClient`] per language. Clients are created lazily on first access,
//! supervised by a periodic health check, and restarted within a bounded
//! budget that resets after every successful initialization.
//!
//! Recreation is always lazy: an unhealthy client is closed and evicted by
//! its health check, and the next [`LspManager::get_client`] or
//! [`LspManager::initialize_client`] call builds a fresh one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::join_all;
use lsp_types::Url;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{LanguageServerConfig, supported_languages};
use crate::error::LspError;

use super::LspResult;
use super::client::{ClientState, LspClient};

/// Bound on each step of the shutdown/exit sequence when closing a client.
const GRACEFUL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Registry {
    configs: HashMap<String, LanguageServerConfig>,
    clients: HashMap<String, Arc<LspClient>>,
    restarts: HashMap<String, u32>,
    closed: bool,
}

struct HealthCheck {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl HealthCheck {
    async fn stop(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }
}

struct Inner {
    registry: RwLock<Registry>,
    health_checks: Mutex<HashMap<String, HealthCheck>>,
    /// Serializes `initialize_client` per language.
    init_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    cancel: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registry of language server clients keyed by language identifier.
///
/// All methods take `&self` and may be called concurrently. The manager owns
/// every health-check task; [`close`](Self::close) stops them and shuts down
/// every live client. Dropping the manager without closing it cancels the
/// health checks but leaves client shutdown to the clients' own drop.
pub struct LspManager {
    inner: Arc<Inner>,
}

impl Default for LspManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LspManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LspManager")
            .field("cancelled", &self.inner.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl LspManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: RwLock::new(Registry::default()),
                health_checks: Mutex::new(HashMap::new()),
                init_locks: Mutex::new(HashMap::new()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Registers a language and starts its health check when the configured
    /// interval is non-zero. The manager stores its own copy of `config`.
    /// ## Errors
    /// Fails if the configuration is invalid, the language is already
    /// registered, or the manager is closed.
    pub async fn register_language(&self, config: &LanguageServerConfig) -> LspResult<()> {
        config.validate()?;
        let language = config.language.clone();

        let mut registry = self.inner.registry.write().await;
        if registry.closed {
            return Err(LspError::ManagerClosed);
        }
        if registry.configs.contains_key(&language) {
            return Err(LspError::LanguageAlreadyRegistered(language));
        }
        registry.configs.insert(language.clone(), config.clone());
        registry.restarts.insert(language.clone(), 0);

        if !config.health_check_interval.is_zero() {
            let check = spawn_health_check(&self.inner, &language, config.health_check_interval);
            lock(&self.inner.health_checks).insert(language.clone(), check);
        }
        drop(registry);

        info!(language = %language, command = %config.command, "registered language server");
        Ok(())
    }

    /// Registers every supported language with its default configuration,
    /// skipping languages that are already registered.
    /// ## Errors
    pub async fn register_default_languages(&self) -> LspResult<()> {
        for language in supported_languages() {
            match self
                .register_language(&LanguageServerConfig::for_language(language))
                .await
            {
                Ok(()) | Err(LspError::LanguageAlreadyRegistered(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Removes a language, closing its live client and stopping its health
    /// check.
    /// ## Errors
    /// Returns [`LspError::LanguageNotRegistered`] for unknown languages.
    pub async fn unregister_language(&self, language: &str) -> LspResult<()> {
        let client = {
            let mut registry = self.inner.registry.write().await;
            if registry.configs.remove(language).is_none() {
                return Err(LspError::LanguageNotRegistered(language.to_string()));
            }
            registry.restarts.remove(language);
            registry.clients.remove(language)
        };

        lock(&self.inner.init_locks).remove(language);
        let check = lock(&self.inner.health_checks).remove(language);
        if let Some(check) = check {
            check.stop().await;
        }
        if let Some(client) = client {
            shutdown_gracefully(&client).await;
        }

        info!(language = %language, "unregistered language server");
        Ok(())
    }

    /// Returns the cached client for `language`, creating an unstarted one
    /// on first access.
    /// ## Errors
    /// Fails if the language is not registered or the manager is closed.
    pub async fn get_client(&self, language: &str) -> LspResult<Arc<LspClient>> {
        {
            let registry = self.inner.registry.read().await;
            if registry.closed {
                return Err(LspError::ManagerClosed);
            }
            if let Some(client) = registry.clients.get(language) {
                return Ok(Arc::clone(client));
            }
            if !registry.configs.contains_key(language) {
                return Err(LspError::LanguageNotRegistered(language.to_string()));
            }
        }

        let mut guard = self.inner.registry.write().await;
        let registry = &mut *guard;
        if registry.closed {
            return Err(LspError::ManagerClosed);
        }
        if let Some(client) = registry.clients.get(language) {
            return Ok(Arc::clone(client));
        }
        let config = registry
            .configs
            .get(language)
            .ok_or_else(|| LspError::LanguageNotRegistered(language.to_string()))?;

        let client = Arc::new(LspClient::new(config)?);
        registry
            .clients
            .insert(language.to_string(), Arc::clone(&client));
        debug!(language = %language, "created language server client");
        Ok(client)
    }

    /// Starts (unless already started) and initializes the client for
    /// `language`, then sends `initialized`.
    ///
    /// Concurrent calls for the same language run one at a time; a caller
    /// that waited on another's handshake gets the initialized client. A
    /// client that is already initialized is returned as is. Clients whose
    /// command is [`MOCK_COMMAND`](crate::config::MOCK_COMMAND) are never
    /// started.
    /// ## Errors
    /// Launch failures are returned directly, as is
    /// [`LspError::AlreadyInitialized`] while a handshake started outside the
    /// manager is still in flight, and [`LspError::Closed`] for a client
    /// closed outside the manager (which is evicted). None of these touch
    /// the budget. When the handshake fails and the restart budget allows
    /// it, the client is evicted and [`LspError::RetryScheduled`] is
    /// returned; otherwise the initialize error itself. If `initialized`
    /// cannot be sent the client is evicted and closed.
    pub async fn initialize_client(
        &self,
        language: &str,
        root_uri: Option<Url>,
    ) -> LspResult<Arc<LspClient>> {
        let init_lock = self.inner.init_lock(language);
        let _serialized = init_lock.lock().await;

        let client = self.get_client(language).await?;
        if client.state() == ClientState::Initialized {
            return Ok(client);
        }

        if !client.is_started() && !client.config().is_mock() {
            match client.start().await {
                Ok(()) | Err(LspError::AlreadyStarted) => {}
                Err(e) => return Err(e),
            }
        }

        match client.initialize(root_uri, None).await {
            Ok(_) => {
                if let Err(e) = client.initialized().await {
                    warn!(
                        language = %language,
                        error = %e,
                        "failed to send initialized, evicting client"
                    );
                    self.inner.evict(language, &client).await;
                    client.close().await;
                    return Err(e);
                }
                self.reset_restart_count(language).await;
                Ok(client)
            }
            // A direct `initialize` on the shared client owns the handshake.
            Err(e @ LspError::AlreadyInitialized)
                if matches!(
                    client.state(),
                    ClientState::Initializing | ClientState::Initialized
                ) =>
            {
                Err(e)
            }
            // Closed outside the manager; drop the stale entry without a restart.
            Err(e @ LspError::Closed) => {
                self.inner.evict(language, &client).await;
                Err(e)
            }
            Err(e) => {
                if !self.should_restart(language).await {
                    return Err(e);
                }
                let attempt = self.inner.increment_restart_count(language).await;
                warn!(
                    language = %language,
                    attempt,
                    error = %e,
                    "initialization failed, evicting client for restart"
                );
                self.inner.evict(language, &client).await;
                client.close().await;
                Err(LspError::RetryScheduled {
                    language: language.to_string(),
                    source: Box::new(e),
                })
            }
        }
    }

    /// Gracefully shuts down and evicts the live client, if any.
    pub async fn close_client(&self, language: &str) {
        let client = self.inner.registry.write().await.clients.remove(language);
        if let Some(client) = client {
            shutdown_gracefully(&client).await;
        }
    }

    /// Whether a live, initialized and not shut down client exists.
    pub async fn is_healthy(&self, language: &str) -> bool {
        self.inner.is_healthy(language).await
    }

    /// Whether auto-restart is enabled and another restart fits in the
    /// language's budget.
    pub async fn should_restart(&self, language: &str) -> bool {
        self.inner.should_restart(language).await
    }

    /// Consumes one restart from the language's budget.
    pub async fn increment_restart_count(&self, language: &str) {
        self.inner.increment_restart_count(language).await;
    }

    /// Refills the language's restart budget.
    pub async fn reset_restart_count(&self, language: &str) {
        let mut registry = self.inner.registry.write().await;
        if let Some(count) = registry.restarts.get_mut(language) {
            *count = 0;
        }
    }

    /// Restarts consumed since the last successful initialization.
    pub async fn restart_count(&self, language: &str) -> u32 {
        self.inner
            .registry
            .read()
            .await
            .restarts
            .get(language)
            .copied()
            .unwrap_or(0)
    }

    /// Registered languages, sorted.
    pub async fn registered_languages(&self) -> Vec<String> {
        let registry = self.inner.registry.read().await;
        sorted(registry.configs.keys())
    }

    /// Languages with a live client, sorted.
    pub async fn active_languages(&self) -> Vec<String> {
        let registry = self.inner.registry.read().await;
        sorted(registry.clients.keys())
    }

    /// Number of live clients.
    pub async fn client_count(&self) -> usize {
        self.inner.registry.read().await.clients.len()
    }

    /// Copy of the stored configuration for `language`.
    /// ## Errors
    pub async fn config(&self, language: &str) -> LspResult<LanguageServerConfig> {
        self.inner
            .registry
            .read()
            .await
            .configs
            .get(language)
            .cloned()
            .ok_or_else(|| LspError::LanguageNotRegistered(language.to_string()))
    }

    /// Replaces the stored configuration for `language`.
    ///
    /// A live client keeps the configuration it was created with until it
    /// is recreated. The health check is restarted if its interval changed.
    /// ## Errors
    /// Fails if the configuration is invalid, names a different language,
    /// or the language is not registered.
    pub async fn update_config(
        &self,
        language: &str,
        config: &LanguageServerConfig,
    ) -> LspResult<()> {
        config.validate()?;
        if config.language != language {
            return Err(LspError::InvalidConfig(format!(
                "configuration for {} cannot replace {language}",
                config.language
            )));
        }

        let previous_interval = {
            let mut registry = self.inner.registry.write().await;
            let Some(stored) = registry.configs.get_mut(language) else {
                return Err(LspError::LanguageNotRegistered(language.to_string()));
            };
            let previous = stored.health_check_interval;
            *stored = config.clone();
            previous
        };

        if previous_interval != config.health_check_interval {
            let old = lock(&self.inner.health_checks).remove(language);
            if let Some(old) = old {
                old.stop().await;
            }
            let registry = self.inner.registry.read().await;
            if !registry.closed
                && registry.configs.contains_key(language)
                && !config.health_check_interval.is_zero()
            {
                let check =
                    spawn_health_check(&self.inner, language, config.health_check_interval);
                lock(&self.inner.health_checks).insert(language.to_string(), check);
            }
        }

        debug!(language = %language, "updated language server configuration");
        Ok(())
    }

    /// Stops all health checks and gracefully closes every live client.
    ///
    /// Idempotent. Registration fails afterwards.
    pub async fn close(&self) {
        self.inner.cancel.cancel();

        let clients: Vec<Arc<LspClient>> = {
            let mut registry = self.inner.registry.write().await;
            registry.closed = true;
            registry.clients.drain().map(|(_, client)| client).collect()
        };
        if !clients.is_empty() {
            info!(count = clients.len(), "closing language server clients");
        }
        join_all(clients.iter().map(|client| shutdown_gracefully(client))).await;

        let checks: Vec<HealthCheck> = lock(&self.inner.health_checks)
            .drain()
            .map(|(_, check)| check)
            .collect();
        join_all(checks.into_iter().map(HealthCheck::stop)).await;
    }
}

impl Drop for LspManager {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl Inner {
    async fn is_healthy(&self, language: &str) -> bool {
        self.registry
            .read()
            .await
            .clients
            .get(language)
            .is_some_and(|client| client.is_initialized() && !client.is_shutdown())
    }

    async fn should_restart(&self, language: &str) -> bool {
        let registry = self.registry.read().await;
        let Some(config) = registry.configs.get(language) else {
            return false;
        };
        config.auto_restart
            && registry.restarts.get(language).copied().unwrap_or(0) < config.max_restarts
    }

    fn init_lock(&self, language: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(lock(&self.init_locks).entry(language.to_string()).or_default())
    }

    async fn increment_restart_count(&self, language: &str) -> u32 {
        let mut registry = self.registry.write().await;
        match registry.restarts.get_mut(language) {
            Some(count) => {
                *count = count.saturating_add(1);
                *count
            }
            None => 0,
        }
    }

    /// Removes `client` from the cache unless it was already replaced.
    async fn evict(&self, language: &str, client: &Arc<LspClient>) -> bool {
        let mut registry = self.registry.write().await;
        let cached = registry
            .clients
            .get(language)
            .is_some_and(|current| Arc::ptr_eq(current, client));
        if cached {
            registry.clients.remove(language);
        }
        cached
    }

    /// Acts when the language is unhealthy, including when it has no client:
    /// closes whatever client is cached and consumes one restart.
    async fn check_health(&self, language: &str) {
        let client = {
            let registry = self.registry.read().await;
            if !registry.configs.contains_key(language) {
                return;
            }
            registry.clients.get(language).cloned()
        };

        let state = client.as_ref().map(|client| client.state());
        let busy_or_healthy = client.as_ref().is_some_and(|client| {
            client.state() == ClientState::Initializing
                || (client.is_initialized() && !client.is_shutdown())
        });
        if busy_or_healthy {
            return;
        }
        if !self.should_restart(language).await {
            debug!(language = %language, ?state, "unhealthy language server left in place");
            return;
        }

        match client {
            Some(client) => {
                if !self.evict(language, &client).await {
                    return;
                }
                warn!(language = %language, ?state, "language server unhealthy, evicting client");
                shutdown_gracefully(&client).await;
            }
            None => debug!(language = %language, "no live language server client"),
        }
        self.increment_restart_count(language).await;
    }
}

fn spawn_health_check(inner: &Arc<Inner>, language: &str, interval: Duration) -> HealthCheck {
    let token = inner.cancel.child_token();
    let weak: Weak<Inner> = Arc::downgrade(inner);
    let stop = token.clone();
    let language = language.to_string();

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(inner) = weak.upgrade() else {
                break;
            };
            inner.check_health(&language).await;
        }
        debug!(language = %language, "health check stopped");
    });

    HealthCheck { token, handle }
}

/// Shutdown and exit (each bounded by [`GRACEFUL_TIMEOUT`]) for initialized
/// clients, then an unconditional close.
async fn shutdown_gracefully(client: &LspClient) {
    if client.is_initialized() {
        match tokio::time::timeout(GRACEFUL_TIMEOUT, client.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(language = %client.language(), error = %e, "shutdown failed"),
            Err(_) => debug!(language = %client.language(), "shutdown timed out"),
        }
        match tokio::time::timeout(GRACEFUL_TIMEOUT, client.exit()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(language = %client.language(), error = %e, "exit failed"),
            Err(_) => debug!(language = %client.language(), "exit timed out"),
        }
    }
    client.close().await;
}

fn sorted<'a>(keys: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut keys: Vec<String> = keys.cloned().collect();
    keys.sort_unstable();
    keys
}
