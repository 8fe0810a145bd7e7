//! # SwKit Worker
//!
//! The offline caching service worker, as a plain library: every platform
//! event becomes a [`WorkerEvent`] fed to [`ServiceWorker::handle`].
//!
//! ## Architecture
//!
//! ```text
//! WorkerEvent ──► ServiceWorker::handle
//!                    ├── Install   → precache manifest (all-or-nothing)
//!                    ├── Activate  → delete stale namespaces, claim clients
//!                    ├── Fetch     → Classifier → StrategyEngine → Caches / Fetcher
//!                    ├── Message   → SKIP_WAITING / CLEAR_CACHE
//!                    └── Push, NotificationClick
//! ```

pub mod classify;
pub mod clients;
pub mod config;
pub mod event;
pub mod lifecycle;
pub mod push;
pub mod strategy;

use std::sync::Arc;

use swkit_cache::Caches;
use swkit_common::{Result, SwKitError};
use swkit_net::{Fetcher, Request};
use tokio::sync::RwLock;
use tracing::{debug, error, info, trace, warn};
use url::Url;

pub use classify::{Classifier, RequestClass, UrlPattern};
pub use clients::{Client, ClientType, Clients};
pub use config::{CacheNames, NotificationConfig, WorkerConfig};
pub use event::{EventOutcome, WorkerCommand, WorkerEvent};
pub use lifecycle::{Lifecycle, ServiceWorkerId, WorkerState};
pub use push::{Notification, PushPayload};
pub use strategy::{Strategy, StrategyEngine};

/// Resources a worker shares with its host and with other worker versions.
#[derive(Clone)]
pub struct WorkerContext {
    pub caches: Caches,
    pub fetcher: Arc<dyn Fetcher>,
    pub clients: Arc<RwLock<Clients>>,
}

impl WorkerContext {
    pub fn new(caches: Caches, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            caches,
            fetcher,
            clients: Arc::new(RwLock::new(Clients::new())),
        }
    }

    pub fn with_clients(mut self, clients: Arc<RwLock<Clients>>) -> Self {
        self.clients = clients;
        self
    }
}

/// One version of the service worker.
pub struct ServiceWorker {
    id: ServiceWorkerId,
    script_url: Url,
    scope: Url,
    config: WorkerConfig,
    names: CacheNames,
    classifier: Classifier,
    engine: StrategyEngine,
    context: WorkerContext,
    lifecycle: RwLock<Lifecycle>,
    notifications: RwLock<push::Notifications>,
}

impl ServiceWorker {
    /// Create a worker in the `Parsed` state. Fails on invalid configuration.
    pub fn new(
        script_url: Url,
        scope: Url,
        config: WorkerConfig,
        context: WorkerContext,
    ) -> Result<Self> {
        config.validate()?;
        let names = config.cache_names();
        let classifier = Classifier::from_substrings(&config.origin, &config.api_patterns);
        let engine = StrategyEngine::new(
            context.caches.clone(),
            context.fetcher.clone(),
            names.clone(),
            config.resolve(&config.offline_page)?,
            config.network_timeout(),
        );

        Ok(Self {
            id: ServiceWorkerId::new(),
            script_url,
            scope,
            config,
            names,
            classifier,
            engine,
            context,
            lifecycle: RwLock::new(Lifecycle::new()),
            notifications: RwLock::new(push::Notifications::new()),
        })
    }

    pub fn id(&self) -> ServiceWorkerId {
        self.id
    }

    pub fn script_url(&self) -> &Url {
        &self.script_url
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn version(&self) -> &str {
        &self.config.version
    }

    pub fn cache_names(&self) -> &CacheNames {
        &self.names
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub async fn state(&self) -> WorkerState {
        self.lifecycle.read().await.state()
    }

    pub async fn skip_waiting_requested(&self) -> bool {
        self.lifecycle.read().await.skip_waiting_requested()
    }

    /// Notifications still on screen.
    pub async fn notifications(&self) -> Vec<Notification> {
        self.notifications.read().await.active().to_vec()
    }

    /// Retire this worker, releasing the clients it controlled.
    pub async fn make_redundant(&self) {
        self.lifecycle.write().await.make_redundant();
        self.context.clients.write().await.release(self.id);
    }

    /// Dispatch one event.
    pub async fn handle(&self, event: WorkerEvent) -> Result<EventOutcome> {
        trace!(worker = self.id.raw(), event = event.name(), "Dispatching event");
        match event {
            WorkerEvent::Install => self.install().await,
            WorkerEvent::Activate => self.activate().await,
            WorkerEvent::Fetch(request) => self.fetch(request).await,
            WorkerEvent::Message(command) => self.message(command).await,
            WorkerEvent::Push(data) => self.push(data).await,
            WorkerEvent::NotificationClick { notification_id } => {
                self.notification_click(notification_id).await
            }
        }
    }

    async fn install(&self) -> Result<EventOutcome> {
        self.lifecycle.write().await.begin_install()?;
        info!(version = %self.config.version, cache = %self.names.precache, "Installing");

        match self.precache().await {
            Ok(precached) => {
                let mut lifecycle = self.lifecycle.write().await;
                lifecycle.install_succeeded()?;
                let skip_waiting =
                    self.config.skip_waiting_on_install || lifecycle.skip_waiting_requested();
                info!(precached, "Installed");
                Ok(EventOutcome::Installed {
                    precached,
                    skip_waiting,
                })
            }
            Err(e) => {
                error!(version = %self.config.version, error = %e, "Install failed");
                self.lifecycle.write().await.install_failed(e.to_string());
                Err(SwKitError::install(
                    format!("precaching {} failed", self.names.precache),
                    e,
                ))
            }
        }
    }

    /// Fetch and store every manifest path. A namespace created by a failed
    /// attempt is removed again.
    async fn precache(&self) -> Result<usize> {
        let requests = self
            .config
            .precache_manifest
            .iter()
            .map(|path| self.config.resolve(path).map(Request::get))
            .collect::<Result<Vec<_>>>()?;

        let caches = &self.context.caches;
        let existed = caches.has(&self.names.precache).await?;
        let cache = caches.open(&self.names.precache).await?;

        if let Err(e) = cache.add_all(self.context.fetcher.as_ref(), &requests).await {
            if !existed {
                if let Err(cleanup) = caches.delete(&self.names.precache).await {
                    warn!(
                        cache = %self.names.precache,
                        error = %cleanup,
                        "Failed to remove partial precache"
                    );
                }
            }
            return Err(e);
        }
        Ok(requests.len())
    }

    async fn activate(&self) -> Result<EventOutcome> {
        self.lifecycle.write().await.begin_activate()?;
        info!(version = %self.config.version, "Activating");

        // Activation completes even if garbage collection fails.
        let deleted = match self.collect_stale_caches().await {
            Ok(deleted) => deleted,
            Err(e) => {
                warn!(error = %e, "Stale cache cleanup failed");
                Vec::new()
            }
        };

        self.lifecycle.write().await.activated()?;
        let claimed = self.context.clients.write().await.claim(self.id, &self.scope);
        info!(deleted = deleted.len(), claimed, "Activated");

        Ok(EventOutcome::Activated { deleted, claimed })
    }

    async fn collect_stale_caches(&self) -> Result<Vec<String>> {
        let mut deleted = Vec::new();
        for name in self.context.caches.keys().await? {
            if self.names.contains(&name) {
                continue;
            }
            if self.context.caches.delete(&name).await? {
                info!(cache = %name, "Deleting old cache");
                deleted.push(name);
            }
        }
        Ok(deleted)
    }

    async fn fetch(&self, request: Request) -> Result<EventOutcome> {
        if !self.lifecycle.read().await.is_active() {
            return Ok(EventOutcome::Passthrough);
        }

        let class = self.classifier.classify(&request);
        match Strategy::for_class(class) {
            None => Ok(EventOutcome::Passthrough),
            Some(strategy) => {
                let response = self.engine.execute(strategy, &request).await?;
                Ok(EventOutcome::Response(response))
            }
        }
    }

    async fn message(&self, command: WorkerCommand) -> Result<EventOutcome> {
        debug!(?command, "Command received");
        match command {
            WorkerCommand::SkipWaiting => {
                let waiting = self.lifecycle.write().await.request_skip_waiting();
                info!(waiting, "Skip waiting requested");
                Ok(EventOutcome::SkipWaiting { waiting })
            }
            WorkerCommand::ClearCache => {
                let removed = self.context.caches.clear_all().await?;
                debug!(worker = self.id.raw(), removed, "Clear cache handled");
                Ok(EventOutcome::CachesCleared { removed })
            }
        }
    }

    async fn push(&self, data: Option<String>) -> Result<EventOutcome> {
        let Some(data) = data else {
            return Ok(EventOutcome::Ignored);
        };
        let payload = PushPayload::from_json(&data)?;
        let notification = self
            .notifications
            .write()
            .await
            .show(payload, &self.config.notification);
        Ok(EventOutcome::NotificationShown(notification))
    }

    async fn notification_click(&self, notification_id: u64) -> Result<EventOutcome> {
        self.notifications.write().await.close(notification_id);

        let root = self.config.resolve("/")?;
        let mut clients = self.context.clients.write().await;
        let existing = clients
            .match_all(
                None,
                &clients::ClientMatchOptions {
                    include_uncontrolled: true,
                    client_type: ClientType::Window,
                },
            )
            .into_iter()
            .find(|c| c.url == root)
            .map(|c| c.id.clone());

        let (client_id, opened) = match existing {
            Some(id) => {
                clients.focus(&id)?;
                (id, false)
            }
            None => (clients.open_window(root).id, true),
        };
        debug!(client = %client_id, opened, "Notification clicked");
        Ok(EventOutcome::NotificationClicked { client_id, opened })
    }
}
