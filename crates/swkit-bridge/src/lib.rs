//! # SwKit Bridge
//!
//! Application-side companion of the service worker.
//!
//! ## Features
//!
//! - **Registration**: registers `/sw.js` for scope `/` and polls for updates
//! - **Update signal**: [`BridgeEvent::UpdateAvailable`] (`sw-update-available`),
//!   once per new worker, only while the page is controlled
//! - **Install prompt**: capture the platform's install offer, show it once
//! - **Utilities**: standalone detection, support check, cache clearing and
//!   storage estimate, unregister
//!
//! The bridge never activates an update on its own; the application decides
//! when to post `SKIP_WAITING` to the waiting worker.

pub mod container;
pub mod environment;
pub mod install;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};
use swkit_cache::StorageEstimate;
use swkit_common::{Result, SwKitError};
use swkit_net::{Request, Response};
use swkit_worker::{Client, ServiceWorker, ServiceWorkerId, WorkerCommand, WorkerState};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use url::Url;

pub use container::{
    ContainerEvent, FetchedScript, Registration, ScriptSource, ServiceWorkerContainer,
    StaticScript,
};
pub use environment::{Capabilities, DisplayEnvironment};
pub use install::{
    AvailabilityCallback, InstallOutcome, InstallPrompt, InstallPromptHandle, InstallPromptResult,
    InstallPromptSlot,
};

/// Name of the update-available event.
pub const UPDATE_AVAILABLE_EVENT: &str = "sw-update-available";

/// Bridge configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Worker script, relative to the page.
    pub script_url: String,

    /// Registration scope, relative to the page.
    pub scope: String,

    /// Seconds between update checks.
    pub update_interval_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            script_url: "/sw.js".to_string(),
            scope: "/".to_string(),
            update_interval_secs: 30 * 60,
        }
    }
}

impl BridgeConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| SwKitError::config_with_source("invalid bridge config", e))
    }
}

/// A worker reference handed to the application.
#[derive(Clone)]
pub struct WorkerHandle {
    worker: Arc<ServiceWorker>,
    container: ServiceWorkerContainer,
}

impl WorkerHandle {
    pub fn id(&self) -> ServiceWorkerId {
        self.worker.id()
    }

    pub fn version(&self) -> &str {
        self.worker.version()
    }

    pub async fn state(&self) -> WorkerState {
        self.worker.state().await
    }

    /// Send a command to the worker (`postMessage`).
    pub async fn post_message(&self, command: WorkerCommand) -> Result<()> {
        self.container.post_message(self.worker.id(), command).await
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.worker.id())
            .field("version", &self.worker.version())
            .finish()
    }
}

/// Events raised to the application.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// A new worker finished installing while the page was controlled.
    UpdateAvailable {
        registration: Registration,
        new_worker: WorkerHandle,
    },
}

impl BridgeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            BridgeEvent::UpdateAvailable { .. } => UPDATE_AVAILABLE_EVENT,
        }
    }
}

/// Everything the bridge needs from its host.
pub struct Platform {
    pub container: ServiceWorkerContainer,
    pub events: mpsc::UnboundedReceiver<ContainerEvent>,
    pub environment: DisplayEnvironment,
    pub capabilities: Capabilities,
}

impl Platform {
    pub fn new(
        container: ServiceWorkerContainer,
        events: mpsc::UnboundedReceiver<ContainerEvent>,
    ) -> Self {
        Self {
            container,
            events,
            environment: DisplayEnvironment::browser(),
            capabilities: Capabilities::default(),
        }
    }

    pub fn with_environment(mut self, environment: DisplayEnvironment) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

struct BridgeInner {
    config: BridgeConfig,
    page_client_id: String,
    script_url: Url,
    scope: Url,
    container: ServiceWorkerContainer,
    container_events: Mutex<mpsc::UnboundedReceiver<ContainerEvent>>,
    environment: DisplayEnvironment,
    capabilities: Capabilities,
    install: InstallPrompt,
    announced: Mutex<HashSet<ServiceWorkerId>>,
    event_tx: mpsc::UnboundedSender<BridgeEvent>,
}

impl BridgeInner {
    async fn check_for_update(&self) -> Result<bool> {
        let result = self.container.update(&self.scope).await;
        self.pump_events().await;
        Ok(result?.is_some())
    }

    /// Turn container events into application events.
    async fn pump_events(&self) {
        let mut events = self.container_events.lock().await;
        while let Ok(event) = events.try_recv() {
            debug!(?event, "Container event");
            if let ContainerEvent::Installed {
                scope,
                worker,
                had_active: true,
            } = event
            {
                if scope == self.scope {
                    self.announce_update(&scope, worker).await;
                }
            }
        }
    }

    async fn announce_update(&self, scope: &Url, worker: ServiceWorkerId) {
        if self.container.controller(&self.page_client_id).await.is_none() {
            return;
        }
        let mut announced = self.announced.lock().await;
        if announced.contains(&worker) {
            return;
        }
        let (Some(registration), Some(new_worker)) = (
            self.container.get_registration(scope).await,
            self.container.worker(worker).await,
        ) else {
            return;
        };

        let version = new_worker.version().to_string();
        let event = BridgeEvent::UpdateAvailable {
            registration,
            new_worker: WorkerHandle {
                worker: new_worker,
                container: self.container.clone(),
            },
        };
        if self.event_tx.send(event).is_ok() {
            announced.insert(worker);
            info!(%version, "New service worker available. Refresh to update.");
        }
    }
}

/// The application's view of its service worker.
pub struct PwaBridge {
    inner: Arc<BridgeInner>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl PwaBridge {
    /// Create a bridge for the page at `page_url`. The page joins the
    /// container's clients as an uncontrolled window.
    pub async fn new(
        page_url: Url,
        config: BridgeConfig,
        platform: Platform,
    ) -> Result<(Self, mpsc::UnboundedReceiver<BridgeEvent>)> {
        let script_url = page_url
            .join(&config.script_url)
            .map_err(|e| SwKitError::InvalidUrl(format!("{}: {e}", config.script_url)))?;
        let scope = page_url
            .join(&config.scope)
            .map_err(|e| SwKitError::InvalidUrl(format!("{}: {e}", config.scope)))?;

        let page = Client::window(page_url);
        let page_client_id = page.id.clone();
        platform.container.clients().write().await.add(page);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let inner = BridgeInner {
            config,
            page_client_id,
            script_url,
            scope,
            container: platform.container,
            container_events: Mutex::new(platform.events),
            environment: platform.environment,
            capabilities: platform.capabilities,
            install: InstallPrompt::new(),
            announced: Mutex::new(HashSet::new()),
            event_tx,
        };

        Ok((
            Self {
                inner: Arc::new(inner),
                poller: Mutex::new(None),
            },
            event_rx,
        ))
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn container(&self) -> &ServiceWorkerContainer {
        &self.inner.container
    }

    /// Client id of the page this bridge runs in.
    pub fn page_client_id(&self) -> &str {
        &self.inner.page_client_id
    }

    /// Register the worker and start polling for updates.
    ///
    /// Returns `None` when service workers are unsupported or registration
    /// failed; failures are logged, not returned.
    pub async fn register(&self) -> Option<Registration> {
        if !self.inner.capabilities.service_worker {
            info!("Service workers are not supported");
            return None;
        }

        let result = self
            .inner
            .container
            .register(&self.inner.script_url, &self.inner.scope)
            .await;
        self.inner.pump_events().await;

        match result {
            Ok(registration) => {
                info!(scope = %registration.scope, "Service worker registered");
                self.start_update_polling().await;
                Some(registration)
            }
            Err(e) => {
                error!(error = %e, "Service worker registration failed");
                None
            }
        }
    }

    async fn start_update_polling(&self) {
        let mut poller = self.poller.lock().await;
        if poller.is_some() {
            return;
        }

        let inner = self.inner.clone();
        let period = inner.config.update_interval();
        *poller = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = inner.check_for_update().await {
                    warn!(error = %e, "Update check failed");
                }
            }
        }));
    }

    /// Check for a new worker version now. Returns whether one was installed.
    pub async fn check_for_update(&self) -> Result<bool> {
        self.inner.check_for_update().await
    }

    /// Worker controlling this page.
    pub async fn controller(&self) -> Option<ServiceWorkerId> {
        self.inner.container.controller(&self.inner.page_client_id).await
    }

    /// Fetch as this page would.
    pub async fn fetch(&self, request: Request) -> Result<Response> {
        self.inner
            .container
            .fetch(Some(self.inner.page_client_id.as_str()), request)
            .await
    }

    /// Listen for install offers. Does nothing (and returns `false`) when the
    /// app already runs standalone.
    pub async fn setup_install_prompt<F>(&self, callback: F) -> bool
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        if self.is_standalone() {
            info!("App is already installed");
            return false;
        }
        self.inner.install.subscribe(Arc::new(callback)).await;
        true
    }

    /// Platform hook: the platform offers installation.
    pub async fn on_install_offer(&self, handle: Box<dyn InstallPromptHandle>) {
        self.inner.install.offer(handle).await;
    }

    /// Platform hook: the app was installed.
    pub async fn on_app_installed(&self) {
        if self.inner.install.is_subscribed().await {
            self.inner.install.installed().await;
        }
    }

    /// Show the captured install offer. Resolves to `unavailable` when there
    /// is none, including on a second call for the same offer.
    pub async fn show_install_prompt(&self) -> InstallPromptResult {
        self.inner.install.show().await
    }

    pub fn is_standalone(&self) -> bool {
        self.inner.environment.is_standalone()
    }

    pub fn is_pwa_supported(&self) -> bool {
        self.inner.capabilities.is_pwa_supported()
    }

    /// Delete every cache namespace.
    pub async fn clear_caches(&self) -> bool {
        if !self.inner.capabilities.cache_storage {
            return false;
        }
        match self.inner.container.caches().clear_all().await {
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, "Failed to clear caches");
                false
            }
        }
    }

    /// Approximate storage usage; zeros when unavailable.
    pub async fn cache_info(&self) -> StorageEstimate {
        if !self.inner.capabilities.storage_estimate {
            return StorageEstimate::unavailable();
        }
        match self.inner.container.caches().estimate().await {
            Ok(estimate) => estimate,
            Err(e) => {
                error!(error = %e, "Failed to get cache info");
                StorageEstimate::unavailable()
            }
        }
    }

    /// Unregister every registration and stop update polling.
    pub async fn unregister(&self) -> bool {
        if !self.inner.capabilities.service_worker {
            return false;
        }
        if let Some(poller) = self.poller.lock().await.take() {
            poller.abort();
        }

        let container = &self.inner.container;
        for registration in container.get_registrations().await {
            if let Err(e) = container.unregister(&registration.scope).await {
                error!(error = %e, "Failed to unregister service workers");
                return false;
            }
        }
        info!("All service workers unregistered");
        true
    }
}

impl Drop for PwaBridge {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.get_mut().take() {
            poller.abort();
        }
    }
}
