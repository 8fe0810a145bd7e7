//! Service worker container.
//!
//! Plays the platform's part: loads worker scripts, runs install and
//! activation, keeps the installing/waiting/active slots of each registration
//! and routes page fetches to the controlling worker.
//!
//! Registration jobs (register, update, skip-waiting promotion, unregister)
//! run one at a time.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use hashbrown::HashMap;
use swkit_cache::Caches;
use swkit_common::{OptionExt, Result, SwKitError};
use swkit_net::{Fetcher, Request, Response};
use swkit_worker::{
    Clients, EventOutcome, ServiceWorker, ServiceWorkerId, WorkerCommand, WorkerConfig,
    WorkerContext, WorkerEvent, WorkerState,
};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info};
use url::Url;

// ==================== Script Sources ====================

/// Where a registration's worker definition comes from.
///
/// A worker is identified by its configuration; a different `version` is an
/// update.
#[async_trait]
pub trait ScriptSource: Send + Sync {
    async fn load(&self, script_url: &Url) -> Result<WorkerConfig>;
}

/// In-process worker definition, replaceable to simulate a deployment.
pub struct StaticScript {
    config: RwLock<WorkerConfig>,
}

impl StaticScript {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    /// Publish a new definition; picked up by the next update check.
    pub async fn set(&self, config: WorkerConfig) {
        *self.config.write().await = config;
    }
}

#[async_trait]
impl ScriptSource for StaticScript {
    async fn load(&self, _script_url: &Url) -> Result<WorkerConfig> {
        Ok(self.config.read().await.clone())
    }
}

/// Fetches the worker definition as JSON from the script URL.
pub struct FetchedScript {
    fetcher: Arc<dyn Fetcher>,
}

impl FetchedScript {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl ScriptSource for FetchedScript {
    async fn load(&self, script_url: &Url) -> Result<WorkerConfig> {
        let response = self.fetcher.fetch(&Request::get(script_url.clone())).await?;
        if !response.ok() {
            return Err(SwKitError::network(format!(
                "{script_url} returned {}",
                response.status
            )));
        }
        WorkerConfig::from_json_str(&response.text()?)
    }
}

// ==================== Registration ====================

/// A registration: one scope, one script, up to two live worker versions.
#[derive(Clone)]
pub struct Registration {
    pub scope: Url,
    pub script_url: Url,
    pub waiting: Option<Arc<ServiceWorker>>,
    pub active: Option<Arc<ServiceWorker>>,
}

impl Registration {
    fn new(scope: Url, script_url: Url) -> Self {
        Self {
            scope,
            script_url,
            waiting: None,
            active: None,
        }
    }

    /// The most recently installed worker.
    pub fn newest_worker(&self) -> Option<&Arc<ServiceWorker>> {
        self.waiting.as_ref().or(self.active.as_ref())
    }

    fn workers(&self) -> impl Iterator<Item = &Arc<ServiceWorker>> {
        self.waiting.iter().chain(self.active.iter())
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("scope", &self.scope.as_str())
            .field("script_url", &self.script_url.as_str())
            .field("waiting", &self.waiting.as_ref().map(|w| w.id()))
            .field("active", &self.active.as_ref().map(|w| w.id()))
            .finish()
    }
}

/// Container events.
#[derive(Debug, Clone)]
pub enum ContainerEvent {
    /// A different worker version was found and is being installed.
    UpdateFound { scope: Url },
    /// A new worker finished installing. `had_active` is whether another
    /// version was active at that moment.
    Installed {
        scope: Url,
        worker: ServiceWorkerId,
        had_active: bool,
    },
    InstallFailed { scope: Url, error: String },
    Activated { scope: Url, worker: ServiceWorkerId },
    /// Clients were claimed by a newly active worker.
    ControllerChange { worker: ServiceWorkerId, claimed: usize },
    Unregistered { scope: Url },
}

// ==================== Service Worker Container ====================

/// Service worker container (`navigator.serviceWorker`).
#[derive(Clone)]
pub struct ServiceWorkerContainer {
    context: WorkerContext,
    source: Arc<dyn ScriptSource>,
    registrations: Arc<RwLock<HashMap<String, Registration>>>,
    jobs: Arc<Mutex<()>>,
    event_tx: mpsc::UnboundedSender<ContainerEvent>,
}

impl ServiceWorkerContainer {
    /// Create a new container.
    pub fn new(
        context: WorkerContext,
        source: Arc<dyn ScriptSource>,
    ) -> (Self, mpsc::UnboundedReceiver<ContainerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                context,
                source,
                registrations: Arc::new(RwLock::new(HashMap::new())),
                jobs: Arc::new(Mutex::new(())),
                event_tx,
            },
            event_rx,
        )
    }

    pub fn caches(&self) -> &Caches {
        &self.context.caches
    }

    pub fn clients(&self) -> &Arc<RwLock<Clients>> {
        &self.context.clients
    }

    fn emit(&self, event: ContainerEvent) {
        // Nobody listening is fine.
        let _ = self.event_tx.send(event);
    }

    /// Register a service worker and install it.
    ///
    /// The first worker of a registration activates immediately; later
    /// versions wait unless they asked to skip waiting.
    pub async fn register(&self, script_url: &Url, scope: &Url) -> Result<Registration> {
        if script_url.origin() != scope.origin() {
            return Err(SwKitError::InvalidUrl(format!(
                "script {script_url} is not same-origin with scope {scope}"
            )));
        }

        let _job = self.jobs.lock().await;
        {
            let mut registrations = self.registrations.write().await;
            registrations
                .entry(scope.to_string())
                .and_modify(|r| r.script_url = script_url.clone())
                .or_insert_with(|| Registration::new(scope.clone(), script_url.clone()));
        }
        info!(scope = %scope, script = %script_url, "Registering service worker");

        if let Err(e) = self.update_locked(scope).await {
            // A registration that never got a worker is dropped.
            let mut registrations = self.registrations.write().await;
            if registrations
                .get(scope.as_str())
                .is_some_and(|r| r.newest_worker().is_none())
            {
                registrations.remove(scope.as_str());
            }
            return Err(e);
        }

        self.get_registration(scope)
            .await
            .ok_or_not_found(scope.as_str())
    }

    /// Check the script for a new version and install it if there is one.
    /// Returns the id of the newly installed worker.
    pub async fn update(&self, scope: &Url) -> Result<Option<ServiceWorkerId>> {
        let _job = self.jobs.lock().await;
        self.update_locked(scope).await
    }

    async fn update_locked(&self, scope: &Url) -> Result<Option<ServiceWorkerId>> {
        let (script_url, newest_version) = {
            let registrations = self.registrations.read().await;
            let registration = registrations
                .get(scope.as_str())
                .ok_or_not_found(scope.as_str())?;
            (
                registration.script_url.clone(),
                registration
                    .newest_worker()
                    .map(|w| w.version().to_string()),
            )
        };

        let config = self.source.load(&script_url).await?;
        if newest_version.as_deref() == Some(config.version.as_str()) {
            debug!(scope = %scope, version = %config.version, "No update");
            return Ok(None);
        }

        info!(scope = %scope, version = %config.version, "Update found");
        self.emit(ContainerEvent::UpdateFound {
            scope: scope.clone(),
        });
        self.install_locked(scope, &script_url, config).await.map(Some)
    }

    async fn install_locked(
        &self,
        scope: &Url,
        script_url: &Url,
        config: WorkerConfig,
    ) -> Result<ServiceWorkerId> {
        let worker = Arc::new(ServiceWorker::new(
            script_url.clone(),
            scope.clone(),
            config,
            self.context.clone(),
        )?);

        let skip_waiting = match worker.handle(WorkerEvent::Install).await {
            Ok(EventOutcome::Installed { skip_waiting, .. }) => skip_waiting,
            Ok(other) => {
                return Err(SwKitError::internal(format!(
                    "unexpected install outcome: {other:?}"
                )))
            }
            Err(e) => {
                error!(scope = %scope, error = %e, "Service worker install failed");
                self.emit(ContainerEvent::InstallFailed {
                    scope: scope.clone(),
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        let (had_active, replaced) = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .get_mut(scope.as_str())
                .ok_or_not_found(scope.as_str())?;
            let replaced = registration.waiting.replace(worker.clone());
            (registration.active.is_some(), replaced)
        };
        if let Some(previous) = replaced {
            previous.make_redundant().await;
        }

        self.emit(ContainerEvent::Installed {
            scope: scope.clone(),
            worker: worker.id(),
            had_active,
        });

        if !had_active || skip_waiting {
            self.activate_waiting_locked(scope).await?;
        }
        Ok(worker.id())
    }

    /// Promote the waiting worker: run activation, then retire the previously
    /// active one. On failure both slots are left as they were.
    async fn activate_waiting_locked(&self, scope: &Url) -> Result<Option<ServiceWorkerId>> {
        let (worker, previous) = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .get_mut(scope.as_str())
                .ok_or_not_found(scope.as_str())?;
            let Some(worker) = registration.waiting.clone() else {
                return Ok(None);
            };
            let state = worker.state().await;
            if state != WorkerState::Waiting {
                return Err(SwKitError::InvalidState(format!(
                    "service worker {} is {state:?}, expected waiting",
                    worker.id().raw()
                )));
            }
            registration.waiting = None;
            (worker, registration.active.take())
        };

        let claimed = match worker.handle(WorkerEvent::Activate).await {
            Ok(EventOutcome::Activated { claimed, .. }) => claimed,
            Ok(_) => 0,
            Err(e) => {
                error!(
                    scope = %scope,
                    worker = worker.id().raw(),
                    error = %e,
                    "Activation failed"
                );
                let mut registrations = self.registrations.write().await;
                if let Some(registration) = registrations.get_mut(scope.as_str()) {
                    registration.waiting = Some(worker);
                    registration.active = previous;
                }
                return Err(e);
            }
        };

        if let Some(registration) = self.registrations.write().await.get_mut(scope.as_str()) {
            registration.active = Some(worker.clone());
        }
        if let Some(previous) = previous {
            previous.make_redundant().await;
        }

        self.emit(ContainerEvent::Activated {
            scope: scope.clone(),
            worker: worker.id(),
        });
        self.emit(ContainerEvent::ControllerChange {
            worker: worker.id(),
            claimed,
        });
        Ok(Some(worker.id()))
    }

    /// Deliver a command to a live worker.
    pub async fn post_message(
        &self,
        worker: ServiceWorkerId,
        command: WorkerCommand,
    ) -> Result<()> {
        let _job = self.jobs.lock().await;
        let (scope, target) = self
            .find_worker(worker)
            .await
            .ok_or_not_found(format!("service worker {}", worker.raw()))?;

        let outcome = target.handle(WorkerEvent::Message(command)).await?;
        if let EventOutcome::SkipWaiting { waiting: true } = outcome {
            self.activate_waiting_locked(&scope).await?;
        }
        Ok(())
    }

    async fn find_worker(&self, id: ServiceWorkerId) -> Option<(Url, Arc<ServiceWorker>)> {
        let registrations = self.registrations.read().await;
        registrations.values().find_map(|r| {
            r.workers()
                .find(|w| w.id() == id)
                .map(|w| (r.scope.clone(), w.clone()))
        })
    }

    /// A live (waiting or active) worker by id.
    pub async fn worker(&self, id: ServiceWorkerId) -> Option<Arc<ServiceWorker>> {
        self.find_worker(id).await.map(|(_, w)| w)
    }

    /// Worker controlling a client.
    pub async fn controller(&self, client_id: &str) -> Option<ServiceWorkerId> {
        self.context.clients.read().await.controller_of(client_id)
    }

    /// Fetch on behalf of a page.
    ///
    /// Navigations go to the active worker of the registration whose scope
    /// covers the URL; subresources go to the worker controlling `client_id`.
    /// Anything not intercepted goes straight to the network.
    pub async fn fetch(&self, client_id: Option<&str>, request: Request) -> Result<Response> {
        if let Some(worker) = self.handling_worker(client_id, &request).await {
            if let EventOutcome::Response(response) =
                worker.handle(WorkerEvent::Fetch(request.clone())).await?
            {
                return Ok(response);
            }
        }
        self.context.fetcher.fetch(&request).await
    }

    async fn handling_worker(
        &self,
        client_id: Option<&str>,
        request: &Request,
    ) -> Option<Arc<ServiceWorker>> {
        let registrations = self.registrations.read().await;
        if request.is_navigation() {
            return registrations
                .values()
                .filter(|r| request.url.as_str().starts_with(r.scope.as_str()))
                .max_by_key(|r| r.scope.as_str().len())
                .and_then(|r| r.active.clone());
        }

        let controller = self.context.clients.read().await.controller_of(client_id?)?;
        registrations
            .values()
            .filter_map(|r| r.active.as_ref())
            .find(|w| w.id() == controller)
            .cloned()
    }

    /// Get the registration for exactly this scope.
    pub async fn get_registration(&self, scope: &Url) -> Option<Registration> {
        self.registrations.read().await.get(scope.as_str()).cloned()
    }

    /// Get all registrations, ordered by scope.
    pub async fn get_registrations(&self) -> Vec<Registration> {
        let mut all: Vec<Registration> =
            self.registrations.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.scope.as_str().cmp(b.scope.as_str()));
        all
    }

    /// Unregister a scope. Its workers become redundant and release their
    /// clients immediately.
    pub async fn unregister(&self, scope: &Url) -> Result<bool> {
        let _job = self.jobs.lock().await;
        let removed = self.registrations.write().await.remove(scope.as_str());
        let Some(registration) = removed else {
            return Ok(false);
        };

        for worker in registration.workers() {
            worker.make_redundant().await;
        }
        info!(scope = %scope, "Service worker unregistered");
        self.emit(ContainerEvent::Unregistered {
            scope: scope.clone(),
        });
        Ok(true)
    }
}
