//! Clients API: the pages a worker can control.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use swkit_common::{OptionExt, Result, SwKitError};
use tracing::debug;
use url::Url;

use crate::lifecycle::ServiceWorkerId;

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    SharedWorker,
    All,
}

/// A client (controlled page).
#[derive(Debug, Clone)]
pub struct Client {
    /// Client ID.
    pub id: String,

    /// Client URL.
    pub url: Url,

    /// Client type.
    pub client_type: ClientType,

    /// Whether focused.
    pub focused: bool,

    /// Worker currently controlling this client.
    pub controller: Option<ServiceWorkerId>,
}

impl Client {
    /// A new, uncontrolled window client.
    pub fn window(url: Url) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self {
            id: format!("client-{}", COUNTER.fetch_add(1, Ordering::Relaxed)),
            url,
            client_type: ClientType::Window,
            focused: false,
            controller: None,
        }
    }
}

/// Options for `clients.matchAll()`.
#[derive(Debug, Clone, Default)]
pub struct ClientMatchOptions {
    pub include_uncontrolled: bool,
    pub client_type: ClientType,
}

/// Clients registry.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<String, Client>,
}

impl Clients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a client.
    pub fn add(&mut self, client: Client) {
        self.clients.insert(client.id.clone(), client);
    }

    /// Remove a client.
    pub fn remove(&mut self, id: &str) -> Option<Client> {
        self.clients.remove(id)
    }

    /// Get a client by ID.
    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Number of known clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Match clients, optionally only those controlled by `worker`.
    pub fn match_all(
        &self,
        worker: Option<ServiceWorkerId>,
        options: &ClientMatchOptions,
    ) -> Vec<&Client> {
        let mut matched: Vec<&Client> = self
            .clients
            .values()
            .filter(|c| {
                options.include_uncontrolled || (worker.is_some() && c.controller == worker)
            })
            .filter(|c| match options.client_type {
                ClientType::All => true,
                t => c.client_type == t,
            })
            .collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        matched
    }

    /// Open a window and focus it.
    pub fn open_window(&mut self, url: Url) -> Client {
        for other in self.clients.values_mut() {
            other.focused = false;
        }
        let mut client = Client::window(url);
        client.focused = true;
        debug!(client = %client.id, url = %client.url, "Window opened");
        self.add(client.clone());
        client
    }

    /// Focus a window client.
    pub fn focus(&mut self, id: &str) -> Result<()> {
        let client_type = self.get(id).ok_or_not_found(id)?.client_type;
        if client_type != ClientType::Window {
            return Err(SwKitError::InvalidState(
                "Can only focus window clients".to_string(),
            ));
        }
        for client in self.clients.values_mut() {
            client.focused = client.id == id;
        }
        Ok(())
    }

    /// Make `worker` the controller of every window client inside `scope`.
    /// Returns how many clients were claimed.
    pub fn claim(&mut self, worker: ServiceWorkerId, scope: &Url) -> usize {
        let mut claimed = 0;
        for client in self.clients.values_mut() {
            if client.client_type == ClientType::Window
                && client.url.as_str().starts_with(scope.as_str())
            {
                client.controller = Some(worker);
                claimed += 1;
            }
        }
        debug!(worker = worker.raw(), claimed, "Clients claimed");
        claimed
    }

    /// Controller of a client.
    pub fn controller_of(&self, id: &str) -> Option<ServiceWorkerId> {
        self.get(id).and_then(|c| c.controller)
    }

    /// Release every client controlled by `worker`.
    pub fn release(&mut self, worker: ServiceWorkerId) {
        for client in self.clients.values_mut() {
            if client.controller == Some(worker) {
                client.controller = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(path: &str) -> Url {
        Url::parse("https://app.test/").unwrap().join(path).unwrap()
    }

    #[test]
    fn test_clients() {
        let mut clients = Clients::new();

        let client = clients.open_window(url("/"));
        assert_eq!(client.client_type, ClientType::Window);
        assert!(client.focused);
        assert!(clients.get(&client.id).is_some());
    }

    #[test]
    fn test_focus_moves_between_windows() {
        let mut clients = Clients::new();
        let a = clients.open_window(url("/a"));
        let b = clients.open_window(url("/b"));
        assert!(!clients.get(&a.id).unwrap().focused);

        clients.focus(&a.id).unwrap();
        assert!(clients.get(&a.id).unwrap().focused);
        assert!(!clients.get(&b.id).unwrap().focused);
        assert!(matches!(clients.focus("missing"), Err(SwKitError::NotFound(_))));
    }

    #[test]
    fn test_claim_respects_scope() {
        let mut clients = Clients::new();
        let inside = Client::window(url("/dashboard"));
        let outside = Client::window(Url::parse("https://other.test/").unwrap());
        let (inside_id, outside_id) = (inside.id.clone(), outside.id.clone());
        clients.add(inside);
        clients.add(outside);

        let worker = ServiceWorkerId::new();
        assert_eq!(clients.claim(worker, &url("/")), 1);
        assert_eq!(clients.controller_of(&inside_id), Some(worker));
        assert_eq!(clients.controller_of(&outside_id), None);

        let controlled = clients.match_all(Some(worker), &ClientMatchOptions::default());
        assert_eq!(controlled.len(), 1);

        let all = clients.match_all(
            None,
            &ClientMatchOptions {
                include_uncontrolled: true,
                client_type: ClientType::All,
            },
        );
        assert_eq!(all.len(), 2);

        clients.release(worker);
        assert_eq!(clients.controller_of(&inside_id), None);
    }
}
