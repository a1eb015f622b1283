//! Registry of relay clients keyed by server address.
//!
//! Each registered address owns one [`FemtoRelayClient`] with its own backoff
//! controller, built from a shared template configuration. Routing an event
//! to several addresses never lets one unreachable server affect the others.

use std::collections::{BTreeMap, btree_map::Entry};

use log::debug;
use parking_lot::RwLock;

use crate::builder::require_address;
use crate::client::{
    FemtoRelayClient, Flusher, LinkState, RelayClientConfig, RelayError, ShutdownReport,
};
use crate::event::FemtoEvent;

/// Snapshot of one address in the registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandleStatus {
    pub address: String,
    pub registered: bool,
    /// Whether a stream to the address is currently established.
    pub live: bool,
    pub state: Option<LinkState>,
    pub attempt_count: u32,
    pub pending: usize,
}

impl HandleStatus {
    fn absent(address: &str) -> Self {
        Self {
            address: address.to_owned(),
            registered: false,
            live: false,
            state: None,
            attempt_count: 0,
            pending: 0,
        }
    }

    fn of(client: &FemtoRelayClient) -> Self {
        let state = client.state();
        Self {
            address: client.address().to_owned(),
            registered: true,
            live: state == LinkState::Streaming,
            state: Some(state),
            attempt_count: client.backoff().attempt_count(),
            pending: client.pending(),
        }
    }
}

/// Per-address outcome of [`ConnectionRegistry::route`].
#[derive(Debug, Default)]
pub struct RouteReport {
    pub results: Vec<(String, Result<(), RelayError>)>,
}

impl RouteReport {
    /// Addresses that accepted the event for delivery.
    pub fn accepted(&self) -> impl Iterator<Item = &str> {
        self.results
            .iter()
            .filter(|(_, result)| result.is_ok())
            .map(|(address, _)| address.as_str())
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &RelayError)> {
        self.results
            .iter()
            .filter_map(|(address, result)| result.as_ref().err().map(|err| (address.as_str(), err)))
    }

    pub fn is_complete(&self) -> bool {
        self.results.iter().all(|(_, result)| result.is_ok())
    }

    /// Whether every target failed. An empty route counts as failed.
    pub fn all_failed(&self) -> bool {
        self.results.iter().all(|(_, result)| result.is_err())
    }

    pub fn into_failures(self) -> Vec<(String, RelayError)> {
        self.results
            .into_iter()
            .filter_map(|(address, result)| result.err().map(|err| (address, err)))
            .collect()
    }
}

/// Address-keyed set of relay clients.
pub struct ConnectionRegistry {
    template: RelayClientConfig,
    clients: RwLock<BTreeMap<String, FemtoRelayClient>>,
}

impl ConnectionRegistry {
    /// Create an empty registry whose clients are built from `template`.
    pub fn new(template: RelayClientConfig) -> Self {
        Self {
            template,
            clients: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register `address`, starting a client for it if none exists.
    ///
    /// Returns `true` when a new client was created.
    pub fn register(&self, address: &str) -> Result<bool, RelayError> {
        let address = require_address(Some(address), "client")?;
        match self.clients.write().entry(address) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                debug!("registering relay client for {}", slot.key());
                let config = self.template.with_address(slot.key().as_str());
                slot.insert(FemtoRelayClient::with_config(config));
                Ok(true)
            }
        }
    }

    pub fn contains(&self, address: &str) -> bool {
        self.clients.read().contains_key(address)
    }

    pub fn addresses(&self) -> Vec<String> {
        self.clients.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    /// Submit `event` to every listed address.
    ///
    /// Unregistered addresses fail with [`RelayError::UnknownAddress`]; the
    /// remaining addresses still receive the event.
    pub fn route<A: AsRef<str>>(&self, event: &FemtoEvent, addresses: &[A]) -> RouteReport {
        let clients = self.clients.read();
        let results = addresses
            .iter()
            .map(|address| {
                let address = address.as_ref();
                let result = match clients.get(address) {
                    Some(client) => client.submit(event.clone()),
                    None => Err(RelayError::UnknownAddress(address.to_owned())),
                };
                (address.to_owned(), result)
            })
            .collect();
        RouteReport { results }
    }

    /// Submit `event` to every registered address.
    pub fn broadcast(&self, event: &FemtoEvent) -> RouteReport {
        let clients = self.clients.read();
        let results = clients
            .iter()
            .map(|(address, client)| (address.clone(), client.submit(event.clone())))
            .collect();
        RouteReport { results }
    }

    /// Status of every registered address.
    pub fn handles(&self) -> Vec<HandleStatus> {
        self.clients.read().values().map(HandleStatus::of).collect()
    }

    /// Status of `address`, registered or not.
    pub fn status(&self, address: &str) -> HandleStatus {
        self.clients
            .read()
            .get(address)
            .map_or_else(|| HandleStatus::absent(address), HandleStatus::of)
    }

    /// Ask every client to deliver what it holds.
    ///
    /// Returns `true` when every client ended with nothing pending. The
    /// registry lock is released before any client blocks on its flush.
    pub fn flush_all(&self) -> bool {
        let flushers: Vec<Option<Flusher>> =
            self.clients.read().values().map(FemtoRelayClient::flusher).collect();
        flushers
            .iter()
            .fold(true, |all, flusher| flusher.as_ref().is_some_and(Flusher::flush) && all)
    }

    /// Close and forget the client for `address`.
    pub fn deregister(&self, address: &str) -> Option<ShutdownReport> {
        let mut client = self.clients.write().remove(address)?;
        debug!("deregistering relay client for {address}");
        Some(client.close())
    }

    /// Close every client, returning what each could not deliver.
    pub fn close_all(&self) -> BTreeMap<String, ShutdownReport> {
        let clients = std::mem::take(&mut *self.clients.write());
        clients
            .into_iter()
            .map(|(address, mut client)| {
                let report = client.close();
                (address, report)
            })
            .collect()
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("addresses", &self.addresses())
            .finish()
    }
}
