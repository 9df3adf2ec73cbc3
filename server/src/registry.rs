//! The process-wide client-id → Client Object map.
//!
//! Grounded in `original_source/server/apphandler/clients.py` (`getClient`,
//! `ClientHelper`, `MultipleClientHelper`, `writeAll`) for the supplemented
//! helpers, and referenced throughout that file's `_getNetwork()` calls for
//! the underlying `clients` map / `new_client` callback / shutdown shape
//! spec.md §4.6 describes directly.
//!
//! Per spec.md §9's "Global state" design note, this registry is passed
//! around as an explicit `Arc<Registry>` handle rather than resolved through
//! a module-level accessor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex as SyncMutex, RwLock};

use crate::app::AppFactoryRegistry;
use crate::client::ClientObject;
use crate::config::NetworkConfig;
use crate::error::{Error, Result};

type NewClientCallback = dyn Fn(Arc<ClientObject>) + Send + Sync;

/// The process-wide registry: one per server instance.
pub struct Registry {
    clients: RwLock<HashMap<String, Arc<ClientObject>>>,
    pub factories: AppFactoryRegistry,
    cfg: NetworkConfig,
    new_client_cb: SyncMutex<Option<Arc<NewClientCallback>>>,
    shutdown_requested: AtomicBool,
}

impl Registry {
    pub fn new(cfg: NetworkConfig) -> Arc<Self> {
        Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            factories: AppFactoryRegistry::new(),
            cfg,
            new_client_cb: SyncMutex::new(None),
            shutdown_requested: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.cfg
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Registers the callback fired whenever a brand-new Client Object is
    /// created (spec.md §2's "callback for new clients").
    pub fn set_new_client_callback<F>(&self, cb: F)
    where
        F: Fn(Arc<ClientObject>) + Send + Sync + 'static,
    {
        *self.new_client_cb.lock() = Some(Arc::new(cb));
    }

    /// Looks up `client_id`, creating a transport-less Client Object if it
    /// doesn't exist yet and `only_with_connection` is false.
    ///
    /// Grounded in `clients.py::getClient`: "basically a future client
    /// object without a transport/socket." See DESIGN.md for this crate's
    /// resolution of `only_with_connection`'s exact meaning.
    pub fn get_or_create_client(self: &Arc<Self>, client_id: &str, only_with_connection: bool) -> Result<Arc<ClientObject>> {
        if let Some(existing) = self.clients.read().get(client_id).cloned() {
            if only_with_connection && !existing.is_connected() {
                return Err(Error::NoSuchClient);
            }
            return Ok(existing);
        }
        if only_with_connection {
            return Err(Error::NoSuchClient);
        }
        let client = ClientObject::new(client_id.to_string(), self.cfg.clone(), Arc::downgrade(self));
        self.clients.write().insert(client_id.to_string(), client.clone());
        self.fire_new_client(client.clone());
        Ok(client)
    }

    /// Looks up an existing Client Object without creating one.
    pub fn get_client(&self, client_id: &str) -> Option<Arc<ClientObject>> {
        self.clients.read().get(client_id).cloned()
    }

    fn fire_new_client(&self, client: Arc<ClientObject>) {
        if let Some(cb) = self.new_client_cb.lock().clone() {
            cb(client);
        }
    }

    /// Currently-attached clients.
    pub fn connected_clients(&self) -> Vec<Arc<ClientObject>> {
        self.clients.read().values().filter(|c| c.is_connected()).cloned().collect()
    }

    /// Every client object known to the registry, connected or not.
    pub fn all_clients(&self) -> Vec<Arc<ClientObject>> {
        self.clients.read().values().cloned().collect()
    }

    /// Removes `client_id` from the map. Called by a Client Object once it
    /// has fully transitioned to `REMOVED`.
    pub(crate) fn forget(&self, client_id: &str) {
        self.clients.write().remove(client_id);
    }

    /// Waits until `client_id` is connected, or `timeout` elapses.
    ///
    /// Grounded in `clients.py::ClientHelper.awaitConnection`.
    pub async fn await_connection(self: &Arc<Self>, client_id: &str, timeout: Option<Duration>) -> Result<Arc<ClientObject>> {
        self.await_connection_many(std::slice::from_ref(&client_id.to_string()), timeout)
            .await
            .map(|mut v| v.remove(0))
    }

    /// Waits until every id in `client_ids` is connected, or `timeout`
    /// elapses.
    ///
    /// Grounded in `clients.py::MultipleClientHelper.awaitConnection`.
    pub async fn await_connection_many(
        self: &Arc<Self>,
        client_ids: &[String],
        timeout: Option<Duration>,
    ) -> Result<Vec<Arc<ClientObject>>> {
        let deadline = timeout.map(|d| Instant::now() + d);
        loop {
            let all: Option<Vec<_>> = client_ids
                .iter()
                .map(|id| self.clients.read().get(id).cloned().filter(|c| c.is_connected()))
                .collect();
            if let Some(clients) = all {
                return Ok(clients);
            }
            match deadline {
                Some(d) => {
                    let remaining = d.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(Error::ReadTimeout);
                    }
                    tokio::time::sleep(std::cmp::min(remaining, Duration::from_millis(50))).await;
                }
                None => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }
    }

    /// Sends `message` to several clients concurrently, reporting success
    /// per id instead of failing the whole batch.
    ///
    /// Grounded in `clients.py::writeAll`; this is what spec.md §8 scenario
    /// S6 exercises.
    #[allow(clippy::too_many_arguments)]
    pub async fn write_all(
        self: &Arc<Self>,
        client_ids: &[String],
        app_ident: u8,
        app_id: u8,
        app_header_byte: u8,
        message: &serde_json::Value,
        timeout: Option<Duration>,
        only_with_connection: bool,
        qos: bool,
    ) -> Vec<(String, bool)> {
        let mut handles = Vec::with_capacity(client_ids.len());
        for id in client_ids {
            let id = id.clone();
            let this = self.clone();
            let message = message.clone();
            handles.push(tokio::spawn(async move {
                let ok = match this.get_or_create_client(&id, only_with_connection) {
                    Ok(client) => client
                        .write_app(app_ident, app_id, app_header_byte, &message, timeout, only_with_connection, qos)
                        .await
                        .is_ok(),
                    Err(_) => false,
                };
                (id, ok)
            }));
        }
        let mut out = Vec::with_capacity(handles.len());
        for h in handles {
            if let Ok(pair) = h.await {
                out.push(pair);
            }
        }
        out
    }

    /// Cascades shutdown to every Client Object, which cascades to every
    /// App Instance (spec.md §4.4/§4.6).
    pub async fn shutdown(self: &Arc<Self>) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        let clients: Vec<_> = self.clients.read().values().cloned().collect();
        for client in clients {
            client.shutdown().await;
        }
        tokio::time::sleep(Duration::from_secs(linkframe::config::SHUTDOWN_GRACE_S)).await;
    }
}
