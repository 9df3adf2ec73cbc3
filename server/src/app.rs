//! The abstract App / App Instance contract and the app-factory registry.
//!
//! Grounded in `original_source/server/apphandler/apphandler.py`'s
//! `App`/`AppInstance`/`AppHandler` classes. Python discovers concrete app
//! classes by reflection over a YAML config (`apphandler.py::loadApps`,
//! explicitly out of scope per spec.md §1); this crate replaces that with an
//! explicit, host-supplied registry of `AppFactory` objects keyed by
//! `app_ident`, per spec.md §9's "Dynamic dispatch over apps" design note.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::client::ClientObject;
use crate::error::{Error, Result};

/// Command-byte values for the `app_header_byte` of the MQTT-bridge app
/// (`app_ident` reserved as `1`, spec.md §6).
///
/// The MQTT bridge itself is an external collaborator (spec.md §1 Non-goals)
/// and has no implementation in this crate, but its command bytes are part
/// of the stable wire contract any app-multiplexer client relies on, so they
/// are kept here as documentation/constants rather than dropped.
pub mod mqtt_bridge {
    /// Publish a message to a topic.
    pub const PUBLISH: u8 = 1;
    /// Subscribe to a topic.
    pub const SUBSCRIBE: u8 = 2;
    /// Unsubscribe from a topic.
    pub const UNSUBSCRIBE: u8 = 3;
    /// Register a last-will message.
    pub const WILL: u8 = 4;
    /// Bridge's welcome/ack response to the device.
    pub const WELCOME: u8 = 5;
}

/// A per-device, per-app-id instance of a multiplexed application.
///
/// Concrete apps (echo, an MQTT bridge, ...) implement this outside the
/// core; the core only ever calls these four methods.
#[async_trait]
pub trait AppInstance: Send + Sync {
    /// Called when a transport attaches (first connect, or reconnect).
    async fn start(&self);

    /// Called when the underlying transport is lost. The instance is kept
    /// around (not stopped) so it can resume on reconnect.
    async fn pause(&self);

    /// Called once, when the owning client object is evicted or the server
    /// shuts down. The core never persists instance state past this call.
    async fn stop(&self);

    /// Delivers one inbound frame's app-header byte and payload to this
    /// instance. Per spec.md §4.5, implementations MUST NOT block the
    /// dispatcher; long-running work should be spawned as its own task.
    async fn handle(&self, app_header_byte: u8, payload: &[u8]);
}

/// Creates [`AppInstance`]s for one `app_ident` on demand.
///
/// Registered once per `app_ident` with the [`Registry`](crate::registry::Registry)
/// before the server starts accepting connections.
#[async_trait]
pub trait AppFactory: Send + Sync {
    /// Builds a new instance bound to `client` under `app_id`.
    ///
    /// Returning `Err` causes the multiplexer to log and drop the frame that
    /// triggered the creation (spec.md §4.5 step 3), surfaced as
    /// [`Error::AppFactoryError`].
    async fn create(&self, client: Arc<ClientObject>, app_id: u8) -> Result<Arc<dyn AppInstance>>;
}

/// The `app_ident -> factory` registry.
///
/// A plain `HashMap` behind a `parking_lot::RwLock`, since lookups and
/// registrations are synchronous and hold the lock only briefly — unlike the
/// client map in [`Registry`](crate::registry::Registry), this is read far
/// more often than written (once per unseen `(app_id)` per client) and never
/// needs to be awaited on.
#[derive(Default)]
pub struct AppFactoryRegistry {
    factories: RwLock<HashMap<u8, Arc<dyn AppFactory>>>,
}

impl AppFactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the factory for `app_ident`.
    pub fn register(&self, app_ident: u8, factory: Arc<dyn AppFactory>) {
        self.factories.write().insert(app_ident, factory);
    }

    fn get(&self, app_ident: u8) -> Option<Arc<dyn AppFactory>> {
        self.factories.read().get(&app_ident).cloned()
    }
}

/// Dispatches one inbound `(app_header, payload)` pair to the right
/// [`AppInstance`], creating it via the factory registry if this is the
/// first frame this `client`/`app_id` pair has seen.
///
/// Implements spec.md §4.5's inbound dispatch steps 1-4. Step 4's "the
/// handler MUST NOT block the dispatcher" is the App's responsibility, not
/// this function's — dispatch awaits `handle` directly since `handle` itself
/// is expected to hand off long work to its own task.
pub async fn dispatch(
    client: &Arc<ClientObject>,
    factories: &AppFactoryRegistry,
    app_header: &[u8],
    payload: &[u8],
) -> Result<()> {
    if app_header.len() < 3 {
        log::warn!(
            "client {}: dropping frame with missing or short app header ({} bytes)",
            client.client_id,
            app_header.len()
        );
        return Ok(());
    }
    let app_ident = app_header[0];
    let app_id = app_header[1];
    let app_header_byte = app_header[2];

    let instance = match client.get_app_instance(app_id) {
        Some(instance) => instance,
        None => {
            let factory = factories.get(app_ident).ok_or(Error::AppFactoryError)?;
            let instance = factory.create(client.clone(), app_id).await?;
            client.insert_app_instance(app_id, instance.clone());
            instance.start().await;
            instance
        }
    };

    instance.handle(app_header_byte, payload).await;
    Ok(())
}
