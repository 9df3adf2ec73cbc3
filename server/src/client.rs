//! The durable per-device Client Object: lifecycle state machine, reliable
//! send/receive, and the queues an app reads from and writes to. Sequence
//! assignment and dedup bookkeeping are reused directly from the
//! `linkframe` crate. Holds only a `Weak` back-reference to the registry to
//! avoid a client <-> registry <-> app-instance reference cycle.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use linkframe::{DedupWindow, Frame, SeqCounter};
use parking_lot::Mutex as SyncMutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex as AsyncMutex, Notify, Semaphore};
use tokio::task::JoinHandle;

use crate::app::AppInstance;
use crate::config::NetworkConfig;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::framer::OwnedFrame;
use crate::registry::Registry;

const ACK_WAIT: Duration = Duration::from_millis(linkframe::config::ACK_WAIT_MS);
const INTER_FRAME_GAP: Duration = Duration::from_millis(linkframe::config::INTER_FRAME_GAP_MS);
const EVICTION_GRACE: Duration = Duration::from_secs(linkframe::config::OBJECT_EVICTION_GRACE_S);

/// Where a Client Object sits in the spec.md §4.4 state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Connected,
    Disconnected,
    Closing,
    Removed,
}

struct Reliability {
    seq: SeqCounter,
    dedup: DedupWindow,
    pending_ack_seq: Option<u8>,
    last_ack_seq: Option<u8>,
}

#[derive(Default)]
struct TaskHandles {
    keepalive: Option<JoinHandle<()>>,
    eviction: Option<JoinHandle<()>>,
}

impl TaskHandles {
    fn abort_all(&mut self) {
        if let Some(h) = self.keepalive.take() {
            h.abort();
        }
        if let Some(h) = self.eviction.take() {
            h.abort();
        }
    }
}

/// The durable, reconnect-surviving entity keyed by `client_id`.
pub struct ClientObject {
    pub client_id: String,
    registry: Weak<Registry>,
    cfg: NetworkConfig,

    state: SyncMutex<LifecycleState>,
    reliability: SyncMutex<Reliability>,
    last_rx_time: SyncMutex<Instant>,
    last_tx_time: SyncMutex<Instant>,
    last_connection_time: SyncMutex<Option<Instant>>,

    rx_queue: SyncMutex<VecDeque<(Vec<u8>, Vec<u8>)>>,
    tx_queue: SyncMutex<VecDeque<OwnedFrame>>,
    new_message: Notify,
    ack_notify: Notify,
    /// Fired just before a reconnect swaps in a new transport, so the old
    /// connection's reader task (which otherwise has no other way to learn
    /// it's been superseded) can stop instead of lingering.
    superseded: Notify,

    /// Doubles as `output_lock`: holding the lock is both "have exclusive
    /// access to the transport" and "no other raw write can interleave".
    transport: AsyncMutex<Option<OwnedWriteHalf>>,
    /// Bumped on every `attach_transport`. Lets a connection task that is
    /// about to tear down its transport tell whether it is still the one
    /// currently attached, or whether a reconnect has already superseded it
    /// — see `detach_transport`'s doc comment.
    generation: AtomicU64,
    connected: Event,
    closing: Event,
    removed: AtomicBool,

    send_slot: Semaphore,
    app_instances: SyncMutex<HashMap<u8, Arc<dyn AppInstance>>>,
    tasks: SyncMutex<TaskHandles>,
}

impl ClientObject {
    pub fn new(client_id: String, cfg: NetworkConfig, registry: Weak<Registry>) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            client_id,
            registry,
            cfg,
            state: SyncMutex::new(LifecycleState::Created),
            reliability: SyncMutex::new(Reliability {
                seq: SeqCounter::new(),
                dedup: DedupWindow::new(),
                pending_ack_seq: None,
                last_ack_seq: None,
            }),
            last_rx_time: SyncMutex::new(now),
            last_tx_time: SyncMutex::new(now),
            last_connection_time: SyncMutex::new(None),
            rx_queue: SyncMutex::new(VecDeque::new()),
            tx_queue: SyncMutex::new(VecDeque::new()),
            new_message: Notify::new(),
            ack_notify: Notify::new(),
            superseded: Notify::new(),
            transport: AsyncMutex::new(None),
            generation: AtomicU64::new(0),
            connected: Event::new(),
            closing: Event::new(),
            removed: AtomicBool::new(false),
            send_slot: Semaphore::new(1),
            app_instances: SyncMutex::new(HashMap::new()),
            tasks: SyncMutex::new(TaskHandles::default()),
        })
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.is_set()
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    fn check_removed(&self) -> Result<()> {
        if self.is_removed() {
            Err(Error::ClientRemoved)
        } else {
            Ok(())
        }
    }

    pub fn touch_rx(&self) {
        *self.last_rx_time.lock() = Instant::now();
    }

    pub fn last_rx_time(&self) -> Instant {
        *self.last_rx_time.lock()
    }

    pub fn get_app_instance(&self, app_id: u8) -> Option<Arc<dyn AppInstance>> {
        self.app_instances.lock().get(&app_id).cloned()
    }

    pub fn insert_app_instance(&self, app_id: u8, instance: Arc<dyn AppInstance>) {
        self.app_instances.lock().insert(app_id, instance);
    }

    // ---- connection layer entry points -----------------------------------

    /// Attaches (or reattaches) a transport. Cancels any eviction timer,
    /// starts the keepalive ticker, and (if this is a reconnect) calls
    /// `start` on every existing app instance.
    ///
    /// Returns this attachment's generation number; the caller must thread
    /// it back into [`detach_transport`](Self::detach_transport) so a
    /// superseded connection's teardown can't clobber a newer one (see that
    /// method's doc comment).
    pub async fn attach_transport(self: &Arc<Self>, writer: OwnedWriteHalf) -> Result<u64> {
        self.check_removed()?;
        let is_reconnect = self.state() == LifecycleState::Disconnected;
        self.superseded.notify_waiters();

        let generation = {
            let mut guard = self.transport.lock().await;
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            *guard = Some(writer);
            generation
        };
        {
            let mut tasks = self.tasks.lock();
            tasks.abort_all();
        }
        *self.last_connection_time.lock() = Some(Instant::now());
        self.touch_rx();
        self.connected.set();
        self.closing.clear();
        *self.state.lock() = LifecycleState::Connected;

        self.spawn_keepalive();

        if is_reconnect {
            let instances: Vec<_> = self.app_instances.lock().values().cloned().collect();
            for instance in instances {
                instance.start().await;
            }
        }
        Ok(generation)
    }

    /// Called by the connection layer when the transport is lost (EOF, read
    /// error, or RX-silence timeout). Preserves `rx_queue`/`tx_queue` per
    /// spec.md §1/§3 — see DESIGN.md for why this crate does not clear them
    /// here despite spec.md §4.4's literal wording.
    ///
    /// `generation` must be the value returned by the `attach_transport`
    /// call that started the connection now tearing down. If a reconnect has
    /// already attached a newer transport (`self.generation` has since
    /// advanced), this call is a no-op: the old connection's teardown must
    /// not clear the new transport, abort the new keepalive task, or pause
    /// app instances that the reconnect just resumed. This is the "suppress
    /// its stop-on-close side effect" spec.md §4.3 asks for when a fresher
    /// connection supersedes an older one.
    pub async fn detach_transport(self: &Arc<Self>, generation: u64) {
        {
            let mut guard = self.transport.lock().await;
            if self.generation.load(Ordering::SeqCst) != generation {
                // A reconnect already attached a newer transport while we
                // were tearing down; leave it alone entirely.
                return;
            }
            *guard = None;
        }
        self.connected.clear();
        {
            let mut tasks = self.tasks.lock();
            tasks.abort_all();
        }

        let instances: Vec<_> = self.app_instances.lock().values().cloned().collect();
        for instance in instances {
            instance.pause().await;
        }

        if self.is_removed() {
            return;
        }
        *self.state.lock() = LifecycleState::Disconnected;

        if let Some(ttl) = self.cfg.object_timeout() {
            self.spawn_eviction(ttl);
        }
        // An infinite TTL (`None`) leaves the object in `Disconnected`
        // indefinitely, per spec.md §4.4.
    }

    fn spawn_keepalive(self: &Arc<Self>) {
        let this = self.clone();
        let period = self.cfg.keepalive_period();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                if !this.is_connected() {
                    return;
                }
                // A keepalive has no preheader at all: a bare "\n".
                if this.write_raw(b"\n").await.is_err() {
                    return;
                }
            }
        });
        self.tasks.lock().keepalive = Some(handle);
    }

    fn spawn_eviction(self: &Arc<Self>, ttl: Duration) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            this.evict().await;
        });
        self.tasks.lock().eviction = Some(handle);
    }

    /// TTL-driven removal: `CLOSING`, a short grace period, then `REMOVED`.
    async fn evict(self: &Arc<Self>) {
        if self.state() != LifecycleState::Disconnected {
            return; // reconnected or already handled
        }
        *self.state.lock() = LifecycleState::Closing;
        self.closing.set();
        tokio::time::sleep(EVICTION_GRACE).await;
        self.finish_removal().await;
    }

    /// Global-shutdown path: skips the TTL wait, still gives app instances
    /// the closing signal and the same grace window before stopping them.
    pub async fn shutdown(self: &Arc<Self>) {
        {
            let mut guard = self.transport.lock().await;
            *guard = None;
        }
        self.connected.clear();
        *self.state.lock() = LifecycleState::Closing;
        self.closing.set();
        self.tasks.lock().abort_all();
        self.finish_removal().await;
    }

    async fn finish_removal(self: &Arc<Self>) {
        let instances: Vec<_> = self.app_instances.lock().values().cloned().collect();
        for instance in instances {
            instance.stop().await;
        }
        self.app_instances.lock().clear();
        self.removed.store(true, Ordering::SeqCst);
        *self.state.lock() = LifecycleState::Removed;
        self.new_message.notify_waiters();
        self.ack_notify.notify_waiters();
        if let Some(registry) = self.registry.upgrade() {
            registry.forget(&self.client_id);
        }
    }

    // ---- receive path (spec.md §4.2) --------------------------------------

    /// Processes one post-login frame: ACK bookkeeping, dedup, delivery, and
    /// (for QOS frames) emitting the matching ACK.
    ///
    /// Returns `true` only if this frame was newly delivered to `rx_queue`
    /// (not an ACK, not a duplicate) — the caller must gate app-multiplexer
    /// dispatch on this so a dedup-dropped duplicate is never handed to the
    /// app a second time (spec.md §4.2 step 3, §8 invariant 1).
    pub async fn handle_incoming_frame(self: &Arc<Self>, frame: OwnedFrame) -> bool {
        if frame.is_ack() {
            let mut r = self.reliability.lock();
            r.last_ack_seq = Some(frame.seq);
            drop(r);
            self.ack_notify.notify_waiters();
            return false;
        }

        if frame.seq == 0 {
            self.reliability.lock().dedup.reset();
        }

        let is_new = self.reliability.lock().dedup.mark(frame.seq);
        if is_new {
            self.deliver(frame.app_header.clone(), frame.payload.clone());
        }
        if frame.flags.is_qos() {
            self.send_ack(frame.seq).await;
        }
        is_new
    }

    /// Handles the login-frame's special "reset dedup state" semantics; see
    /// DESIGN.md Open Question #3 for why this bypasses the generic
    /// `seq == 0` rule for the header/ACK protocol variant this crate uses.
    pub fn reset_on_login(&self) {
        self.reliability.lock().dedup.reset();
    }

    fn deliver(&self, app_header: Vec<u8>, payload: Vec<u8>) {
        let mut q = self.rx_queue.lock();
        if q.len() >= self.cfg.queue_cap {
            q.pop_front();
            log::debug!("client {}: rx_queue full, dropped oldest", self.client_id);
        }
        q.push_back((app_header, payload));
        drop(q);
        self.new_message.notify_waiters();
    }

    /// Sends the immediate login ACK this protocol variant uses (see
    /// DESIGN.md Open Question #1). The login frame's pseudo-`seq` byte in
    /// this variant is the ACK-marker value itself, so the ACK simply
    /// echoes it.
    pub async fn send_login_ack(&self) {
        self.send_ack(0x2c).await;
    }

    /// Lets the connection layer watch for being superseded by a reconnect.
    pub(crate) fn superseded(&self) -> &Notify {
        &self.superseded
    }

    async fn send_ack(&self, seq: u8) {
        let frame = Frame::new_ack(seq);
        let mut buf = [0u8; 16];
        if let Ok(n) = frame.encode(&mut buf) {
            let _ = self.write_raw(&buf[..n]).await;
        }
    }

    /// Reads the next delivered `(app_header, payload)` pair, waiting up to
    /// `timeout` (or forever if `None`).
    pub async fn read(self: &Arc<Self>, timeout: Option<Duration>) -> Result<(Vec<u8>, Vec<u8>)> {
        let fut = self.read_inner();
        match timeout {
            Some(d) => tokio::time::timeout(d, fut).await.map_err(|_| Error::ReadTimeout)?,
            None => fut.await,
        }
    }

    async fn read_inner(self: &Arc<Self>) -> Result<(Vec<u8>, Vec<u8>)> {
        loop {
            self.check_removed()?;
            let notified = self.new_message.notified();
            if let Some(item) = self.rx_queue.lock().pop_front() {
                return Ok(item);
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
        }
    }

    // ---- send path (spec.md §4.2, §4.5) -----------------------------------

    /// Constructs and sends an application frame. Mirrors the Python
    /// `write(app_ident, app_id, app_header_byte, message, timeout,
    /// only_with_connection, qos)` signature from `clients.py`.
    pub async fn write_app(
        self: &Arc<Self>,
        app_ident: u8,
        app_id: u8,
        app_header_byte: u8,
        message: &serde_json::Value,
        timeout: Option<Duration>,
        only_with_connection: bool,
        qos: bool,
    ) -> Result<()> {
        self.check_removed()?;
        if only_with_connection && !self.is_connected() {
            return Err(Error::NoSuchClient);
        }
        let app_header = [app_ident, app_id, app_header_byte];
        let payload = serde_json::to_vec(message).expect("serde_json::Value serialization is infallible");
        self.send(&app_header, &payload, qos, timeout).await
    }

    async fn send(self: &Arc<Self>, app_header: &[u8], payload: &[u8], qos: bool, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|d| Instant::now() + d);
        let permit = match deadline {
            Some(d) => {
                let remaining = d.saturating_duration_since(Instant::now());
                tokio::time::timeout(remaining, self.send_slot.acquire())
                    .await
                    .map_err(|_| Error::WriteTimeout)?
                    .expect("send_slot semaphore is never closed")
            }
            None => self.send_slot.acquire().await.expect("send_slot semaphore is never closed"),
        };

        let seq = self.reliability.lock().seq.advance();
        let frame = Frame::new_data(seq, qos, app_header, payload)?;
        let mut buf = vec![0u8; frame.wire_len()];
        frame.encode(&mut buf)?;

        let result = if !qos {
            self.pace_and_write(&buf).await
        } else {
            self.send_qos(seq, &buf, deadline).await
        };

        drop(permit);
        result
    }

    async fn pace_and_write(&self, buf: &[u8]) -> Result<()> {
        self.wait_inter_frame_gap().await;
        self.write_raw(buf).await?;
        *self.last_tx_time.lock() = Instant::now();
        Ok(())
    }

    async fn send_qos(self: &Arc<Self>, seq: u8, buf: &[u8], deadline: Option<Instant>) -> Result<()> {
        self.reliability.lock().pending_ack_seq = Some(seq);
        let result = self.send_qos_loop(seq, buf, deadline).await;
        self.reliability.lock().pending_ack_seq = None;
        result
    }

    async fn send_qos_loop(self: &Arc<Self>, seq: u8, buf: &[u8], deadline: Option<Instant>) -> Result<()> {
        loop {
            if !self.is_connected() {
                let remaining = match deadline {
                    Some(d) => {
                        let r = d.saturating_duration_since(Instant::now());
                        if r.is_zero() {
                            return Err(Error::WriteTimeout);
                        }
                        Some(r)
                    }
                    None => None,
                };
                match remaining {
                    Some(r) => {
                        if !self.connected.wait_timeout(r).await {
                            return Err(Error::WriteTimeout);
                        }
                    }
                    None => self.connected.wait().await,
                }
            }

            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return Err(Error::WriteTimeout);
                }
            }

            if self.pace_and_write(buf).await.is_err() {
                continue; // transport broken mid-attempt: retry once reconnected
            }

            let ack_wait = match deadline {
                Some(d) => std::cmp::min(ACK_WAIT, d.saturating_duration_since(Instant::now())),
                None => ACK_WAIT,
            };
            if ack_wait.is_zero() {
                return Err(Error::WriteTimeout);
            }
            if self.wait_for_ack(seq, ack_wait).await {
                return Ok(());
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return Err(Error::WriteTimeout);
                }
            }
            // ACK window elapsed before the overall deadline: retransmit.
        }
    }

    async fn wait_for_ack(&self, seq: u8, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let r = self.reliability.lock();
                if r.last_ack_seq == Some(seq) {
                    return true;
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let notified = self.ack_notify.notified();
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    async fn wait_inter_frame_gap(&self) {
        let since = self.last_tx_time.lock().elapsed();
        if since < INTER_FRAME_GAP {
            tokio::time::sleep(INTER_FRAME_GAP - since).await;
        }
    }

    async fn write_raw(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.transport.lock().await;
        match guard.as_mut() {
            Some(writer) => match writer.write_all(bytes).await {
                Ok(()) => Ok(()),
                Err(_) => {
                    *guard = None;
                    Err(Error::TransportBroken)
                }
            },
            None => Err(Error::TransportBroken),
        }
    }
}
