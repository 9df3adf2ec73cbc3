//! The TCP accept loop and per-connection driver: accept, spawn a task per
//! connection, extract the login line, then hand lines off to the framer
//! and reliability engine for the lifetime of that socket.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

use crate::app::dispatch;
use crate::client::ClientObject;
use crate::error::{Error, Result};
use crate::framer::{Framer, FramerEvent};
use crate::registry::Registry;

/// The fixed 5-byte preheader of a login frame, already hex-encoded: the
/// wire-level counterpart of `linkframe::config::LoginMarker::BYTES`.
const LOGIN_PREHEADER_HEX: &[u8; 10] = b"2c0000002c";

/// Extracts the client id from the first line of a fresh connection.
///
/// Two login styles are supported behind this trait (see DESIGN.md Open
/// Question #1 for which one this crate defaults to and why) so a host
/// program could swap in the other variant without touching the connection
/// layer.
pub trait IdExtractor: Send + Sync {
    /// Returns the client id if `first_line` is a valid login line for this
    /// variant.
    fn extract(&self, first_line: &[u8]) -> Option<String>;
}

/// Header/ACK variant: the line must start with the login marker
/// `2c 00 00 00 2c`; the id is every byte after it, verbatim.
///
/// This line's declared `payload_len` field (`00 00`, by construction of
/// the marker) does not match the id's actual length — unlike every other
/// line on the wire, the login line is never run through
/// `linkframe::Frame::decode`, precisely because that mismatch would make
/// it fail length validation. See DESIGN.md Open Question #3.
#[derive(Debug, Default)]
pub struct HeaderAckIdExtractor;

impl IdExtractor for HeaderAckIdExtractor {
    fn extract(&self, first_line: &[u8]) -> Option<String> {
        if first_line.len() < 10 || &first_line[0..10] != LOGIN_PREHEADER_HEX {
            return None;
        }
        std::str::from_utf8(&first_line[10..]).ok().map(str::to_string)
    }
}

/// Generic variant: the whole first line, raw, is the client id.
#[derive(Debug, Default)]
pub struct GenericIdExtractor;

impl IdExtractor for GenericIdExtractor {
    fn extract(&self, first_line: &[u8]) -> Option<String> {
        std::str::from_utf8(first_line).ok().map(str::to_string)
    }
}

/// Runs the TCP accept loop until the listener is closed.
pub struct ConnectionServer {
    registry: Arc<Registry>,
    id_extractor: Arc<dyn IdExtractor>,
}

impl ConnectionServer {
    pub fn new(registry: Arc<Registry>, id_extractor: Arc<dyn IdExtractor>) -> Self {
        Self { registry, id_extractor }
    }

    /// Binds the configured `hostname:port`. Split out from [`serve`] so
    /// tests can bind to an OS-assigned port (`port: 0`) and read back the
    /// real address before connecting.
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        let cfg = self.registry.config();
        let addr = format!("{}:{}", cfg.hostname, cfg.port);
        let listener = TcpListener::bind(&addr).await?;
        log::info!("listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    pub async fn run(&self) -> std::io::Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            if let Err(e) = stream.set_nodelay(true) {
                log::warn!("failed to set TCP_NODELAY for {peer}: {e}");
            }
            log::info!("accepted connection from {peer}");

            let registry = self.registry.clone();
            let id_extractor = self.id_extractor.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(registry, id_extractor, stream).await {
                    log::info!("connection from {peer} ended: {e}");
                }
            });
        }
    }
}

async fn handle_connection(registry: Arc<Registry>, id_extractor: Arc<dyn IdExtractor>, stream: TcpStream) -> Result<()> {
    let (mut read_half, write_half) = stream.into_split();
    let mut login_buf = Vec::new();
    let mut read_buf = [0u8; 4096];
    // Shared across the login handshake and the main read loop below so a
    // partial line that arrives glued to the login line's trailing bytes
    // (same TCP segment, split frame) isn't lost to a throwaway instance
    // (spec.md §4.3: "append any further lines from the initial read").
    let mut framer = Framer::new();

    let (client, generation) = loop {
        let n = read_half.read(&mut read_buf).await.map_err(|_| Error::TransportBroken)?;
        if n == 0 {
            return Err(Error::TransportBroken);
        }
        login_buf.extend_from_slice(&read_buf[..n]);
        let Some(pos) = login_buf.iter().position(|&b| b == b'\n') else {
            continue;
        };

        let first_line = login_buf[..pos].to_vec();
        let rest = login_buf[pos + 1..].to_vec();

        let Some(client_id) = id_extractor.extract(&first_line) else {
            log::warn!("rejecting connection: not a valid login line");
            return Err(Error::FrameDecode(linkframe::FrameDecodeError::ShortPreheader));
        };

        let client = registry.get_or_create_client(&client_id, false)?;
        let generation = client.attach_transport(write_half).await?;
        client.reset_on_login();
        client.touch_rx();
        client.send_login_ack().await;
        log::info!("client {client_id}: logged in");

        for event in framer.feed(&rest) {
            process_event(&client, &registry, event).await;
        }
        break (client, generation);
    };

    let connection_timeout = registry.config().connection_timeout();
    loop {
        tokio::select! {
            result = tokio::time::timeout(connection_timeout, read_half.read(&mut read_buf)) => {
                match result {
                    Err(_) => {
                        log::info!("client {}: rx silence exceeded {:?}", client.client_id, connection_timeout);
                        break;
                    }
                    Ok(Err(_)) | Ok(Ok(0)) => break,
                    Ok(Ok(n)) => {
                        client.touch_rx();
                        for event in framer.feed(&read_buf[..n]) {
                            process_event(&client, &registry, event).await;
                        }
                    }
                }
            }
            _ = client.superseded().notified() => {
                log::info!("client {}: superseded by a newer connection", client.client_id);
                break;
            }
        }
    }

    client.detach_transport(generation).await;
    Ok(())
}

async fn process_event(client: &Arc<ClientObject>, registry: &Arc<Registry>, event: std::result::Result<FramerEvent, linkframe::FrameDecodeError>) {
    match event {
        Ok(FramerEvent::Keepalive) => {}
        Ok(FramerEvent::Frame(frame)) => {
            let app_header = frame.app_header.clone();
            let payload = frame.payload.clone();
            let delivered = client.handle_incoming_frame(frame).await;
            // Only dispatch frames `handle_incoming_frame` actually accepted
            // as new: an ACK or a dedup-dropped duplicate must never reach
            // the app a second time (spec.md §4.2 step 3, §8 invariant 1).
            if delivered && !app_header.is_empty() {
                if let Err(e) = dispatch(client, &registry.factories, &app_header, &payload).await {
                    log::warn!("client {}: dispatch failed: {e}", client.client_id);
                }
            }
        }
        Err(e) => {
            log::debug!("client {}: dropping unparseable line: {e}", client.client_id);
        }
    }
}
