//! Manually opened TCP session: operator sends lines or raw bytes, a pump
//! task forwards whatever the device answers.

use avtool_core::codec::{parse_hex_pairs, to_ascii, to_hex};
use avtool_core::{AvError, AvResult, LineEnding};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(1500);
const RX_CHUNK: usize = 256;
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendMode {
    #[default]
    Ascii,
    Hex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TermEvent {
    Status { connected: bool, host: String, port: u16 },
    Rx { hex: String, ascii: String },
}

/// Bytes to put on the wire for one send request.
///
/// In ascii mode `suffix` is either an escaped line ending (`\r`, `\n`,
/// `\r\n`) or literal text appended as is.
pub fn build_payload(mode: SendMode, data: &str, suffix: &str) -> AvResult<Vec<u8>> {
    match mode {
        SendMode::Hex => parse_hex_pairs(data),
        SendMode::Ascii => {
            let mut out = data.as_bytes().to_vec();
            match LineEnding::from_escaped(suffix) {
                Some(le) => out.extend_from_slice(le.as_bytes()),
                None => out.extend_from_slice(suffix.as_bytes()),
            }
            Ok(out)
        }
    }
}

struct Link {
    peer: SocketAddr,
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct TermState {
    link: Option<Link>,
    generation: u64,
}

#[derive(Clone)]
pub struct TerminalSession {
    state: Arc<Mutex<TermState>>,
    events: broadcast::Sender<TermEvent>,
}

impl Default for TerminalSession {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalSession {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        TerminalSession { state: Arc::new(Mutex::new(TermState::default())), events }
    }

    fn lock(&self) -> MutexGuard<'_, TermState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TermEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> TermEvent {
        match self.lock().link.as_ref() {
            Some(l) => TermEvent::Status { connected: true, host: l.peer.ip().to_string(), port: l.peer.port() },
            None => TermEvent::Status { connected: false, host: String::new(), port: 0 },
        }
    }

    fn emit_status(&self) {
        let _ = self.events.send(self.status());
    }

    /// Replace any open session with a new connection to `host:port`.
    pub async fn connect(&self, host: &str, port: u16) -> AvResult<()> {
        if host.trim().is_empty() || port == 0 {
            return Err(AvError::invalid("missing host or port"));
        }
        if self.close_link() {
            self.emit_status();
        }

        let peer = tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| AvError::NotFound(format!("no address for {}", host)))?;
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(peer))
            .await
            .map_err(|_| AvError::Network(std::io::ErrorKind::TimedOut.into()))??;
        let (reader, writer) = stream.into_split();

        let cancel = CancellationToken::new();
        let generation = {
            let mut s = self.lock();
            s.generation += 1;
            s.link = Some(Link { peer, writer: Arc::new(tokio::sync::Mutex::new(writer)), cancel: cancel.clone() });
            s.generation
        };
        tokio::spawn(pump(self.clone(), reader, generation, cancel));
        info!(%peer, "terminal connected");
        self.emit_status();
        Ok(())
    }

    /// Write one payload. Returns the number of bytes sent.
    pub async fn send(&self, mode: SendMode, data: &str, suffix: &str) -> AvResult<usize> {
        let payload = build_payload(mode, data, suffix)?;
        let writer = match self.lock().link.as_ref() {
            Some(l) => l.writer.clone(),
            None => return Err(AvError::invalid("not connected")),
        };
        let mut w = writer.lock().await;
        w.write_all(&payload).await?;
        debug!(len = payload.len(), "terminal tx");
        Ok(payload.len())
    }

    /// Close the session if any. Always reports the resulting status.
    pub fn disconnect(&self) {
        self.close_link();
        self.emit_status();
    }

    fn close_link(&self) -> bool {
        let link = {
            let mut s = self.lock();
            s.generation += 1;
            s.link.take()
        };
        match link {
            Some(link) => {
                link.cancel.cancel();
                info!(peer = %link.peer, "terminal disconnected");
                true
            }
            None => false,
        }
    }

    fn closed_by_peer(&self, generation: u64) {
        let dropped = {
            let mut s = self.lock();
            if s.generation != generation {
                return;
            }
            s.link.take()
        };
        if let Some(link) = dropped {
            info!(peer = %link.peer, "terminal peer closed");
            self.emit_status();
        }
    }
}

async fn pump(session: TerminalSession, mut reader: OwnedReadHalf, generation: u64, cancel: CancellationToken) {
    let mut buf = [0u8; RX_CHUNK];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            r = reader.read(&mut buf) => match r {
                Ok(0) => break,
                Ok(n) => {
                    let _ = session.events.send(TermEvent::Rx { hex: to_hex(&buf[..n]), ascii: to_ascii(&buf[..n]) });
                }
                Err(e) => {
                    debug!("terminal read failed: {}", e);
                    break;
                }
            }
        }
    }
    session.closed_by_peer(generation);
}
