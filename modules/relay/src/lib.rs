//! Single-session TCP relay: one inbound client, one outbound target, bytes
//! streamed both ways and optionally recorded in the capture store.
//!
//! `Stopped -> Listening -> Paired -> Listening ... -> Stopped`. A pair
//! teardown returns to `Listening`; only [`Relay::stop`] closes the listener.

use avtool_core::codec::{to_ascii, to_hex};
use avtool_core::{AvError, AvResult};
use capture_store::CaptureStore;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;
const READ_CHUNK: usize = 1024;
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    pub listen_port: u16,
    pub target_host: String,
    pub target_port: u16,
    #[serde(default)]
    pub capture_to_learn: bool,
}

impl RelayConfig {
    fn validate(&self) -> AvResult<()> {
        if self.target_host.trim().is_empty() || self.target_port == 0 || self.listen_port == 0 {
            return Err(AvError::invalid("missing target or listen port"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    #[serde(rename = "RX(target->client)")]
    TargetToClient,
    #[serde(rename = "TX(client->target)")]
    ClientToTarget,
}

impl Direction {
    pub fn label(self) -> &'static str {
        match self {
            Direction::TargetToClient => "RX(target->client)",
            Direction::ClientToTarget => "TX(client->target)",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatus {
    pub running: bool,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture_to_learn: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelayEvent {
    Status(RelayStatus),
    Data { dir: Direction, hex: String, ascii: String },
    Error { msg: String },
}

#[derive(Debug, Default)]
struct RelayState {
    config: Option<RelayConfig>,
    paired: bool,
    connected: bool,
    /// Bumped on every start/stop so stale pair tasks cannot touch a newer session.
    generation: u64,
    cancel: Option<CancellationToken>,
    accept_task: Option<JoinHandle<()>>,
}

#[derive(Clone)]
pub struct Relay {
    state: Arc<Mutex<RelayState>>,
    events: broadcast::Sender<RelayEvent>,
    store: CaptureStore,
}

impl Relay {
    pub fn new(store: CaptureStore) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Relay { state: Arc::new(Mutex::new(RelayState::default())), events, store }
    }

    fn lock(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: RelayEvent) {
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> RelayStatus {
        snapshot(&self.lock())
    }

    /// Open the listener. A relay that is already running is stopped first.
    /// Bad configuration is reported as an error event followed by the
    /// unchanged status, and leaves any running relay untouched.
    pub async fn start(&self, config: RelayConfig) -> AvResult<()> {
        if let Err(e) = config.validate() {
            self.emit(RelayEvent::Error { msg: e.to_string() });
            self.emit(RelayEvent::Status(self.status()));
            return Err(e);
        }
        if self.lock().config.is_some() {
            self.stop().await;
        }

        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.listen_port));
        let listener = match TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                self.emit(RelayEvent::Error { msg: format!("listen on {} failed: {}", addr, e) });
                return Err(AvError::Network(e));
            }
        };

        let cancel = CancellationToken::new();
        let status = {
            let mut s = self.lock();
            s.generation += 1;
            s.config = Some(config.clone());
            s.paired = false;
            s.connected = false;
            s.cancel = Some(cancel.clone());
            let task = tokio::spawn(accept_loop(self.clone(), listener, s.generation, config.clone(), cancel));
            s.accept_task = Some(task);
            snapshot(&s)
        };
        info!(
            listen = config.listen_port,
            dest = %format!("{}:{}", config.target_host, config.target_port),
            capture = config.capture_to_learn,
            "relay listening"
        );
        self.emit(RelayEvent::Status(status));
        Ok(())
    }

    /// Close the pair and the listener. Safe to call at any time; once it
    /// returns the listen port is free and both pair sockets are closed.
    pub async fn stop(&self) {
        let (token, task) = {
            let mut s = self.lock();
            s.generation += 1;
            s.config = None;
            s.paired = false;
            s.connected = false;
            (s.cancel.take(), s.accept_task.take())
        };
        if let Some(token) = token {
            token.cancel();
        }
        if let Some(task) = task {
            let _ = task.await;
            info!("relay stopped");
        }
        self.emit(RelayEvent::Status(RelayStatus::default()));
    }

    fn claim_pair(&self, generation: u64) -> bool {
        let mut s = self.lock();
        if s.generation != generation || s.paired {
            return false;
        }
        s.paired = true;
        true
    }

    fn mark_connected(&self, generation: u64) -> Option<RelayStatus> {
        let mut s = self.lock();
        if s.generation != generation {
            return None;
        }
        s.connected = true;
        Some(snapshot(&s))
    }

    fn release_pair(&self, generation: u64) -> bool {
        let mut s = self.lock();
        if s.generation != generation {
            return false;
        }
        s.paired = false;
        s.connected = false;
        true
    }

    fn record(&self, dir: Direction, config: &RelayConfig, bytes: &[u8]) {
        debug!(dir = dir.label(), len = bytes.len(), "relay chunk");
        if config.capture_to_learn {
            self.store.append(&format!("PROXY {}", dir.label()), 0, config.listen_port, bytes);
        }
        self.emit(RelayEvent::Data { dir, hex: to_hex(bytes), ascii: to_ascii(bytes) });
    }
}

fn snapshot(s: &RelayState) -> RelayStatus {
    match &s.config {
        None => RelayStatus::default(),
        Some(c) => RelayStatus {
            running: true,
            connected: s.connected,
            listen_port: Some(c.listen_port),
            target_host: Some(c.target_host.clone()),
            target_port: Some(c.target_port),
            capture_to_learn: Some(c.capture_to_learn),
        },
    }
}

async fn accept_loop(relay: Relay, listener: TcpListener, generation: u64, config: RelayConfig, cancel: CancellationToken) {
    let mut pair_task: Option<JoinHandle<()>> = None;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if !relay.claim_pair(generation) {
                        warn!(%peer, "relay already paired, dropping client");
                        drop(stream);
                        continue;
                    }
                    info!(%peer, "relay client accepted");
                    pair_task = Some(tokio::spawn(pair(
                        relay.clone(),
                        generation,
                        stream,
                        config.clone(),
                        cancel.child_token(),
                    )));
                }
                Err(e) => debug!("relay accept failed: {}", e),
            }
        }
    }
    drop(listener);
    if let Some(task) = pair_task {
        let _ = task.await;
    }
}

async fn pair(relay: Relay, generation: u64, inbound: TcpStream, config: RelayConfig, cancel: CancellationToken) {
    if let Err(msg) = run_pair(&relay, generation, inbound, &config, &cancel).await {
        warn!("relay session aborted: {}", msg);
        relay.emit(RelayEvent::Error { msg });
    }
    if relay.release_pair(generation) {
        info!("relay pair closed");
        let status = relay.status();
        relay.emit(RelayEvent::Status(RelayStatus { running: true, connected: false, ..status }));
    }
}

async fn resolve(host: &str, port: u16) -> Option<SocketAddr> {
    tokio::net::lookup_host((host, port)).await.ok()?.next()
}

async fn run_pair(
    relay: &Relay,
    generation: u64,
    mut inbound: TcpStream,
    config: &RelayConfig,
    cancel: &CancellationToken,
) -> Result<(), String> {
    let target = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        r = resolve(&config.target_host, config.target_port) => {
            r.ok_or_else(|| format!("DNS failed for target {}", config.target_host))?
        }
    };
    let mut outbound = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        r = timeout(CONNECT_TIMEOUT, TcpStream::connect(target)) => match r {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(format!("target connect error: {}", e)),
            Err(_) => return Err(format!("target connect to {} timed out", target)),
        }
    };

    match relay.mark_connected(generation) {
        Some(status) => relay.emit(RelayEvent::Status(status)),
        None => return Ok(()),
    }
    info!(dest = %target, "relay paired");

    let mut client_buf = [0u8; READ_CHUNK];
    let mut target_buf = [0u8; READ_CHUNK];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            r = inbound.read(&mut client_buf) => match r {
                Ok(0) => break,
                Ok(n) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        r = outbound.write_all(&client_buf[..n]) => r.map_err(|e| format!("write to target failed: {}", e))?,
                    }
                    relay.record(Direction::ClientToTarget, config, &client_buf[..n]);
                }
                Err(e) => {
                    debug!("relay client read failed: {}", e);
                    break;
                }
            },
            r = outbound.read(&mut target_buf) => match r {
                Ok(0) => break,
                Ok(n) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        r = inbound.write_all(&target_buf[..n]) => r.map_err(|e| format!("write to client failed: {}", e))?,
                    }
                    relay.record(Direction::TargetToClient, config, &target_buf[..n]);
                }
                Err(e) => {
                    debug!("relay target read failed: {}", e);
                    break;
                }
            },
        }
    }
    Ok(())
}
