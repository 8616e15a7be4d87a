//! JSON-lines request/response surface over the scanner, capture store,
//! relay and terminal session.

use anyhow::Result;
use avtool_core::AvError;
use capture_store::{CaptureStore, Collector};
use host_discovery::{ScanRequest, Scanner};
use relay::{Relay, RelayConfig};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::{Ipv4Addr, SocketAddr};
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum Request {
    Health,
    StartScan(ScanRequest),
    CancelScan,
    ScanResults,
    ListCaptures {
        #[serde(default)]
        filter: Option<String>,
        #[serde(default, rename = "pinnedOnly")]
        pinned_only: bool,
    },
    GetCapture {
        id: String,
    },
    PinCapture {
        id: String,
        #[serde(default = "default_pin")]
        pin: bool,
    },
    ClearCaptures,
    Learner {
        #[serde(default)]
        enabled: Option<bool>,
        #[serde(default)]
        port: Option<u16>,
    },
    StartRelay(RelayConfig),
    StopRelay,
    #[cfg(feature = "wake")]
    Wake { mac: String },
    #[cfg(feature = "pjlink")]
    Pjlink {
        host: String,
        #[serde(default)]
        port: Option<u16>,
        #[serde(default)]
        password: Option<String>,
        command: String,
    },
    #[cfg(feature = "terminal")]
    TermConnect { host: String, port: u16 },
    #[cfg(feature = "terminal")]
    TermSend {
        #[serde(default)]
        mode: terminal::SendMode,
        #[serde(default)]
        data: String,
        #[serde(default)]
        suffix: String,
    },
    #[cfg(feature = "terminal")]
    TermDisconnect,
}

fn default_pin() -> bool {
    true
}

/// The passive collector plus the settings it was (or will be) started with.
struct Learner {
    enabled: bool,
    port: u16,
    collector: Option<Collector>,
}

impl Learner {
    fn status(&self) -> Value {
        json!({ "enabled": self.enabled, "port": self.port, "listening": self.collector.is_some() })
    }
}

pub struct Controller {
    pub scanner: Scanner,
    pub store: CaptureStore,
    pub relay: Relay,
    #[cfg(feature = "terminal")]
    pub terminal: terminal::TerminalSession,
    learner: Mutex<Learner>,
}

fn ok() -> Value {
    json!({ "ok": true })
}

fn error(msg: impl std::fmt::Display) -> Value {
    json!({ "error": msg.to_string() })
}

impl Controller {
    pub fn new(scanner: Scanner, store: CaptureStore, learn_enabled: bool, learn_port: u16) -> Self {
        Controller {
            scanner,
            relay: Relay::new(store.clone()),
            store,
            #[cfg(feature = "terminal")]
            terminal: terminal::TerminalSession::new(),
            learner: Mutex::new(Learner { enabled: learn_enabled, port: learn_port, collector: None }),
        }
    }

    /// Apply new learner settings and restart the collector to match.
    pub async fn configure_learner(&self, enabled: Option<bool>, port: Option<u16>) -> Result<Value> {
        let mut learner = self.learner.lock().await;
        if let Some(e) = enabled {
            learner.enabled = e;
        }
        if let Some(p) = port.filter(|p| *p != 0) {
            learner.port = p;
        }
        if let Some(old) = learner.collector.take() {
            old.stop().await;
        }
        if learner.enabled {
            let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, learner.port));
            learner.collector = Some(Collector::bind(addr, self.store.clone()).await?);
        }
        Ok(learner.status())
    }

    pub async fn shutdown(&self) {
        self.scanner.cancel();
        self.relay.stop().await;
        #[cfg(feature = "terminal")]
        self.terminal.disconnect();
        if let Some(c) = self.learner.lock().await.collector.take() {
            c.stop().await;
        }
    }

    /// Handle one request line and produce its response object.
    pub async fn handle_line(&self, line: &str) -> Value {
        let raw: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => return error("bad json"),
        };
        let req: Request = match serde_json::from_value(raw) {
            Ok(r) => r,
            Err(e) => return error(format!("bad request: {}", e)),
        };
        self.handle(req).await
    }

    async fn handle(&self, req: Request) -> Value {
        match req {
            Request::Health => {
                let disc = self.scanner.snapshot();
                let learn = self.learner.lock().await.status();
                let mut health = json!({
                    "version": avtool_core::version(),
                    "learn": learn,
                    "proxy": self.relay.status(),
                    "disc": { "running": disc.running, "progress": disc.progress },
                    "captures": self.store.len(),
                });
                #[cfg(feature = "terminal")]
                {
                    health["term"] = json!(self.terminal.status());
                }
                health
            }
            Request::StartScan(scan) => match self.scanner.start(scan) {
                Ok(()) => ok(),
                Err(e) => error(e),
            },
            Request::CancelScan => json!({ "ok": true, "wasRunning": self.scanner.cancel() }),
            Request::ScanResults => json!(self.scanner.snapshot()),
            Request::ListCaptures { filter, pinned_only } => {
                json!({ "captures": self.store.list(filter.as_deref(), pinned_only) })
            }
            Request::GetCapture { id } => match self.store.get(&id) {
                Some(c) => json!(c),
                None => error(AvError::NotFound(format!("capture {}", id))),
            },
            Request::PinCapture { id, pin } => match self.store.set_pinned(&id, pin) {
                Ok(()) => ok(),
                Err(e) => error(e),
            },
            Request::ClearCaptures => {
                self.store.clear();
                info!("captures cleared");
                ok()
            }
            Request::Learner { enabled, port } => match self.configure_learner(enabled, port).await {
                Ok(status) => status,
                Err(e) => {
                    warn!("learner restart failed: {:#}", e);
                    error(e)
                }
            },
            Request::StartRelay(cfg) => match self.relay.start(cfg).await {
                Ok(()) => ok(),
                Err(e) => error(e),
            },
            Request::StopRelay => {
                self.relay.stop().await;
                ok()
            }
            #[cfg(feature = "wake")]
            Request::Wake { mac } => match wake::send_magic_packet(&mac).await {
                Ok(()) => ok(),
                Err(e) => error(e),
            },
            #[cfg(feature = "pjlink")]
            Request::Pjlink { host, port, password, command } => {
                let port = port.unwrap_or(pjlink::PJLINK_PORT);
                match pjlink::send_command(&host, port, password.as_deref(), &command).await {
                    Ok(response) => json!({ "response": response }),
                    Err(e) => error(e),
                }
            }
            #[cfg(feature = "terminal")]
            Request::TermConnect { host, port } => match self.terminal.connect(&host, port).await {
                Ok(()) => ok(),
                Err(e) => error(e),
            },
            #[cfg(feature = "terminal")]
            Request::TermSend { mode, data, suffix } => match self.terminal.send(mode, &data, &suffix).await {
                Ok(n) => json!({ "ok": true, "bytes": n }),
                Err(e) => error(e),
            },
            #[cfg(feature = "terminal")]
            Request::TermDisconnect => {
                self.terminal.disconnect();
                ok()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    fn controller() -> Controller {
        Controller::new(Scanner::default(), CaptureStore::new(), false, 5000)
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn malformed_lines() {
        let c = controller();
        assert_eq!(c.handle_line("{not json").await, json!({"error": "bad json"}));
        let unknown = c.handle_line(r#"{"cmd":"reboot"}"#).await;
        assert!(unknown["error"].as_str().unwrap().starts_with("bad request"));
        let missing = c.handle_line(r#"{"cmd":"get_capture"}"#).await;
        assert!(missing["error"].is_string());
    }

    #[tokio::test]
    async fn health_reports_every_session() {
        let c = controller();
        let h = c.handle_line(r#"{"cmd":"health"}"#).await;
        assert_eq!(h["disc"]["running"], false);
        assert_eq!(h["proxy"]["running"], false);
        assert_eq!(h["learn"]["enabled"], false);
        assert_eq!(h["captures"], 0);
    }

    #[tokio::test]
    async fn capture_commands() {
        let c = controller();
        let id = c.store.append("10.0.0.7", 4000, 5000, b"PWR ON\r").id().to_string();

        let list = c.handle_line(r#"{"cmd":"list_captures","filter":"10.0.0"}"#).await;
        assert_eq!(list["captures"][0]["id"], id.as_str());
        let got = c.handle_line(&format!(r#"{{"cmd":"get_capture","id":"{}"}}"#, id)).await;
        assert_eq!(got["bytesAscii"], "PWR ON.");

        assert_eq!(c.handle_line(&format!(r#"{{"cmd":"pin_capture","id":"{}"}}"#, id)).await, ok());
        let pinned = c.handle_line(r#"{"cmd":"list_captures","pinnedOnly":true}"#).await;
        assert_eq!(pinned["captures"].as_array().unwrap().len(), 1);

        assert!(c.handle_line(r#"{"cmd":"pin_capture","id":"FFFFFFFF","pin":false}"#).await["error"].is_string());
        assert!(c.handle_line(r#"{"cmd":"get_capture","id":"FFFFFFFF"}"#).await["error"].is_string());

        assert_eq!(c.handle_line(r#"{"cmd":"clear_captures"}"#).await, ok());
        assert!(c.store.is_empty());
    }

    #[tokio::test]
    async fn scan_commands() {
        let c = controller();
        let bad = c.handle_line(r#"{"cmd":"start_scan","subnet":"127.0.0","from":10,"to":2}"#).await;
        assert!(bad["error"].as_str().unwrap().contains("invalid input"));

        let port = free_port();
        let req = format!(r#"{{"cmd":"start_scan","subnet":"127.0.0","from":1,"to":3,"ports":[{}]}}"#, port);
        assert_eq!(c.handle_line(&req).await, ok());
        let again = c.handle_line(&req).await;
        assert_eq!(again["error"], "scan already running");

        for _ in 0..200 {
            if !c.scanner.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let results = c.handle_line(r#"{"cmd":"scan_results"}"#).await;
        assert_eq!(results["running"], false);
        assert_eq!(results["progress"], 3);
        assert_eq!(results["results"], json!([]));
    }

    #[tokio::test]
    async fn learner_restart_records_traffic() {
        let c = controller();
        let port = free_port();
        let status = c.handle_line(&format!(r#"{{"cmd":"learner","enabled":true,"port":{}}}"#, port)).await;
        assert_eq!(status["listening"], true);
        assert_eq!(status["port"], port);

        let mut s = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        s.write_all(b"#MODEL?\r\n").await.unwrap();
        for _ in 0..200 {
            if !c.store.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(c.store.list(None, false)[0].local_port, port);

        let off = c.handle_line(r#"{"cmd":"learner","enabled":false}"#).await;
        assert_eq!(off["listening"], false);
        c.shutdown().await;
    }

    #[tokio::test]
    async fn relay_commands() {
        let c = controller();
        let bad = c.handle_line(r#"{"cmd":"start_relay","listenPort":0,"targetHost":"","targetPort":23}"#).await;
        assert!(bad["error"].is_string());
        assert_eq!(c.relay.status().running, false);

        let listen = free_port();
        let req = format!(
            r#"{{"cmd":"start_relay","listenPort":{},"targetHost":"127.0.0.1","targetPort":{},"captureToLearn":true}}"#,
            listen,
            free_port()
        );
        assert_eq!(c.handle_line(&req).await, ok());
        let h = c.handle_line(r#"{"cmd":"health"}"#).await;
        assert_eq!(h["proxy"]["listenPort"], listen);
        assert_eq!(h["proxy"]["captureToLearn"], true);

        let retarget = free_port();
        let req = format!(
            r#"{{"cmd":"start_relay","listenPort":{},"targetHost":"127.0.0.1","targetPort":{}}}"#,
            listen, retarget
        );
        assert_eq!(c.handle_line(&req).await, ok());
        assert_eq!(c.relay.status().target_port, Some(retarget));
        assert_eq!(c.handle_line(r#"{"cmd":"stop_relay"}"#).await, ok());
        assert_eq!(c.relay.status().running, false);
    }

    #[cfg(feature = "wake")]
    #[tokio::test]
    async fn wake_rejects_bad_mac() {
        let c = controller();
        let r = c.handle_line(r#"{"cmd":"wake","mac":"zz:zz"}"#).await;
        assert!(r["error"].as_str().unwrap().contains("bad mac"));
    }

    #[cfg(feature = "terminal")]
    #[tokio::test]
    async fn terminal_requires_connection() {
        let c = controller();
        let r = c.handle_line(r#"{"cmd":"term_send","data":"PWR ON","suffix":"\\r"}"#).await;
        assert!(r["error"].as_str().unwrap().contains("not connected"));
        assert_eq!(c.handle_line(r#"{"cmd":"term_disconnect"}"#).await, ok());
    }
}
