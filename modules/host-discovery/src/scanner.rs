use crate::{check_range, local_ipv4, neighbor_mac, parse_subnet_base, DEFAULT_FROM, DEFAULT_TO};
use avtool_core::{monotonic_ms, AvError, AvResult, LineEnding};
use fingerprint::{suggest, Suggestion};
use port_scan::{normalize_ports, sweep_host, HostSweep, DEFAULT_PROBE_TIMEOUT};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const EVENT_CAPACITY: usize = 256;

/// Operator request to start a sweep. Missing fields take defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScanRequest {
    pub subnet: Option<String>,
    pub from: Option<u8>,
    pub to: Option<u8>,
    #[serde(default)]
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone, Copy)]
pub struct ScanOptions {
    pub probe_timeout: Duration,
    /// Pause after each port probe.
    pub probe_gap: Duration,
    /// Pause after each host.
    pub host_gap: Duration,
}

impl Default for ScanOptions {
    fn default() -> Self {
        ScanOptions {
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            probe_gap: Duration::from_millis(2),
            host_gap: Duration::from_millis(3),
        }
    }
}

/// One responsive host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResult {
    pub ip: Ipv4Addr,
    pub open_ports: Vec<u16>,
    pub fingerprint: String,
    pub suggested_template_id: String,
    #[serde(serialize_with = "LineEnding::serialize_escaped")]
    pub suggested_suffix: LineEnding,
    pub suggested_port: Option<u16>,
    pub name_hint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    pub seen_ms: u64,
}

impl ScanResult {
    fn new(ip: Ipv4Addr, open_ports: Vec<u16>, s: Suggestion, mac: Option<String>) -> Self {
        ScanResult {
            ip,
            open_ports,
            fingerprint: s.fingerprint,
            suggested_template_id: s.template_id,
            suggested_suffix: s.suffix,
            suggested_port: s.best_port,
            name_hint: s.name_hint,
            mac,
            seen_ms: monotonic_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    Host(ScanResult),
    Done,
}

impl ScanEvent {
    /// Wire form: the result object itself, or `{"type":"done"}`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ScanEvent::Host(r) => serde_json::to_value(r).unwrap_or(serde_json::Value::Null),
            ScanEvent::Done => serde_json::json!({ "type": "done" }),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanSnapshot {
    pub running: bool,
    pub progress: u32,
    pub results: Vec<ScanResult>,
}

#[derive(Debug, Clone)]
struct SweepPlan {
    base: [u8; 3],
    from: u8,
    to: u8,
    ports: Vec<u16>,
}

impl SweepPlan {
    fn from_request(req: ScanRequest) -> AvResult<Self> {
        let base = match req.subnet.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(s) => parse_subnet_base(s)?,
            None => {
                let ip = local_ipv4().ok_or_else(|| AvError::invalid("no subnet given and no local IPv4 address"))?;
                let o = ip.octets();
                [o[0], o[1], o[2]]
            }
        };
        let from = req.from.unwrap_or(DEFAULT_FROM);
        let to = req.to.unwrap_or(DEFAULT_TO);
        check_range(from, to)?;
        Ok(SweepPlan { base, from, to, ports: normalize_ports(&req.ports) })
    }
}

#[derive(Debug, Default)]
struct Session {
    running: bool,
    progress: u32,
    results: Vec<ScanResult>,
    plan: Option<SweepPlan>,
    cancel: Option<CancellationToken>,
}

/// Process-wide discovery session. At most one sweep runs at a time; the
/// sweep task is the only writer of progress and results while it runs.
#[derive(Clone)]
pub struct Scanner {
    session: Arc<Mutex<Session>>,
    events: broadcast::Sender<ScanEvent>,
    options: ScanOptions,
}

impl Default for Scanner {
    fn default() -> Self {
        Self::new(ScanOptions::default())
    }
}

impl Scanner {
    pub fn new(options: ScanOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Scanner { session: Arc::new(Mutex::new(Session::default())), events, options }
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Receive every event emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }

    /// Claim the session and spawn the sweep. Must be called from within a
    /// tokio runtime. A running session is left untouched.
    pub fn start(&self, req: ScanRequest) -> AvResult<()> {
        let mut session = self.lock();
        if session.running {
            return Err(AvError::AlreadyRunning("scan"));
        }
        let plan = SweepPlan::from_request(req)?;
        let cancel = CancellationToken::new();
        session.running = true;
        session.progress = 0;
        session.results.clear();
        session.plan = Some(plan.clone());
        session.cancel = Some(cancel.clone());
        drop(session);

        info!(
            subnet = %format!("{}.{}.{}", plan.base[0], plan.base[1], plan.base[2]),
            from = plan.from,
            to = plan.to,
            ports = ?plan.ports,
            "discovery started"
        );
        tokio::spawn(sweep(self.clone(), plan, cancel));
        Ok(())
    }

    /// Ask the sweep to stop at its next port or host boundary.
    /// Returns false if nothing was running.
    pub fn cancel(&self) -> bool {
        match self.lock().cancel.as_ref() {
            Some(token) => {
                token.cancel();
                info!("discovery cancel requested");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn snapshot(&self) -> ScanSnapshot {
        let s = self.lock();
        ScanSnapshot { running: s.running, progress: s.progress, results: s.results.clone() }
    }
}

async fn sweep(scanner: Scanner, plan: SweepPlan, cancel: CancellationToken) {
    let opts = scanner.options;
    for host in plan.from..=plan.to {
        if cancel.is_cancelled() {
            break;
        }
        let ip = Ipv4Addr::new(plan.base[0], plan.base[1], plan.base[2], host);
        let open = match sweep_host(IpAddr::V4(ip), &plan.ports, opts.probe_timeout, opts.probe_gap, &cancel).await {
            HostSweep::Complete(open) => open,
            HostSweep::Cancelled => break,
        };

        if open.is_empty() {
            scanner.lock().progress += 1;
        } else {
            let banner = banners::grab_banner(IpAddr::V4(ip), &open).await;
            let suggestion = suggest(&banner, &open);
            let result = ScanResult::new(ip, open, suggestion, neighbor_mac(ip));
            info!(%ip, ports = ?result.open_ports, hint = %result.name_hint, "host responded");
            {
                let mut s = scanner.lock();
                s.results.push(result.clone());
                s.progress += 1;
            }
            let _ = scanner.events.send(ScanEvent::Host(result));
        }

        if !opts.host_gap.is_zero() {
            tokio::time::sleep(opts.host_gap).await;
        }
    }

    let progress = {
        let mut s = scanner.lock();
        s.running = false;
        s.cancel = None;
        s.progress
    };
    if cancel.is_cancelled() {
        info!(progress, "discovery cancelled");
    } else {
        info!(progress, "discovery finished");
    }
    if scanner.events.send(ScanEvent::Done).is_err() {
        debug!("no discovery subscribers for done event");
    }
}
