use anyhow::{anyhow, Result};
use capture_store::{Capture, CaptureStore, Collector};
use clap::{Parser, Subcommand, ValueEnum};
use host_discovery::{ScanEvent, ScanOptions, ScanRequest, ScanResult, Scanner};
use relay::{Relay, RelayConfig, RelayEvent};
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

mod config;
mod control;
mod logging;

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_else(|_| String::new())
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat { Text, Json, Jsonl }

impl OutputFormat {
    fn from_config(s: &str) -> Self {
        match s {
            "json" => OutputFormat::Json,
            "jsonl" => OutputFormat::Jsonl,
            _ => OutputFormat::Text,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "avtool", version, about = "Discover, learn and relay AV control endpoints on the local network")]
struct Cli {
    /// Optional config file (YAML). If omitted, loads ./avtool.yaml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print version information
    Version,
    /// Sweep a /24 for AV endpoints and suggest a protocol template for each
    Discover {
        /// Subnet base: 192.168.1, 192.168.1.0/24 or any address inside it. Default: this host's subnet
        #[arg(long)]
        subnet: Option<String>,
        /// First host octet (1-254)
        #[arg(long)]
        from: Option<u8>,
        /// Last host octet (1-254)
        #[arg(long)]
        to: Option<u8>,
        /// Ports: comma/range list (e.g., 23,5000-5002). Default: common AV control ports
        #[arg(long)]
        ports: Option<String>,
        /// Timeout per port probe in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Output format: text, json, or jsonl
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
        /// Output file (overwrites)
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
        /// Write CSV instead of text/json when --out is provided
        #[arg(long, default_value_t = false)]
        csv: bool,
    },
    /// Listen passively and record whatever connecting controllers send
    Learn {
        /// Listen port (default: learn.port from config, else 5000)
        #[arg(long)]
        port: Option<u16>,
        /// Output format: text, json, or jsonl
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Relay one client to a target device, printing the traffic both ways
    Relay {
        /// Target hostname or IP
        target_host: String,
        /// Target port
        target_port: u16,
        /// Listen port (default: relay.listen_port from config, else 23001)
        #[arg(long)]
        listen_port: Option<u16>,
        /// Also record relayed chunks in the capture store and print them on exit
        #[arg(long, default_value_t = false)]
        capture: bool,
        /// Output format: text, json, or jsonl
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Send a Wake-on-LAN magic packet
    #[cfg(feature = "wake")]
    Wake {
        /// Hardware address, e.g. AA:BB:CC:DD:EE:FF
        mac: String,
    },
    /// Run one PJLink command, e.g. "%1POWR 1"
    #[cfg(feature = "pjlink")]
    Pjlink {
        /// Projector hostname or IP
        host: String,
        /// Command line without the trailing CR
        command: String,
        #[arg(long)]
        password: Option<String>,
        #[arg(long, default_value_t = 4352)]
        port: u16,
    },
    /// Interactive session: stdin lines are sent, device output is printed
    #[cfg(feature = "terminal")]
    Terminal {
        host: String,
        port: u16,
        /// Appended to each line in ascii mode: \r, \n, \r\n or literal text
        #[arg(long, default_value = "\\r")]
        suffix: String,
        /// Treat each stdin line as hex byte pairs
        #[arg(long, default_value_t = false)]
        hex: bool,
        /// Output format: text, json, or jsonl
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// JSON-lines control surface on stdin/stdout
    Control,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let loaded_cfg = config::load_config(cli.config.as_deref())?;
    logging::init_logging(
        loaded_cfg.log.level.as_deref(),
        logging::LogFormat::parse(loaded_cfg.log.format.as_deref()),
    );

    match cli.command {
        Commands::Version => {
            println!("avtool {} (core {})", env!("CARGO_PKG_VERSION"), avtool_core::version());
        }
        Commands::Discover { mut subnet, mut from, mut to, mut ports, mut timeout_ms, format, out, csv } => {
            let d = &loaded_cfg.discover;
            if subnet.is_none() { subnet = d.subnet.clone(); }
            if from.is_none() { from = d.from; }
            if to.is_none() { to = d.to; }
            if ports.is_none() { ports = d.ports.clone(); }
            if timeout_ms.is_none() { timeout_ms = d.timeout_ms; }
            let format = format
                .or_else(|| d.format.as_deref().map(OutputFormat::from_config))
                .unwrap_or(OutputFormat::Text);
            if csv && out.is_none() {
                return Err(anyhow!("--csv requires --out <file>"));
            }

            let ports_vec = match ports {
                Some(spec) => port_scan::parse_ports(&spec)?,
                None => Vec::new(),
            };
            let mut opts = ScanOptions::default();
            if let Some(ms) = timeout_ms {
                opts.probe_timeout = Duration::from_millis(ms);
            }
            let req = ScanRequest { subnet: subnet.clone(), from, to, ports: ports_vec };

            let rt = tokio::runtime::Runtime::new()?;
            let started = Instant::now();
            let started_at = now_rfc3339();
            let stream_lines = out.is_none() && format != OutputFormat::Json;
            let (results, progress, cancelled) = rt.block_on(run_discover(req, opts, format, stream_lines))?;
            let duration_ms = started.elapsed().as_millis();
            let ended_at = now_rfc3339();

            if let Some(path) = out {
                if csv {
                    write_results_csv(&path, &results)?;
                    return Ok(());
                }
                let mut w = BufWriter::new(OpenOptions::new().create(true).truncate(true).write(true).open(&path)?);
                match format {
                    OutputFormat::Text => for r in &results { writeln!(w, "{}", result_line(r))?; },
                    OutputFormat::Jsonl => for r in &results { writeln!(w, "{}", serde_json::to_string(r)?)?; },
                    OutputFormat::Json => {
                        let obj = discover_summary(&subnet, progress, cancelled, &results, &started_at, &ended_at, duration_ms);
                        writeln!(w, "{}", serde_json::to_string(&obj)?)?;
                    }
                }
                w.flush()?;
            } else {
                match format {
                    OutputFormat::Json => {
                        let obj = discover_summary(&subnet, progress, cancelled, &results, &started_at, &ended_at, duration_ms);
                        println!("{}", serde_json::to_string(&obj)?);
                    }
                    OutputFormat::Text => {
                        println!(
                            "({} host(s) responded, {} swept{}, took {} ms)",
                            results.len(),
                            progress,
                            if cancelled { ", cancelled" } else { "" },
                            duration_ms
                        );
                    }
                    OutputFormat::Jsonl => {}
                }
            }
        }
        Commands::Learn { port, format } => {
            let port = port.unwrap_or_else(|| loaded_cfg.learn.port());
            let rt = tokio::runtime::Runtime::new()?;
            let captures = rt.block_on(run_learn(port, format))?;
            if format == OutputFormat::Json {
                println!("{}", serde_json::to_string(&serde_json::json!({ "captures": captures }))?);
            }
        }
        Commands::Relay { target_host, target_port, listen_port, capture, format } => {
            let cfg = RelayConfig {
                listen_port: listen_port.unwrap_or_else(|| loaded_cfg.relay.listen_port()),
                target_host,
                target_port,
                capture_to_learn: capture,
            };
            let rt = tokio::runtime::Runtime::new()?;
            let captures = rt.block_on(run_relay(cfg, format))?;
            for c in &captures {
                print_capture(c, format)?;
            }
        }
        #[cfg(feature = "wake")]
        Commands::Wake { mac } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(wake::send_magic_packet(&mac))?;
            println!("wake packet sent for {}", mac);
        }
        #[cfg(feature = "pjlink")]
        Commands::Pjlink { host, command, password, port } => {
            let rt = tokio::runtime::Runtime::new()?;
            let response = rt.block_on(pjlink::send_command(&host, port, password.as_deref(), &command))?;
            println!("{}", response);
        }
        #[cfg(feature = "terminal")]
        Commands::Terminal { host, port, suffix, hex, format } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_terminal(host, port, suffix, hex, format))?;
        }
        Commands::Control => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_control(&loaded_cfg))?;
        }
    }
    Ok(())
}

fn result_line(r: &ScanResult) -> String {
    let ports = r.open_ports.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(",");
    let mut line = format!("{} open [{}] {}", r.ip, ports, r.name_hint);
    if !r.suggested_template_id.is_empty() {
        line.push_str(&format!(" template={} suffix={}", r.suggested_template_id, r.suggested_suffix.escaped()));
    }
    if let Some(p) = r.suggested_port {
        line.push_str(&format!(" port={}", p));
    }
    if let Some(mac) = &r.mac {
        line.push_str(&format!(" mac={}", mac));
    }
    if !r.fingerprint.is_empty() {
        line.push_str(&format!(" \"{}\"", r.fingerprint));
    }
    line
}

fn discover_summary(
    subnet: &Option<String>,
    progress: u32,
    cancelled: bool,
    results: &[ScanResult],
    started_at: &str,
    ended_at: &str,
    duration_ms: u128,
) -> serde_json::Value {
    serde_json::json!({
        "subnet": subnet,
        "progress": progress,
        "cancelled": cancelled,
        "results": results,
        "started_at": started_at,
        "ended_at": ended_at,
        "duration_ms": duration_ms,
    })
}

fn write_results_csv(path: &Path, results: &[ScanResult]) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(std::fs::File::create(path)?);
    wtr.write_record(["ip", "mac", "open_ports", "fingerprint", "template_id", "suffix", "port", "name_hint", "seen_ms"])?;
    for r in results {
        wtr.write_record([
            r.ip.to_string(),
            r.mac.clone().unwrap_or_default(),
            r.open_ports.iter().map(|p| p.to_string()).collect::<Vec<_>>().join("|"),
            r.fingerprint.clone(),
            r.suggested_template_id.clone(),
            r.suggested_suffix.escaped().to_string(),
            r.suggested_port.map(|p| p.to_string()).unwrap_or_default(),
            r.name_hint.clone(),
            r.seen_ms.to_string(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

async fn run_discover(
    req: ScanRequest,
    opts: ScanOptions,
    format: OutputFormat,
    stream_lines: bool,
) -> Result<(Vec<ScanResult>, u32, bool)> {
    let scanner = Scanner::new(opts);
    let mut rx = scanner.subscribe();
    scanner.start(req)?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut cancelled = false;
    loop {
        tokio::select! {
            _ = &mut ctrl_c, if !cancelled => {
                cancelled = true;
                scanner.cancel();
            }
            ev = rx.recv() => match ev {
                Ok(ScanEvent::Host(r)) if stream_lines => match format {
                    OutputFormat::Jsonl => println!("{}", serde_json::to_string(&r)?),
                    _ => println!("{}", result_line(&r)),
                },
                Ok(ScanEvent::Host(_)) => {}
                Ok(ScanEvent::Done) | Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "discovery output lagged"),
            }
        }
    }
    let snap = scanner.snapshot();
    Ok((snap.results, snap.progress, cancelled))
}

fn print_capture(c: &Capture, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => println!(
            "{} {}:{} -> :{} x{} [{}] {}",
            c.id, c.source_address, c.source_port, c.local_port, c.repeat_count, c.bytes_hex, c.bytes_ascii
        ),
        OutputFormat::Json | OutputFormat::Jsonl => println!("{}", serde_json::to_string(c)?),
    }
    Ok(())
}

async fn run_learn(port: u16, format: OutputFormat) -> Result<Vec<Capture>> {
    let store = CaptureStore::new();
    let collector = Collector::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)), store.clone()).await?;
    eprintln!("learning on port {} (Ctrl-C to stop)", collector.local_port());

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut seen = HashSet::new();
    let mut tick = tokio::time::interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            _ = tick.tick() => {
                if format == OutputFormat::Json {
                    continue;
                }
                let mut fresh: Vec<Capture> = store.list(None, false).into_iter().filter(|c| !seen.contains(&c.id)).collect();
                fresh.reverse();
                for c in fresh {
                    print_capture(&c, format)?;
                    seen.insert(c.id);
                }
            }
        }
    }
    collector.stop().await;
    Ok(store.list(None, false))
}

fn print_relay_event(ev: &RelayEvent, format: OutputFormat) -> Result<()> {
    match (format, ev) {
        (OutputFormat::Json | OutputFormat::Jsonl, _) => println!("{}", serde_json::to_string(ev)?),
        (OutputFormat::Text, RelayEvent::Status(s)) => {
            println!("status running={} connected={}", s.running, s.connected)
        }
        (OutputFormat::Text, RelayEvent::Data { dir, hex, ascii }) => println!("{} [{}] {}", dir.label(), hex, ascii),
        (OutputFormat::Text, RelayEvent::Error { msg }) => println!("error: {}", msg),
    }
    Ok(())
}

async fn run_relay(cfg: RelayConfig, format: OutputFormat) -> Result<Vec<Capture>> {
    let store = CaptureStore::new();
    let relay = Relay::new(store.clone());
    let mut rx = relay.subscribe();
    relay.start(cfg).await?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            ev = rx.recv() => match ev {
                Ok(ev) => print_relay_event(&ev, format)?,
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "relay output lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    }
    relay.stop().await;
    let mut captures = store.list(None, false);
    captures.reverse();
    Ok(captures)
}

#[cfg(feature = "terminal")]
async fn run_terminal(host: String, port: u16, suffix: String, hex: bool, format: OutputFormat) -> Result<()> {
    use terminal::{SendMode, TermEvent, TerminalSession};

    let session = TerminalSession::new();
    let mut rx = session.subscribe();
    session.connect(&host, port).await?;
    let mode = if hex { SendMode::Hex } else { SendMode::Ascii };

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            line = lines.next_line() => match line? {
                Some(l) => {
                    if let Err(e) = session.send(mode, &l, &suffix).await {
                        eprintln!("send failed: {}", e);
                    }
                }
                None => break,
            },
            ev = rx.recv() => match ev {
                Ok(ev) => {
                    match (format, &ev) {
                        (OutputFormat::Json | OutputFormat::Jsonl, _) => println!("{}", serde_json::to_string(&ev)?),
                        (OutputFormat::Text, TermEvent::Rx { hex, ascii }) => println!("<< [{}] {}", hex, ascii),
                        (OutputFormat::Text, TermEvent::Status { connected, host, port }) => {
                            println!("status connected={} {}:{}", connected, host, port)
                        }
                    }
                    if matches!(ev, TermEvent::Status { connected: false, .. }) {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "terminal output lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    }
    session.disconnect();
    Ok(())
}

fn event_line(source: &str, data: serde_json::Value) -> String {
    serde_json::json!({ "event": source, "data": data }).to_string()
}

async fn run_control(cfg: &config::Config) -> Result<()> {
    let mut opts = ScanOptions::default();
    if let Some(ms) = cfg.discover.timeout_ms {
        opts.probe_timeout = Duration::from_millis(ms);
    }
    let ctl = control::Controller::new(Scanner::new(opts), CaptureStore::new(), cfg.learn.enabled(), cfg.learn.port());
    if let Err(e) = ctl.configure_learner(None, None).await {
        warn!("learner not started: {:#}", e);
    }

    let mut disc_rx = ctl.scanner.subscribe();
    let mut proxy_rx = ctl.relay.subscribe();
    #[cfg(feature = "terminal")]
    let mut term_rx = ctl.terminal.subscribe();
    #[cfg(not(feature = "terminal"))]
    let (_term_tx, mut term_rx) = tokio::sync::broadcast::channel::<serde_json::Value>(1);

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            line = lines.next_line() => match line? {
                Some(l) if l.trim().is_empty() => {}
                Some(l) => println!("{}", ctl.handle_line(&l).await),
                None => break,
            },
            ev = disc_rx.recv() => match ev {
                Ok(ev) => println!("{}", event_line("disc", ev.to_json())),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "discovery events lagged"),
                Err(RecvError::Closed) => {}
            },
            ev = proxy_rx.recv() => match ev {
                Ok(ev) => println!("{}", event_line("proxy", serde_json::to_value(&ev)?)),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "relay events lagged"),
                Err(RecvError::Closed) => {}
            },
            ev = term_rx.recv() => match ev {
                Ok(ev) => println!("{}", event_line("term", serde_json::to_value(&ev)?)),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "terminal events lagged"),
                Err(RecvError::Closed) => {}
            },
        }
    }
    ctl.shutdown().await;
    Ok(())
}
