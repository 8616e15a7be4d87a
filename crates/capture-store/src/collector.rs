//! Passive listener that records whatever connecting peers send.

use crate::CaptureStore;
use anyhow::Result;
use std::net::SocketAddr;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const READ_CHUNK: usize = 1024;

/// A running collector. Every chunk read from any inbound connection is
/// appended to the store on its own; there is no reassembly across reads.
pub struct Collector {
    local_port: u16,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Collector {
    pub async fn bind(addr: SocketAddr, store: CaptureStore) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_port = listener.local_addr()?.port();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(listener, local_port, store, cancel.clone()));
        info!(port = local_port, "capture collector listening");
        Ok(Collector { local_port, cancel, task })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Close the listener and every connection it accepted.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
        info!(port = self.local_port, "capture collector stopped");
    }
}

async fn accept_loop(listener: TcpListener, local_port: u16, store: CaptureStore, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "collector accepted connection");
                    tokio::spawn(record(stream, peer, local_port, store.clone(), cancel.child_token()));
                }
                Err(e) => debug!("collector accept failed: {}", e),
            }
        }
    }
}

async fn record(mut stream: TcpStream, peer: SocketAddr, local_port: u16, store: CaptureStore, cancel: CancellationToken) {
    let source = peer.ip().to_string();
    let mut buf = [0u8; READ_CHUNK];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            read = stream.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => {
                    store.append(&source, peer.port(), local_port, &buf[..n]);
                }
                Err(e) => {
                    debug!(%peer, "collector read failed: {}", e);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    async fn wait_for_len(store: &CaptureStore, n: usize) {
        for _ in 0..200 {
            if store.len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("store never reached {} entries (has {})", n, store.len());
    }

    #[tokio::test]
    async fn records_chunks_from_concurrent_peers() {
        let store = CaptureStore::new();
        let collector = Collector::bind("127.0.0.1:0".parse().unwrap(), store.clone()).await.unwrap();
        let port = collector.local_port();

        let mut a = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut b = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        a.write_all(b"POWER ON\r").await.unwrap();
        wait_for_len(&store, 1).await;
        b.write_all(&[0xAA, 0x11, 0x01, 0x00]).await.unwrap();
        wait_for_len(&store, 2).await;

        let caps = store.list(Some("127.0.0.1"), false);
        assert_eq!(caps.len(), 2);
        assert!(caps.iter().all(|c| c.local_port == port));
        assert_eq!(caps[0].bytes_hex, "AA 11 01 00");
        assert_eq!(caps[1].bytes_ascii, "POWER ON.");
        assert_eq!(caps[1].source_port, a.local_addr().unwrap().port());

        collector.stop().await;
    }

    #[tokio::test]
    async fn stop_releases_the_port() {
        let store = CaptureStore::new();
        let collector = Collector::bind("127.0.0.1:0".parse().unwrap(), store).await.unwrap();
        let port = collector.local_port();
        collector.stop().await;
        assert!(TcpListener::bind(("127.0.0.1", port)).await.is_ok());
    }
}
