//! PJLink class 1 command client.
//!
//! The projector opens with `PJLINK 0\r` (no auth) or `PJLINK 1 <salt>\r`.
//! With auth, every command is prefixed by `hex(md5(salt || password))`.

use anyhow::{anyhow, bail, Result};
use md5::{Digest, Md5};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

pub const PJLINK_PORT: u16 = 4352;
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(1500);
/// Upper bound for the whole banner/command/reply exchange.
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(3);

/// Authentication state announced by the banner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Open,
    Salted(String),
}

pub fn parse_banner(line: &str) -> Result<Challenge> {
    if !line.starts_with("PJLINK ") {
        bail!("invalid banner: {:?}", line);
    }
    let mut tokens = line.split_whitespace().skip(1);
    match tokens.next() {
        Some("1") => {
            let salt = tokens.next().ok_or_else(|| anyhow!("invalid banner: missing salt"))?;
            Ok(Challenge::Salted(salt.to_string()))
        }
        _ => Ok(Challenge::Open),
    }
}

/// Lowercase hex MD5 of `salt` followed by `password`.
pub fn auth_prefix(salt: &str, password: &str) -> String {
    let mut h = Md5::new();
    h.update(salt.as_bytes());
    h.update(password.as_bytes());
    hex::encode(h.finalize())
}

async fn read_line<R: AsyncBufReadExt + Unpin>(r: &mut R) -> Result<String> {
    let mut buf = Vec::new();
    let n = r.read_until(b'\r', &mut buf).await?;
    if n == 0 {
        bail!("connection closed");
    }
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(String::from_utf8_lossy(&buf).trim_start_matches('\n').to_string())
}

/// Run one command over an already connected stream and return the reply
/// line without its CR. Nothing is written if the device wants a password
/// and none was given.
pub async fn exchange<S>(stream: S, password: Option<&str>, cmd: &str) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut io = BufReader::new(stream);
    let banner = read_line(&mut io).await?;
    let prefix = match parse_banner(&banner)? {
        Challenge::Open => String::new(),
        Challenge::Salted(salt) => match password.filter(|p| !p.is_empty()) {
            Some(pw) => auth_prefix(&salt, pw),
            None => bail!("password required"),
        },
    };
    let line = format!("{}{}\r", prefix, cmd);
    io.write_all(line.as_bytes()).await?;
    io.flush().await?;
    read_line(&mut io).await
}

/// Connect to `host:port` and run [`exchange`].
pub async fn send_command(host: &str, port: u16, password: Option<&str>, cmd: &str) -> Result<String> {
    let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .map_err(|_| anyhow!("connect to {}:{} timed out", host, port))??;
    debug!(host, port, "pjlink connected");
    timeout(EXCHANGE_TIMEOUT, exchange(stream, password, cmd))
        .await
        .map_err(|_| anyhow!("no reply from {}:{}", host, port))?
}
