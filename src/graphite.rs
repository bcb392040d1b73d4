//! Plaintext Graphite publishing.
//!
//! One TCP dial per flush, an absolute deadline covering connect, write,
//! and close, no retries. A flush either arrives whole within its interval
//! or is lost.

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};

/// Write `payload` to the downstream receiver in a single connection.
///
/// `deadline` is an absolute cutoff for all I/O on the connection. The
/// stream is closed on every exit path when it drops.
pub async fn publish(addr: &str, payload: &Bytes, deadline: Instant) -> Result<()> {
    let mut stream = timeout_at(deadline, TcpStream::connect(addr))
        .await
        .context("connect deadline exceeded")?
        .with_context(|| format!("dialing {addr}"))?;

    timeout_at(deadline, stream.write_all(payload))
        .await
        .context("write deadline exceeded")?
        .context("writing stats")?;

    timeout_at(deadline, stream.shutdown())
        .await
        .context("close deadline exceeded")?
        .context("closing connection")?;

    Ok(())
}
