//! UDP sample ingestion.
//!
//! A single sequential reader pulls datagrams into a fixed buffer, parses
//! them, and feeds the bounded sample channel. A full channel blocks the
//! reader; the socket's own receive buffer is the lossy boundary.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

use crate::protocol::{parse_packet, Sample, MAX_DATAGRAM_SIZE};

/// The UDP listener feeding the aggregator.
pub struct UdpIngress {
    socket: UdpSocket,
    samples: mpsc::Sender<Sample>,
}

impl UdpIngress {
    /// Binds the listener socket. Failure here is fatal at startup.
    pub async fn bind(address: &str, port: u16, samples: mpsc::Sender<Sample>) -> Result<Self> {
        let socket = UdpSocket::bind((address, port))
            .await
            .with_context(|| format!("binding udp socket on {address}:{port}"))?;

        info!(addr = %socket.local_addr().context("resolving local addr")?, "udp listener bound");
        Ok(Self { socket, samples })
    }

    /// The address the socket actually bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().context("resolving local addr")
    }

    /// Spawns the read loop.
    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    async fn run(self, cancel: CancellationToken) {
        // One fixed allocation reused for every read.
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                res = self.socket.recv_from(&mut buf) => {
                    match res {
                        Ok((len, peer)) => {
                            trace!(peer = %peer, len, "datagram received");
                            let payload = Bytes::copy_from_slice(&buf[..len]);
                            for sample in parse_packet(&payload) {
                                // Blocking here when the channel is full is
                                // the designed backpressure.
                                if self.samples.send(sample).await.is_err() {
                                    info!("sample channel closed, stopping udp listener");
                                    return;
                                }
                            }
                        }
                        Err(e) => warn!(error = %e, "udp read failed"),
                    }
                }
            }
        }

        info!("udp listener stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SampleValue;
    use std::time::Duration;

    async fn recv_with_timeout(rx: &mut mpsc::Receiver<Sample>) -> Sample {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("sample within deadline")
            .expect("channel open")
    }

    #[tokio::test]
    async fn test_datagram_flows_to_channel() {
        let (tx, mut rx) = mpsc::channel(16);
        let ingress = UdpIngress::bind("127.0.0.1", 0, tx).await.expect("bind");
        let addr = ingress.local_addr().expect("addr");
        let cancel = CancellationToken::new();
        let task = ingress.start(cancel.clone());

        let client = UdpSocket::bind("127.0.0.1:0").await.expect("client bind");
        client
            .send_to(b"gorets:1|c\nglork:320|g\n", addr)
            .await
            .expect("send");

        let first = recv_with_timeout(&mut rx).await;
        assert_eq!(first.bucket, "gorets");
        assert_eq!(first.value, SampleValue::Counter(1));

        let second = recv_with_timeout(&mut rx).await;
        assert_eq!(second.bucket, "glork");
        assert_eq!(second.value, SampleValue::Gauge(320));

        cancel.cancel();
        task.await.expect("listener task");
    }

    #[tokio::test]
    async fn test_malformed_datagram_yields_good_samples_only() {
        let (tx, mut rx) = mpsc::channel(16);
        let ingress = UdpIngress::bind("127.0.0.1", 0, tx).await.expect("bind");
        let addr = ingress.local_addr().expect("addr");
        let cancel = CancellationToken::new();
        let task = ingress.start(cancel.clone());

        let client = UdpSocket::bind("127.0.0.1:0").await.expect("client bind");
        client
            .send_to(b"good:1|c\nbad line\nalso:2|c\n", addr)
            .await
            .expect("send");

        assert_eq!(recv_with_timeout(&mut rx).await.bucket, "good");
        assert_eq!(recv_with_timeout(&mut rx).await.bucket, "also");

        cancel.cancel();
        task.await.expect("listener task");
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal() {
        let (tx, _rx) = mpsc::channel(16);
        assert!(UdpIngress::bind("256.0.0.1", 0, tx).await.is_err());
    }
}
