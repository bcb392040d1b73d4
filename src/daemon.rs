//! Daemon orchestration.
//!
//! Wires the UDP ingress to the aggregator through the bounded sample
//! channel and owns the cancellation token that drives shutdown.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::aggregator::Aggregator;
use crate::config::Config;
use crate::ingress::UdpIngress;

/// Capacity of the ingress-to-aggregator channel: enough to absorb a burst
/// while a publish holds the aggregator.
pub const SAMPLE_QUEUE_CAPACITY: usize = 2048;

/// The running collector: one ingress task, one aggregator task.
pub struct Daemon {
    cfg: Config,
    cancel: CancellationToken,
    local_addr: Option<SocketAddr>,
    ingress_task: Option<JoinHandle<()>>,
    aggregator_task: Option<JoinHandle<()>>,
}

impl Daemon {
    /// Creates a daemon from validated configuration.
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg,
            cancel: CancellationToken::new(),
            local_addr: None,
            ingress_task: None,
            aggregator_task: None,
        }
    }

    /// Binds the listener and spawns both tasks. Bind failure is fatal.
    pub async fn start(&mut self) -> Result<()> {
        let (tx, rx) = mpsc::channel(SAMPLE_QUEUE_CAPACITY);

        let ingress = UdpIngress::bind(&self.cfg.address, self.cfg.port, tx)
            .await
            .context("starting udp listener")?;
        self.local_addr = Some(ingress.local_addr()?);

        let aggregator = Aggregator::new(&self.cfg);
        self.aggregator_task = Some(tokio::spawn(
            aggregator.run(rx, self.cancel.child_token()),
        ));
        self.ingress_task = Some(ingress.start(self.cancel.child_token()));

        info!(
            graphite = %self.cfg.graphite,
            flush_interval = ?self.cfg.flush_interval,
            percentiles = ?self.cfg.percentiles,
            "daemon started",
        );
        Ok(())
    }

    /// The address the UDP listener bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Cancels both tasks and waits for the aggregator's final publish.
    pub async fn stop(&mut self) {
        self.cancel.cancel();

        if let Some(task) = self.aggregator_task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "aggregator task join failed");
            }
        }
        if let Some(task) = self.ingress_task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "ingress task join failed");
            }
        }
    }
}
