//! The aggregation engine.
//!
//! A single task owns the four aggregation maps and multiplexes over three
//! event sources: incoming samples, the flush ticker, and shutdown. Nothing
//! else can reach the maps, so no locks exist anywhere in the pipeline.
//! Publishing runs inline on the same task; a flush fully completes before
//! the next one can begin, and samples arriving meanwhile queue in the
//! bounded channel.

pub mod timer;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::mem;
use std::time::{Duration, SystemTime};

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::graphite;
use crate::protocol::{Sample, SampleValue};

use self::timer::{threshold, TimerSummary};

/// Single owner of all aggregation state.
pub struct Aggregator {
    flush_interval: Duration,
    graphite_addr: String,
    percentiles: Vec<i32>,
    /// Bucket that counts accepted samples; `None` disables self-counting.
    receive_counter: Option<Bytes>,

    counters: HashMap<Bytes, i64>,
    gauges: HashMap<Bytes, i64>,
    sets: HashMap<Bytes, HashSet<Bytes>>,
    timers: HashMap<Bytes, Vec<i64>>,
}

impl Aggregator {
    /// Creates an aggregator with empty state.
    pub fn new(cfg: &Config) -> Self {
        let receive_counter = if cfg.receive_counter.is_empty() {
            None
        } else {
            Some(Bytes::copy_from_slice(cfg.receive_counter.as_bytes()))
        };

        Self {
            flush_interval: cfg.flush_interval,
            graphite_addr: cfg.graphite.clone(),
            percentiles: cfg.percentiles.clone(),
            receive_counter,
            counters: HashMap::new(),
            gauges: HashMap::new(),
            sets: HashMap::new(),
            timers: HashMap::new(),
        }
    }

    /// The serving loop: one event per iteration until cancellation, then
    /// one final publish.
    pub async fn run(mut self, mut samples: mpsc::Receiver<Sample>, cancel: CancellationToken) {
        let mut ticker = interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // An interval's first tick completes immediately; consume it so the
        // first flush lands one full interval after startup.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.publish(Instant::now() + self.flush_interval).await;
                    break;
                }

                _ = ticker.tick() => {
                    self.publish(Instant::now() + self.flush_interval).await;
                }

                Some(sample) = samples.recv() => {
                    self.apply(sample);
                }
            }
        }

        info!("aggregator stopped");
    }

    /// Applies one sample to the owned maps.
    fn apply(&mut self, sample: Sample) {
        if let Some(bucket) = &self.receive_counter {
            *self.counters.entry(bucket.clone()).or_insert(0) += 1;
        }

        match sample.value {
            SampleValue::Counter(value) => {
                // The inverse rate is computed in f32 before widening;
                // 1/0.1f32 is exactly 10.0.
                let scaled = (value as f64 * f64::from(1.0_f32 / sample.sample_rate)) as i64;
                *self.counters.entry(sample.bucket).or_insert(0) += scaled;
            }
            SampleValue::Gauge(value) => {
                self.gauges.insert(sample.bucket, value);
            }
            SampleValue::Timer(value) => {
                self.timers.entry(sample.bucket).or_default().push(value);
            }
            SampleValue::Set(member) => {
                self.sets.entry(sample.bucket).or_default().insert(member);
            }
        }
    }

    /// Serializes and drains the current state, then ships it downstream.
    ///
    /// An empty interval opens no connection. A failed publish drops the
    /// interval; the drained state is not restored.
    async fn publish(&mut self, deadline: Instant) {
        let now = unix_now();
        let (payload, lines) = self.render(now);
        if lines == 0 {
            debug!("flush skipped, no stats");
            return;
        }

        if tracing::enabled!(tracing::Level::DEBUG) {
            for line in payload.split(|b| *b == b'\n').filter(|l| !l.is_empty()) {
                debug!(line = %String::from_utf8_lossy(line), "publishing");
            }
        }

        match graphite::publish(&self.graphite_addr, &payload, deadline).await {
            Ok(()) => info!(stats = lines, graphite = %self.graphite_addr, "sent stats"),
            Err(e) => warn!(
                error = %e,
                graphite = %self.graphite_addr,
                "publish failed, dropping interval",
            ),
        }
    }

    /// Renders counters, gauges, sets, then timers into Graphite lines,
    /// draining each map as it goes. Returns the payload and line count.
    fn render(&mut self, now: i64) -> (Bytes, u64) {
        let mut buf = BytesMut::new();
        let mut lines = 0u64;
        let interval_secs = self.flush_interval.as_secs_f64();

        for (bucket, count) in mem::take(&mut self.counters) {
            put_line(&mut buf, "stats.counters.", &bucket, ".count", count, now);
            let rate = count as f64 / interval_secs;
            put_line(
                &mut buf,
                "stats.counters.",
                &bucket,
                ".rate",
                format_args!("{rate:.6}"),
                now,
            );
            lines += 2;
        }

        for (bucket, value) in mem::take(&mut self.gauges) {
            put_line(&mut buf, "stats.gauges.", &bucket, "", value, now);
            lines += 1;
        }

        for (bucket, members) in mem::take(&mut self.sets) {
            put_line(&mut buf, "stats.sets.", &bucket, ".count", members.len(), now);
            lines += 1;
        }

        for (bucket, values) in &mut self.timers {
            let Some(summary) = TimerSummary::compute(values) else {
                continue;
            };

            let mean = summary.mean;
            put_line(
                &mut buf,
                "stats.timers.",
                bucket,
                ".mean",
                format_args!("{mean:.6}"),
                now,
            );
            put_line(&mut buf, "stats.timers.", bucket, ".upper", summary.upper, now);
            put_line(&mut buf, "stats.timers.", bucket, ".lower", summary.lower, now);
            put_line(&mut buf, "stats.timers.", bucket, ".count", summary.count, now);
            lines += 4;

            for &p in &self.percentiles {
                let suffix = if p >= 0 {
                    format!(".upper_{p}")
                } else {
                    format!(".lower_{}", -p)
                };
                put_line(&mut buf, "stats.timers.", bucket, &suffix, threshold(values, p), now);
                lines += 1;
            }

            // The key stays; only the interval's observations are dropped.
            values.clear();
        }

        (buf.freeze(), lines)
    }
}

/// Appends one `<prefix><bucket><suffix> <value> <now>\n` line.
fn put_line(
    buf: &mut BytesMut,
    prefix: &str,
    bucket: &[u8],
    suffix: &str,
    value: impl fmt::Display,
    now: i64,
) {
    buf.extend_from_slice(prefix.as_bytes());
    buf.extend_from_slice(bucket);
    buf.extend_from_slice(suffix.as_bytes());
    buf.extend_from_slice(format!(" {value} {now}\n").as_bytes());
}

/// Current wall clock as Unix seconds.
fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
