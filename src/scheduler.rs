//! Tick scheduler
//!
//! Drives the adapter's periodic scan from a tokio interval. The scan runs
//! under the adapter lock, so it never interleaves with a request.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::adapter::SharedAdapter;
use crate::io::{AssemblyStore, FrameSink};

/// Scheduler counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub ticks: u64,
    pub timed_out: u64,
    pub expired_sessions: u64,
    pub produced: u64,
    pub production_failures: u64,
    pub errors: u64,
}

pub struct TickScheduler<A: AssemblyStore, S: FrameSink> {
    adapter: SharedAdapter<A>,
    sink: S,
    tick: Duration,
    shutdown_rx: Option<mpsc::Receiver<()>>,
    stats: SchedulerStats,
}

impl<A: AssemblyStore, S: FrameSink> TickScheduler<A, S> {
    pub fn new(adapter: SharedAdapter<A>, sink: S, tick: Duration) -> Self {
        Self {
            adapter,
            sink,
            tick,
            shutdown_rx: None,
            stats: SchedulerStats::default(),
        }
    }

    /// Set the shutdown receiver
    pub fn with_shutdown(mut self, rx: mpsc::Receiver<()>) -> Self {
        self.shutdown_rx = Some(rx);
        self
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Tick until the shutdown channel fires or closes
    pub async fn run(&mut self) -> SchedulerStats {
        info!("Tick scheduler started (period {:?})", self.tick);

        let mut timer = tokio::time::interval(self.tick);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                instant = timer.tick() => {
                    self.scan(instant.into_std()).await;
                }

                _ = async {
                    match self.shutdown_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending::<Option<()>>().await,
                    }
                } => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        info!(
            "Tick scheduler stopped after {} ticks ({} produced, {} timed out)",
            self.stats.ticks, self.stats.produced, self.stats.timed_out
        );
        self.stats.clone()
    }

    async fn scan(&mut self, now: std::time::Instant) {
        self.stats.ticks += 1;

        match self.adapter.on_tick(now, &mut self.sink).await {
            Ok(report) => {
                self.stats.timed_out += report.timed_out.len() as u64;
                self.stats.expired_sessions += report.expired_sessions.len() as u64;
                self.stats.produced += report.produced as u64;
                self.stats.production_failures += report.production_failures as u64;
                if !report.is_idle() {
                    debug!(
                        "Tick {}: produced={} failures={} timed_out={} sessions_expired={}",
                        self.stats.ticks,
                        report.produced,
                        report.production_failures,
                        report.timed_out.len(),
                        report.expired_sessions.len()
                    );
                }
            }
            // Fatal faults were quarantined by the adapter; the scan
            // resumes next tick.
            Err(e) if e.is_fatal() => {
                self.stats.errors += 1;
                error!("Tick {} aborted: {}", self.stats.ticks, e);
            }
            Err(e) => {
                self.stats.errors += 1;
                warn!("Tick {} failed: {}", self.stats.ticks, e);
            }
        }
    }
}
