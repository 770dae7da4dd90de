//! Byte accounting for the optional sniffing mode.
//!
//! The relay engine reports every successful read through a write-only
//! [`ByteSink`]. The production sink keeps per-port totals and snapshots
//! them to the sniffer log as JSON; tests substitute counting stubs.

use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(5);

/// Traffic direction relative to the tunnel: `Inbound` bytes arrived from
/// the tunnel, `Outbound` bytes were fed into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Write-only counter sink consumed by the relay engine. Implementations
/// must tolerate concurrent, unordered increments.
pub trait ByteSink: Send + Sync {
    fn record(&self, port: u16, bytes: u64, direction: Direction);
}

#[derive(Default)]
struct PortCounters {
    inbound: AtomicU64,
    outbound: AtomicU64,
}

/// Per-port usage totals, periodically written to the sniffer log.
pub struct UsageMonitor {
    counters: RwLock<HashMap<u16, PortCounters>>,
    log_path: PathBuf,
}

/// One row of the sniffer log snapshot.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PortUsage {
    pub port: u16,
    pub inbound: u64,
    pub outbound: u64,
}

impl UsageMonitor {
    pub fn new(log_path: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            counters: RwLock::new(HashMap::new()),
            log_path: log_path.into(),
        })
    }

    /// Spawns the periodic snapshot writer for one instance generation.
    pub fn spawn_reporter(self: &Arc<Self>, scope: CancellationToken) {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SNAPSHOT_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = scope.cancelled() => return,
                    _ = tick.tick() => {
                        if let Err(e) = monitor.flush().await {
                            warn!("failed to write sniffer log: {e}");
                        }
                    }
                }
            }
        });
    }

    /// Current totals, sorted by port.
    pub fn snapshot(&self) -> Vec<PortUsage> {
        let mut rows = Vec::new();
        if let Ok(counters) = self.counters.read() {
            for (port, counts) in counters.iter() {
                rows.push(PortUsage {
                    port: *port,
                    inbound: counts.inbound.load(Ordering::Relaxed),
                    outbound: counts.outbound.load(Ordering::Relaxed),
                });
            }
        }
        rows.sort_by_key(|row| row.port);
        rows
    }

    async fn flush(&self) -> std::io::Result<()> {
        let snapshot = self.snapshot();
        let json = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        tokio::fs::write(&self.log_path, json).await
    }
}

impl ByteSink for UsageMonitor {
    fn record(&self, port: u16, bytes: u64, direction: Direction) {
        {
            // hot path: the port already has counters
            if let Ok(counters) = self.counters.read() {
                if let Some(counts) = counters.get(&port) {
                    match direction {
                        Direction::Inbound => counts.inbound.fetch_add(bytes, Ordering::Relaxed),
                        Direction::Outbound => counts.outbound.fetch_add(bytes, Ordering::Relaxed),
                    };
                    return;
                }
            }
        }
        if let Ok(mut counters) = self.counters.write() {
            let counts = counters.entry(port).or_default();
            match direction {
                Direction::Inbound => counts.inbound.fetch_add(bytes, Ordering::Relaxed),
                Direction::Outbound => counts.outbound.fetch_add(bytes, Ordering::Relaxed),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_accumulate_per_port_and_direction() {
        let monitor = UsageMonitor::new("unused.json");
        monitor.record(8080, 10, Direction::Inbound);
        monitor.record(8080, 5, Direction::Inbound);
        monitor.record(8080, 7, Direction::Outbound);
        monitor.record(22, 1, Direction::Outbound);

        let snapshot = monitor.snapshot();
        assert_eq!(
            snapshot,
            vec![
                PortUsage { port: 22, inbound: 0, outbound: 1 },
                PortUsage { port: 8080, inbound: 15, outbound: 7 },
            ]
        );
    }

    #[tokio::test]
    async fn concurrent_increments_are_not_lost() {
        let monitor = UsageMonitor::new("unused.json");
        let mut handles = Vec::new();
        for _ in 0..8 {
            let monitor = monitor.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    monitor.record(443, 1, Direction::Inbound);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(monitor.snapshot()[0].inbound, 800);
    }

    #[tokio::test]
    async fn flush_writes_the_snapshot() {
        let path = std::env::temp_dir().join("backhaul-usage-test.json");
        let monitor = UsageMonitor::new(&path);
        monitor.record(9000, 42, Direction::Outbound);
        monitor.flush().await.unwrap();

        let written = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(written.contains("9000"));
        assert!(written.contains("42"));
        let _ = tokio::fs::remove_file(&path).await;
    }
}
