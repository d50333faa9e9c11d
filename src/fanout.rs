//! Fan-out: one bounded queue per engine.
//!
//! Every published packet is offered to every engine without blocking the
//! producer:
//! - queue above the warning depth: the packet is delivered and a backlog
//!   warning is logged
//! - queue full: the packet is dropped for that engine only
//!
//! Dropping the [`FanOut`] closes every queue so engines drain and exit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::metrics;
use crate::packet::ParsedPacket;

/// Shared handle to one decoded packet
pub type SharedPacket = Arc<ParsedPacket>;

/// Queue sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanOutConfig {
    /// Depth above which a backlog warning is logged
    pub warn_depth: usize,

    /// Hard capacity of each engine queue
    pub queue_limit: usize,
}

impl Default for FanOutConfig {
    fn default() -> Self {
        Self {
            warn_depth: crate::defaults::QUEUE_WARN_DEPTH,
            queue_limit: crate::defaults::QUEUE_LIMIT,
        }
    }
}

/// Per-engine queue statistics (lock-free)
#[derive(Debug, Default)]
pub struct LaneStats {
    /// Packets delivered to the queue
    pub published: AtomicU64,

    /// Packets dropped on a full queue
    pub dropped: AtomicU64,

    /// Deliveries made while above the warning depth
    pub backlogged: AtomicU64,

    /// Depth observed at the last publish
    pub depth: AtomicU64,
}

impl LaneStats {
    /// Snapshot current stats
    pub fn snapshot(&self) -> LaneStatsSnapshot {
        LaneStatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            backlogged: self.backlogged.load(Ordering::Relaxed),
            depth: self.depth.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of one engine queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaneStatsSnapshot {
    pub published: u64,
    pub dropped: u64,
    pub backlogged: u64,
    pub depth: u64,
}

/// Outcome of a publish across all engines
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishResult {
    pub delivered: usize,
    pub dropped: usize,
}

struct Lane {
    engine: &'static str,
    tx: mpsc::Sender<SharedPacket>,
    stats: Arc<LaneStats>,
}

/// Non-blocking multi-consumer distributor
pub struct FanOut {
    config: FanOutConfig,
    lanes: Vec<Lane>,
}

impl FanOut {
    pub fn new(config: FanOutConfig) -> Self {
        Self {
            config,
            lanes: Vec::new(),
        }
    }

    /// Register an engine and get the receiving end of its queue
    pub fn subscribe(&mut self, engine: &'static str) -> mpsc::Receiver<SharedPacket> {
        let (tx, rx) = mpsc::channel(self.config.queue_limit.max(1));
        self.lanes.push(Lane {
            engine,
            tx,
            stats: Arc::new(LaneStats::default()),
        });
        rx
    }

    /// Stats handles by engine name
    pub fn stats(&self) -> Vec<(&'static str, Arc<LaneStats>)> {
        self.lanes
            .iter()
            .map(|lane| (lane.engine, Arc::clone(&lane.stats)))
            .collect()
    }

    /// Offer a packet to every engine
    pub fn publish(&self, packet: ParsedPacket) -> PublishResult {
        let packet = Arc::new(packet);
        let mut result = PublishResult::default();

        for lane in &self.lanes {
            let depth = lane.tx.max_capacity() - lane.tx.capacity();

            match lane.tx.try_send(Arc::clone(&packet)) {
                Ok(()) => {
                    let depth = depth + 1;
                    lane.stats.published.fetch_add(1, Ordering::Relaxed);
                    lane.stats.depth.store(depth as u64, Ordering::Relaxed);
                    metrics::record_published(lane.engine, depth);

                    if depth > self.config.warn_depth {
                        lane.stats.backlogged.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            engine = lane.engine,
                            depth,
                            "Engine queue backlog"
                        );
                    }
                    result.delivered += 1;
                }
                Err(TrySendError::Full(_)) => {
                    lane.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    metrics::record_dropped(lane.engine);
                    tracing::warn!(engine = lane.engine, "Queue overflow: packet dropped");
                    result.dropped += 1;
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(engine = lane.engine, "Engine queue closed");
                    result.dropped += 1;
                }
            }
        }

        result
    }
}
