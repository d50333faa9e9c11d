//! Per-packet batch scoring.
//!
//! Packets are transformed and buffered. When a packet arrives and the
//! buffer already holds `batch_size` rows, the whole buffer is scored in one
//! call and cleared, then the arriving packet starts the next batch.
//!
//! Summaries are deduplicated within a batch only; the same anomaly in the
//! next batch is reported again.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::summary::summarize;
use super::transform::{PacketTransform, PACKET_FEATURES};
use super::ReportSink;
use crate::error::{IdsError, Result};
use crate::fanout::SharedPacket;
use crate::inference::{Predictor, Verdict};
use crate::metrics;

/// Batch engine statistics (lock-free)
#[derive(Debug, Default)]
pub struct BatchStats {
    pub packets: AtomicU64,
    pub batches: AtomicU64,
    /// Rows the model flagged
    pub flagged: AtomicU64,
    /// Distinct summaries written to reports
    pub reported: AtomicU64,
    pub dhcp_filtered: AtomicU64,
    /// Flagged packets whose raw frame could not be decoded
    pub malformed: AtomicU64,
    pub failures: AtomicU64,
}

impl BatchStats {
    pub fn snapshot(&self) -> BatchStatsSnapshot {
        BatchStatsSnapshot {
            packets: self.packets.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            flagged: self.flagged.load(Ordering::Relaxed),
            reported: self.reported.load(Ordering::Relaxed),
            dhcp_filtered: self.dhcp_filtered.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchStatsSnapshot {
    pub packets: u64,
    pub batches: u64,
    pub flagged: u64,
    pub reported: u64,
    pub dhcp_filtered: u64,
    pub malformed: u64,
    pub failures: u64,
}

/// Result of scoring one batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    /// Sequence number of the batch, starting at 1
    pub batch: u64,
    pub size: usize,
    pub flagged: usize,
    /// Distinct summaries, sorted
    pub summaries: Vec<String>,
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "batch {}: {} of {} packets anomalous, {} distinct",
            self.batch,
            self.flagged,
            self.size,
            self.summaries.len()
        )?;
        for summary in &self.summaries {
            write!(f, "\n  {summary}")?;
        }
        Ok(())
    }
}

/// Buffers packets and scores them in fixed-size batches
pub struct BatchScorer {
    transform: PacketTransform,
    predictor: Predictor,
    batch_size: usize,
    rows: Vec<[f64; PACKET_FEATURES]>,
    packets: Vec<SharedPacket>,
    stats: Arc<BatchStats>,
}

impl BatchScorer {
    pub fn new(predictor: Predictor, transform: PacketTransform, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            transform,
            predictor,
            batch_size,
            rows: Vec::with_capacity(batch_size),
            packets: Vec::with_capacity(batch_size),
            stats: Arc::new(BatchStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<BatchStats> {
        Arc::clone(&self.stats)
    }

    /// Packets waiting in the current batch
    pub fn pending(&self) -> usize {
        self.rows.len()
    }

    /// Buffer one packet, scoring the full batch first if needed.
    ///
    /// Returns the report of the batch scored by this call, if any. A
    /// model failure is logged and the batch is dropped.
    pub fn process(&mut self, packet: SharedPacket) -> Option<BatchReport> {
        self.stats.packets.fetch_add(1, Ordering::Relaxed);

        let report = if self.rows.len() >= self.batch_size {
            let report = match self.score() {
                Ok(report) => Some(report),
                Err(e) => {
                    self.stats.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        model = self.predictor.name(),
                        size = self.rows.len(),
                        error = %e,
                        "Batch scoring failed, batch dropped"
                    );
                    None
                }
            };
            self.rows.clear();
            self.packets.clear();
            report
        } else {
            None
        };

        self.rows.push(self.transform.transform(&packet));
        self.packets.push(packet);
        report
    }

    fn score(&self) -> Result<BatchReport> {
        let flat: Vec<f64> = self.rows.iter().flatten().copied().collect();
        let x = Array2::from_shape_vec((self.rows.len(), PACKET_FEATURES), flat).map_err(|e| {
            IdsError::InvalidArtifact {
                name: self.predictor.name().to_string(),
                reason: e.to_string(),
            }
        })?;
        let verdicts = self.predictor.predict_rows(&x)?;

        let batch = self.stats.batches.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::BATCHES_SCORED.inc();

        let mut flagged = 0;
        let mut summaries = BTreeSet::new();
        for (packet, verdict) in self.packets.iter().zip(verdicts) {
            if verdict != Verdict::Abnormal {
                continue;
            }
            flagged += 1;

            match summarize(packet) {
                Some(summary) if summary.is_dhcp => {
                    self.stats.dhcp_filtered.fetch_add(1, Ordering::Relaxed);
                }
                Some(summary) => {
                    summaries.insert(summary.text);
                }
                None => {
                    self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(time = packet.time, "Malformed frame skipped in summary");
                }
            }
        }

        self.stats.flagged.fetch_add(flagged as u64, Ordering::Relaxed);
        self.stats
            .reported
            .fetch_add(summaries.len() as u64, Ordering::Relaxed);
        metrics::ANOMALIES_REPORTED.inc_by(summaries.len() as f64);

        Ok(BatchReport {
            batch,
            size: self.rows.len(),
            flagged,
            summaries: summaries.into_iter().collect(),
        })
    }

    /// Consume the queue until it closes, writing non-empty reports
    pub async fn run(mut self, mut rx: mpsc::Receiver<SharedPacket>, mut sink: ReportSink) {
        tracing::info!(
            model = self.predictor.name(),
            batch_size = self.batch_size,
            "Per-packet engine started"
        );

        while let Some(packet) = rx.recv().await {
            let Some(report) = self.process(packet) else {
                continue;
            };
            if report.summaries.is_empty() {
                tracing::debug!(batch = report.batch, flagged = report.flagged, "Batch clean");
                continue;
            }
            tracing::warn!(
                batch = report.batch,
                flagged = report.flagged,
                distinct = report.summaries.len(),
                "Anomalous packets"
            );
            sink.emit(&report);
        }

        tracing::info!(
            pending = self.pending(),
            "Per-packet engine stopped, partial batch not scored"
        );
    }
}
