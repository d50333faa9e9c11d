//! Windowed aggregate scoring.
//!
//! Packets are folded into one open bucket per window, where the window
//! index is `floor(time / interval)`. A packet for the next index seals the
//! open bucket, scores it and opens a new one. The first window of a run
//! almost never covers a full interval, so it is sealed without scoring.
//!
//! Packets for any other index are rejected as out of order.

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::ReportSink;
use crate::bucket::Bucket;
use crate::error::Result;
use crate::fanout::SharedPacket;
use crate::features::{featurize, featurize_flows, Baseline, Deviation, FeatureStats, KnownVocabulary};
use crate::inference::{Ensemble, EnsembleVerdict, Verdict};
use crate::metrics;
use crate::packet::ParsedPacket;

/// Aggregator statistics (lock-free)
#[derive(Debug, Default)]
pub struct AggregateStats {
    pub packets: AtomicU64,
    pub windows_scored: AtomicU64,
    pub windows_abnormal: AtomicU64,
    /// Windows sealed without scoring (first of a run)
    pub windows_skipped: AtomicU64,
    pub out_of_order: AtomicU64,
    pub failures: AtomicU64,
}

impl AggregateStats {
    pub fn snapshot(&self) -> AggregateStatsSnapshot {
        AggregateStatsSnapshot {
            packets: self.packets.load(Ordering::Relaxed),
            windows_scored: self.windows_scored.load(Ordering::Relaxed),
            windows_abnormal: self.windows_abnormal.load(Ordering::Relaxed),
            windows_skipped: self.windows_skipped.load(Ordering::Relaxed),
            out_of_order: self.out_of_order.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateStatsSnapshot {
    pub packets: u64,
    pub windows_scored: u64,
    pub windows_abnormal: u64,
    pub windows_skipped: u64,
    pub out_of_order: u64,
    pub failures: u64,
}

enum Phase {
    AwaitingFirst,
    Accumulating {
        index: i64,
        bucket: Bucket,
        /// First window of the run, sealed without scoring
        partial: bool,
    },
    /// Only observable while a bucket is being scored
    Sealing,
}

/// Scored window
#[derive(Debug, Clone)]
pub struct WindowReport {
    pub index: i64,
    pub start_time: f64,
    pub packets: u64,
    pub result: EnsembleVerdict,
    /// Features outside their training range, filled for abnormal windows
    pub deviations: Vec<Deviation>,
}

impl fmt::Display for WindowReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "window {} (start {:.0}, {} packets): {}",
            self.index, self.start_time, self.packets, self.result.verdict
        )?;
        for deviation in &self.deviations {
            writeln!(f, "{deviation}")?;
        }
        write!(
            f,
            "Models that predicted abnormal: [{}] ({} of {})",
            self.result.abnormal.join(", "),
            self.result.abnormal.len(),
            self.result.voters
        )
    }
}

/// What a single packet did to the aggregator
#[derive(Debug, Clone)]
pub enum AggregateOutcome {
    /// First packet of the run opened this window
    Opened(i64),
    Inserted(i64),
    /// The first window was sealed unscored and the next one opened
    Skipped { sealed: i64, opened: i64 },
    /// A window was sealed and scored; the next one opened
    Scored(WindowReport),
    /// A window was sealed but scoring failed; the next one opened
    Failed { sealed: i64, error: String },
    OutOfOrder { index: i64, current: i64 },
}

/// Streaming window aggregator
pub struct StreamAggregator {
    interval: f64,
    vocab: KnownVocabulary,
    ensemble: Ensemble,
    feature_stats: FeatureStats,
    phase: Phase,
    stats: Arc<AggregateStats>,
}

impl StreamAggregator {
    pub fn new(
        interval: f64,
        vocab: KnownVocabulary,
        ensemble: Ensemble,
        feature_stats: FeatureStats,
    ) -> Self {
        Self {
            interval,
            vocab,
            ensemble,
            feature_stats,
            phase: Phase::AwaitingFirst,
            stats: Arc::new(AggregateStats::default()),
        }
    }

    /// Interval, vocabulary and drift statistics from a baseline
    pub fn from_baseline(baseline: Baseline, ensemble: Ensemble) -> Result<Self> {
        let feature_stats = baseline.feature_stats()?;
        Ok(Self::new(
            baseline.interval,
            baseline.known,
            ensemble,
            feature_stats,
        ))
    }

    pub fn stats(&self) -> Arc<AggregateStats> {
        Arc::clone(&self.stats)
    }

    /// Index of the open window, if any
    pub fn current_window(&self) -> Option<i64> {
        match &self.phase {
            Phase::Accumulating { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// Counts of the open window, if any
    pub fn current_bucket(&self) -> Option<&Bucket> {
        match &self.phase {
            Phase::Accumulating { bucket, .. } => Some(bucket),
            _ => None,
        }
    }

    pub fn window_index(&self, time: f64) -> i64 {
        (time / self.interval).floor() as i64
    }

    pub fn process(&mut self, packet: &ParsedPacket) -> AggregateOutcome {
        self.stats.packets.fetch_add(1, Ordering::Relaxed);
        let index = self.window_index(packet.time);

        let Some(current) = self.current_window() else {
            self.open(index, packet, true);
            return AggregateOutcome::Opened(index);
        };

        match index - current {
            0 => {
                if let Phase::Accumulating { bucket, .. } = &mut self.phase {
                    bucket.insert(packet);
                }
                AggregateOutcome::Inserted(index)
            }
            1 => self.seal_and_open(index, packet),
            _ => {
                self.stats.out_of_order.fetch_add(1, Ordering::Relaxed);
                metrics::OUT_OF_ORDER.inc();
                tracing::warn!(
                    index,
                    current,
                    time = packet.time,
                    "Out of order packet rejected"
                );
                AggregateOutcome::OutOfOrder { index, current }
            }
        }
    }

    fn open(&mut self, index: i64, packet: &ParsedPacket, partial: bool) {
        let mut bucket = Bucket::new();
        bucket.insert(packet);
        self.phase = Phase::Accumulating {
            index,
            bucket,
            partial,
        };
    }

    fn seal_and_open(&mut self, next: i64, packet: &ParsedPacket) -> AggregateOutcome {
        let sealed = mem::replace(&mut self.phase, Phase::Sealing);
        let Phase::Accumulating {
            index,
            bucket,
            partial,
        } = sealed
        else {
            self.open(next, packet, true);
            return AggregateOutcome::Opened(next);
        };

        let outcome = if partial {
            self.stats.windows_skipped.fetch_add(1, Ordering::Relaxed);
            tracing::info!(window = index, packets = bucket.total(), "First window skipped");
            AggregateOutcome::Skipped {
                sealed: index,
                opened: next,
            }
        } else {
            match self.score(index, &bucket) {
                Ok(report) => AggregateOutcome::Scored(report),
                Err(e) => {
                    self.stats.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(window = index, error = %e, "Window scoring failed");
                    AggregateOutcome::Failed {
                        sealed: index,
                        error: e.to_string(),
                    }
                }
            }
        };

        self.open(next, packet, false);
        outcome
    }

    fn score(&self, index: i64, bucket: &Bucket) -> Result<WindowReport> {
        let features = featurize(&self.vocab, bucket)?;
        let flows = featurize_flows(&self.vocab, bucket);
        let result = self.ensemble.vote(&features.values, &flows)?;

        let deviations = match result.verdict {
            Verdict::Abnormal => self.feature_stats.deviations(&features.values, &flows),
            Verdict::Normal => Vec::new(),
        };

        self.stats.windows_scored.fetch_add(1, Ordering::Relaxed);
        if result.verdict == Verdict::Abnormal {
            self.stats.windows_abnormal.fetch_add(1, Ordering::Relaxed);
        }
        metrics::record_window(result.verdict.as_str());

        Ok(WindowReport {
            index,
            start_time: index as f64 * self.interval,
            packets: bucket.total(),
            result,
            deviations,
        })
    }

    /// Consume the queue until it closes, writing one report per scored window
    pub async fn run(mut self, mut rx: mpsc::Receiver<SharedPacket>, mut sink: ReportSink) {
        tracing::info!(
            interval = self.interval,
            models = self.ensemble.len(),
            "Aggregate engine started"
        );

        while let Some(packet) = rx.recv().await {
            if let AggregateOutcome::Scored(report) = self.process(&packet) {
                match report.result.verdict {
                    Verdict::Abnormal => tracing::warn!(
                        window = report.index,
                        models = ?report.result.abnormal,
                        deviations = report.deviations.len(),
                        "Abnormal window"
                    ),
                    Verdict::Normal => tracing::info!(
                        window = report.index,
                        models = ?report.result.abnormal,
                        "Normal window"
                    ),
                }
                sink.emit(&report);
            }
        }

        tracing::info!(
            window = ?self.current_window(),
            "Aggregate engine stopped, open window not scored"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::{CategoryField, Label};
    use crate::engine::SharedBuffer;
    use crate::features::{feature_names, flow_feature_names, Family};
    use crate::inference::testing::fixed;
    use crate::inference::Predictor;

    fn vocab() -> KnownVocabulary {
        KnownVocabulary::new()
            .with_family(Family::Ip, vec![])
            .with_family(Family::Mac, vec![])
            .with_family(Family::UdpPort, vec![])
            .with_family(Family::UdpLen, vec![])
    }

    fn width() -> usize {
        feature_names(&vocab()).unwrap().len()
    }

    fn flat_stats() -> FeatureStats {
        let names: Vec<String> = feature_names(&vocab())
            .unwrap()
            .into_iter()
            .chain(flow_feature_names())
            .collect();
        let n = names.len();
        FeatureStats {
            names,
            mean: vec![0.0; n],
            std: vec![0.0; n],
        }
    }

    fn aggregator(votes: &[bool]) -> StreamAggregator {
        let predictors: Vec<Predictor> = votes
            .iter()
            .enumerate()
            .map(|(i, v)| fixed(&format!("m{i}"), *v, width()))
            .collect();
        StreamAggregator::new(1.0, vocab(), Ensemble::new(predictors), flat_stats())
    }

    fn packet(time: f64) -> ParsedPacket {
        ParsedPacket::at(time).with_ip("10.0.0.1", "10.0.0.2")
    }

    #[test]
    fn test_window_sealing() {
        let mut agg = aggregator(&[false, false, false]);

        assert!(matches!(agg.process(&packet(0.1)), AggregateOutcome::Opened(0)));
        assert!(matches!(agg.process(&packet(0.5)), AggregateOutcome::Inserted(0)));
        assert!(matches!(
            agg.process(&packet(1.2)),
            AggregateOutcome::Skipped { sealed: 0, opened: 1 }
        ));
        assert!(matches!(agg.process(&packet(1.7)), AggregateOutcome::Inserted(1)));

        match agg.process(&packet(2.0)) {
            AggregateOutcome::Scored(report) => {
                assert_eq!(report.index, 1);
                assert_eq!(report.packets, 2);
                assert_eq!(report.result.verdict, Verdict::Normal);
            }
            other => panic!("expected a scored window, got {other:?}"),
        }

        let stats = agg.stats().snapshot();
        assert_eq!(stats.windows_scored, 1);
        assert_eq!(stats.windows_skipped, 1);
        assert_eq!(agg.current_window(), Some(2));
    }

    #[test]
    fn test_out_of_order_rejected() {
        let mut agg = aggregator(&[false]);
        agg.process(&packet(10.0));
        agg.process(&packet(11.0));

        assert!(matches!(
            agg.process(&packet(10.5)),
            AggregateOutcome::OutOfOrder { index: 10, current: 11 }
        ));
        assert!(matches!(
            agg.process(&packet(13.0)),
            AggregateOutcome::OutOfOrder { index: 13, current: 11 }
        ));

        // state untouched
        assert_eq!(agg.current_window(), Some(11));
        assert!(matches!(agg.process(&packet(11.9)), AggregateOutcome::Inserted(11)));
        assert_eq!(agg.stats().snapshot().out_of_order, 2);
    }

    #[test]
    fn test_stale_packet_leaves_window_untouched() {
        let mut agg = aggregator(&[false]);
        agg.process(&packet(1.0));
        agg.process(&ParsedPacket::at(2.0).with_ip("10.0.0.1", "10.0.0.2"));
        assert_eq!(agg.current_window(), Some(2));

        let stale = ParsedPacket::at(0.5).with_ip("10.9.9.9", "10.0.0.2");
        assert!(matches!(
            agg.process(&stale),
            AggregateOutcome::OutOfOrder { index: 0, current: 2 }
        ));

        let open = agg.current_bucket().unwrap();
        assert_eq!(open.total(), 1);
        let ip_src = open.category(CategoryField::IpSrc).unwrap();
        assert_eq!(ip_src.total(), 1);
        assert_eq!(ip_src.count(&Label::value("10.9.9.9")), 0);
        assert_eq!(ip_src.count(&Label::value("10.0.0.1")), 1);

        match agg.process(&packet(3.0)) {
            AggregateOutcome::Scored(report) => {
                assert_eq!(report.index, 2);
                assert_eq!(report.packets, 1);
            }
            other => panic!("expected a scored window, got {other:?}"),
        }
    }

    fn score_with(votes: &[bool]) -> WindowReport {
        let mut agg = aggregator(votes);
        agg.process(&packet(0.0));
        agg.process(&packet(1.0));
        agg.process(&packet(1.5));
        match agg.process(&packet(2.0)) {
            AggregateOutcome::Scored(report) => report,
            other => panic!("expected a scored window, got {other:?}"),
        }
    }

    #[test]
    fn test_majority_votes() {
        let report = score_with(&[true, true, false]);
        assert_eq!(report.result.verdict, Verdict::Abnormal);
        assert_eq!(report.result.abnormal, vec!["m0", "m1"]);
        // total, has_ip and the ip/other columns deviate from an all-zero baseline
        assert!(report.deviations.iter().any(|d| d.name == "total"));

        assert_eq!(score_with(&[true, false, false]).result.verdict, Verdict::Normal);
        let tie = score_with(&[true, true, false, false]);
        assert_eq!(tie.result.verdict, Verdict::Normal);
        assert!(tie.deviations.is_empty());
    }

    #[test]
    fn test_failure_confined_to_window() {
        let predictors = vec![fixed("wrong-width", true, 3)];
        let mut agg = StreamAggregator::new(1.0, vocab(), Ensemble::new(predictors), flat_stats());

        agg.process(&packet(0.0));
        agg.process(&packet(1.0));
        assert!(matches!(
            agg.process(&packet(2.0)),
            AggregateOutcome::Failed { sealed: 1, .. }
        ));
        // next window still opens and accepts packets
        assert!(matches!(agg.process(&packet(2.5)), AggregateOutcome::Inserted(2)));
        assert_eq!(agg.stats().snapshot().failures, 1);
    }

    #[test]
    fn test_report_format() {
        let report = score_with(&[true, true, false]);
        let text = report.to_string();

        assert!(text.starts_with("window 1 (start 1, 2 packets): abnormal\n"));
        assert!(text.contains("  total"));
        assert!(text.ends_with("Models that predicted abnormal: [m0, m1] (2 of 3)"));
    }

    #[tokio::test]
    async fn test_run_emits_scored_windows() {
        let agg = aggregator(&[false]);
        let stats = agg.stats();
        let buffer = SharedBuffer::default();
        let (tx, rx) = mpsc::channel(16);

        let handle = tokio::spawn(agg.run(rx, buffer.sink()));
        for t in [0.0, 0.0, 1.0, 1.0, 2.0, 3.0, 2.5] {
            tx.send(Arc::new(packet(t))).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap();

        let out = buffer.contents();
        assert!(out.contains("window 1 (start 1, 2 packets): normal"));
        assert!(out.contains("window 2 (start 2, 1 packets): normal"));
        assert_eq!(stats.snapshot().out_of_order, 1);
    }
}
