//! Fixed-interval bucket sequences.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::Bucket;
use crate::error::{IdsError, Result};
use crate::packet::ParsedPacket;

/// Result of a streaming insert into a [`BucketSeries`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesInsert {
    /// Counted into an existing bucket
    Inserted(usize),
    /// Opened the next bucket and counted into it
    Opened(usize),
    /// Negative index or a jump past the next bucket
    Rejected(i64),
}

/// Ordered buckets, each covering `interval` seconds from `start_time`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketSeries {
    interval: f64,
    start_time: f64,
    buckets: Vec<Bucket>,
    #[serde(default)]
    rejected: u64,
}

fn check_interval(interval: f64) -> Result<()> {
    if interval.is_finite() && interval > 0.0 {
        Ok(())
    } else {
        Err(IdsError::InvalidArtifact {
            name: "bucket series".to_string(),
            reason: format!("interval must be positive, got {interval}"),
        })
    }
}

impl BucketSeries {
    /// Create an empty series that grows as packets arrive
    pub fn new(interval: f64, start_time: f64) -> Result<Self> {
        Self::with_len(interval, start_time, 0)
    }

    /// Create a series of `n` empty buckets
    pub fn with_len(interval: f64, start_time: f64, n: usize) -> Result<Self> {
        check_interval(interval)?;
        Ok(Self {
            interval,
            start_time,
            buckets: vec![Bucket::new(); n],
            rejected: 0,
        })
    }

    /// Build a series covering every packet in `packets`.
    ///
    /// The series starts at the whole second of the earliest packet and
    /// ends with the bucket holding the latest one.
    pub fn from_packets(packets: &[ParsedPacket], interval: f64) -> Result<Self> {
        let first = packets
            .iter()
            .map(|p| p.time)
            .fold(f64::INFINITY, f64::min);
        let last = packets
            .iter()
            .map(|p| p.time)
            .fold(f64::NEG_INFINITY, f64::max);

        if !first.is_finite() || !last.is_finite() {
            return Err(IdsError::EmptyInput("no packets to bucket".to_string()));
        }

        let mut series = Self::new(interval, first.floor())?;
        let n = series.index_for(last) as usize + 1;
        series.buckets = vec![Bucket::new(); n];

        for packet in packets {
            let index = series.index_for(packet.time);
            series.insert_at(packet, index as usize)?;
        }

        tracing::debug!(
            buckets = series.len(),
            packets = packets.len(),
            interval,
            "Bucket series built"
        );

        Ok(series)
    }

    /// Window index for an arrival time (may be negative)
    pub fn index_for(&self, time: f64) -> i64 {
        ((time - self.start_time) / self.interval).floor() as i64
    }

    /// Count a packet into a known bucket
    pub fn insert_at(&mut self, packet: &ParsedPacket, index: usize) -> Result<()> {
        let len = self.buckets.len();
        let bucket = self
            .buckets
            .get_mut(index)
            .ok_or(IdsError::IndexOutOfRange { index, len })?;
        bucket.insert(packet);
        Ok(())
    }

    /// Count a packet by its arrival time, opening at most one new bucket.
    ///
    /// A packet that maps before the start or more than one bucket past the
    /// last open bucket is rejected and only recorded in [`Self::rejected`].
    pub fn push(&mut self, packet: &ParsedPacket) -> SeriesInsert {
        let index = self.index_for(packet.time);
        let next = self.buckets.len() as i64;

        if index < 0 || index > next {
            self.rejected += 1;
            tracing::warn!(index, open = next - 1, "Out of order packet rejected");
            return SeriesInsert::Rejected(index);
        }

        let index = index as usize;
        if index == self.buckets.len() {
            let mut bucket = Bucket::new();
            bucket.insert(packet);
            self.buckets.push(bucket);
            SeriesInsert::Opened(index)
        } else {
            self.buckets[index].insert(packet);
            SeriesInsert::Inserted(index)
        }
    }

    pub fn interval(&self) -> f64 {
        self.interval
    }

    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Bucket> {
        self.buckets.get(index)
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    /// Every bucket except the last, which rarely spans a full interval
    pub fn complete_buckets(&self) -> &[Bucket] {
        match self.buckets.split_last() {
            Some((_, complete)) => complete,
            None => &[],
        }
    }

    /// Packets refused by [`Self::push`]
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(writer, self)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let series: Self = serde_json::from_reader(reader)?;
        check_interval(series.interval)?;
        Ok(series)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::{CategoryField, Label};

    fn packet(time: f64, src: &str) -> ParsedPacket {
        ParsedPacket::at(time)
            .with_ether("00:00:00:00:00:01", "00:00:00:00:00:02")
            .with_ip(src, "10.0.0.9")
            .with_udp(8120, 8120, 100)
    }

    #[test]
    fn test_index_for() {
        let series = BucketSeries::new(60.0, 1000.0).unwrap();
        assert_eq!(series.index_for(1000.0), 0);
        assert_eq!(series.index_for(1059.9), 0);
        assert_eq!(series.index_for(1060.0), 1);
        assert_eq!(series.index_for(999.0), -1);
    }

    #[test]
    fn test_push_opens_contiguous_buckets() {
        let mut series = BucketSeries::new(10.0, 0.0).unwrap();

        assert_eq!(series.push(&packet(1.0, "10.0.0.1")), SeriesInsert::Opened(0));
        assert_eq!(series.push(&packet(2.0, "10.0.0.1")), SeriesInsert::Inserted(0));
        assert_eq!(series.push(&packet(12.0, "10.0.0.1")), SeriesInsert::Opened(1));

        // Skips bucket 2
        assert_eq!(series.push(&packet(35.0, "10.0.0.1")), SeriesInsert::Rejected(3));
        assert_eq!(series.push(&packet(-5.0, "10.0.0.1")), SeriesInsert::Rejected(-1));

        assert_eq!(series.len(), 2);
        assert_eq!(series.rejected(), 2);
        assert_eq!(series.get(0).unwrap().total(), 2);
        assert_eq!(series.get(1).unwrap().total(), 1);
    }

    #[test]
    fn test_from_packets() {
        let packets = vec![
            packet(100.2, "10.0.0.1"),
            packet(130.0, "10.0.0.2"),
            packet(165.5, "10.0.0.1"),
            packet(221.0, "10.0.0.3"),
        ];
        let series = BucketSeries::from_packets(&packets, 60.0).unwrap();

        assert_eq!(series.start_time(), 100.0);
        assert_eq!(series.len(), 3);
        assert_eq!(series.get(0).unwrap().total(), 2);
        assert_eq!(series.get(1).unwrap().total(), 1);
        assert_eq!(series.get(2).unwrap().total(), 1);
        assert_eq!(series.complete_buckets().len(), 2);
    }

    #[test]
    fn test_from_packets_empty() {
        assert!(matches!(
            BucketSeries::from_packets(&[], 60.0),
            Err(IdsError::EmptyInput(_))
        ));
    }

    #[test]
    fn test_from_packets_fractional_interval() {
        let packets = vec![packet(100.2, "10.0.0.1"), packet(101.7, "10.0.0.2")];
        let series = BucketSeries::from_packets(&packets, 0.5).unwrap();

        // 100.0 start: 100.2 -> 0, 101.7 -> 3
        assert_eq!(series.len(), 4);
        assert_eq!(series.get(0).unwrap().total(), 1);
        assert_eq!(series.get(3).unwrap().total(), 1);
        assert_eq!(series.complete_buckets().len(), 3);
    }

    #[test]
    fn test_insert_at_reports_index() {
        let mut series = BucketSeries::with_len(1.0, 0.0, 2).unwrap();
        assert!(matches!(
            series.insert_at(&packet(0.0, "10.0.0.1"), 3),
            Err(IdsError::IndexOutOfRange { index: 3, len: 2 })
        ));
    }

    #[test]
    fn test_non_positive_interval_rejected() {
        for interval in [0.0, -1.0, f64::NAN] {
            assert!(matches!(
                BucketSeries::new(interval, 0.0),
                Err(IdsError::InvalidArtifact { .. })
            ));
        }
        assert!(BucketSeries::from_packets(&[packet(1.0, "10.0.0.1")], 0.0).is_err());
    }

    #[test]
    fn test_load_rejects_bad_interval() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buckets.json");
        std::fs::write(&path, r#"{"interval": 0.0, "start_time": 0.0, "buckets": []}"#).unwrap();

        assert!(matches!(
            BucketSeries::load(&path),
            Err(IdsError::InvalidArtifact { .. })
        ));
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buckets.json");

        let mut series = BucketSeries::new(30.0, 500.0).unwrap();
        series.push(&packet(501.0, "10.0.0.1"));
        series.push(&packet(502.0, "10.0.0.2"));
        series.push(&packet(531.0, "10.0.0.1"));
        series.push(&ParsedPacket::at(540.0));

        series.save(&path).unwrap();
        let loaded = BucketSeries::load(&path).unwrap();

        assert_eq!(loaded.interval(), 30.0);
        assert_eq!(loaded.start_time(), 500.0);
        assert_eq!(loaded.buckets(), series.buckets());

        let ip_src = loaded.get(1).unwrap().category(CategoryField::IpSrc).unwrap();
        assert_eq!(ip_src.count(&Label::Absent), 1);
        assert_eq!(ip_src.count(&Label::value("10.0.0.1")), 1);
    }
}
