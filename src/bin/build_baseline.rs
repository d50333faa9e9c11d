//! Offline baseline construction.
//!
//! Reads a JSON-lines packet export, buckets it by interval, drops the
//! trailing partial bucket and writes the bucket series plus the baseline
//! artifact used by the aggregate engine.
//!
//! ```text
//! build-baseline <packets.jsonl>
//! ```

use std::env;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scada_ids::{
    bucket::BucketSeries, config::HostInventory, defaults, features::Baseline, parse_packet,
    ParsedPacket,
};

/// Environment variable names
mod env_vars {
    pub const INTERVAL: &str = "SCADA_IDS_INTERVAL";
    pub const INVENTORY: &str = "SCADA_IDS_INVENTORY";
    pub const BASELINE: &str = "SCADA_IDS_BASELINE";
    pub const SERIES_OUT: &str = "SCADA_IDS_SERIES_OUT";
    pub const LOG_LEVEL: &str = "SCADA_IDS_LOG_LEVEL";
}

const SERIES_OUT: &str = "aggregate_buckets.json";

fn init_logging() {
    let level = env::var(env_vars::LOG_LEVEL).unwrap_or_else(|_| "info".to_string());

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("scada_ids={level},build_baseline={level}").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn path_var(key: &str, default: &str) -> PathBuf {
    env::var(key)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

/// Decode every line; undecodable lines are logged and skipped
fn read_packets(path: &Path) -> Result<Vec<ParsedPacket>> {
    let reader = BufReader::new(
        File::open(path).with_context(|| format!("opening {}", path.display()))?,
    );

    let mut packets = Vec::new();
    let mut skipped = 0usize;
    for (n, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("reading {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match parse_packet(line.as_bytes()) {
            Ok(packet) => packets.push(packet),
            Err(e) => {
                skipped += 1;
                tracing::warn!(line = n + 1, error = %e, "Skipping undecodable packet");
            }
        }
    }

    tracing::info!(packets = packets.len(), skipped, "Packets read");
    Ok(packets)
}

fn main() -> Result<()> {
    init_logging();

    let Some(input) = env::args().nth(1).map(PathBuf::from) else {
        bail!("usage: build-baseline <packets.jsonl>");
    };

    let interval = match env::var(env_vars::INTERVAL) {
        Ok(s) => s
            .parse::<f64>()
            .with_context(|| format!("{} is not a number: {s}", env_vars::INTERVAL))?,
        Err(_) => defaults::INTERVAL_SECS,
    };
    if !(interval.is_finite() && interval > 0.0) {
        bail!("interval must be positive, got {interval}");
    }

    let inventory_path = path_var(env_vars::INVENTORY, defaults::INVENTORY_PATH);
    let baseline_path = path_var(env_vars::BASELINE, defaults::BASELINE_PATH);
    let series_path = path_var(env_vars::SERIES_OUT, SERIES_OUT);

    let inventory = HostInventory::load(&inventory_path)
        .with_context(|| format!("loading inventory {}", inventory_path.display()))?;
    let packets = read_packets(&input)?;

    let series = BucketSeries::from_packets(&packets, interval)?;
    let complete = series.complete_buckets();
    if complete.is_empty() {
        bail!(
            "capture spans a single interval ({} s); need at least two buckets",
            interval
        );
    }

    let baseline = Baseline::build(complete, interval, &inventory)?;

    series
        .save(&series_path)
        .with_context(|| format!("writing {}", series_path.display()))?;
    baseline
        .save(&baseline_path)
        .with_context(|| format!("writing {}", baseline_path.display()))?;

    tracing::info!(
        buckets = complete.len(),
        features = baseline.feature_names.len(),
        flow_features = baseline.flow_feature_names.len(),
        series = %series_path.display(),
        baseline = %baseline_path.display(),
        "Baseline written"
    );

    Ok(())
}
