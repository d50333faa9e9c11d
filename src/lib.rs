//! SCADA-IDS: anomaly detection for SCADA network traffic.
//!
//! Two engines run side by side over the same packet stream:
//!
//! - **Aggregate**: packets are folded into fixed time windows, each sealed
//!   window is featurized against a trained vocabulary and scored by a
//!   majority-vote ensemble of outlier models
//! - **Per-packet**: each packet becomes a 25-column row; rows are scored
//!   in batches and anomalous packets are reported as one-line summaries
//!
//! Packets arrive as JSON datagrams over UDP and are fanned out to both
//! engines through bounded queues.

pub mod api;
pub mod bucket;
pub mod config;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod features;
pub mod gateway;
pub mod inference;
pub mod metrics;
pub mod packet;

pub use config::{HostInventory, IdsConfig};
pub use error::{IdsError, Result};
pub use packet::{parse_packet, ParseError, ParsedPacket};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build information
pub mod build_info {
    /// Git commit hash (if available)
    pub const GIT_HASH: &str = match option_env!("GIT_HASH") {
        Some(hash) => hash,
        None => "unknown",
    };

    /// Build timestamp
    pub const BUILD_TIME: &str = match option_env!("BUILD_TIME") {
        Some(time) => time,
        None => "unknown",
    };

    /// Target triple
    pub const TARGET: &str = env!("TARGET");
}

/// Default configuration constants
pub mod defaults {
    /// Parsed-packet datagram listener
    pub const UDP_BIND_ADDR: &str = "0.0.0.0:5100";

    pub const API_BIND_ADDR: &str = "127.0.0.1:8090";

    pub const BASELINE_PATH: &str = "aggregate_features.json";
    pub const MODEL_PATH: &str = "aggregate_model.json";
    pub const PACKET_MODEL_PATH: &str = "per_packet_model.json";
    pub const INVENTORY_PATH: &str = "inventory.json";

    pub const AGGREGATE_OUT: &str = "aggregate.log";
    pub const PACKET_OUT: &str = "per_packet.log";

    /// Per-packet rows scored per model call
    pub const BATCH_SIZE: usize = 100;

    /// Queue depth that logs a backlog warning
    pub const QUEUE_WARN_DEPTH: usize = 1000;

    /// Hard capacity of each engine queue
    pub const QUEUE_LIMIT: usize = 10000;

    /// Aggregation interval in seconds for offline baselines
    pub const INTERVAL_SECS: f64 = 60.0;
}

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::bucket::{Bucket, BucketSeries};
    pub use crate::engine::{BatchScorer, PacketTransform, StreamAggregator};
    pub use crate::fanout::{FanOut, FanOutConfig};
    pub use crate::features::{featurize, featurize_flows, Baseline, KnownVocabulary};
    pub use crate::inference::{Ensemble, Predictor, Verdict};
    pub use crate::packet::{parse_packet, ParsedPacket};
}
