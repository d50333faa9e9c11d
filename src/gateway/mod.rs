//! Ingestion gateway: parsed-packet datagrams in, fan-out to the engines.

pub mod udp;

pub use udp::{UdpConfig, UdpReceiver, UdpStats, UdpStatsSnapshot};
