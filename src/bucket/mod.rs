//! Per-window packet statistics.
//!
//! A [`Bucket`] counts what was seen during one window:
//! - total packets
//! - how many packets carried each protocol layer
//! - per categorical field, how often each value (or its absence) occurred
//! - directed address and MAC pairs

pub mod series;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::packet::ParsedPacket;

pub use series::{BucketSeries, SeriesInsert};

/// Protocol presence flags, in canonical (alphabetical) order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceFlag {
    HasArp,
    HasEther,
    HasIcmp,
    HasIp,
    HasTcp,
    HasUdp,
}

impl PresenceFlag {
    pub const ALL: [PresenceFlag; 6] = [
        PresenceFlag::HasArp,
        PresenceFlag::HasEther,
        PresenceFlag::HasIcmp,
        PresenceFlag::HasIp,
        PresenceFlag::HasTcp,
        PresenceFlag::HasUdp,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PresenceFlag::HasArp => "has_arp",
            PresenceFlag::HasEther => "has_ether",
            PresenceFlag::HasIcmp => "has_icmp",
            PresenceFlag::HasIp => "has_ip",
            PresenceFlag::HasTcp => "has_tcp",
            PresenceFlag::HasUdp => "has_udp",
        }
    }

    pub fn is_set(&self, packet: &ParsedPacket) -> bool {
        match self {
            PresenceFlag::HasArp => packet.has_arp(),
            PresenceFlag::HasEther => packet.has_ether(),
            PresenceFlag::HasIcmp => packet.has_icmp(),
            PresenceFlag::HasIp => packet.has_ip(),
            PresenceFlag::HasTcp => packet.has_tcp(),
            PresenceFlag::HasUdp => packet.has_udp(),
        }
    }
}

/// Categorical fields, in canonical (alphabetical) order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryField {
    IpDst,
    IpSrc,
    MacDst,
    MacSrc,
    UdpDstPort,
    UdpLen,
    UdpSrcPort,
}

impl CategoryField {
    pub const ALL: [CategoryField; 7] = [
        CategoryField::IpDst,
        CategoryField::IpSrc,
        CategoryField::MacDst,
        CategoryField::MacSrc,
        CategoryField::UdpDstPort,
        CategoryField::UdpLen,
        CategoryField::UdpSrcPort,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CategoryField::IpDst => "ip_dst",
            CategoryField::IpSrc => "ip_src",
            CategoryField::MacDst => "mac_dst",
            CategoryField::MacSrc => "mac_src",
            CategoryField::UdpDstPort => "udp_dst_port",
            CategoryField::UdpLen => "udp_len",
            CategoryField::UdpSrcPort => "udp_src_port",
        }
    }

    /// The packet's value for this field, or [`Label::Absent`]
    pub fn label(&self, packet: &ParsedPacket) -> Label {
        let value = match self {
            CategoryField::IpDst => packet.ip_dst().map(str::to_string),
            CategoryField::IpSrc => packet.ip_src().map(str::to_string),
            CategoryField::MacDst => packet.mac_dst().map(str::to_string),
            CategoryField::MacSrc => packet.mac_src().map(str::to_string),
            CategoryField::UdpDstPort => packet.udp_dst_port().map(|p| p.to_string()),
            CategoryField::UdpLen => packet.udp_len().map(|l| l.to_string()),
            CategoryField::UdpSrcPort => packet.udp_src_port().map(|p| p.to_string()),
        };
        value.map_or(Label::Absent, Label::Value)
    }
}

impl fmt::Display for CategoryField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Directed endpoint pairs tracked as flows
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowPair {
    Ip,
    Mac,
}

impl FlowPair {
    pub const ALL: [FlowPair; 2] = [FlowPair::Ip, FlowPair::Mac];

    /// `(source, destination)`, only when both are present
    pub fn endpoints<'a>(&self, packet: &'a ParsedPacket) -> Option<(&'a str, &'a str)> {
        match self {
            FlowPair::Ip => Some((packet.ip_src()?, packet.ip_dst()?)),
            FlowPair::Mac => Some((packet.mac_src()?, packet.mac_dst()?)),
        }
    }
}

/// A categorical value, or the marker for "field not in packet"
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "Option<String>")]
pub enum Label {
    Absent,
    Value(String),
}

impl Label {
    pub fn value(v: impl Into<String>) -> Self {
        Label::Value(v.into())
    }
}

impl From<Option<String>> for Label {
    fn from(v: Option<String>) -> Self {
        v.map_or(Label::Absent, Label::Value)
    }
}

impl From<Label> for Option<String> {
    fn from(label: Label) -> Self {
        match label {
            Label::Absent => None,
            Label::Value(v) => Some(v),
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Label::Absent => f.write_str("absent"),
            Label::Value(v) => f.write_str(v),
        }
    }
}

/// Value counts for one categorical field
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCounts {
    /// Packets that did not carry the field
    pub absent: u64,
    pub values: BTreeMap<String, u64>,
}

impl CategoryCounts {
    fn record(&mut self, label: Label) {
        match label {
            Label::Absent => self.absent += 1,
            Label::Value(v) => *self.values.entry(v).or_insert(0) += 1,
        }
    }

    /// Count for one label (zero if never seen)
    pub fn count(&self, label: &Label) -> u64 {
        match label {
            Label::Absent => self.absent,
            Label::Value(v) => self.values.get(v).copied().unwrap_or(0),
        }
    }

    /// Sum over all labels, absent included
    pub fn total(&self) -> u64 {
        self.absent + self.values.values().sum::<u64>()
    }

    /// Every label that was observed at least once
    pub fn labels(&self) -> BTreeSet<Label> {
        let mut labels: BTreeSet<Label> = self.values.keys().cloned().map(Label::Value).collect();
        if self.absent > 0 {
            labels.insert(Label::Absent);
        }
        labels
    }

    /// `(label, count)` pairs, absent first when observed
    pub fn iter(&self) -> impl Iterator<Item = (Label, u64)> + '_ {
        let absent = (self.absent > 0).then_some((Label::Absent, self.absent));
        absent
            .into_iter()
            .chain(self.values.iter().map(|(v, c)| (Label::Value(v.clone()), *c)))
    }
}

/// Directed pair counts: source -> destination -> count
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowTable {
    counts: BTreeMap<String, BTreeMap<String, u64>>,
}

impl FlowTable {
    fn record(&mut self, src: &str, dst: &str) {
        *self
            .counts
            .entry(src.to_string())
            .or_default()
            .entry(dst.to_string())
            .or_insert(0) += 1;
    }

    pub fn count(&self, src: &str, dst: &str) -> u64 {
        self.counts
            .get(src)
            .and_then(|dsts| dsts.get(dst))
            .copied()
            .unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, u64)> + '_ {
        self.counts.iter().flat_map(|(src, dsts)| {
            dsts.iter()
                .map(move |(dst, count)| (src.as_str(), dst.as_str(), *count))
        })
    }

    pub fn total(&self) -> u64 {
        self.iter().map(|(_, _, c)| c).sum()
    }
}

/// Counter aggregate for one time window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    total: u64,
    presence: BTreeMap<PresenceFlag, u64>,
    categories: BTreeMap<CategoryField, CategoryCounts>,
    flows: BTreeMap<FlowPair, FlowTable>,
}

impl Default for Bucket {
    fn default() -> Self {
        Self::new()
    }
}

impl Bucket {
    /// Create an empty bucket with every tracked field at zero
    pub fn new() -> Self {
        Self {
            total: 0,
            presence: PresenceFlag::ALL.iter().map(|f| (*f, 0)).collect(),
            categories: CategoryField::ALL
                .iter()
                .map(|f| (*f, CategoryCounts::default()))
                .collect(),
            flows: FlowPair::ALL
                .iter()
                .map(|p| (*p, FlowTable::default()))
                .collect(),
        }
    }

    /// Add one packet. Missing fields count as absent, never as errors.
    pub fn insert(&mut self, packet: &ParsedPacket) {
        self.total += 1;

        for flag in PresenceFlag::ALL {
            if flag.is_set(packet) {
                *self.presence.entry(flag).or_insert(0) += 1;
            }
        }

        for field in CategoryField::ALL {
            self.categories
                .entry(field)
                .or_default()
                .record(field.label(packet));
        }

        for pair in FlowPair::ALL {
            if let Some((src, dst)) = pair.endpoints(packet) {
                self.flows.entry(pair).or_default().record(src, dst);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn presence(&self, flag: PresenceFlag) -> u64 {
        self.presence.get(&flag).copied().unwrap_or(0)
    }

    /// Presence counts in canonical order
    pub fn presence_counts(&self) -> impl Iterator<Item = (PresenceFlag, u64)> + '_ {
        self.presence.iter().map(|(f, c)| (*f, *c))
    }

    pub fn category(&self, field: CategoryField) -> Option<&CategoryCounts> {
        self.categories.get(&field)
    }

    /// Category tables in canonical order
    pub fn categories(&self) -> impl Iterator<Item = (CategoryField, &CategoryCounts)> + '_ {
        self.categories.iter().map(|(f, c)| (*f, c))
    }

    pub fn flows(&self, pair: FlowPair) -> Option<&FlowTable> {
        self.flows.get(&pair)
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Total packets: {}", self.total)?;
        for (flag, count) in self.presence_counts() {
            writeln!(f, "  {}: {}", flag.name(), count)?;
        }
        for (field, counts) in self.categories() {
            let entries: Vec<String> = counts
                .iter()
                .map(|(label, count)| format!("{label}={count}"))
                .collect();
            writeln!(f, "  {}: [{}]", field, entries.join(", "))?;
        }
        for pair in FlowPair::ALL {
            if let Some(table) = self.flows(pair) {
                writeln!(f, "  {:?} flows: {}", pair, table.total())?;
            }
        }
        Ok(())
    }
}
