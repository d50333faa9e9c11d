//! Known-value vocabulary that caps categorical feature width.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::bucket::{Bucket, CategoryField, Label};
use crate::config::{HostInventory, HostRole};
use crate::error::{IdsError, Result};

/// Groups of categorical fields that share one known-value list
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    Ip,
    Mac,
    UdpPort,
    UdpLen,
}

impl Family {
    pub fn of(field: CategoryField) -> Family {
        match field {
            CategoryField::IpDst | CategoryField::IpSrc => Family::Ip,
            CategoryField::MacDst | CategoryField::MacSrc => Family::Mac,
            CategoryField::UdpDstPort | CategoryField::UdpSrcPort => Family::UdpPort,
            CategoryField::UdpLen => Family::UdpLen,
        }
    }
}

/// Direction class of a flow endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// One of the SCADA master replicas, reported as `self`
    Master = 0,
    Client = 1,
    Other = 2,
}

impl Endpoint {
    pub const ALL: [Endpoint; 3] = [Endpoint::Master, Endpoint::Client, Endpoint::Other];

    pub fn prefix(&self) -> &'static str {
        match self {
            Endpoint::Master => "self",
            Endpoint::Client => "client",
            Endpoint::Other => "other",
        }
    }
}

/// Values treated as individually significant, per field family.
///
/// Anything outside a family's list is folded into that field's `other`
/// feature.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownVocabulary {
    families: BTreeMap<Family, Vec<Label>>,

    #[serde(default)]
    master_ips: BTreeSet<String>,
    #[serde(default)]
    client_ips: BTreeSet<String>,
    #[serde(default)]
    master_macs: BTreeSet<String>,
    #[serde(default)]
    client_macs: BTreeSet<String>,
}

impl KnownVocabulary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the known list for one family (sorted, deduplicated)
    pub fn with_family(mut self, family: Family, labels: impl IntoIterator<Item = Label>) -> Self {
        let labels: BTreeSet<Label> = labels.into_iter().collect();
        self.families.insert(family, labels.into_iter().collect());
        self
    }

    /// Take address/MAC lists and flow roles from the host inventory
    pub fn with_inventory(self, inventory: &HostInventory) -> Self {
        let mut vocab = self
            .with_family(Family::Ip, inventory.known_ips().map(Label::value))
            .with_family(Family::Mac, inventory.known_macs().map(Label::value));

        vocab.master_ips = inventory.ips_with_role(HostRole::Master).collect();
        vocab.client_ips = inventory.ips_with_role(HostRole::Client).collect();
        vocab.master_macs = inventory.macs_with_role(HostRole::Master).collect();
        vocab.client_macs = inventory.macs_with_role(HostRole::Client).collect();
        vocab
    }

    /// Derive the vocabulary from baseline buckets.
    ///
    /// UDP ports and lengths are known only if they occur in every bucket;
    /// addresses and MACs come from the inventory.
    pub fn from_baseline(buckets: &[Bucket], inventory: &HostInventory) -> Result<Self> {
        let (ports, lens) = common_labels(buckets)?;

        tracing::info!(
            buckets = buckets.len(),
            known_ports = ports.len(),
            known_lens = lens.len(),
            "Vocabulary derived from baseline"
        );

        Ok(Self::new()
            .with_family(Family::UdpPort, ports)
            .with_family(Family::UdpLen, lens)
            .with_inventory(inventory))
    }

    /// Known labels for a family, `None` if the family is missing
    pub fn known(&self, family: Family) -> Option<&[Label]> {
        self.families.get(&family).map(Vec::as_slice)
    }

    /// Known labels for the family a field belongs to
    pub fn known_for(&self, field: CategoryField) -> Result<&[Label]> {
        self.known(Family::of(field))
            .ok_or_else(|| IdsError::UnknownField {
                field: field.name().to_string(),
            })
    }

    pub fn classify_ip(&self, ip: &str) -> Endpoint {
        classify(ip, &self.master_ips, &self.client_ips)
    }

    pub fn classify_mac(&self, mac: &str) -> Endpoint {
        classify(mac, &self.master_macs, &self.client_macs)
    }
}

fn classify(value: &str, masters: &BTreeSet<String>, clients: &BTreeSet<String>) -> Endpoint {
    if clients.contains(value) {
        Endpoint::Client
    } else if masters.contains(value) {
        Endpoint::Master
    } else {
        Endpoint::Other
    }
}

/// Labels seen in every bucket: `(udp ports, udp lengths)`.
///
/// Ports pool source and destination keys per bucket before intersecting.
/// The absent marker is a label like any other.
pub fn common_labels(buckets: &[Bucket]) -> Result<(Vec<Label>, Vec<Label>)> {
    let mut ports: Option<BTreeSet<Label>> = None;
    let mut lens: Option<BTreeSet<Label>> = None;

    for bucket in buckets {
        let mut bucket_ports = labels_of(bucket, CategoryField::UdpSrcPort);
        bucket_ports.extend(labels_of(bucket, CategoryField::UdpDstPort));
        let bucket_lens = labels_of(bucket, CategoryField::UdpLen);

        ports = Some(match ports {
            None => bucket_ports,
            Some(acc) => acc.intersection(&bucket_ports).cloned().collect(),
        });
        lens = Some(match lens {
            None => bucket_lens,
            Some(acc) => acc.intersection(&bucket_lens).cloned().collect(),
        });
    }

    match (ports, lens) {
        (Some(ports), Some(lens)) => Ok((ports.into_iter().collect(), lens.into_iter().collect())),
        _ => Err(IdsError::EmptyInput("baseline has no buckets".to_string())),
    }
}

fn labels_of(bucket: &Bucket, field: CategoryField) -> BTreeSet<Label> {
    bucket
        .category(field)
        .map(|counts| counts.labels())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Host;
    use crate::packet::ParsedPacket;

    fn bucket_with_ports(ports: &[(u16, u16)]) -> Bucket {
        let mut bucket = Bucket::new();
        for (i, (port, len)) in ports.iter().enumerate() {
            bucket.insert(
                &ParsedPacket::at(i as f64)
                    .with_ip("10.0.0.1", "10.0.0.2")
                    .with_udp(*port, *port, *len),
            );
        }
        bucket
    }

    fn inventory() -> HostInventory {
        HostInventory {
            hosts: vec![
                Host::new("192.168.101.101", "00:00:00:00:00:01", HostRole::Master),
                Host::new("192.168.101.107", "00:00:00:00:00:07", HostRole::Client),
                Host::new("192.168.101.109", "00:00:00:00:00:09", HostRole::Device),
            ],
            authorized_ports: vec![8120],
        }
    }

    #[test]
    fn test_value_in_every_bucket_is_known() {
        let buckets = vec![
            bucket_with_ports(&[(8120, 64), (53, 40)]),
            bucket_with_ports(&[(8120, 64), (53, 40)]),
            bucket_with_ports(&[(8120, 64), (123, 48)]),
        ];

        let (ports, lens) = common_labels(&buckets).unwrap();

        assert_eq!(ports, vec![Label::value("8120")]);
        assert_eq!(lens, vec![Label::value("64")]);
        // 53 appears in only 2 of 3 buckets
        assert!(!ports.contains(&Label::value("53")));
    }

    #[test]
    fn test_absent_marker_can_be_known() {
        let mut buckets = vec![bucket_with_ports(&[(8120, 64)]), bucket_with_ports(&[(8120, 64)])];
        for bucket in &mut buckets {
            bucket.insert(&ParsedPacket::at(9.0).with_ether("00:00:00:00:00:01", "00:00:00:00:00:02"));
        }

        let (ports, _) = common_labels(&buckets).unwrap();
        assert_eq!(ports, vec![Label::Absent, Label::value("8120")]);
    }

    #[test]
    fn test_empty_baseline_is_an_error() {
        assert!(matches!(common_labels(&[]), Err(IdsError::EmptyInput(_))));
    }

    #[test]
    fn test_from_baseline_uses_inventory() {
        let buckets = vec![bucket_with_ports(&[(8120, 64)])];
        let vocab = KnownVocabulary::from_baseline(&buckets, &inventory()).unwrap();

        assert_eq!(vocab.known(Family::Ip).unwrap().len(), 3);
        assert_eq!(vocab.known(Family::Mac).unwrap().len(), 3);
        assert_eq!(vocab.classify_ip("192.168.101.101"), Endpoint::Master);
        assert_eq!(vocab.classify_ip("192.168.101.107"), Endpoint::Client);
        assert_eq!(vocab.classify_ip("192.168.101.109"), Endpoint::Other);
        assert_eq!(vocab.classify_mac("00:00:00:00:00:07"), Endpoint::Client);
        assert_eq!(vocab.classify_mac("de:ad:be:ef:00:00"), Endpoint::Other);
    }

    #[test]
    fn test_missing_family_is_unknown_field() {
        let vocab = KnownVocabulary::new().with_family(Family::Ip, vec![]);
        assert!(vocab.known_for(CategoryField::IpSrc).is_ok());
        assert!(matches!(
            vocab.known_for(CategoryField::UdpLen),
            Err(IdsError::UnknownField { .. })
        ));
    }

    #[test]
    fn test_serde_round_trip() {
        let vocab = KnownVocabulary::new()
            .with_family(Family::UdpPort, vec![Label::Absent, Label::value("8120")])
            .with_inventory(&inventory());

        let json = serde_json::to_string(&vocab).unwrap();
        let back: KnownVocabulary = serde_json::from_str(&json).unwrap();
        assert_eq!(back, vocab);
    }
}
