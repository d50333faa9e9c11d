//! Bucket featurization.
//!
//! Converts a [`Bucket`] into a fixed-order numeric vector whose layout
//! depends only on the [`KnownVocabulary`]:
//!
//! ```text
//! total | presence flags (alphabetical) | per field (alphabetical):
//!                                           field/<known label>... field/other
//! ```
//!
//! The flow vector is a separate 18-value block: two 3x3 grids (addresses,
//! then MACs) over `{self, client, other}`, row-major by `(src, dst)`.

pub mod baseline;
pub mod vocabulary;

use serde::{Deserialize, Serialize};

use crate::bucket::{Bucket, CategoryField, FlowPair, PresenceFlag};
use crate::error::Result;

pub use baseline::{Baseline, Deviation, FeatureStats};
pub use vocabulary::{common_labels, Endpoint, Family, KnownVocabulary};

/// Number of values produced by [`featurize_flows`]
pub const FLOW_FEATURES: usize = 18;

const GRID: usize = Endpoint::ALL.len();

/// Named numeric features for one bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub names: Vec<String>,
    pub values: Vec<f64>,
}

impl FeatureVector {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value by feature name
    pub fn get(&self, name: &str) -> Option<f64> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| self.values[i])
    }
}

/// Feature names in vector order
pub fn feature_names(vocab: &KnownVocabulary) -> Result<Vec<String>> {
    let mut names = vec!["total".to_string()];
    names.extend(PresenceFlag::ALL.iter().map(|f| f.name().to_string()));

    for field in CategoryField::ALL {
        for label in vocab.known_for(field)? {
            names.push(format!("{}/{}", field.name(), label));
        }
        names.push(format!("{}/other", field.name()));
    }

    Ok(names)
}

/// Featurize one bucket.
///
/// Counts for labels outside the vocabulary are summed into `field/other`.
pub fn featurize(vocab: &KnownVocabulary, bucket: &Bucket) -> Result<FeatureVector> {
    let names = feature_names(vocab)?;
    let mut values = Vec::with_capacity(names.len());

    values.push(bucket.total() as f64);
    values.extend(PresenceFlag::ALL.iter().map(|f| bucket.presence(*f) as f64));

    for field in CategoryField::ALL {
        let known = vocab.known_for(field)?;
        let Some(counts) = bucket.category(field) else {
            values.extend(std::iter::repeat(0.0).take(known.len() + 1));
            continue;
        };

        let mut known_total = 0;
        for label in known {
            let count = counts.count(label);
            known_total += count;
            values.push(count as f64);
        }
        values.push(counts.total().saturating_sub(known_total) as f64);
    }

    debug_assert_eq!(names.len(), values.len());
    Ok(FeatureVector { names, values })
}

/// The 18 flow feature names, e.g. `self_ip -> client_ip`
pub fn flow_feature_names() -> Vec<String> {
    let mut names = Vec::with_capacity(FLOW_FEATURES);
    for kind in ["ip", "mac"] {
        for src in Endpoint::ALL {
            for dst in Endpoint::ALL {
                names.push(format!(
                    "{}_{kind} -> {}_{kind}",
                    src.prefix(),
                    dst.prefix()
                ));
            }
        }
    }
    names
}

/// Flow counts binned by endpoint class
pub fn featurize_flows(vocab: &KnownVocabulary, bucket: &Bucket) -> Vec<f64> {
    let mut values = vec![0.0; FLOW_FEATURES];

    for (offset, pair) in FlowPair::ALL.iter().enumerate() {
        let Some(table) = bucket.flows(*pair) else {
            continue;
        };
        let classify = |v: &str| match pair {
            FlowPair::Ip => vocab.classify_ip(v),
            FlowPair::Mac => vocab.classify_mac(v),
        };

        for (src, dst, count) in table.iter() {
            let cell = classify(src) as usize * GRID + classify(dst) as usize;
            values[offset * GRID * GRID + cell] += count as f64;
        }
    }

    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::Label;
    use crate::config::{Host, HostInventory, HostRole};
    use crate::error::IdsError;
    use crate::packet::ParsedPacket;

    const MASTER_IP: &str = "192.168.101.101";
    const MASTER_MAC: &str = "00:00:00:00:00:01";
    const CLIENT_IP: &str = "192.168.101.107";
    const CLIENT_MAC: &str = "00:00:00:00:00:07";
    const DEVICE_IP: &str = "192.168.101.109";
    const DEVICE_MAC: &str = "00:00:00:00:00:09";

    fn vocab() -> KnownVocabulary {
        let inventory = HostInventory {
            hosts: vec![
                Host::new(MASTER_IP, MASTER_MAC, HostRole::Master),
                Host::new(CLIENT_IP, CLIENT_MAC, HostRole::Client),
                Host::new(DEVICE_IP, DEVICE_MAC, HostRole::Device),
            ],
            authorized_ports: vec![8120],
        };
        KnownVocabulary::new()
            .with_family(Family::UdpPort, vec![Label::value("8120")])
            .with_family(Family::UdpLen, vec![Label::Absent, Label::value("64")])
            .with_inventory(&inventory)
    }

    fn packet(src: (&str, &str), dst: (&str, &str), port: u16, len: u16) -> ParsedPacket {
        ParsedPacket::at(0.0)
            .with_ether(src.1, dst.1)
            .with_ip(src.0, dst.0)
            .with_udp(port, port, len)
    }

    fn sample_bucket() -> Bucket {
        let mut bucket = Bucket::new();
        let master = (MASTER_IP, MASTER_MAC);
        let client = (CLIENT_IP, CLIENT_MAC);
        let device = (DEVICE_IP, DEVICE_MAC);

        bucket.insert(&packet(master, device, 8120, 64));
        bucket.insert(&packet(master, device, 8120, 64));
        bucket.insert(&packet(device, master, 8120, 72));
        bucket.insert(&packet(client, master, 20000, 64));
        bucket.insert(&packet(("10.9.9.9", "de:ad:be:ef:00:01"), device, 53, 40));
        bucket.insert(&ParsedPacket::at(0.0).with_ether(DEVICE_MAC, "ff:ff:ff:ff:ff:ff"));
        bucket
    }

    #[test]
    fn test_feature_names_layout() {
        let names = feature_names(&vocab()).unwrap();

        assert_eq!(names[0], "total");
        assert_eq!(names[1], "has_arp");
        assert_eq!(names[6], "has_udp");
        // ip_dst: 3 known hosts sorted, then other
        assert_eq!(names[7], "ip_dst/192.168.101.101");
        assert_eq!(names[10], "ip_dst/other");
        assert!(names.contains(&"udp_len/absent".to_string()));
        assert_eq!(names.last().unwrap(), "udp_src_port/other");

        // 1 + 6 + 4*(3+1) + 2*(1+1) + (2+1)
        assert_eq!(names.len(), 1 + 6 + 16 + 4 + 3);
    }

    #[test]
    fn test_featurize_counts_and_other() {
        let features = featurize(&vocab(), &sample_bucket()).unwrap();

        assert_eq!(features.len(), feature_names(&vocab()).unwrap().len());
        assert_eq!(features.get("total"), Some(6.0));
        assert_eq!(features.get("has_ether"), Some(6.0));
        assert_eq!(features.get("has_udp"), Some(5.0));
        assert_eq!(features.get("ip_src/192.168.101.101"), Some(2.0));
        // 10.9.9.9 plus the non-IP frame
        assert_eq!(features.get("ip_src/other"), Some(2.0));
        assert_eq!(features.get("udp_src_port/8120"), Some(3.0));
        assert_eq!(features.get("udp_src_port/other"), Some(3.0));
        assert_eq!(features.get("udp_len/absent"), Some(1.0));
        assert_eq!(features.get("udp_len/64"), Some(3.0));
        assert_eq!(features.get("udp_len/other"), Some(2.0));
    }

    #[test]
    fn test_featurize_is_deterministic() {
        let bucket = sample_bucket();
        let a = featurize(&vocab(), &bucket).unwrap();
        let b = featurize(&vocab(), &bucket.clone()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_every_category_group_sums_to_total() {
        let vocab = vocab();
        let features = featurize(&vocab, &sample_bucket()).unwrap();

        for field in CategoryField::ALL {
            let prefix = format!("{}/", field.name());
            let sum: f64 = features
                .names
                .iter()
                .zip(&features.values)
                .filter(|(n, _)| n.starts_with(&prefix))
                .map(|(_, v)| v)
                .sum();
            assert_eq!(sum, 6.0, "{field}");
        }
    }

    #[test]
    fn test_missing_family_fails() {
        let vocab = KnownVocabulary::new().with_family(Family::Ip, vec![]);
        assert!(matches!(
            featurize(&vocab, &Bucket::new()),
            Err(IdsError::UnknownField { .. })
        ));
    }

    #[test]
    fn test_flow_feature_names() {
        let names = flow_feature_names();
        assert_eq!(names.len(), FLOW_FEATURES);
        assert_eq!(names[0], "self_ip -> self_ip");
        assert_eq!(names[1], "self_ip -> client_ip");
        assert_eq!(names[8], "other_ip -> other_ip");
        assert_eq!(names[9], "self_mac -> self_mac");
    }

    #[test]
    fn test_featurize_flows_grid() {
        let flows = featurize_flows(&vocab(), &sample_bucket());
        let names = flow_feature_names();
        let at = |name: &str| flows[names.iter().position(|n| n == name).unwrap()];

        assert_eq!(at("self_ip -> other_ip"), 2.0);
        assert_eq!(at("other_ip -> self_ip"), 1.0);
        assert_eq!(at("client_ip -> self_ip"), 1.0);
        assert_eq!(at("other_ip -> other_ip"), 1.0);
        assert_eq!(at("self_mac -> other_mac"), 2.0);
        // broadcast frame from the device counts only in the MAC grid
        assert_eq!(at("other_mac -> other_mac"), 2.0);
        assert_eq!(flows[..9].iter().sum::<f64>(), 5.0);
        assert_eq!(flows[9..].iter().sum::<f64>(), 6.0);
    }
}
