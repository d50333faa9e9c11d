//! Per-packet numeric transform.
//!
//! Maps one packet to a fixed 25-value row. Addresses, MACs and UDP ports
//! are reduced to trust levels against the host inventory; other numeric
//! header fields pass through.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::HostInventory;
use crate::packet::ParsedPacket;

/// Number of values per packet row
pub const PACKET_FEATURES: usize = 25;

/// Column names in row order
pub const COLUMNS: [&str; PACKET_FEATURES] = [
    "ip_src",
    "ip_dst",
    "ip_ttl",
    "ip_len",
    "ip_ver",
    "proto",
    "mac_src",
    "mac_dst",
    "tcp_src_port",
    "tcp_dst_port",
    "udp_src_port",
    "udp_dst_port",
    "icmp_type",
    "icmp_code",
    "arp_op",
    "arp_psrc",
    "arp_pdst",
    "arp_hwsrc",
    "arp_hwdst",
    "has_ip",
    "has_ether",
    "has_tcp",
    "has_udp",
    "has_icmp",
    "has_arp",
];

const TRUSTED: f64 = 100.0;
const UNKNOWN: f64 = 1.0;
const SPOOFED: f64 = -100.0;
const MISSING: f64 = 0.0;

/// Inventory-backed transform
#[derive(Debug, Clone, Default)]
pub struct PacketTransform {
    /// Known IP -> MAC of its owner
    owners: BTreeMap<String, String>,
    authorized_ports: BTreeSet<u16>,
}

impl PacketTransform {
    pub fn new(inventory: &HostInventory) -> Self {
        Self {
            owners: inventory.owners(),
            authorized_ports: inventory.authorized_ports.iter().copied().collect(),
        }
    }

    fn address(&self, ip: Option<&str>) -> f64 {
        match ip {
            None => MISSING,
            Some(ip) if self.owners.contains_key(ip) => TRUSTED,
            Some(_) => UNKNOWN,
        }
    }

    /// MAC scored against the owner of the address it claims
    fn mac(&self, claimed_ip: Option<&str>, mac: Option<&str>) -> f64 {
        let Some(mac) = mac else {
            return MISSING;
        };
        match claimed_ip.and_then(|ip| self.owners.get(ip)) {
            Some(owner) if owner == mac => TRUSTED,
            Some(_) => SPOOFED,
            None => UNKNOWN,
        }
    }

    fn port(&self, port: Option<u16>) -> f64 {
        match port {
            None | Some(0) => MISSING,
            Some(p) if self.authorized_ports.contains(&p) => TRUSTED,
            Some(_) => UNKNOWN,
        }
    }

    /// Transform one packet into a row in [`COLUMNS`] order
    pub fn transform(&self, packet: &ParsedPacket) -> [f64; PACKET_FEATURES] {
        let ip = packet.ip.as_ref();
        let tcp = packet.tcp.as_ref();
        let icmp = packet.icmp.as_ref();
        let arp = packet.arp.as_ref();

        let arp_psrc = arp.and_then(|a| a.psrc.as_deref());
        let arp_pdst = arp.and_then(|a| a.pdst.as_deref());

        // ARP frames claim addresses in the ARP payload, not an IP header
        let (claimed_src, claimed_dst) = if packet.has_arp() {
            (arp_psrc, arp_pdst)
        } else {
            (packet.ip_src(), packet.ip_dst())
        };

        let num = |v: Option<f64>| v.unwrap_or(MISSING);
        let flag = |set: bool| if set { TRUSTED } else { MISSING };

        [
            self.address(packet.ip_src()),
            self.address(packet.ip_dst()),
            num(ip.and_then(|i| i.ttl).map(f64::from)),
            num(ip.and_then(|i| i.len).map(f64::from)),
            num(ip.and_then(|i| i.version).map(f64::from)),
            num(ip.and_then(|i| i.proto).map(f64::from)),
            self.mac(claimed_src, packet.mac_src()),
            self.mac(claimed_dst, packet.mac_dst()),
            num(tcp.and_then(|t| t.src_port).map(f64::from)),
            num(tcp.and_then(|t| t.dst_port).map(f64::from)),
            self.port(packet.udp_src_port()),
            self.port(packet.udp_dst_port()),
            num(icmp.and_then(|i| i.icmp_type).map(f64::from)),
            num(icmp.and_then(|i| i.code).map(f64::from)),
            num(arp.and_then(|a| a.op).map(f64::from)),
            self.address(arp_psrc),
            self.address(arp_pdst),
            self.mac(arp_psrc, arp.and_then(|a| a.hwsrc.as_deref())),
            self.mac(arp_pdst, arp.and_then(|a| a.hwdst.as_deref())),
            flag(packet.has_ip()),
            flag(packet.has_ether()),
            flag(packet.has_tcp()),
            flag(packet.has_udp()),
            flag(packet.has_icmp()),
            flag(packet.has_arp()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Host, HostRole};
    use crate::packet::{ArpLayer, IpLayer};

    fn transform() -> PacketTransform {
        PacketTransform::new(&HostInventory {
            hosts: vec![
                Host::new("192.168.101.101", "00:00:00:00:00:01", HostRole::Master),
                Host::new("192.168.101.109", "00:00:00:00:00:09", HostRole::Device),
            ],
            authorized_ports: vec![8120, 53],
        })
    }

    fn col(row: &[f64; PACKET_FEATURES], name: &str) -> f64 {
        row[COLUMNS.iter().position(|c| *c == name).unwrap()]
    }

    #[test]
    fn test_trusted_udp_packet() {
        let mut packet = ParsedPacket::at(0.0)
            .with_ether("00:00:00:00:00:01", "00:00:00:00:00:09")
            .with_ip("192.168.101.101", "192.168.101.109")
            .with_udp(8120, 40000, 64);
        packet.ip = Some(IpLayer {
            ttl: Some(64),
            proto: Some(17),
            ..packet.ip.take().unwrap_or_default()
        });

        let row = transform().transform(&packet);

        assert_eq!(col(&row, "ip_src"), 100.0);
        assert_eq!(col(&row, "ip_dst"), 100.0);
        assert_eq!(col(&row, "ip_ttl"), 64.0);
        assert_eq!(col(&row, "proto"), 17.0);
        assert_eq!(col(&row, "mac_src"), 100.0);
        assert_eq!(col(&row, "mac_dst"), 100.0);
        assert_eq!(col(&row, "udp_src_port"), 100.0);
        assert_eq!(col(&row, "udp_dst_port"), 1.0);
        assert_eq!(col(&row, "tcp_src_port"), 0.0);
        assert_eq!(col(&row, "has_udp"), 100.0);
        assert_eq!(col(&row, "has_tcp"), 0.0);
        assert_eq!(col(&row, "arp_psrc"), 0.0);
    }

    #[test]
    fn test_spoofed_and_unknown_macs() {
        let packet = ParsedPacket::at(0.0)
            .with_ether("de:ad:be:ef:00:00", "00:00:00:00:00:09")
            .with_ip("192.168.101.101", "10.0.0.8");

        let row = transform().transform(&packet);

        // claims the master's address from a foreign MAC
        assert_eq!(col(&row, "mac_src"), -100.0);
        // destination address is not in the inventory
        assert_eq!(col(&row, "ip_dst"), 1.0);
        assert_eq!(col(&row, "mac_dst"), 1.0);
    }

    #[test]
    fn test_arp_uses_payload_addresses() {
        let mut packet = ParsedPacket::at(0.0).with_ether("00:00:00:00:00:09", "ff:ff:ff:ff:ff:ff");
        packet.arp = Some(ArpLayer {
            op: Some(2),
            psrc: Some("192.168.101.101".into()),
            pdst: Some("192.168.101.109".into()),
            hwsrc: Some("00:00:00:00:00:09".into()),
            hwdst: Some("00:00:00:00:00:09".into()),
        });

        let row = transform().transform(&packet);

        assert_eq!(col(&row, "has_arp"), 100.0);
        assert_eq!(col(&row, "arp_op"), 2.0);
        assert_eq!(col(&row, "arp_psrc"), 100.0);
        // device MAC answering for the master address
        assert_eq!(col(&row, "mac_src"), -100.0);
        assert_eq!(col(&row, "arp_hwsrc"), -100.0);
        assert_eq!(col(&row, "arp_hwdst"), 100.0);
        assert_eq!(col(&row, "mac_dst"), -100.0);
        assert_eq!(col(&row, "ip_src"), 0.0);
    }

    #[test]
    fn test_empty_packet_is_all_zero() {
        let row = transform().transform(&ParsedPacket::at(0.0));
        assert!(row.iter().all(|v| *v == 0.0));
    }
}
