//! One-line packet summaries for anomaly reports.
//!
//! Frames forwarded by the capture side are decoded again with `pnet` so
//! the summary reflects what was on the wire; packets without raw bytes are
//! summarised from their parsed fields.

use pnet::packet::arp::{ArpOperations, ArpPacket};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::icmp::IcmpPacket;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use pnet::packet::Packet;

use crate::packet::ParsedPacket;

const DHCP_SERVER_PORT: u16 = 67;
const DHCP_CLIENT_PORT: u16 = 68;

/// A summary line and whether the packet is DHCP housekeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub text: String,
    pub is_dhcp: bool,
}

/// Client/server exchange in either direction
fn is_dhcp_ports(src: u16, dst: u16) -> bool {
    matches!(
        (src, dst),
        (DHCP_CLIENT_PORT, DHCP_SERVER_PORT) | (DHCP_SERVER_PORT, DHCP_CLIENT_PORT)
    )
}

/// Summarise a packet, preferring its raw frame.
///
/// `None` means the raw frame could not be decoded.
pub fn summarize(packet: &ParsedPacket) -> Option<Summary> {
    match &packet.raw {
        Some(raw) => summarize_frame(raw),
        None => Some(summarize_fields(packet)),
    }
}

/// Decode an Ethernet frame into a summary line
pub fn summarize_frame(raw: &[u8]) -> Option<Summary> {
    let ether = EthernetPacket::new(raw)?;
    let mut text = format!("Ether {} > {}", ether.get_source(), ether.get_destination());
    let mut is_dhcp = false;

    match ether.get_ethertype() {
        EtherTypes::Ipv4 => {
            let ip = Ipv4Packet::new(ether.payload())?;
            let (src, dst) = (ip.get_source(), ip.get_destination());

            match ip.get_next_level_protocol() {
                IpNextHeaderProtocols::Udp => {
                    let udp = UdpPacket::new(ip.payload())?;
                    let (sport, dport) = (udp.get_source(), udp.get_destination());
                    is_dhcp = is_dhcp_ports(sport, dport);
                    text.push_str(&format!(" / IP / UDP {src}:{sport} > {dst}:{dport}"));
                }
                IpNextHeaderProtocols::Tcp => {
                    let tcp = TcpPacket::new(ip.payload())?;
                    text.push_str(&format!(
                        " / IP / TCP {src}:{} > {dst}:{}",
                        tcp.get_source(),
                        tcp.get_destination()
                    ));
                }
                IpNextHeaderProtocols::Icmp => {
                    let icmp = IcmpPacket::new(ip.payload())?;
                    text.push_str(&format!(
                        " / IP / ICMP {src} > {dst} type {} code {}",
                        icmp.get_icmp_type().0,
                        icmp.get_icmp_code().0
                    ));
                }
                other => text.push_str(&format!(" / IP {src} > {dst} proto {}", other.0)),
            }
        }
        EtherTypes::Arp => {
            let arp = ArpPacket::new(ether.payload())?;
            let line = match arp.get_operation() {
                ArpOperations::Request => format!(
                    " / ARP who has {} says {}",
                    arp.get_target_proto_addr(),
                    arp.get_sender_proto_addr()
                ),
                ArpOperations::Reply => format!(
                    " / ARP {} is at {}",
                    arp.get_sender_proto_addr(),
                    arp.get_sender_hw_addr()
                ),
                op => format!(" / ARP op {}", op.0),
            };
            text.push_str(&line);
        }
        other => text.push_str(&format!(" / type 0x{:04x}", other.0)),
    }

    Some(Summary { text, is_dhcp })
}

/// Summary built from parsed fields when no frame was forwarded
pub fn summarize_fields(packet: &ParsedPacket) -> Summary {
    let mut parts = Vec::new();
    let mut is_dhcp = false;

    if packet.has_ether() {
        parts.push(format!(
            "Ether {} > {}",
            packet.mac_src().unwrap_or("?"),
            packet.mac_dst().unwrap_or("?")
        ));
    }

    let src = packet.ip_src().unwrap_or("?");
    let dst = packet.ip_dst().unwrap_or("?");
    if let Some(udp) = &packet.udp {
        let (sport, dport) = (udp.src_port.unwrap_or(0), udp.dst_port.unwrap_or(0));
        is_dhcp = is_dhcp_ports(sport, dport);
        parts.push(format!("IP / UDP {src}:{sport} > {dst}:{dport}"));
    } else if let Some(tcp) = &packet.tcp {
        parts.push(format!(
            "IP / TCP {src}:{} > {dst}:{}",
            tcp.src_port.unwrap_or(0),
            tcp.dst_port.unwrap_or(0)
        ));
    } else if let Some(icmp) = &packet.icmp {
        parts.push(format!(
            "IP / ICMP {src} > {dst} type {} code {}",
            icmp.icmp_type.unwrap_or(0),
            icmp.code.unwrap_or(0)
        ));
    } else if packet.has_ip() {
        parts.push(format!("IP {src} > {dst}"));
    }

    if let Some(arp) = &packet.arp {
        parts.push(format!(
            "ARP op {} {} > {}",
            arp.op.unwrap_or(0),
            arp.psrc.as_deref().unwrap_or("?"),
            arp.pdst.as_deref().unwrap_or("?")
        ));
    }

    if parts.is_empty() {
        parts.push("empty packet".to_string());
    }

    Summary {
        text: parts.join(" / "),
        is_dhcp,
    }
}


#[cfg(test)]
mod tests {
    use super::frames::udp_frame;
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_udp_frame_summary() {
        let summary = summarize_frame(&udp_frame(8120, 8120)).unwrap();
        assert_eq!(
            summary.text,
            "Ether 00:00:00:00:00:01 > 00:00:00:00:00:09 / IP / UDP 192.168.101.101:8120 > 192.168.101.109:8120"
        );
        assert!(!summary.is_dhcp);
    }

    #[test]
    fn test_dhcp_detected() {
        assert!(summarize_frame(&udp_frame(68, 67)).unwrap().is_dhcp);
        assert!(summarize_frame(&udp_frame(67, 68)).unwrap().is_dhcp);
    }

    #[test]
    fn test_single_dhcp_port_is_not_dhcp() {
        for (sport, dport) in [(67, 5000), (8120, 67), (68, 8120), (67, 67)] {
            let summary = summarize_frame(&udp_frame(sport, dport)).unwrap();
            assert!(!summary.is_dhcp, "{sport} > {dport}");
        }
    }

    #[test]
    fn test_truncated_frame_is_none() {
        let frame = udp_frame(8120, 8120);
        assert!(summarize_frame(&frame[..10]).is_none());
        // Ethernet header intact, IP header cut short
        assert!(summarize_frame(&frame[..20]).is_none());
    }

    #[test]
    fn test_fields_fallback() {
        let packet = ParsedPacket::at(0.0)
            .with_ether("00:00:00:00:00:01", "00:00:00:00:00:09")
            .with_ip("192.168.101.101", "192.168.101.109")
            .with_udp(67, 68, 300);

        let summary = summarize(&packet).unwrap();
        assert!(summary.is_dhcp);
        assert!(summary.text.contains("UDP 192.168.101.101:67 > 192.168.101.109:68"));
    }

    #[test]
    fn test_raw_preferred_over_fields() {
        let mut packet = ParsedPacket::at(0.0).with_udp(1, 2, 8);
        packet.raw = Some(Bytes::from(udp_frame(8120, 53)));
        let summary = summarize(&packet).unwrap();
        assert!(summary.text.ends_with("192.168.101.109:53"));
    }
}
