//! Parsed packet model and its wire decoding.
//!
//! The capture side reduces every frame to a flat field mapping:
//!
//! ```text
//! {"time": 1700000000.25, "is_training": false,
//!  "has_ether": true, "mac_src": "00:00:00:00:00:01", "mac_dst": "...",
//!  "has_ip": true, "ip_src": "192.168.101.101", "ip_dst": "...", "ip_ttl": 64,
//!  "has_udp": true, "udp_src_port": 8120, "udp_dst_port": 8120, "udp_len": 120,
//!  "raw": [0, 0, 0, ...]}
//! ```
//!
//! Decoding turns that mapping into a closed, per-layer schema where a
//! missing layer or field is `None` rather than a sentinel value.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Decode errors for upstream packet datagrams
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("empty datagram")]
    Empty,

    #[error("invalid packet JSON: {0}")]
    InvalidJson(String),

    #[error("invalid arrival time: {0}")]
    InvalidTime(f64),
}

/// Ethernet header fields
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EtherLayer {
    pub mac_src: Option<String>,
    pub mac_dst: Option<String>,
    pub ether_type: Option<u16>,
}

/// IPv4 header fields
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpLayer {
    pub src: Option<String>,
    pub dst: Option<String>,
    pub ttl: Option<u8>,
    pub len: Option<u16>,
    pub version: Option<u8>,
    pub proto: Option<u8>,
}

/// TCP header fields
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TcpLayer {
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
}

/// UDP header fields
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UdpLayer {
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub len: Option<u16>,
}

/// ICMP header fields
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IcmpLayer {
    pub icmp_type: Option<u8>,
    pub code: Option<u8>,
}

/// ARP payload fields
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArpLayer {
    pub op: Option<u16>,
    pub psrc: Option<String>,
    pub pdst: Option<String>,
    pub hwsrc: Option<String>,
    pub hwdst: Option<String>,
}

/// One observed packet, reduced to the fields the detectors use.
///
/// A layer is `Some` exactly when the frame carried that protocol, so the
/// `has_*` accessors and the optional fields never disagree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "FlatPacket", into = "FlatPacket")]
pub struct ParsedPacket {
    /// Arrival time, seconds since the epoch
    pub time: f64,

    /// Captured while the system was in training mode
    pub is_training: bool,

    pub ether: Option<EtherLayer>,
    pub ip: Option<IpLayer>,
    pub tcp: Option<TcpLayer>,
    pub udp: Option<UdpLayer>,
    pub icmp: Option<IcmpLayer>,
    pub arp: Option<ArpLayer>,

    /// Original frame bytes, when the capture side forwarded them
    pub raw: Option<Bytes>,
}

impl ParsedPacket {
    /// Create an empty packet observed at `time`
    pub fn at(time: f64) -> Self {
        Self {
            time,
            ..Default::default()
        }
    }

    pub fn has_ether(&self) -> bool {
        self.ether.is_some()
    }

    pub fn has_ip(&self) -> bool {
        self.ip.is_some()
    }

    pub fn has_tcp(&self) -> bool {
        self.tcp.is_some()
    }

    pub fn has_udp(&self) -> bool {
        self.udp.is_some()
    }

    pub fn has_icmp(&self) -> bool {
        self.icmp.is_some()
    }

    pub fn has_arp(&self) -> bool {
        self.arp.is_some()
    }

    pub fn mac_src(&self) -> Option<&str> {
        self.ether.as_ref()?.mac_src.as_deref()
    }

    pub fn mac_dst(&self) -> Option<&str> {
        self.ether.as_ref()?.mac_dst.as_deref()
    }

    pub fn ip_src(&self) -> Option<&str> {
        self.ip.as_ref()?.src.as_deref()
    }

    pub fn ip_dst(&self) -> Option<&str> {
        self.ip.as_ref()?.dst.as_deref()
    }

    pub fn udp_src_port(&self) -> Option<u16> {
        self.udp.as_ref()?.src_port
    }

    pub fn udp_dst_port(&self) -> Option<u16> {
        self.udp.as_ref()?.dst_port
    }

    pub fn udp_len(&self) -> Option<u16> {
        self.udp.as_ref()?.len
    }

    /// Builder-style helpers, mostly for fixtures and replay tools
    pub fn with_ether(mut self, mac_src: &str, mac_dst: &str) -> Self {
        self.ether = Some(EtherLayer {
            mac_src: Some(mac_src.to_string()),
            mac_dst: Some(mac_dst.to_string()),
            ether_type: None,
        });
        self
    }

    pub fn with_ip(mut self, src: &str, dst: &str) -> Self {
        self.ip = Some(IpLayer {
            src: Some(src.to_string()),
            dst: Some(dst.to_string()),
            ..Default::default()
        });
        self
    }

    pub fn with_udp(mut self, src_port: u16, dst_port: u16, len: u16) -> Self {
        self.udp = Some(UdpLayer {
            src_port: Some(src_port),
            dst_port: Some(dst_port),
            len: Some(len),
        });
        self
    }

    pub fn with_tcp(mut self, src_port: u16, dst_port: u16) -> Self {
        self.tcp = Some(TcpLayer {
            src_port: Some(src_port),
            dst_port: Some(dst_port),
        });
        self
    }
}

impl fmt::Display for ParsedPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ParsedPacket {{ time: {:.3}, ip: {} > {}, mac: {} > {} }}",
            self.time,
            self.ip_src().unwrap_or("-"),
            self.ip_dst().unwrap_or("-"),
            self.mac_src().unwrap_or("-"),
            self.mac_dst().unwrap_or("-"),
        )
    }
}

/// The flat field mapping produced by the capture side
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlatPacket {
    pub time: f64,
    pub is_training: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_ether: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac_src: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac_dst: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ether_type: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_ip: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_src: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_dst: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_ttl: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_len: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_ver: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proto: Option<u8>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_tcp: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_src_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_dst_port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_udp: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udp_src_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udp_dst_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udp_len: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_icmp: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icmp_type: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icmp_code: Option<u8>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_arp: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arp_op: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arp_psrc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arp_pdst: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arp_hwsrc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arp_hwdst: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<Vec<u8>>,
}

/// A layer exists if its flag says so or any of its fields was captured
fn layer_present(flag: Option<bool>, any_field: bool) -> bool {
    flag.unwrap_or(false) || any_field
}

impl From<FlatPacket> for ParsedPacket {
    fn from(flat: FlatPacket) -> Self {
        let ether = layer_present(
            flat.has_ether,
            flat.mac_src.is_some() || flat.mac_dst.is_some() || flat.ether_type.is_some(),
        )
        .then(|| EtherLayer {
            mac_src: flat.mac_src,
            mac_dst: flat.mac_dst,
            ether_type: flat.ether_type,
        });

        let ip = layer_present(
            flat.has_ip,
            flat.ip_src.is_some() || flat.ip_dst.is_some() || flat.ip_ttl.is_some(),
        )
        .then(|| IpLayer {
            src: flat.ip_src,
            dst: flat.ip_dst,
            ttl: flat.ip_ttl,
            len: flat.ip_len,
            version: flat.ip_ver,
            proto: flat.proto,
        });

        let tcp = layer_present(
            flat.has_tcp,
            flat.tcp_src_port.is_some() || flat.tcp_dst_port.is_some(),
        )
        .then(|| TcpLayer {
            src_port: flat.tcp_src_port,
            dst_port: flat.tcp_dst_port,
        });

        let udp = layer_present(
            flat.has_udp,
            flat.udp_src_port.is_some() || flat.udp_dst_port.is_some() || flat.udp_len.is_some(),
        )
        .then(|| UdpLayer {
            src_port: flat.udp_src_port,
            dst_port: flat.udp_dst_port,
            len: flat.udp_len,
        });

        let icmp = layer_present(
            flat.has_icmp,
            flat.icmp_type.is_some() || flat.icmp_code.is_some(),
        )
        .then(|| IcmpLayer {
            icmp_type: flat.icmp_type,
            code: flat.icmp_code,
        });

        let arp = layer_present(
            flat.has_arp,
            flat.arp_op.is_some() || flat.arp_psrc.is_some() || flat.arp_pdst.is_some(),
        )
        .then(|| ArpLayer {
            op: flat.arp_op,
            psrc: flat.arp_psrc,
            pdst: flat.arp_pdst,
            hwsrc: flat.arp_hwsrc,
            hwdst: flat.arp_hwdst,
        });

        Self {
            time: flat.time,
            is_training: flat.is_training,
            ether,
            ip,
            tcp,
            udp,
            icmp,
            arp,
            raw: flat.raw.map(Bytes::from),
        }
    }
}

impl From<ParsedPacket> for FlatPacket {
    fn from(packet: ParsedPacket) -> Self {
        let mut flat = FlatPacket {
            time: packet.time,
            is_training: packet.is_training,
            raw: packet.raw.map(|b| b.to_vec()),
            ..Default::default()
        };

        if let Some(ether) = packet.ether {
            flat.has_ether = Some(true);
            flat.mac_src = ether.mac_src;
            flat.mac_dst = ether.mac_dst;
            flat.ether_type = ether.ether_type;
        }
        if let Some(ip) = packet.ip {
            flat.has_ip = Some(true);
            flat.ip_src = ip.src;
            flat.ip_dst = ip.dst;
            flat.ip_ttl = ip.ttl;
            flat.ip_len = ip.len;
            flat.ip_ver = ip.version;
            flat.proto = ip.proto;
        }
        if let Some(tcp) = packet.tcp {
            flat.has_tcp = Some(true);
            flat.tcp_src_port = tcp.src_port;
            flat.tcp_dst_port = tcp.dst_port;
        }
        if let Some(udp) = packet.udp {
            flat.has_udp = Some(true);
            flat.udp_src_port = udp.src_port;
            flat.udp_dst_port = udp.dst_port;
            flat.udp_len = udp.len;
        }
        if let Some(icmp) = packet.icmp {
            flat.has_icmp = Some(true);
            flat.icmp_type = icmp.icmp_type;
            flat.icmp_code = icmp.code;
        }
        if let Some(arp) = packet.arp {
            flat.has_arp = Some(true);
            flat.arp_op = arp.op;
            flat.arp_psrc = arp.psrc;
            flat.arp_pdst = arp.pdst;
            flat.arp_hwsrc = arp.hwsrc;
            flat.arp_hwdst = arp.hwdst;
        }

        flat
    }
}

/// Decode one upstream datagram (a JSON flat field mapping).
///
/// # Example
/// ```
/// use scada_ids::packet::parse_packet;
///
/// let data = br#"{"time": 12.5, "has_ip": true, "ip_src": "10.0.0.1", "ip_dst": "10.0.0.2"}"#;
/// let packet = parse_packet(data).unwrap();
/// assert!(packet.has_ip());
/// assert!(!packet.has_udp());
/// assert_eq!(packet.ip_src(), Some("10.0.0.1"));
/// ```
pub fn parse_packet(data: &[u8]) -> Result<ParsedPacket, ParseError> {
    if data.iter().all(u8::is_ascii_whitespace) {
        return Err(ParseError::Empty);
    }

    let packet: ParsedPacket =
        serde_json::from_slice(data).map_err(|e| ParseError::InvalidJson(e.to_string()))?;

    if !packet.time.is_finite() || packet.time < 0.0 {
        return Err(ParseError::InvalidTime(packet.time));
    }

    Ok(packet)
}
