use chrono::{DateTime, SecondsFormat, Utc};
use hickory_proto::op::{Message, MessageType};
use hickory_proto::rr::{Name, RData};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::sll::SLLPacket;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use pnet::packet::vlan::VlanPacket;
use pnet::packet::Packet;
use std::net::Ipv4Addr;
use tracing::trace;

const DNS_PORT: u16 = 53;
const AF_INET: u32 = 2;
const ETHERNET_HEADER_LEN: usize = 14;
const VLAN_HEADER_LEN: usize = 4;
const SLL_HEADER_LEN: usize = 16;

/// Link layer framing of captured bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// Ethernet II, optionally with one 802.1Q tag
    Ethernet,
    /// Linux cooked capture v1 (`-i any`)
    LinuxSll,
    /// BSD loopback: 4-byte address family header
    Loopback,
    /// Bare IPv4 datagram
    RawIpv4,
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Layer {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

/// Ports of a TCP or UDP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortLayer {
    pub src_port: u16,
    pub dst_port: u16,
}

impl PortLayer {
    pub fn touches(&self, port: u16) -> bool {
        self.src_port == port || self.dst_port == port
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsAnswer {
    /// Set for A records only
    pub ipv4: Option<Ipv4Addr>,
}

/// Pre-parsed DNS message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsLayer {
    pub response: bool,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsAnswer>,
}

impl From<&Message> for DnsLayer {
    fn from(message: &Message) -> Self {
        let questions = message
            .queries()
            .iter()
            .map(|query| DnsQuestion {
                name: display_name(query.name()),
                qtype: query.query_type().to_string(),
            })
            .collect();

        let answers = message
            .answers()
            .iter()
            .map(|record| DnsAnswer {
                ipv4: match record.data() {
                    Some(RData::A(a)) => Some(a.0),
                    _ => None,
                },
            })
            .collect();

        Self {
            response: message.message_type() == MessageType::Response,
            questions,
            answers,
        }
    }
}

fn display_name(name: &Name) -> String {
    let mut text = name.to_utf8();
    if text.len() > 1 && text.ends_with('.') {
        text.pop();
    }
    text
}

/// One captured unit of traffic with its parsed lower layers.
///
/// Layers that were absent or failed to parse are `None`. `payload` is the
/// transport payload and is only present when non-empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub timestamp: DateTime<Utc>,
    pub ipv4: Option<Ipv4Layer>,
    pub tcp: Option<PortLayer>,
    pub udp: Option<PortLayer>,
    pub dns: Option<DnsLayer>,
    pub payload: Option<Vec<u8>>,
}

impl Frame {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            ipv4: None,
            tcp: None,
            udp: None,
            dns: None,
            payload: None,
        }
    }

    pub fn with_ipv4(mut self, src: Ipv4Addr, dst: Ipv4Addr) -> Self {
        self.ipv4 = Some(Ipv4Layer { src, dst });
        self
    }

    pub fn with_tcp(mut self, src_port: u16, dst_port: u16) -> Self {
        self.tcp = Some(PortLayer { src_port, dst_port });
        self
    }

    pub fn with_udp(mut self, src_port: u16, dst_port: u16) -> Self {
        self.udp = Some(PortLayer { src_port, dst_port });
        self
    }

    pub fn with_dns(mut self, dns: DnsLayer) -> Self {
        self.dns = Some(dns);
        self
    }

    pub fn with_payload(mut self, payload: &[u8]) -> Self {
        self.payload = (!payload.is_empty()).then(|| payload.to_vec());
        self
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    /// Capture time as RFC3339, second precision, UTC
    pub fn timestamp_rfc3339(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    /// Parse raw captured bytes down to the application payload
    pub fn from_link(link: LinkType, data: &[u8], timestamp: DateTime<Utc>) -> Self {
        let frame = Self::new(timestamp);

        let ip_bytes = match link {
            LinkType::Ethernet => {
                let ethernet = match EthernetPacket::new(data) {
                    Some(eth) => eth,
                    None => {
                        trace!("Failed to parse Ethernet frame ({} bytes)", data.len());
                        return frame;
                    }
                };
                let mut ethertype = ethernet.get_ethertype();
                let mut offset = ETHERNET_HEADER_LEN;

                // One 802.1Q tag
                if ethertype == EtherTypes::Vlan {
                    let Some(vlan) = VlanPacket::new(&data[offset..]) else {
                        return frame;
                    };
                    ethertype = vlan.get_ethertype();
                    offset += VLAN_HEADER_LEN;
                }

                if ethertype != EtherTypes::Ipv4 {
                    return frame;
                }
                &data[offset..]
            }
            LinkType::LinuxSll => {
                let Some(sll) = SLLPacket::new(data) else {
                    return frame;
                };
                if sll.get_protocol() != EtherTypes::Ipv4 {
                    return frame;
                }
                &data[SLL_HEADER_LEN..]
            }
            LinkType::Loopback => {
                if data.len() < 4 {
                    return frame;
                }
                let family = [data[0], data[1], data[2], data[3]];
                if u32::from_le_bytes(family) != AF_INET && u32::from_be_bytes(family) != AF_INET {
                    return frame;
                }
                &data[4..]
            }
            LinkType::RawIpv4 => data,
            LinkType::Unsupported => return frame,
        };

        frame.parse_ipv4(ip_bytes)
    }

    fn parse_ipv4(mut self, bytes: &[u8]) -> Self {
        let ipv4 = match Ipv4Packet::new(bytes) {
            Some(ip) if ip.get_version() == 4 => ip,
            _ => {
                trace!("Failed to parse IPv4 packet");
                return self;
            }
        };

        self = self.with_ipv4(ipv4.get_source(), ipv4.get_destination());

        // Non-first fragments carry no transport header
        if ipv4.get_fragment_offset() != 0 {
            return self;
        }

        match ipv4.get_next_level_protocol() {
            IpNextHeaderProtocols::Tcp => {
                if let Some(tcp) = TcpPacket::new(ipv4.payload()) {
                    self = self
                        .with_tcp(tcp.get_source(), tcp.get_destination())
                        .with_payload(tcp.payload());
                }
            }
            IpNextHeaderProtocols::Udp => {
                if let Some(udp) = UdpPacket::new(ipv4.payload()) {
                    self = self
                        .with_udp(udp.get_source(), udp.get_destination())
                        .with_payload(udp.payload());

                    let ports = PortLayer {
                        src_port: udp.get_source(),
                        dst_port: udp.get_destination(),
                    };
                    if ports.touches(DNS_PORT) {
                        self.dns = Message::from_vec(udp.payload())
                            .ok()
                            .map(|message| DnsLayer::from(&message));
                    }
                }
            }
            _ => {}
        }

        self
    }
}
