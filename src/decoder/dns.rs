use super::{endpoints, DecodeError, PacketDecoder};
use crate::frame::{DnsLayer, Frame};
use crate::packet::{DnsMetadata, PacketMetadata};

const DNS_PORT: u16 = 53;

/// DNS over UDP port 53
pub struct DnsDecoder;

impl PacketDecoder for DnsDecoder {
    fn name(&self) -> &'static str {
        "DNS"
    }

    fn can_decode(&self, frame: &Frame) -> bool {
        frame.udp.is_some_and(|udp| udp.touches(DNS_PORT))
    }

    fn decode(&self, frame: &Frame) -> Result<PacketMetadata, DecodeError> {
        let ip = frame.ipv4.as_ref().ok_or(DecodeError::MissingLayer("IPv4"))?;
        let udp = frame.udp.as_ref().ok_or(DecodeError::MissingLayer("UDP"))?;
        let dns = frame.dns.as_ref().ok_or(DecodeError::MissingLayer("DNS"))?;

        Ok(PacketMetadata::dns(endpoints(frame, ip, udp), summarize(dns)))
    }
}

/// First question plus the first IPv4 answer, if either exists
fn summarize(dns: &DnsLayer) -> Option<DnsMetadata> {
    let question = dns.questions.first();
    let response_ip = dns.answers.iter().find_map(|answer| answer.ipv4);

    if question.is_none() && response_ip.is_none() {
        return None;
    }

    let mut meta = DnsMetadata {
        is_query: !dns.response,
        ..Default::default()
    };
    if let Some(question) = question {
        meta.query_name = question.name.clone();
        meta.query_type = question.qtype.clone();
    }
    if let Some(ip) = response_ip {
        meta.response_ip = ip.to_string();
    }

    Some(meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::test_frames;
    use crate::frame::{DnsAnswer, DnsQuestion};
    use crate::packet::Protocol;
    use std::net::Ipv4Addr;

    fn question(name: &str, qtype: &str) -> DnsQuestion {
        DnsQuestion {
            name: name.to_string(),
            qtype: qtype.to_string(),
        }
    }

    #[test]
    fn test_predicate_ports() {
        assert!(DnsDecoder.can_decode(&test_frames::udp(40000, 53)));
        assert!(DnsDecoder.can_decode(&test_frames::udp(53, 40000)));
        assert!(!DnsDecoder.can_decode(&test_frames::udp(40000, 5353)));
        assert!(!DnsDecoder.can_decode(&test_frames::tcp(40000, 53, b"")));
    }

    #[test]
    fn test_single_question_query() {
        let frame = test_frames::udp(40000, 53).with_dns(DnsLayer {
            response: false,
            questions: vec![question("example.com", "A")],
            answers: vec![],
        });

        let meta = DnsDecoder.decode(&frame).unwrap();

        assert_eq!(meta.protocol, Protocol::Dns);
        assert_eq!(
            meta.dns,
            Some(DnsMetadata {
                is_query: true,
                query_name: "example.com".to_string(),
                query_type: "A".to_string(),
                response_ip: String::new(),
            })
        );
    }

    #[test]
    fn test_response_uses_first_question_and_first_ipv4_answer() {
        let frame = test_frames::udp(53, 40000).with_dns(DnsLayer {
            response: true,
            questions: vec![question("www.example.com", "A"), question("ignored.test", "MX")],
            answers: vec![
                DnsAnswer { ipv4: None },
                DnsAnswer {
                    ipv4: Some(Ipv4Addr::new(93, 184, 216, 34)),
                },
                DnsAnswer {
                    ipv4: Some(Ipv4Addr::new(1, 1, 1, 1)),
                },
            ],
        });

        let dns = DnsDecoder.decode(&frame).unwrap().dns.unwrap();

        assert!(!dns.is_query);
        assert_eq!(dns.query_name, "www.example.com");
        assert_eq!(dns.query_type, "A");
        assert_eq!(dns.response_ip, "93.184.216.34");
    }

    #[test]
    fn test_answer_without_question_creates_record() {
        let frame = test_frames::udp(53, 40000).with_dns(DnsLayer {
            response: true,
            questions: vec![],
            answers: vec![DnsAnswer {
                ipv4: Some(Ipv4Addr::new(10, 1, 2, 3)),
            }],
        });

        let dns = DnsDecoder.decode(&frame).unwrap().dns.unwrap();

        assert!(!dns.is_query);
        assert!(dns.query_name.is_empty());
        assert_eq!(dns.response_ip, "10.1.2.3");
    }

    #[test]
    fn test_empty_message_yields_bare_record() {
        let frame = test_frames::udp(53, 40000).with_dns(DnsLayer {
            response: true,
            questions: vec![],
            answers: vec![DnsAnswer { ipv4: None }],
        });

        let meta = DnsDecoder.decode(&frame).unwrap();

        assert_eq!(meta.protocol, Protocol::Dns);
        assert!(meta.dns.is_none());
    }

    #[test]
    fn test_missing_dns_layer() {
        let frame = test_frames::udp(40000, 53).with_payload(b"\x00\x01garbage");
        assert_eq!(
            DnsDecoder.decode(&frame),
            Err(DecodeError::MissingLayer("DNS"))
        );
    }

    #[test]
    fn test_decoding_is_repeatable() {
        let frame = test_frames::udp(53, 40000).with_dns(DnsLayer {
            response: true,
            questions: vec![question("example.com", "A")],
            answers: vec![DnsAnswer {
                ipv4: Some(Ipv4Addr::new(93, 184, 216, 34)),
            }],
        });

        let first = serde_json::to_vec(&DnsDecoder.decode(&frame).unwrap()).unwrap();
        let second = serde_json::to_vec(&DnsDecoder.decode(&frame).unwrap()).unwrap();

        assert_eq!(first, second);
    }
}
