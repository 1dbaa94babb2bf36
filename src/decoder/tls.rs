use super::{endpoints, DecodeError, PacketDecoder};
use crate::frame::Frame;
use crate::packet::{PacketMetadata, TlsMetadata};

const TLS_PORT: u16 = 443;
const TLS_RECORD_HEADER_SIZE: usize = 5;

/// TLS record headers on port 443
pub struct TlsDecoder;

impl PacketDecoder for TlsDecoder {
    fn name(&self) -> &'static str {
        "TLS"
    }

    fn can_decode(&self, frame: &Frame) -> bool {
        frame.tcp.is_some_and(|tcp| tcp.touches(TLS_PORT))
    }

    fn decode(&self, frame: &Frame) -> Result<PacketMetadata, DecodeError> {
        let ip = frame.ipv4.as_ref().ok_or(DecodeError::MissingLayer("IPv4"))?;
        let tcp = frame.tcp.as_ref().ok_or(DecodeError::MissingLayer("TCP"))?;

        let record = frame.payload().and_then(parse_record_header);

        Ok(PacketMetadata::tls(endpoints(frame, ip, tcp), record))
    }
}

/// ContentType (1) | ProtocolVersion (2) | Length (2, big endian)
fn parse_record_header(payload: &[u8]) -> Option<TlsMetadata> {
    if payload.len() < TLS_RECORD_HEADER_SIZE {
        return None;
    }

    let record_type = payload[0];
    Some(TlsMetadata {
        record_type,
        record_type_name: record_type_name(record_type).to_string(),
        version: version_name(payload[1], payload[2]).to_string(),
        payload_length: u16::from_be_bytes([payload[3], payload[4]]),
    })
}

fn record_type_name(record_type: u8) -> &'static str {
    match record_type {
        20 => "Change Cipher Spec",
        21 => "Alert",
        22 => "Handshake",
        23 => "Application Data",
        _ => "Unknown",
    }
}

fn version_name(major: u8, minor: u8) -> &'static str {
    match (major, minor) {
        (3, 1) => "TLS 1.0",
        (3, 2) => "TLS 1.1",
        (3, 3) => "TLS 1.2",
        (3, 4) => "TLS 1.3",
        _ => "Unknown",
    }
}
