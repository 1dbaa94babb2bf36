use std::collections::BTreeMap;

use super::{endpoints, DecodeError, PacketDecoder};
use crate::frame::Frame;
use crate::packet::{HttpMetadata, PacketMetadata};

const HTTP_PORTS: [u16; 2] = [80, 8080];

/// Payload prefixes accepted as plaintext HTTP
const HTTP_PREFIXES: [&[u8]; 4] = [b"GET", b"POST", b"HEAD", b"HTTP"];

/// Plaintext HTTP on ports 80 and 8080
pub struct HttpDecoder;

impl PacketDecoder for HttpDecoder {
    fn name(&self) -> &'static str {
        "HTTP"
    }

    fn can_decode(&self, frame: &Frame) -> bool {
        frame
            .tcp
            .is_some_and(|tcp| HTTP_PORTS.iter().any(|&port| tcp.touches(port)))
    }

    fn decode(&self, frame: &Frame) -> Result<PacketMetadata, DecodeError> {
        let ip = frame.ipv4.as_ref().ok_or(DecodeError::MissingLayer("IPv4"))?;
        let tcp = frame.tcp.as_ref().ok_or(DecodeError::MissingLayer("TCP"))?;
        let endpoints = endpoints(frame, ip, tcp);

        let Some(payload) = frame.payload() else {
            return Ok(PacketMetadata::http(endpoints, None));
        };

        if !HTTP_PREFIXES.iter().any(|prefix| payload.starts_with(prefix)) {
            return Err(DecodeError::NotApplicable("HTTP"));
        }

        Ok(PacketMetadata::http(endpoints, Some(parse_message(payload))))
    }
}

fn parse_message(payload: &[u8]) -> HttpMetadata {
    let text = String::from_utf8_lossy(payload);
    let mut lines = text.split('\n');
    let start_line = lines.next().unwrap_or_default();

    let method = text.split_whitespace().next().unwrap_or_default();
    let path = start_line.split_whitespace().nth(1).unwrap_or_default();

    HttpMetadata {
        method: method.to_string(),
        path: path.to_string(),
        headers: parse_headers(lines),
    }
}

/// Header lines up to the first blank line; later duplicates win
fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();

    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_string(), value.trim().to_string());
        }
    }

    headers
}
