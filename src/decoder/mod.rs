pub mod dns;
pub mod http;
pub mod tls;

use thiserror::Error;

use crate::frame::{Frame, Ipv4Layer, PortLayer};
use crate::packet::{Endpoints, PacketMetadata};

pub use dns::DnsDecoder;
pub use http::HttpDecoder;
pub use tls::TlsDecoder;

/// Why a decoder produced nothing for a frame. Never fatal to the pipeline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("missing {0} layer")]
    MissingLayer(&'static str),

    #[error("payload is not {0}")]
    NotApplicable(&'static str),
}

/// A stateless predicate + extractor for one application protocol
pub trait PacketDecoder: Send + Sync {
    fn name(&self) -> &'static str;

    /// Cheap header-only check; must not inspect deeper than one layer
    fn can_decode(&self, frame: &Frame) -> bool;

    fn decode(&self, frame: &Frame) -> Result<PacketMetadata, DecodeError>;
}

/// Which decoders the registry is built with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderConfig {
    pub http: bool,
    pub tls: bool,
    pub dns: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            http: true,
            tls: true,
            dns: true,
        }
    }
}

/// Ordered set of active decoders tried against every frame
#[derive(Default)]
pub struct DecoderRegistry {
    decoders: Vec<Box<dyn PacketDecoder>>,
}

impl DecoderRegistry {
    /// Builds the registry in fixed order: HTTP, TLS, DNS
    pub fn new(config: DecoderConfig) -> Self {
        let mut registry = Self::default();
        if config.http {
            registry.register(HttpDecoder);
        }
        if config.tls {
            registry.register(TlsDecoder);
        }
        if config.dns {
            registry.register(DnsDecoder);
        }
        registry
    }

    pub fn register<D>(&mut self, decoder: D)
    where
        D: PacketDecoder + 'static,
    {
        self.decoders.push(Box::new(decoder));
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.decoders.iter().map(|d| d.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// Try every decoder in order and hand each successful result to `emit`.
    ///
    /// A match does not stop the walk: a frame whose ports satisfy several
    /// predicates is decoded once per matching decoder. Failures are dropped.
    /// Returns the number of records emitted.
    pub fn dispatch<F>(&self, frame: &Frame, mut emit: F) -> usize
    where
        F: FnMut(PacketMetadata),
    {
        let mut emitted = 0;

        for decoder in &self.decoders {
            if !decoder.can_decode(frame) {
                continue;
            }
            match decoder.decode(frame) {
                Ok(metadata) => {
                    emit(metadata);
                    emitted += 1;
                }
                Err(_) => {}
            }
        }

        emitted
    }
}

/// IPv4 + transport addressing for a decoded record
pub(crate) fn endpoints(frame: &Frame, ip: &Ipv4Layer, ports: &PortLayer) -> Endpoints {
    Endpoints {
        timestamp: frame.timestamp_rfc3339(),
        src_ip: ip.src.to_string(),
        dst_ip: ip.dst.to_string(),
        src_port: ports.src_port,
        dst_port: ports.dst_port,
    }
}

#[cfg(test)]
pub(crate) mod test_frames {
    use crate::frame::Frame;
    use chrono::{DateTime, Utc};
    use std::net::Ipv4Addr;

    pub fn ts() -> DateTime<Utc> {
        DateTime::from_timestamp(1_714_564_800, 0).unwrap()
    }

    pub fn tcp(src_port: u16, dst_port: u16, payload: &[u8]) -> Frame {
        Frame::new(ts())
            .with_ipv4(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2))
            .with_tcp(src_port, dst_port)
            .with_payload(payload)
    }

    pub fn udp(src_port: u16, dst_port: u16) -> Frame {
        Frame::new(ts())
            .with_ipv4(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 53))
            .with_udp(src_port, dst_port)
    }
}
