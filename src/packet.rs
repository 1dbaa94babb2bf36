use serde::Serialize;
use std::collections::BTreeMap;

/// Application protocol a record was decoded as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Protocol {
    #[serde(rename = "HTTP")]
    Http,
    #[serde(rename = "TLS")]
    Tls,
    #[serde(rename = "DNS")]
    Dns,
}

/// Addressing shared by every decoded record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoints {
    pub timestamp: String,
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
}

/// One successfully decoded frame.
///
/// At most one of `http`, `tls`, `dns` is populated and it always matches
/// `protocol`; the constructors below are the only way the decoders build one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PacketMetadata {
    pub protocol: Protocol,
    #[serde(flatten)]
    pub endpoints: Endpoints,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsMetadata>,
}

impl PacketMetadata {
    fn bare(protocol: Protocol, endpoints: Endpoints) -> Self {
        Self {
            protocol,
            endpoints,
            http: None,
            tls: None,
            dns: None,
        }
    }

    pub fn http(endpoints: Endpoints, http: Option<HttpMetadata>) -> Self {
        Self {
            http,
            ..Self::bare(Protocol::Http, endpoints)
        }
    }

    pub fn tls(endpoints: Endpoints, tls: Option<TlsMetadata>) -> Self {
        Self {
            tls,
            ..Self::bare(Protocol::Tls, endpoints)
        }
    }

    pub fn dns(endpoints: Endpoints, dns: Option<DnsMetadata>) -> Self {
        Self {
            dns,
            ..Self::bare(Protocol::Dns, endpoints)
        }
    }
}

/// Request line and headers of a plaintext HTTP message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HttpMetadata {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub method: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub path: String,
    // Ordered map so repeated encodings of one record are byte-identical
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

/// TLS record layer header
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TlsMetadata {
    pub record_type: u8,
    pub record_type_name: String,
    pub version: String,
    pub payload_length: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DnsMetadata {
    pub is_query: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub query_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub query_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub response_ip: String,
}

/// Outcome of one probe request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FuzzOutcome {
    pub target: String,
    pub payload: String,
    pub response: ResponseSummary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResponseSummary {
    pub status_code: u16,
    pub length: usize,
    pub anomaly: bool,
}

impl FuzzOutcome {
    pub fn new(target: String, payload: String, status_code: u16, length: usize) -> Self {
        Self {
            target,
            payload,
            response: ResponseSummary {
                status_code,
                length,
                anomaly: status_code >= 500,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> Endpoints {
        Endpoints {
            timestamp: "2024-05-01T12:00:00Z".to_string(),
            src_ip: "10.0.0.1".to_string(),
            dst_ip: "10.0.0.2".to_string(),
            src_port: 51000,
            dst_port: 443,
        }
    }

    #[test]
    fn test_absent_sub_records_are_omitted() {
        let meta = PacketMetadata::tls(endpoints(), None);
        let json = serde_json::to_string(&meta).unwrap();

        assert_eq!(
            json,
            r#"{"protocol":"TLS","timestamp":"2024-05-01T12:00:00Z","src_ip":"10.0.0.1","dst_ip":"10.0.0.2","src_port":51000,"dst_port":443}"#
        );
    }

    #[test]
    fn test_dns_empty_fields_are_omitted() {
        let meta = PacketMetadata::dns(
            endpoints(),
            Some(DnsMetadata {
                is_query: false,
                response_ip: "93.184.216.34".to_string(),
                ..Default::default()
            }),
        );
        let value = serde_json::to_value(&meta).unwrap();

        assert_eq!(value["protocol"], "DNS");
        assert_eq!(value["dns"]["is_query"], false);
        assert_eq!(value["dns"]["response_ip"], "93.184.216.34");
        assert!(value["dns"].get("query_name").is_none());
        assert!(value.get("http").is_none());
        assert!(value.get("tls").is_none());
    }

    #[test]
    fn test_fuzz_outcome_anomaly_threshold() {
        let ok = FuzzOutcome::new("http://a/x".into(), "p".into(), 499, 10);
        let bad = FuzzOutcome::new("http://a/x".into(), "p".into(), 500, 0);

        assert!(!ok.response.anomaly);
        assert!(bad.response.anomaly);

        let value = serde_json::to_value(&bad).unwrap();
        assert_eq!(value["response"]["status_code"], 500);
        assert_eq!(value["response"]["length"], 0);
        assert_eq!(value["response"]["anomaly"], true);
    }
}
