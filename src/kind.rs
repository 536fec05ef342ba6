//! The fixed set of test kinds the native library knows how to run.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestKind {
    DnsInjection,
    HttpInvalidRequestLine,
    /// Network diagnostic tool.
    Ndt,
    TcpConnect,
    WebConnectivity,
    MeekFrontedRequests,
    /// Template test: a single DNS query.
    DnsQuery,
    /// Template test: a single HTTP request.
    HttpRequest,
}

impl TestKind {
    pub const ALL: [TestKind; 8] = [
        TestKind::DnsInjection,
        TestKind::HttpInvalidRequestLine,
        TestKind::Ndt,
        TestKind::TcpConnect,
        TestKind::WebConnectivity,
        TestKind::MeekFrontedRequests,
        TestKind::DnsQuery,
        TestKind::HttpRequest,
    ];

    /// Name passed across the native boundary.
    pub fn native_name(&self) -> &'static str {
        match self {
            TestKind::DnsInjection => "dns_injection",
            TestKind::HttpInvalidRequestLine => "http_invalid_request_line",
            TestKind::Ndt => "ndt",
            TestKind::TcpConnect => "tcp_connect",
            TestKind::WebConnectivity => "web_connectivity",
            TestKind::MeekFrontedRequests => "meek_fronted_requests",
            TestKind::DnsQuery => "dns_query",
            TestKind::HttpRequest => "http_request",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            TestKind::DnsInjection => "OONI dns-injection",
            TestKind::HttpInvalidRequestLine => "OONI http-invalid-request-line",
            TestKind::Ndt => "network diagnostic tool",
            TestKind::TcpConnect => "OONI tcp-connect",
            TestKind::WebConnectivity => "OONI web-connectivity",
            TestKind::MeekFrontedRequests => "OONI meek-fronted-requests",
            TestKind::DnsQuery => "DNS query template",
            TestKind::HttpRequest => "HTTP request template",
        }
    }
}

impl std::fmt::Display for TestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.native_name())
    }
}

impl FromStr for TestKind {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().replace('-', "_");
        TestKind::ALL
            .iter()
            .copied()
            .find(|k| k.native_name() == normalized)
            .ok_or_else(|| BridgeError::UnknownTestKind { name: s.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_native_and_kebab_names() {
        assert_eq!("tcp_connect".parse::<TestKind>().unwrap(), TestKind::TcpConnect);
        assert_eq!("web-connectivity".parse::<TestKind>().unwrap(), TestKind::WebConnectivity);
        assert_eq!("ndt".parse::<TestKind>().unwrap(), TestKind::Ndt);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let err = "bogus_kind".parse::<TestKind>().unwrap_err();
        assert_eq!(
            err,
            BridgeError::UnknownTestKind {
                name: "bogus_kind".into()
            }
        );
    }

    #[test]
    fn test_every_kind_roundtrips_through_its_native_name() {
        for kind in TestKind::ALL {
            assert_eq!(kind.native_name().parse::<TestKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_serde_uses_native_names() {
        let json = serde_json::to_string(&TestKind::HttpInvalidRequestLine).unwrap();
        assert_eq!(json, "\"http_invalid_request_line\"");
    }
}
