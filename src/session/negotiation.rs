//! Supported-protocol negotiation rules shared by both protocol versions.

use serde::Serialize;

use crate::codec::is_gzip;
use crate::handler::HandlerRegistry;
use crate::protocol::{SupportedProtocol, Version, CORE_PROTOCOL};

/// What a finished negotiation agreed on.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Negotiated {
    /// Session identifier assigned by the server.
    pub session_id: String,
    /// Accepted (protocol, role) entries; the role is the server's.
    pub protocols: Vec<SupportedProtocol>,
    /// Body compression in force, if any.
    pub compression: Option<String>,
    /// Application name announced by the peer.
    pub peer_application: String,
}

/// Entries a client requests: for every registered non-core handler, the
/// role it wants the server to play.
pub fn requested_protocols(registry: &HandlerRegistry, version: Version) -> Vec<SupportedProtocol> {
    registry
        .handlers()
        .filter(|h| h.protocol() != CORE_PROTOCOL)
        .map(|h| {
            let mut entry = SupportedProtocol::new(h.protocol(), version, h.counterpart_role());
            entry.protocol_capabilities = h.capabilities();
            entry
        })
        .collect()
}

/// Entries a server offers: every registered non-core handler in its own role.
pub fn supported_protocols(registry: &HandlerRegistry, version: Version) -> Vec<SupportedProtocol> {
    registry
        .handlers()
        .filter(|h| h.protocol() != CORE_PROTOCOL)
        .map(|h| {
            let mut entry = SupportedProtocol::new(h.protocol(), version, h.role());
            entry.protocol_capabilities = h.capabilities();
            entry
        })
        .collect()
}

/// Intersect a client's request with what this server supports.
///
/// The result keeps request order, uses the server's capability sets and
/// holds at most one entry per (protocol, role).
pub fn accept_protocols(
    requested: &[SupportedProtocol],
    supported: &[SupportedProtocol],
) -> Vec<SupportedProtocol> {
    let mut accepted: Vec<SupportedProtocol> = Vec::new();
    for request in requested {
        let duplicate = accepted
            .iter()
            .any(|a| a.matches(request.protocol, &request.role));
        if duplicate {
            continue;
        }
        if let Some(entry) = supported
            .iter()
            .find(|s| s.matches(request.protocol, &request.role))
        {
            accepted.push(entry.clone());
        }
    }
    accepted
}

/// Pick the body compression both sides support.
pub fn select_compression(offered: &[String], local: Option<&str>) -> Option<String> {
    let local = local.filter(|l| is_gzip(l))?;
    offered
        .iter()
        .any(|o| o.eq_ignore_ascii_case(local))
        .then(|| local.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    const V12: Version = Version::new(1, 2, 0, 0);

    #[test]
    fn test_accept_single_overlap() {
        let requested = vec![SupportedProtocol::new(1, V12, "customer")];
        let supported = vec![SupportedProtocol::new(1, V12, "Customer")];
        let accepted = accept_protocols(&requested, &supported);
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].protocol, 1);
    }

    #[test]
    fn test_accept_no_overlap() {
        let requested = vec![SupportedProtocol::new(99, V12, "customer")];
        let supported = vec![SupportedProtocol::new(1, V12, "customer")];
        assert!(accept_protocols(&requested, &supported).is_empty());
    }

    #[test]
    fn test_accept_role_must_match() {
        let requested = vec![SupportedProtocol::new(4, V12, "customer")];
        let supported = vec![SupportedProtocol::new(4, V12, "store")];
        assert!(accept_protocols(&requested, &supported).is_empty());
    }

    #[test]
    fn test_accept_deduplicates() {
        let requested = vec![
            SupportedProtocol::new(4, V12, "store"),
            SupportedProtocol::new(4, V12, "STORE"),
            SupportedProtocol::new(14, V12, "store"),
        ];
        let supported = vec![
            SupportedProtocol::new(14, V12, "store"),
            SupportedProtocol::new(4, V12, "store"),
        ];
        let accepted: Vec<i32> = accept_protocols(&requested, &supported)
            .iter()
            .map(|p| p.protocol)
            .collect();
        assert_eq!(accepted, vec![4, 14]);
    }

    #[test]
    fn test_select_compression() {
        let offered = vec!["GZIP".to_string()];
        assert_eq!(select_compression(&offered, Some("gzip")).as_deref(), Some("gzip"));
        assert_eq!(select_compression(&offered, None), None);
        assert_eq!(select_compression(&[], Some("gzip")), None);
        assert_eq!(select_compression(&["br".to_string()], Some("br")), None);
    }
}
