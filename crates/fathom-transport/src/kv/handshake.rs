//! HELLO feature negotiation: the client always requests
//! the full feature set it understands; the server replies with the
//! subset it supports, and that subset becomes the session's
//! negotiated-feature set for the rest of its life.

use std::collections::HashSet;

/// The optional features this client always requests on HELLO.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Feature {
    TcpNoDelay,
    MutationSeqno,
    Xattr,
    ExtendedErrors,
    SelectBucket,
    Snappy,
    JsonDatatype,
    Duplex,
    ClusterMapNotification,
    UnorderedExecution,
    AlternateRequestFraming,
    Tracing,
    SynchronousReplication,
    Vattr,
    Collections,
    CreateAsDeletedSubdoc,
}

impl Feature {
    /// All features this client offers, in HELLO request order.
    pub const ALL: [Feature; 16] = [
        Feature::TcpNoDelay,
        Feature::MutationSeqno,
        Feature::Xattr,
        Feature::ExtendedErrors,
        Feature::SelectBucket,
        Feature::Snappy,
        Feature::JsonDatatype,
        Feature::Duplex,
        Feature::ClusterMapNotification,
        Feature::UnorderedExecution,
        Feature::AlternateRequestFraming,
        Feature::Tracing,
        Feature::SynchronousReplication,
        Feature::Vattr,
        Feature::Collections,
        Feature::CreateAsDeletedSubdoc,
    ];

    fn code(self) -> u16 {
        match self {
            Feature::TcpNoDelay => 0x03,
            Feature::MutationSeqno => 0x04,
            Feature::Xattr => 0x06,
            Feature::ExtendedErrors => 0x07,
            Feature::SelectBucket => 0x08,
            Feature::Snappy => 0x0a,
            Feature::JsonDatatype => 0x0b,
            Feature::Duplex => 0x0c,
            Feature::ClusterMapNotification => 0x0d,
            Feature::UnorderedExecution => 0x0e,
            Feature::AlternateRequestFraming => 0x10,
            Feature::Tracing => 0x11,
            Feature::SynchronousReplication => 0x13,
            Feature::Vattr => 0x15,
            Feature::Collections => 0x12,
            Feature::CreateAsDeletedSubdoc => 0x17,
        }
    }

    fn from_code(code: u16) -> Option<Feature> {
        Feature::ALL.into_iter().find(|f| f.code() == code)
    }
}

/// Encode the HELLO request body: a list of big-endian `u16` feature
/// codes.
pub fn hello_request_body() -> Vec<u8> {
    let mut body = Vec::with_capacity(Feature::ALL.len() * 2);
    for feature in Feature::ALL {
        body.extend_from_slice(&feature.code().to_be_bytes());
    }
    body
}

/// Decode the server's HELLO response body into the negotiated subset.
pub fn parse_negotiated_features(body: &[u8]) -> HashSet<Feature> {
    body.chunks_exact(2)
        .filter_map(|pair| Feature::from_code(u16::from_be_bytes([pair[0], pair[1]])))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_lists_every_offered_feature_once() {
        let body = hello_request_body();
        assert_eq!(body.len(), Feature::ALL.len() * 2);
    }

    #[test]
    fn unsupported_server_codes_are_ignored_not_fatal() {
        let mut body = Vec::new();
        body.extend_from_slice(&Feature::Snappy.code().to_be_bytes());
        body.extend_from_slice(&0xffffu16.to_be_bytes());
        let negotiated = parse_negotiated_features(&body);
        assert_eq!(negotiated.len(), 1);
        assert!(negotiated.contains(&Feature::Snappy));
    }

    #[test]
    fn empty_response_negotiates_no_optional_features() {
        assert!(parse_negotiated_features(&[]).is_empty());
    }
}
