//! Encoding of [`Envelope`]s to and from the wire unit of each binding.
//!
//! Only the envelope framing lives here. The application payload stays opaque bytes, and the
//! header map serialization is pluggable through [`HeadersCodec`].

use std::collections::BTreeMap;
use std::fmt::Debug;

use bytes::Bytes;

use crate::envelope::Envelope;
use crate::error::GatewayError;

mod text;
mod wire_unit;

pub use text::TextFrameCodec;
pub use wire_unit::WireUnitCodec;

/// Converts envelopes to and from a transport specific wire unit.
pub trait EnvelopeCodec: Debug + Send + Sync + 'static {
    type Wire: Send + 'static;

    fn encode(&self, envelope: &Envelope) -> Result<Self::Wire, GatewayError>;

    fn decode(&self, wire: Self::Wire) -> Result<Envelope, GatewayError>;
}

/// Serializes the string-keyed header map.
pub trait HeadersCodec: Debug + Send + Sync + 'static {
    fn encode(&self, headers: &BTreeMap<String, String>) -> Result<Bytes, GatewayError>;

    fn decode(&self, bytes: &[u8]) -> Result<BTreeMap<String, String>, GatewayError>;
}

/// Headers as a flat JSON object of strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonHeadersCodec;

impl HeadersCodec for JsonHeadersCodec {
    fn encode(&self, headers: &BTreeMap<String, String>) -> Result<Bytes, GatewayError> {
        serde_json::to_vec(headers)
            .map(Bytes::from)
            .map_err(|e| GatewayError::Encoding(format!("failed to encode headers: {e}")))
    }

    fn decode(&self, bytes: &[u8]) -> Result<BTreeMap<String, String>, GatewayError> {
        if bytes.is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_slice(bytes)
            .map_err(|e| GatewayError::Encoding(format!("failed to decode headers: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_headers_roundtrip() {
        let headers = BTreeMap::from([
            ("q".to_string(), "/echo".to_string()),
            ("sid".to_string(), "1".to_string()),
        ]);

        let bytes = JsonHeadersCodec.encode(&headers).unwrap();
        assert_eq!(&bytes[..], br#"{"q":"/echo","sid":"1"}"#);
        assert_eq!(JsonHeadersCodec.decode(&bytes).unwrap(), headers);
    }

    #[test]
    fn test_json_headers_empty_metadata() {
        assert!(JsonHeadersCodec.decode(b"").unwrap().is_empty());
    }

    #[test]
    fn test_json_headers_rejects_non_string_values() {
        let result = JsonHeadersCodec.decode(br#"{"sid":1}"#);
        assert!(matches!(result, Err(GatewayError::Encoding(_))));
    }
}
