use super::{EnvelopeCodec, HeadersCodec, JsonHeadersCodec};
use crate::envelope::Envelope;
use crate::error::GatewayError;
use crate::transport::WireUnit;

/// Frames an envelope as a metadata/data pair for transports with native multiplexing.
///
/// The metadata holds the encoded header map and the data holds the payload bytes untouched.
#[derive(Debug, Clone, Default)]
pub struct WireUnitCodec<H = JsonHeadersCodec> {
    headers: H,
}

impl<H: HeadersCodec> WireUnitCodec<H> {
    pub fn new(headers: H) -> Self {
        Self { headers }
    }
}

impl<H: HeadersCodec> EnvelopeCodec for WireUnitCodec<H> {
    type Wire = WireUnit;

    fn encode(&self, envelope: &Envelope) -> Result<WireUnit, GatewayError> {
        Ok(WireUnit {
            metadata: self.headers.encode(envelope.headers())?,
            data: envelope.payload().cloned(),
        })
    }

    fn decode(&self, wire: WireUnit) -> Result<Envelope, GatewayError> {
        let headers = match self.headers.decode(&wire.metadata) {
            Ok(headers) => headers,
            Err(e) => {
                wire.release();
                return Err(e);
            }
        };

        Ok(Envelope::builder()
            .headers(headers)
            .maybe_payload(wire.data)
            .build())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[test]
    fn test_roundtrip_keeps_binary_payload() {
        let codec = WireUnitCodec::<JsonHeadersCodec>::default();
        let envelope = Envelope::builder()
            .qualifier("/blob/put")
            .header("k", "v")
            .payload(Bytes::from_static(b"\x00\xffraw"))
            .build();

        let unit = codec.encode(&envelope).unwrap();
        assert_eq!(unit.data.as_deref(), Some(&b"\x00\xffraw"[..]));
        assert_eq!(codec.decode(unit).unwrap(), envelope);
    }

    #[test]
    fn test_bad_metadata_is_encoding_error() {
        let codec = WireUnitCodec::<JsonHeadersCodec>::default();
        let unit = WireUnit {
            metadata: Bytes::from_static(b"{"),
            data: Some(Bytes::from_static(b"x")),
        };
        assert!(matches!(codec.decode(unit), Err(GatewayError::Encoding(_))));
    }
}
