use std::collections::BTreeMap;

use bytes::Bytes;
use serde_json::Value;
use serde_json::value::{RawValue, to_raw_value};

use super::EnvelopeCodec;
use crate::envelope::Envelope;
use crate::error::GatewayError;

/// Field of the text frame holding the payload.
const DATA_FIELD: &str = "d";

/// Frames an envelope as one JSON object per WebSocket text message.
///
/// ```text
/// {"d":{"text":"hi"},"q":"/echo/many","sid":"7"}
/// {"sid":"7","sig":"1"}
/// ```
///
/// Header keys become top-level string fields and the payload is embedded under `d`, so payloads
/// on this binding must themselves be JSON. The payload text is carried verbatim in both
/// directions.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextFrameCodec;

fn encoding_error(context: &str, error: serde_json::Error) -> GatewayError {
    GatewayError::Encoding(format!("{context}: {error}"))
}

impl EnvelopeCodec for TextFrameCodec {
    type Wire = String;

    fn encode(&self, envelope: &Envelope) -> Result<String, GatewayError> {
        let mut object: BTreeMap<&str, Box<RawValue>> = BTreeMap::new();

        for (key, value) in envelope.headers() {
            if key == DATA_FIELD {
                return Err(GatewayError::Encoding(format!(
                    "header '{DATA_FIELD}' is reserved for the payload"
                )));
            }
            let value = to_raw_value(value).map_err(|e| encoding_error("invalid header", e))?;
            object.insert(key.as_str(), value);
        }

        if let Some(payload) = envelope.payload() {
            let text = std::str::from_utf8(payload).map_err(|e| {
                GatewayError::Encoding(format!("payload is not valid JSON: {e}"))
            })?;
            let data = RawValue::from_string(text.to_string())
                .map_err(|e| encoding_error("payload is not valid JSON", e))?;
            object.insert(DATA_FIELD, data);
        }

        serde_json::to_string(&object).map_err(|e| encoding_error("failed to encode frame", e))
    }

    fn decode(&self, wire: String) -> Result<Envelope, GatewayError> {
        let object: BTreeMap<String, &RawValue> = serde_json::from_str(&wire)
            .map_err(|e| encoding_error("text frame is not a JSON object", e))?;

        let mut builder = Envelope::builder();
        for (key, raw) in object {
            if key == DATA_FIELD {
                builder = builder.payload(Bytes::copy_from_slice(raw.get().as_bytes()));
                continue;
            }

            let value: Value = serde_json::from_str(raw.get())
                .map_err(|e| encoding_error("invalid header", e))?;
            // Some peers send numeric stream ids and signal codes.
            let value = match value {
                Value::String(value) => value,
                Value::Number(number) => number.to_string(),
                Value::Bool(flag) => flag.to_string(),
                Value::Null => continue,
                Value::Array(_) | Value::Object(_) => {
                    return Err(GatewayError::Encoding(format!(
                        "header '{key}' is not a scalar"
                    )));
                }
            };
            builder = builder.header(key, value);
        }

        Ok(builder.build())
    }
}
