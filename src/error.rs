use std::fmt::Debug;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::envelope::{Envelope, error_qualifier};

pub const BAD_REQUEST: i32 = 400;
pub const UNAUTHORIZED: i32 = 401;
pub const FORBIDDEN: i32 = 403;
pub const INTERNAL_SERVICE: i32 = 500;
pub const SERVICE_UNAVAILABLE: i32 = 503;

/// Errors surfaced by the gateway transport.
///
/// The type is `Clone` so a single connect failure can be handed to every caller sharing the
/// attempt.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// The envelope could not be framed or a frame could not be read back.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// The underlying channel terminated.
    #[error("connection closed")]
    ConnectionClosed,

    /// The stream was cancelled before it produced a result.
    #[error("stream cancelled")]
    Cancelled,

    /// The physical connection could not be established.
    #[error("failed to connect to '{endpoint}': {reason}")]
    Connect { endpoint: String, reason: String },

    /// The binding does not support the requested call shape.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    #[error("bad request ({code}): {message}")]
    BadRequest { code: i32, message: String },

    #[error("unauthorized ({code}): {message}")]
    Unauthorized { code: i32, message: String },

    #[error("forbidden ({code}): {message}")]
    Forbidden { code: i32, message: String },

    #[error("service unavailable ({code}): {message}")]
    ServiceUnavailable { code: i32, message: String },

    #[error("internal service error ({code}): {message}")]
    InternalService { code: i32, message: String },

    /// The peer broke the multiplexing protocol for one exchange.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// An error kind defined by a custom [`ErrorMapper`].
    #[error(transparent)]
    Custom(Arc<dyn std::error::Error + Send + Sync>),
}

impl GatewayError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            code: BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalService {
            code: INTERNAL_SERVICE,
            message: message.into(),
        }
    }

    pub fn custom(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(error))
    }

    /// The service error code, for errors reported by a service.
    pub fn error_code(&self) -> Option<i32> {
        match self {
            Self::BadRequest { code, .. }
            | Self::Unauthorized { code, .. }
            | Self::Forbidden { code, .. }
            | Self::ServiceUnavailable { code, .. }
            | Self::InternalService { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether the error is fatal to the whole connection rather than one exchange.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::ConnectionClosed | Self::Connect { .. })
    }
}

/// The payload of an error envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorData {
    pub error_code: i32,
    pub error_message: String,
}

impl ErrorData {
    pub fn new(error_code: i32, error_message: impl Into<String>) -> Self {
        Self {
            error_code,
            error_message: error_message.into(),
        }
    }

    /// Encode as an error envelope with the matching error qualifier.
    pub fn into_envelope(self) -> Envelope {
        let qualifier = error_qualifier(self.error_code);
        let payload = serde_json::to_vec(&self)
            .map(Bytes::from)
            .unwrap_or_default();
        Envelope::builder()
            .qualifier(qualifier)
            .payload(payload)
            .build()
    }

    /// Read the error data out of an error envelope.
    ///
    /// Peers that do not send structured error data still produce a usable error: the code falls
    /// back to the one in the qualifier and the message to the raw payload text.
    pub fn from_envelope(envelope: &Envelope) -> Self {
        let structured = envelope
            .payload()
            .and_then(|payload| serde_json::from_slice::<ErrorData>(payload).ok());

        structured.unwrap_or_else(|| Self {
            error_code: envelope.error_code().unwrap_or(INTERNAL_SERVICE),
            error_message: envelope
                .payload()
                .map(|payload| String::from_utf8_lossy(payload).into_owned())
                .unwrap_or_default(),
        })
    }
}

/// Converts between error envelopes and [`GatewayError`]s.
///
/// Clients use [`to_error`](ErrorMapper::to_error) on every error-qualified response; gateways use
/// [`to_error_data`](ErrorMapper::to_error_data) on every failed invocation.
pub trait ErrorMapper: Debug + Send + Sync + 'static {
    fn to_error(&self, envelope: &Envelope) -> GatewayError;

    fn to_error_data(&self, error: &GatewayError) -> ErrorData;
}

/// Maps the well-known error codes, falling back to an internal service error.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultErrorMapper;

impl ErrorMapper for DefaultErrorMapper {
    fn to_error(&self, envelope: &Envelope) -> GatewayError {
        let ErrorData {
            error_code: code,
            error_message: message,
        } = ErrorData::from_envelope(envelope);

        match code {
            BAD_REQUEST => GatewayError::BadRequest { code, message },
            UNAUTHORIZED => GatewayError::Unauthorized { code, message },
            FORBIDDEN => GatewayError::Forbidden { code, message },
            SERVICE_UNAVAILABLE => GatewayError::ServiceUnavailable { code, message },
            _ => GatewayError::InternalService { code, message },
        }
    }

    fn to_error_data(&self, error: &GatewayError) -> ErrorData {
        match error {
            GatewayError::BadRequest { code, message }
            | GatewayError::Unauthorized { code, message }
            | GatewayError::Forbidden { code, message }
            | GatewayError::ServiceUnavailable { code, message }
            | GatewayError::InternalService { code, message } => {
                ErrorData::new(*code, message.clone())
            }
            GatewayError::Encoding(_) | GatewayError::ProtocolViolation(_) => {
                ErrorData::new(BAD_REQUEST, error.to_string())
            }
            GatewayError::UnsupportedOperation(_) => {
                ErrorData::new(SERVICE_UNAVAILABLE, error.to_string())
            }
            _ => ErrorData::new(INTERNAL_SERVICE, error.to_string()),
        }
    }
}

pub(crate) fn default_error_mapper() -> Arc<dyn ErrorMapper> {
    Arc::new(DefaultErrorMapper)
}
