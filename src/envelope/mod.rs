//! The routable unit of communication and the multiplexing control vocabulary.
//!
//! An [`Envelope`] is a qualifier, an ordered header map and an optional opaque payload. The
//! qualifier lives in the headers under [`HEADER_QUALIFIER`] so that every binding frames it the
//! same way.
//!
//! Multiplexed bindings additionally stamp a [`StreamId`] (`sid`) and, on control frames, a
//! [`Signal`] (`sig`). Rather than parsing those headers ad hoc, they are lifted into the tagged
//! [`Frame`] type carried alongside its stream id in a [`StreamFrame`].

use std::collections::BTreeMap;

use bytes::Bytes;

pub mod error;
mod frame;
mod stream_id;

pub use frame::{Frame, Signal, StreamFrame};
pub use stream_id::StreamId;
pub(crate) use stream_id::StreamIdGenerator;

/// Header carrying the routing qualifier.
pub const HEADER_QUALIFIER: &str = "q";

/// Header carrying the decimal stream id on multiplexed frames.
pub const HEADER_STREAM_ID: &str = "sid";

/// Header carrying the [`Signal`] code on control frames.
pub const HEADER_SIGNAL: &str = "sig";

/// Header carrying the content type of the payload.
pub const HEADER_DATA_FORMAT: &str = "_data_format";

/// Namespace of qualifiers that denote a service error, followed by `/{error_code}`.
pub const ERROR_NAMESPACE: &str = "gateway.error";

/// Qualifier reserved for idle connection heartbeats.
pub const KEEPALIVE_QUALIFIER: &str = "/gateway/keepalive";

/// Build the error qualifier for the given error code.
pub fn error_qualifier(error_code: i32) -> String {
    format!("{ERROR_NAMESPACE}/{error_code}")
}

/// An immutable request or response envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    headers: BTreeMap<String, String>,
    payload: Option<Bytes>,
}

impl Envelope {
    /// Start building a new envelope.
    pub fn builder() -> EnvelopeBuilder {
        EnvelopeBuilder::default()
    }

    /// Start building a copy of this envelope.
    pub fn to_builder(&self) -> EnvelopeBuilder {
        EnvelopeBuilder {
            headers: self.headers.clone(),
            payload: self.payload.clone(),
        }
    }

    /// The routing qualifier, absent on pure control frames.
    pub fn qualifier(&self) -> Option<&str> {
        self.header(HEADER_QUALIFIER)
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    pub fn has_payload(&self) -> bool {
        self.payload.is_some()
    }

    /// Take the envelope apart into its headers and payload.
    pub fn into_parts(self) -> (BTreeMap<String, String>, Option<Bytes>) {
        (self.headers, self.payload)
    }

    /// Derive a copy with `key` set to `value`, overriding any previous value.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Derive a copy without the header `key`.
    pub fn without_header(mut self, key: &str) -> Self {
        self.headers.remove(key);
        self
    }

    /// Derive a copy stamped with the given stream id.
    pub fn with_stream_id(self, stream_id: StreamId) -> Self {
        self.with_header(HEADER_STREAM_ID, stream_id.to_string())
    }

    /// Whether the qualifier denotes a service error.
    pub fn is_error(&self) -> bool {
        self.error_code().is_some()
    }

    /// The error code embedded in an error qualifier.
    pub fn error_code(&self) -> Option<i32> {
        self.qualifier()?
            .strip_prefix(ERROR_NAMESPACE)?
            .strip_prefix('/')?
            .parse()
            .ok()
    }

    /// Discard this envelope, releasing its payload buffer.
    ///
    /// Every point that drops an inbound envelope without delivering it calls this so the release
    /// is visible at the call site.
    pub fn release(self) {
        if let Some(payload) = self.payload {
            tracing::trace!(len = payload.len(), "Releasing discarded payload");
            drop(payload);
        }
    }
}

/// Builder for [`Envelope`].
#[derive(Debug, Default, Clone)]
pub struct EnvelopeBuilder {
    headers: BTreeMap<String, String>,
    payload: Option<Bytes>,
}

impl EnvelopeBuilder {
    pub fn qualifier(self, qualifier: impl Into<String>) -> Self {
        self.header(HEADER_QUALIFIER, qualifier)
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn headers<K, V>(mut self, headers: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.headers
            .extend(headers.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn data_format(self, content_type: impl Into<String>) -> Self {
        self.header(HEADER_DATA_FORMAT, content_type)
    }

    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn maybe_payload(mut self, payload: Option<Bytes>) -> Self {
        self.payload = payload;
        self
    }

    pub fn build(self) -> Envelope {
        Envelope {
            headers: self.headers,
            payload: self.payload,
        }
    }
}
