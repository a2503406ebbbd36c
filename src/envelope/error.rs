//! Error types for lifting envelopes into multiplexed frames.

use super::{Envelope, StreamId};

/// Why an envelope could not be read as a [`StreamFrame`](super::StreamFrame).
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame has no stream id")]
    MissingStreamId,

    #[error("invalid stream id '{0}'")]
    InvalidStreamId(String),

    #[error("unknown signal code '{code}' on stream {stream_id}")]
    UnknownSignal { stream_id: StreamId, code: String },
}

impl FrameError {
    /// The stream the rejected frame belongs to, when it could be determined.
    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            Self::UnknownSignal { stream_id, .. } => Some(*stream_id),
            Self::MissingStreamId | Self::InvalidStreamId(_) => None,
        }
    }
}

/// An envelope that could not be lifted into a frame, handed back so its payload can be released.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct RejectedFrame {
    pub error: FrameError,
    pub envelope: Envelope,
}
