use crate::envelope::StreamId;

/// Indicates that a second terminal event was delivered to a stream's result sink.
#[derive(Debug, thiserror::Error)]
#[error("the result sink of stream {stream_id} has already terminated")]
pub struct SinkAlreadyTerminated {
    pub stream_id: StreamId,
}

/// Indicates that a stream id is already registered on the session.
#[derive(Debug, thiserror::Error)]
#[error("stream {stream_id} is already registered")]
pub struct StreamAlreadyRegistered {
    pub stream_id: StreamId,
}
