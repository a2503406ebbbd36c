use super::error::{FrameError, RejectedFrame};
use super::{Envelope, HEADER_SIGNAL, HEADER_STREAM_ID, StreamId};

/// Control marker distinguishing control frames from data frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Complete,
    Error,
    Cancel,
}

impl Signal {
    /// The numeric code carried in the `sig` header.
    pub const fn code(self) -> u8 {
        match self {
            Self::Complete => 1,
            Self::Error => 2,
            Self::Cancel => 3,
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "1" => Some(Self::Complete),
            "2" => Some(Self::Error),
            "3" => Some(Self::Cancel),
            _ => None,
        }
    }
}

/// A multiplexed frame, discriminated by its signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A normal value.
    Data(Envelope),
    /// The stream ended successfully.
    Complete,
    /// The stream failed; the envelope carries the error qualifier and error data.
    Error(Envelope),
    /// The consumer is no longer interested in the stream.
    Cancel,
}

impl Frame {
    pub fn signal(&self) -> Option<Signal> {
        match self {
            Self::Data(_) => None,
            Self::Complete => Some(Signal::Complete),
            Self::Error(_) => Some(Signal::Error),
            Self::Cancel => Some(Signal::Cancel),
        }
    }

    /// Whether this frame ends the stream it belongs to.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Data(_))
    }
}

/// A [`Frame`] addressed to one logical stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub stream_id: StreamId,
    pub frame: Frame,
}

impl StreamFrame {
    pub fn new(stream_id: StreamId, frame: Frame) -> Self {
        Self { stream_id, frame }
    }

    pub fn data(stream_id: StreamId, envelope: Envelope) -> Self {
        Self::new(stream_id, Frame::Data(envelope))
    }

    pub fn complete(stream_id: StreamId) -> Self {
        Self::new(stream_id, Frame::Complete)
    }

    pub fn cancel(stream_id: StreamId) -> Self {
        Self::new(stream_id, Frame::Cancel)
    }

    pub fn error(stream_id: StreamId, envelope: Envelope) -> Self {
        Self::new(stream_id, Frame::Error(envelope))
    }

    /// Flatten into a wire envelope with `sid` and, for control frames, `sig` stamped.
    pub fn into_envelope(self) -> Envelope {
        let signal = self.frame.signal();
        let envelope = match self.frame {
            Frame::Data(envelope) | Frame::Error(envelope) => envelope,
            Frame::Complete | Frame::Cancel => Envelope::default(),
        };

        let envelope = envelope.with_stream_id(self.stream_id);
        match signal {
            Some(signal) => envelope.with_header(HEADER_SIGNAL, signal.code().to_string()),
            None => envelope.without_header(HEADER_SIGNAL),
        }
    }

    /// Lift a wire envelope into a frame by reading its `sid` and `sig` headers.
    ///
    /// The control headers are stripped from data and error envelopes.
    pub fn try_from_envelope(envelope: Envelope) -> Result<Self, RejectedFrame> {
        let stream_id = match envelope.header(HEADER_STREAM_ID) {
            None => {
                return Err(RejectedFrame {
                    error: FrameError::MissingStreamId,
                    envelope,
                });
            }
            Some(raw) => match raw.parse::<StreamId>() {
                Ok(stream_id) => stream_id,
                Err(_) => {
                    return Err(RejectedFrame {
                        error: FrameError::InvalidStreamId(raw.to_string()),
                        envelope,
                    });
                }
            },
        };

        let signal = match envelope.header(HEADER_SIGNAL) {
            None => None,
            Some(code) => match Signal::from_code(code) {
                Some(signal) => Some(signal),
                None => {
                    return Err(RejectedFrame {
                        error: FrameError::UnknownSignal {
                            stream_id,
                            code: code.to_string(),
                        },
                        envelope,
                    });
                }
            },
        };

        let envelope = envelope
            .without_header(HEADER_STREAM_ID)
            .without_header(HEADER_SIGNAL);

        let frame = match signal {
            None => Frame::Data(envelope),
            Some(Signal::Error) => Frame::Error(envelope),
            Some(Signal::Complete) => {
                envelope.release();
                Frame::Complete
            }
            Some(Signal::Cancel) => {
                envelope.release();
                Frame::Cancel
            }
        };

        Ok(Self { stream_id, frame })
    }
}
