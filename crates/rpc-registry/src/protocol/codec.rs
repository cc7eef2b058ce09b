//! Resumable frame decoder and single-pass encoder

use super::{Envelope, HEADER_LENGTH, MAGIC, MessageKind, SerializerKind};
use crate::error::{DecodeError, Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Decoder progress. Each state consumes a fixed number of bytes and
/// carries whatever header fields have been read so far.
#[derive(Debug, Clone)]
enum State {
    Magic,
    Sign,
    Status {
        kind: MessageKind,
        serializer: SerializerKind,
    },
    Id {
        kind: MessageKind,
        serializer: SerializerKind,
    },
    BodyLength {
        kind: MessageKind,
        serializer: SerializerKind,
        sequence_id: i64,
    },
    Body {
        kind: MessageKind,
        serializer: SerializerKind,
        sequence_id: i64,
        length: usize,
    },
    Failed(DecodeError),
}

/// Per-connection frame decoder.
///
/// Bytes may be fed in arbitrary chunks; the decoder suspends between
/// header fields whenever it runs out of input and picks up where it left
/// off on the next call. Any decode error is sticky: once failed, the
/// decoder keeps returning the same error and the connection must be closed.
#[derive(Debug)]
pub struct FrameDecoder {
    state: State,
    buffer: BytesMut,
    accepts: &'static [MessageKind],
    max_body_length: usize,
}

impl FrameDecoder {
    /// Create a decoder that only admits the given message kinds
    pub fn new(accepts: &'static [MessageKind], max_body_length: usize) -> Self {
        Self {
            state: State::Magic,
            buffer: BytesMut::with_capacity(4096),
            accepts,
            max_body_length,
        }
    }

    /// Append raw bytes read from the transport
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Feed a chunk and drain every frame it completes
    pub fn decode_chunk(&mut self, data: &[u8]) -> std::result::Result<Vec<Envelope>, DecodeError> {
        self.feed(data);
        let mut frames = Vec::new();
        while let Some(envelope) = self.decode()? {
            frames.push(envelope);
        }
        Ok(frames)
    }

    /// Bytes buffered but not yet consumed
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Advance the state machine as far as the buffered input allows.
    ///
    /// Returns `Ok(None)` when more input is needed.
    pub fn decode(&mut self) -> std::result::Result<Option<Envelope>, DecodeError> {
        loop {
            match self.state.clone() {
                State::Failed(err) => return Err(err),
                State::Magic => {
                    if self.buffer.len() < 2 {
                        return Ok(None);
                    }
                    let magic = self.buffer.get_u16();
                    if magic != MAGIC {
                        return Err(self.fail(DecodeError::BadMagic(magic)));
                    }
                    self.state = State::Sign;
                }
                State::Sign => {
                    if self.buffer.is_empty() {
                        return Ok(None);
                    }
                    let sign = self.buffer.get_u8();
                    let kind = match MessageKind::from_code(sign & 0x0F) {
                        Ok(kind) => kind,
                        Err(err) => return Err(self.fail(err)),
                    };
                    if !self.accepts.contains(&kind) {
                        return Err(self.fail(DecodeError::UnexpectedKind(kind)));
                    }
                    let serializer = match SerializerKind::from_code(sign >> 4) {
                        Ok(serializer) => serializer,
                        Err(err) => return Err(self.fail(err)),
                    };
                    self.state = State::Status { kind, serializer };
                }
                State::Status { kind, serializer } => {
                    if self.buffer.is_empty() {
                        return Ok(None);
                    }
                    // reserved
                    self.buffer.advance(1);
                    self.state = State::Id { kind, serializer };
                }
                State::Id { kind, serializer } => {
                    if self.buffer.len() < 8 {
                        return Ok(None);
                    }
                    let sequence_id = self.buffer.get_i64();
                    self.state = State::BodyLength {
                        kind,
                        serializer,
                        sequence_id,
                    };
                }
                State::BodyLength {
                    kind,
                    serializer,
                    sequence_id,
                } => {
                    if self.buffer.len() < 4 {
                        return Ok(None);
                    }
                    let raw = self.buffer.get_i32();
                    let length = match usize::try_from(raw) {
                        Ok(length) if length <= self.max_body_length => length,
                        _ => {
                            return Err(self.fail(DecodeError::InvalidBodyLength {
                                length: raw,
                                max: self.max_body_length,
                            }));
                        }
                    };
                    self.state = State::Body {
                        kind,
                        serializer,
                        sequence_id,
                        length,
                    };
                }
                State::Body {
                    kind,
                    serializer,
                    sequence_id,
                    length,
                } => {
                    if self.buffer.len() < length {
                        return Ok(None);
                    }
                    let body = self.buffer.split_to(length).freeze();
                    self.state = State::Magic;
                    return Ok(Some(Envelope {
                        sequence_id,
                        kind,
                        serializer,
                        body,
                    }));
                }
            }
        }
    }

    fn fail(&mut self, err: DecodeError) -> DecodeError {
        self.buffer.clear();
        self.state = State::Failed(err.clone());
        err
    }
}

/// Encode an envelope into a single contiguous frame
pub fn encode(envelope: &Envelope) -> Result<Bytes> {
    let length = i32::try_from(envelope.body.len())
        .map_err(|_| Error::FrameTooLarge(envelope.body.len()))?;

    let mut frame = BytesMut::with_capacity(HEADER_LENGTH + envelope.body.len());
    frame.put_u16(MAGIC);
    frame.put_u8((envelope.serializer.code() << 4) | envelope.kind.code());
    frame.put_u8(0);
    frame.put_i64(envelope.sequence_id);
    frame.put_i32(length);
    frame.put_slice(&envelope.body);
    Ok(frame.freeze())
}
