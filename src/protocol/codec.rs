use super::header::{FrameHeader, FrameTag, UnknownFrameTag, FRAME_HEADER_LEN};
use super::messages::{CompletionMessage, ProtocolMessage};

use std::mem;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_utils::SegmentedBuf;
use prost::Message;

#[derive(Debug, thiserror::Error)]
pub enum DecodingError {
    #[error("cannot decode frame {0:?}: {1:?}")]
    DecodeMessage(FrameTag, #[source] prost::DecodeError),
    #[error("this execution diverged from the recorded journal at index {entry_index}: the previous run recorded a '{recorded}' entry, this run asked for '{requested}'. Durable handlers must take the same path on every execution.")]
    EntryTypeMismatch {
        entry_index: i64,
        recorded: FrameTag,
        requested: FrameTag,
    },
    #[error(transparent)]
    UnknownFrameTag(#[from] UnknownFrameTag),
}

// --- Frame encoder

pub struct Encoder {}

impl Encoder {
    pub fn new() -> Self {
        Self {}
    }

    /// Encodes a protocol message to a single framed buffer.
    pub fn encode<M: ProtocolMessage>(&self, msg: &M) -> Bytes {
        self.encode_with_tag(M::TAG, msg)
    }

    /// Encodes an arbitrary payload under an explicit tag. Needed for
    /// completion notifications, which share one payload template across tags.
    pub fn encode_with_tag<M: prost::Message>(&self, tag: FrameTag, msg: &M) -> Bytes {
        let len = msg.encoded_len();
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + len);
        let header = FrameHeader::new(tag, len as u32);
        buf.put_u16(header.raw_tag());
        buf.put_u32(header.frame_length());
        msg.encode(&mut buf)
            .expect("encoding into a pre-sized buffer cannot fail");
        buf.freeze()
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

// --- Frame decoder

/// A decoded frame: header plus payload slice. The payload stays untouched
/// until the consumer decides which message type to decode it to.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame(FrameHeader, Bytes);

impl RawFrame {
    /// The raw tag id, which may be unknown to this protocol version.
    pub fn raw_tag(&self) -> u16 {
        self.0.raw_tag()
    }

    pub fn tag(&self) -> Result<FrameTag, UnknownFrameTag> {
        self.0.tag()
    }

    pub fn decode_to<M: ProtocolMessage>(self, entry_index: i64) -> Result<M, DecodingError> {
        let tag = self.tag()?;
        if tag != M::TAG {
            return Err(DecodingError::EntryTypeMismatch {
                entry_index,
                recorded: tag,
                requested: M::TAG,
            });
        }
        M::decode(self.1).map_err(|e| DecodingError::DecodeMessage(tag, e))
    }

    pub fn decode_as_completion(self) -> Result<CompletionMessage, DecodingError> {
        let tag = self.tag()?;
        debug_assert!(tag.is_completion());
        CompletionMessage::decode(self.1).map_err(|e| DecodingError::DecodeMessage(tag, e))
    }
}

/// Stateful decoder turning a chunked byte stream into [`RawFrame`]s.
pub struct Decoder {
    buf: SegmentedBuf<Bytes>,
    state: DecoderState,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buf: SegmentedBuf::new(),
            state: DecoderState::WaitingHeader,
        }
    }

    /// Concatenate a new chunk in the internal buffer.
    pub fn push(&mut self, buf: Bytes) {
        self.buf.push(buf)
    }

    /// Try to consume the next frame in the internal buffer.
    pub fn consume_next(&mut self) -> Option<RawFrame> {
        loop {
            if self.buf.remaining() < self.state.needs_bytes() {
                return None;
            }

            if let Some(res) = self.state.decode(&mut self.buf) {
                return Some(res);
            }
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
enum DecoderState {
    #[default]
    WaitingHeader,
    WaitingPayload(FrameHeader),
}

impl DecoderState {
    fn needs_bytes(&self) -> usize {
        match self {
            DecoderState::WaitingHeader => FRAME_HEADER_LEN,
            DecoderState::WaitingPayload(h) => h.frame_length() as usize,
        }
    }

    fn decode(&mut self, mut buf: impl Buf) -> Option<RawFrame> {
        let mut res = None;

        *self = match mem::take(self) {
            DecoderState::WaitingHeader => {
                let tag = buf.get_u16();
                let length = buf.get_u32();
                DecoderState::WaitingPayload(FrameHeader::from_raw(tag, length))
            }
            DecoderState::WaitingPayload(h) => {
                let msg = RawFrame(h, buf.copy_to_bytes(h.frame_length() as usize));
                res = Some(msg);
                DecoderState::WaitingHeader
            }
        };

        res
    }
}
