//
// Copyright 2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Frame-group codec.
//!
//! A frame group is the wire unit of the transport: an 8-byte header of
//! call id and frame count (both big-endian i32), followed by that many
//! length-prefixed frames. One group carries exactly one request or one
//! response.
//!
//! # Wire format
//!
//! ```text
//! +-----------+------------------+----------------------------------+
//! | id (4)    | frame_count (4)  | frame_count × [len (4) | bytes]  |
//! +-----------+------------------+----------------------------------+
//! ```
//!
//! [`FrameDecoder`] is a resumable state machine: bytes can be fed in
//! arbitrary chunks and leftover bytes are buffered between calls.
//! [`MessageDecoder`] sits on top and parses each group's concatenated
//! frames into a handshake record (optional), a header map, and a body.
//! It starts out expecting a handshake and downgrades permanently the
//! first time a payload decodes cleanly without one; the transition is
//! one-way, so stateful peers that stop sending handshakes keep
//! decoding correctly.

use crate::codec::payload;
use crate::codec::types::Reader;
use crate::error::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::marker::PhantomData;

/// Maximum size of a single frame (16 MiB).
///
/// This limit bounds buffering on untrusted input; larger frames are a
/// wire error.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Size of the frame-group header: id plus frame count.
pub const GROUP_HEADER_SIZE: usize = 8;

/// A decoded frame group: a call id and its raw frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameGroup {
    /// The call id this group belongs to.
    pub id: i32,
    /// The group's frames, in wire order.
    pub frames: Vec<Bytes>,
}

impl FrameGroup {
    /// Concatenates the group's frames into one contiguous payload.
    #[must_use]
    pub fn payload(&self) -> Bytes {
        match self.frames.as_slice() {
            [single] => single.clone(),
            frames => {
                let mut buf = BytesMut::with_capacity(frames.iter().map(Bytes::len).sum());
                for frame in frames {
                    buf.extend_from_slice(frame);
                }
                buf.freeze()
            }
        }
    }
}

/// Encodes one message as a frame group.
///
/// The handshake record, when present, becomes the first frame; the
/// payload is always the last. The returned buffer is one contiguous
/// group, so a single write keeps groups atomic on the stream.
#[must_use]
pub fn encode_message(id: i32, handshake: Option<&[u8]>, payload: &[u8]) -> Bytes {
    let handshake_len = handshake.map_or(0, |hs| hs.len() + 4);
    let mut buf = BytesMut::with_capacity(GROUP_HEADER_SIZE + handshake_len + payload.len() + 4);
    buf.put_i32(id);
    match handshake {
        Some(hs) => {
            buf.put_i32(2);
            buf.put_i32(hs.len() as i32);
            buf.put_slice(hs);
        }
        None => buf.put_i32(1),
    }
    buf.put_i32(payload.len() as i32);
    buf.put_slice(payload);
    buf.freeze()
}

enum DecodeState {
    /// Waiting for the 8-byte group header.
    Header,
    /// Collecting `remaining` more frames for the group `id`.
    Frames {
        id: i32,
        remaining: i32,
        frames: Vec<Bytes>,
    },
}

/// Resumable decoder from raw bytes to [`FrameGroup`]s.
///
/// Feeding fewer bytes than a complete group buffers them and produces
/// nothing; parsing picks up where it left off on the next call. Calling
/// [`finish`](FrameDecoder::finish) at end of input reports buffered
/// leftovers as trailing data.
pub struct FrameDecoder {
    buf: BytesMut,
    state: DecodeState,
}

impl FrameDecoder {
    /// Creates an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(8192),
            state: DecodeState::Header,
        }
    }

    /// Feeds a chunk of bytes, appending every completed group to `out`.
    pub fn feed(&mut self, chunk: &[u8], out: &mut Vec<FrameGroup>) -> Result<(), WireError> {
        self.buf.extend_from_slice(chunk);
        loop {
            match &mut self.state {
                DecodeState::Header => {
                    if self.buf.len() < GROUP_HEADER_SIZE {
                        return Ok(());
                    }
                    let id = self.buf.get_i32();
                    let remaining = self.buf.get_i32();
                    if remaining < 0 {
                        return Err(WireError::NegativeLength {
                            len: i64::from(remaining),
                            what: "frame count",
                        });
                    }
                    self.state = DecodeState::Frames {
                        id,
                        remaining,
                        frames: Vec::with_capacity(remaining as usize),
                    };
                }
                DecodeState::Frames {
                    id,
                    remaining,
                    frames,
                } => {
                    if *remaining == 0 {
                        out.push(FrameGroup {
                            id: *id,
                            frames: std::mem::take(frames),
                        });
                        self.state = DecodeState::Header;
                        continue;
                    }
                    if self.buf.len() < 4 {
                        return Ok(());
                    }
                    let len = i32::from_be_bytes(self.buf[..4].try_into().expect("4-byte slice"));
                    if len < 0 {
                        return Err(WireError::NegativeLength {
                            len: i64::from(len),
                            what: "frame length",
                        });
                    }
                    let len = len as usize;
                    if len > MAX_FRAME_SIZE {
                        return Err(WireError::FrameTooLarge {
                            size: len,
                            max: MAX_FRAME_SIZE,
                        });
                    }
                    if self.buf.len() < 4 + len {
                        return Ok(());
                    }
                    self.buf.advance(4);
                    frames.push(self.buf.split_to(len).freeze());
                    *remaining -= 1;
                }
            }
        }
    }

    /// Checks for buffered leftovers at end of input.
    ///
    /// A partial header or partially-collected group means the stream
    /// ended mid-message; the leftover bytes are attached for
    /// diagnostics.
    pub fn finish(&self) -> Result<(), WireError> {
        let mid_group = matches!(self.state, DecodeState::Frames { .. });
        if mid_group || !self.buf.is_empty() {
            return Err(WireError::TrailingData {
                bytes: self.buf.to_vec(),
            });
        }
        Ok(())
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decoding for a handshake record, one direction of the exchange.
///
/// Implemented by the handshake request (seen by gateways) and the
/// handshake response (seen by bridges).
pub trait HandshakeCodec: Sized + Send + std::fmt::Debug {
    /// Decodes one record from the reader, leaving the cursor on the
    /// first byte after it.
    fn decode(reader: &mut Reader<'_>) -> Result<Self, WireError>;
}

/// One fully-decoded message from the stream.
#[derive(Debug)]
pub struct Message<H> {
    /// The call id from the frame-group header.
    pub id: i32,
    /// The handshake record, when the peer sent one.
    pub handshake: Option<H>,
    /// The decoded header map.
    pub headers: HashMap<String, Bytes>,
    /// The raw business payload.
    pub body: Bytes,
}

/// Decoder from raw bytes to [`Message`]s.
///
/// Wraps a [`FrameDecoder`] and parses each group's payload. Payload
/// parsing is optimistic: while handshakes are expected, a failed parse
/// is retried without one, and the first clean no-handshake decode
/// downgrades the decoder for good.
pub struct MessageDecoder<H> {
    frames: FrameDecoder,
    expect_handshake: bool,
    _marker: PhantomData<H>,
}

impl<H: HandshakeCodec> MessageDecoder<H> {
    /// Creates a decoder that expects a handshake on the first message.
    #[must_use]
    pub fn new() -> Self {
        Self {
            frames: FrameDecoder::new(),
            expect_handshake: true,
            _marker: PhantomData,
        }
    }

    /// Returns `true` while the decoder still expects handshake records.
    #[must_use]
    pub fn expects_handshake(&self) -> bool {
        self.expect_handshake
    }

    /// Feeds a chunk of bytes, appending every completed message to `out`.
    pub fn feed(&mut self, chunk: &[u8], out: &mut Vec<Message<H>>) -> Result<(), WireError> {
        let mut groups = Vec::new();
        self.frames.feed(chunk, &mut groups)?;
        for group in groups {
            out.push(self.decode_group(&group)?);
        }
        Ok(())
    }

    /// Checks for buffered leftovers at end of input.
    pub fn finish(&self) -> Result<(), WireError> {
        self.frames.finish()
    }

    fn decode_group(&mut self, group: &FrameGroup) -> Result<Message<H>, WireError> {
        let buf = group.payload();
        if self.expect_handshake {
            match Self::decode_payload(&buf, true) {
                Ok((handshake, headers, body)) => Ok(Message {
                    id: group.id,
                    handshake,
                    headers,
                    body,
                }),
                Err(err) => match Self::decode_payload(&buf, false) {
                    Ok((_, headers, body)) => {
                        // First clean decode without a handshake: downgrade
                        // for the rest of the connection.
                        self.expect_handshake = false;
                        Ok(Message {
                            id: group.id,
                            handshake: None,
                            headers,
                            body,
                        })
                    }
                    Err(_) => Err(err),
                },
            }
        } else {
            let (_, headers, body) = Self::decode_payload(&buf, false)?;
            Ok(Message {
                id: group.id,
                handshake: None,
                headers,
                body,
            })
        }
    }

    #[allow(clippy::type_complexity)]
    fn decode_payload(
        buf: &[u8],
        with_handshake: bool,
    ) -> Result<(Option<H>, HashMap<String, Bytes>, Bytes), WireError> {
        let mut reader = Reader::new(buf);
        let handshake = if with_handshake {
            Some(H::decode(&mut reader)?)
        } else {
            None
        };
        let (headers, body) = payload::decode_payload(&mut reader)?;
        Ok((handshake, headers, body))
    }
}

impl<H: HandshakeCodec> Default for MessageDecoder<H> {
    fn default() -> Self {
        Self::new()
    }
}
