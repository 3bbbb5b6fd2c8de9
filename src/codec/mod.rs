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

//! Wire codec layer.
//!
//! Three pieces, bottom up:
//!
//! - [`types`]: the binary primitives the handshake and payload schemas
//!   are built from (zigzag longs, strings, fixeds, maps, unions).
//! - [`framing`]: frame-group encoding and the resumable decoder state
//!   machine, including the message-level decoder with its one-way
//!   handshake downgrade.
//! - [`payload`]: the header-map + body payload codec and system-error
//!   payload synthesis.
//!
//! Everything in this layer is pure stream transformation; no I/O
//! happens here.

pub mod framing;
pub mod payload;
pub mod types;

pub use framing::{
    encode_message, FrameDecoder, FrameGroup, HandshakeCodec, Message, MessageDecoder,
    GROUP_HEADER_SIZE, MAX_FRAME_SIZE,
};
pub use payload::{
    decode_payload, decode_system_error, encode_payload, encode_system_error, EMPTY_RESPONSE_BODY,
    SYSTEM_ERROR_PREFIX,
};
