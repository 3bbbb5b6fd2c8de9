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

//! Error types for the transport.
//!
//! Errors are layered to match their blast radius:
//!
//! - [`WireError`]: codec-level failures (truncation, trailing bytes,
//!   oversized frames). Fatal to the affected connection.
//! - [`SystemError`]: errors that travel inside a system-error payload,
//!   identified by a stable code. A system error affects a single call;
//!   the connection stays up.
//! - [`NettyError`]: the unified error type returned by bridge and
//!   gateway operations, composing the layers above plus I/O failures
//!   and bridge teardown.

use bytes::Bytes;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::io;
use thiserror::Error;

/// Stable error codes carried in system-error payloads.
pub mod codes {
    /// The gateway does not recognize the client's protocol hash and no
    /// protocol text was supplied; the client should retry with one.
    pub const UNKNOWN_CLIENT_PROTOCOL: &str = "UNKNOWN_CLIENT_PROTOCOL";
    /// A call handler failed; the failure is relayed in the response.
    pub const CHANNEL_FAILURE: &str = "CHANNEL_FAILURE";
    /// A trace deadline elapsed before the call completed.
    pub const DEADLINE_EXCEEDED: &str = "DEADLINE_EXCEEDED";
    /// A trace was cancelled before the call completed.
    pub const CANCELLED: &str = "CANCELLED";
    /// The bridge was torn down while the call was in flight.
    pub const BRIDGE_DESTROYED: &str = "BRIDGE_DESTROYED";
}

/// An error identified by a stable code, suitable for the wire.
///
/// System errors are the only errors that cross the connection: they are
/// serialized into system-error payloads and reconstructed on the other
/// side. The code is a machine-readable discriminator (see [`codes`]);
/// the message is free-form context for humans. A handler can attach
/// response headers to the error; they travel in the response payload's
/// header map, ahead of the error record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemError {
    code: String,
    message: String,
    headers: HashMap<String, Bytes>,
}

impl SystemError {
    /// Creates a system error from a code and a message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            headers: HashMap::new(),
        }
    }

    /// Attaches response headers to carry alongside the error.
    #[must_use]
    pub fn with_headers(mut self, headers: HashMap<String, Bytes>) -> Self {
        self.headers = headers;
        self
    }

    /// Wraps an arbitrary error under the given code.
    ///
    /// If the error is already a [`NettyError::System`], it is returned
    /// unchanged so codes assigned closer to the failure are preserved.
    pub fn or_code(code: &str, err: NettyError) -> Self {
        match err {
            NettyError::System(e) => e,
            other => Self::new(code, other.to_string()),
        }
    }

    /// The stable error code.
    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }

    /// The human-readable message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The response headers travelling with this error.
    #[must_use]
    pub fn headers(&self) -> &HashMap<String, Bytes> {
        &self.headers
    }

    /// Returns `true` if this error carries the given code.
    #[must_use]
    pub fn is(&self, code: &str) -> bool {
        self.code == code
    }
}

impl fmt::Display for SystemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl StdError for SystemError {}

/// Errors raised by the frame and payload codecs.
///
/// Any wire error is fatal to the connection it occurred on: the byte
/// stream can no longer be trusted to be aligned on a frame boundary.
#[derive(Debug, Error)]
pub enum WireError {
    /// The buffer ended in the middle of a value.
    #[error("truncated {what}")]
    Truncated {
        /// Which value was being decoded.
        what: &'static str,
    },

    /// The input ended with bytes that do not form a complete frame group.
    #[error("trailing data after last frame group ({} bytes)", bytes.len())]
    TrailingData {
        /// The leftover bytes, kept for diagnostics.
        bytes: Vec<u8>,
    },

    /// A frame advertised a size over the allowed maximum.
    #[error("frame of {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// The advertised frame size.
        size: usize,
        /// The configured maximum.
        max: usize,
    },

    /// A union value carried an index with no corresponding branch.
    #[error("invalid union branch {index}")]
    InvalidUnionBranch {
        /// The decoded branch index.
        index: i64,
    },

    /// An enum value carried an index outside the symbol range.
    #[error("invalid enum index {index}")]
    InvalidEnumIndex {
        /// The decoded enum index.
        index: i64,
    },

    /// A string value was not valid UTF-8.
    #[error("invalid utf-8 in string value")]
    InvalidUtf8,

    /// A value that must be a JSON document was not one.
    #[error("invalid json in {what}")]
    InvalidJson {
        /// Which value carried it.
        what: &'static str,
    },

    /// A length prefix was negative.
    #[error("negative length {len} for {what}")]
    NegativeLength {
        /// The decoded length.
        len: i64,
        /// Which value carried it.
        what: &'static str,
    },
}

/// Unified error type for bridge and gateway operations.
///
/// The variants mirror how far an error reaches:
///
/// - [`Wire`](NettyError::Wire) and [`Io`](NettyError::Io) poison the
///   connection and fan out to every pending call.
/// - [`System`](NettyError::System) affects exactly one call.
/// - [`Destroyed`](NettyError::Destroyed) is what pending calls observe
///   when the bridge is torn down underneath them.
#[derive(Debug)]
pub enum NettyError {
    /// A codec failure on the byte stream.
    Wire(WireError),

    /// An I/O failure on the underlying stream.
    Io(io::Error),

    /// An error scoped to a single call, carried as a system-error payload.
    System(SystemError),

    /// The bridge was destroyed while the call was pending, optionally
    /// with the error that triggered the teardown.
    Destroyed(Option<Box<NettyError>>),
}

impl NettyError {
    /// Returns `true` if this is a codec failure.
    #[must_use]
    pub const fn is_wire(&self) -> bool {
        matches!(self, Self::Wire(_))
    }

    /// Returns `true` if this error is scoped to a single call.
    #[must_use]
    pub const fn is_system(&self) -> bool {
        matches!(self, Self::System(_))
    }

    /// Returns `true` if the bridge was torn down under the call.
    #[must_use]
    pub const fn is_destroyed(&self) -> bool {
        matches!(self, Self::Destroyed(_))
    }

    /// Returns `true` if this error poisons the whole connection.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Wire(_) | Self::Io(_) | Self::Destroyed(_))
    }

    /// The system error inside this error, if any.
    #[must_use]
    pub fn as_system(&self) -> Option<&SystemError> {
        match self {
            Self::System(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for NettyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wire(e) => write!(f, "wire error: {}", e),
            Self::Io(e) => write!(f, "stream error: {}", e),
            Self::System(e) => write!(f, "system error: {}", e),
            Self::Destroyed(Some(cause)) => write!(f, "bridge destroyed: {}", cause),
            Self::Destroyed(None) => write!(f, "bridge destroyed"),
        }
    }
}

impl StdError for NettyError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Wire(e) => Some(e),
            Self::Io(e) => Some(e),
            Self::System(e) => Some(e),
            Self::Destroyed(Some(cause)) => Some(cause.as_ref()),
            Self::Destroyed(None) => None,
        }
    }
}

impl From<WireError> for NettyError {
    fn from(error: WireError) -> Self {
        Self::Wire(error)
    }
}

impl From<io::Error> for NettyError {
    fn from(error: io::Error) -> Self {
        Self::Io(error)
    }
}

impl From<SystemError> for NettyError {
    fn from(error: SystemError) -> Self {
        Self::System(error)
    }
}
