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

//! Packet payload codec.
//!
//! A payload is a header map (string keys, byte values) followed by the
//! raw business body. The body's interpretation belongs to the layers
//! above; the transport only materializes it as bytes.
//!
//! System-error payloads are synthesized here too: the body starts with
//! the two discriminator bytes `0x01 0x00` ("error union, system-error
//! branch") followed by the encoded error record. Both bytes are
//! mandatory and bit-exact on the wire.

use crate::codec::types::{self, Reader};
use crate::error::{SystemError, WireError};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;

/// The one-byte body of an empty, error-free response.
pub const EMPTY_RESPONSE_BODY: &[u8] = &[0x00];

/// The discriminator prefix of a system-error body.
pub const SYSTEM_ERROR_PREFIX: &[u8] = &[0x01, 0x00];

/// Encodes a header map and body into one payload buffer.
#[must_use]
pub fn encode_payload(headers: &HashMap<String, Bytes>, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(body.len() + 16);
    types::write_map_bytes(&mut buf, headers);
    buf.put_slice(body);
    buf.freeze()
}

/// Decodes a payload from the reader's current position.
///
/// Everything after the header map is the body.
pub fn decode_payload(reader: &mut Reader<'_>) -> Result<(HashMap<String, Bytes>, Bytes), WireError> {
    let headers = reader.read_map_bytes("request headers")?;
    let body = Bytes::copy_from_slice(reader.remaining());
    Ok((headers, body))
}

/// Encodes a system error into a full payload.
///
/// Response headers, when provided, travel ahead of the discriminator so
/// the caller still receives them alongside the failure.
#[must_use]
pub fn encode_system_error(err: &SystemError, headers: Option<&HashMap<String, Bytes>>) -> Bytes {
    let mut buf = BytesMut::new();
    match headers {
        Some(headers) => types::write_map_bytes(&mut buf, headers),
        None => types::write_map_bytes(&mut buf, &HashMap::new()),
    }
    buf.put_slice(SYSTEM_ERROR_PREFIX);
    types::write_string(&mut buf, err.code());
    types::write_string(&mut buf, err.message());
    buf.freeze()
}

/// Extracts the system error from a body, if it carries one.
///
/// Returns `None` for bodies that do not start with the system-error
/// discriminator; a body that does but is cut short is a wire error.
pub fn decode_system_error(body: &[u8]) -> Result<Option<SystemError>, WireError> {
    if !body.starts_with(SYSTEM_ERROR_PREFIX) {
        return Ok(None);
    }
    let mut reader = Reader::new(&body[SYSTEM_ERROR_PREFIX.len()..]);
    let code = reader.read_string("system error code")?.to_owned();
    let message = reader.read_string("system error message")?.to_owned();
    Ok(Some(SystemError::new(code, message)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;

    #[test]
    fn test_payload_roundtrip() {
        let mut headers = HashMap::new();
        headers.insert("avro.protocols".to_owned(), Bytes::from_static(b"[]"));
        let encoded = encode_payload(&headers, b"body-bytes");

        let mut reader = Reader::new(&encoded);
        let (decoded_headers, body) = decode_payload(&mut reader).unwrap();
        assert_eq!(decoded_headers, headers);
        assert_eq!(body.as_ref(), b"body-bytes");
    }

    #[test]
    fn test_empty_headers_single_terminator() {
        let encoded = encode_payload(&HashMap::new(), &[0x00]);
        assert_eq!(&encoded[..], &[0x00, 0x00]);
    }

    #[test]
    fn test_truncated_headers() {
        // A block count of 1 with no entry behind it.
        let err = decode_payload(&mut Reader::new(&[0x02])).unwrap_err();
        assert_eq!(err.to_string(), "truncated request headers");
    }

    #[test]
    fn test_system_error_prefix_is_bit_exact() {
        let err = SystemError::new(codes::UNKNOWN_CLIENT_PROTOCOL, "retry with protocol");
        let encoded = encode_system_error(&err, None);
        // Empty header map, then the mandatory discriminator bytes.
        assert_eq!(&encoded[..3], &[0x00, 0x01, 0x00]);
    }

    #[test]
    fn test_system_error_roundtrip_with_headers() {
        let mut headers = HashMap::new();
        headers.insert("k".to_owned(), Bytes::from_static(b"v"));
        let err = SystemError::new(codes::CHANNEL_FAILURE, "handler failed");
        let encoded = encode_system_error(&err, Some(&headers));

        let mut reader = Reader::new(&encoded);
        let (decoded_headers, body) = decode_payload(&mut reader).unwrap();
        assert_eq!(decoded_headers, headers);

        let decoded = decode_system_error(&body).unwrap().unwrap();
        assert_eq!(decoded, err);
    }

    #[test]
    fn test_non_error_body_is_not_a_system_error() {
        assert!(decode_system_error(EMPTY_RESPONSE_BODY).unwrap().is_none());
        assert!(decode_system_error(&[]).unwrap().is_none());
    }

    #[test]
    fn test_truncated_system_error_surfaces() {
        let err = decode_system_error(&[0x01, 0x00, 0x08]).unwrap_err();
        assert!(matches!(err, WireError::Truncated { .. }));
    }
}
