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

//! Codec property tests: encode-then-decode identity and chunking
//! invariance for whole message streams.

use avro_netty::codec::{encode_message, encode_payload, MessageDecoder};
use avro_netty::handshake::{HandshakeMatch, HandshakeRequest, HandshakeResponse};
use avro_netty::{Fingerprint, WireError};
use bytes::Bytes;
use std::collections::HashMap;

fn sample_requests() -> Vec<(i32, Option<HandshakeRequest>, HashMap<String, Bytes>, Bytes)> {
    let full = HandshakeRequest {
        client_hash: Fingerprint::from_bytes([1; 16]),
        client_protocol: Some(r#"{"protocol":"Echo"}"#.to_owned()),
        server_hash: Fingerprint::from_bytes([2; 16]),
        meta: HashMap::from([(
            "avro.trace.deadline".to_owned(),
            Bytes::from_static(&[0x80, 0x04]),
        )]),
    };
    let bare = HandshakeRequest {
        client_hash: Fingerprint::from_bytes([3; 16]),
        client_protocol: None,
        server_hash: Fingerprint::from_bytes([3; 16]),
        meta: HashMap::new(),
    };
    vec![
        (
            1,
            Some(full),
            HashMap::from([("k".to_owned(), Bytes::from_static(b"v"))]),
            Bytes::from_static(b"\x00first"),
        ),
        (2, Some(bare), HashMap::new(), Bytes::from_static(b"\x00")),
        (
            i32::MAX,
            None,
            HashMap::new(),
            Bytes::from_static(b"\x00third body"),
        ),
    ]
}

fn encode_stream(
    messages: &[(i32, Option<HandshakeRequest>, HashMap<String, Bytes>, Bytes)],
) -> Vec<u8> {
    let mut stream = Vec::new();
    for (id, handshake, headers, body) in messages {
        let payload = encode_payload(headers, body);
        let encoded = encode_message(
            *id,
            handshake.as_ref().map(|hs| hs.encode()).as_deref(),
            &payload,
        );
        stream.extend_from_slice(&encoded);
    }
    stream
}

#[test]
fn encode_then_decode_is_identity() {
    let messages = sample_requests();
    let stream = encode_stream(&messages);

    let mut decoder = MessageDecoder::<HandshakeRequest>::new();
    let mut decoded = Vec::new();
    decoder.feed(&stream, &mut decoded).unwrap();
    decoder.finish().unwrap();

    assert_eq!(decoded.len(), messages.len());
    for (message, (id, handshake, headers, body)) in decoded.iter().zip(&messages) {
        assert_eq!(message.id, *id);
        assert_eq!(&message.handshake, handshake);
        assert_eq!(&message.headers, headers);
        assert_eq!(&message.body, body);
    }
}

#[test]
fn chunking_does_not_change_the_decoded_stream() {
    let messages = sample_requests();
    let stream = encode_stream(&messages);

    // Every split point, two chunks.
    for split in 0..stream.len() {
        let mut decoder = MessageDecoder::<HandshakeRequest>::new();
        let mut decoded = Vec::new();
        decoder.feed(&stream[..split], &mut decoded).unwrap();
        decoder.feed(&stream[split..], &mut decoded).unwrap();
        decoder.finish().unwrap();
        assert_eq!(decoded.len(), messages.len(), "split at {}", split);
        for (message, (id, ..)) in decoded.iter().zip(&messages) {
            assert_eq!(message.id, *id);
        }
    }

    // One byte at a time.
    let mut decoder = MessageDecoder::<HandshakeRequest>::new();
    let mut decoded = Vec::new();
    for byte in &stream {
        decoder.feed(std::slice::from_ref(byte), &mut decoded).unwrap();
    }
    decoder.finish().unwrap();
    assert_eq!(decoded.len(), messages.len());
}

#[test]
fn response_stream_sticky_downgrade() {
    let with_handshake = {
        let payload = encode_payload(&HashMap::new(), b"\x00one");
        encode_message(
            1,
            Some(&HandshakeResponse::matched(HandshakeMatch::Both).encode()),
            &payload,
        )
    };
    let without_handshake = {
        let payload = encode_payload(&HashMap::new(), b"\x00two");
        encode_message(2, None, &payload)
    };

    let mut decoder = MessageDecoder::<HandshakeResponse>::new();
    let mut decoded = Vec::new();
    decoder.feed(&with_handshake, &mut decoded).unwrap();
    assert!(decoder.expects_handshake());

    decoder.feed(&without_handshake, &mut decoded).unwrap();
    assert!(!decoder.expects_handshake());

    assert_eq!(decoded.len(), 2);
    assert!(decoded[0].handshake.is_some());
    assert!(decoded[1].handshake.is_none());
    assert_eq!(decoded[1].body.as_ref(), b"\x00two");
}

#[test]
fn trailing_bytes_at_end_of_stream_are_reported() {
    let payload = encode_payload(&HashMap::new(), b"\x00ok");
    let mut stream = encode_message(1, None, &payload).to_vec();
    stream.extend_from_slice(&[0xAA, 0xBB, 0xCC]);

    let mut decoder = MessageDecoder::<HandshakeRequest>::new();
    let mut decoded = Vec::new();
    decoder.feed(&stream, &mut decoded).unwrap();
    assert_eq!(decoded.len(), 1);

    match decoder.finish().unwrap_err() {
        WireError::TrailingData { bytes } => assert_eq!(bytes, vec![0xAA, 0xBB, 0xCC]),
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn fewer_than_eight_bytes_is_quiet() {
    let mut decoder = MessageDecoder::<HandshakeRequest>::new();
    let mut decoded = Vec::new();
    decoder.feed(&[0, 0, 0, 1, 0, 0, 0], &mut decoded).unwrap();
    assert!(decoded.is_empty());
}
