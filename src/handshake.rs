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

//! Handshake records and the client-side negotiator.
//!
//! Peers negotiate which protocol they speak by exchanging fingerprints
//! on (some) requests and responses. The request carries the client's
//! fingerprint, the fingerprint it believes the server has, and
//! optionally the full protocol text; the response reports how much the
//! server recognized ([`HandshakeMatch`]) and, when needed, the server's
//! own protocol. Out-of-band metadata (trace context) rides in the
//! `meta` map of both records.
//!
//! [`ClientNegotiator`] keeps the bridge's view of the exchange: the
//! mapping from its own fingerprint to the server's, and the services
//! learned from responses.

use crate::codec::framing::HandshakeCodec;
use crate::codec::types::{self, Reader};
use crate::error::{NettyError, WireError};
use crate::service::{Fingerprint, Service};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::Arc;

/// How much of a handshake request the server recognized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeMatch {
    /// Both fingerprints were recognized; nothing more to exchange.
    Both,
    /// The client was recognized but did not know the server's
    /// fingerprint; the response carries the server's protocol.
    Client,
    /// The client was not recognized; it must retry with its protocol
    /// text attached.
    None,
}

impl HandshakeMatch {
    const SYMBOLS: i64 = 3;

    fn index(self) -> i64 {
        match self {
            Self::Both => 0,
            Self::Client => 1,
            Self::None => 2,
        }
    }

    fn from_index(index: i64) -> Self {
        match index {
            0 => Self::Both,
            1 => Self::Client,
            _ => Self::None,
        }
    }
}

/// The handshake record attached to requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Fingerprint of the client's protocol.
    pub client_hash: Fingerprint,
    /// The client's protocol text; attached only on mismatch retries.
    pub client_protocol: Option<String>,
    /// The fingerprint the client believes the server has.
    pub server_hash: Fingerprint,
    /// Out-of-band metadata, notably trace context.
    pub meta: HashMap<String, Bytes>,
}

impl HandshakeRequest {
    /// Encodes the record into its wire form.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        types::write_fixed16(&mut buf, self.client_hash.as_bytes());
        types::write_union_branch(&mut buf, self.client_protocol.is_some());
        if let Some(protocol) = &self.client_protocol {
            types::write_string(&mut buf, protocol);
        }
        types::write_fixed16(&mut buf, self.server_hash.as_bytes());
        types::write_union_branch(&mut buf, !self.meta.is_empty());
        if !self.meta.is_empty() {
            types::write_map_bytes(&mut buf, &self.meta);
        }
        buf.freeze()
    }
}

impl HandshakeCodec for HandshakeRequest {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, WireError> {
        let client_hash = Fingerprint::from_bytes(reader.read_fixed16("client hash")?);
        let client_protocol = if reader.read_union_branch("client protocol")? {
            Some(reader.read_string("client protocol")?.to_owned())
        } else {
            None
        };
        let server_hash = Fingerprint::from_bytes(reader.read_fixed16("server hash")?);
        let meta = if reader.read_union_branch("handshake meta")? {
            reader.read_map_bytes("handshake meta")?
        } else {
            HashMap::new()
        };
        Ok(Self {
            client_hash,
            client_protocol,
            server_hash,
            meta,
        })
    }
}

/// The handshake record attached to responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// How much the server recognized.
    pub match_: HandshakeMatch,
    /// The server's protocol text, when the client needs it.
    pub server_protocol: Option<String>,
    /// The server's fingerprint, when the client needs it.
    pub server_hash: Option<Fingerprint>,
    /// Out-of-band metadata.
    pub meta: HashMap<String, Bytes>,
}

impl HandshakeResponse {
    /// A bare response reporting only the match kind.
    #[must_use]
    pub fn matched(match_: HandshakeMatch) -> Self {
        Self {
            match_,
            server_protocol: None,
            server_hash: None,
            meta: HashMap::new(),
        }
    }

    /// Attaches the server's protocol and fingerprint.
    #[must_use]
    pub fn with_service(mut self, svc: &Service) -> Self {
        self.server_protocol = Some(svc.text().to_owned());
        self.server_hash = Some(svc.hash());
        self
    }

    /// Encodes the record into its wire form.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        types::write_enum(&mut buf, self.match_.index());
        types::write_union_branch(&mut buf, self.server_protocol.is_some());
        if let Some(protocol) = &self.server_protocol {
            types::write_string(&mut buf, protocol);
        }
        types::write_union_branch(&mut buf, self.server_hash.is_some());
        if let Some(hash) = &self.server_hash {
            types::write_fixed16(&mut buf, hash.as_bytes());
        }
        types::write_union_branch(&mut buf, !self.meta.is_empty());
        if !self.meta.is_empty() {
            types::write_map_bytes(&mut buf, &self.meta);
        }
        buf.freeze()
    }
}

impl HandshakeCodec for HandshakeResponse {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, WireError> {
        let match_ = HandshakeMatch::from_index(
            reader.read_enum(HandshakeMatch::SYMBOLS, "handshake match")?,
        );
        let server_protocol = if reader.read_union_branch("server protocol")? {
            Some(reader.read_string("server protocol")?.to_owned())
        } else {
            None
        };
        let server_hash = if reader.read_union_branch("server hash")? {
            Some(Fingerprint::from_bytes(reader.read_fixed16("server hash")?))
        } else {
            None
        };
        let meta = if reader.read_union_branch("handshake meta")? {
            reader.read_map_bytes("handshake meta")?
        } else {
            HashMap::new()
        };
        Ok(Self {
            match_,
            server_protocol,
            server_hash,
            meta,
        })
    }
}

/// Client-side handshake state for one bridge.
///
/// Tracks, per client service, which server fingerprint corresponds to
/// it, and the services learned from handshake responses. A bridge can
/// carry calls for several client services (discovery first, business
/// calls after), so both caches are keyed by fingerprint. Not
/// synchronized; the owning bridge serializes access.
#[derive(Debug, Default)]
pub struct ClientNegotiator {
    hashes: HashMap<Fingerprint, Fingerprint>,
    server_services: HashMap<Fingerprint, Arc<Service>>,
}

impl ClientNegotiator {
    /// Creates an empty negotiator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the handshake for an outgoing request on `svc`.
    ///
    /// The server fingerprint falls back to the client's own while the
    /// server's is unknown; the protocol text is attached only when the
    /// previous response reported no match.
    #[must_use]
    pub fn outgoing(
        &self,
        svc: &Service,
        include_protocol: bool,
        meta: HashMap<String, Bytes>,
    ) -> HandshakeRequest {
        let client_hash = svc.hash();
        let server_hash = self.hashes.get(&client_hash).copied().unwrap_or(client_hash);
        HandshakeRequest {
            client_hash,
            client_protocol: include_protocol.then(|| svc.text().to_owned()),
            server_hash,
            meta,
        }
    }

    /// Absorbs a handshake response to a call on `svc`, updating the
    /// caches.
    ///
    /// A response carrying the server's protocol (or fingerprint) must
    /// parse; failure poisons the bridge.
    pub fn absorb(&mut self, svc: &Service, response: &HandshakeResponse) -> Result<(), NettyError> {
        if response.server_hash.is_none() && response.server_protocol.is_none() {
            return Ok(());
        }
        let text = response
            .server_protocol
            .as_deref()
            .ok_or(WireError::InvalidJson {
                what: "server protocol",
            })?;
        let server_svc = match response.server_hash {
            Some(hash) => Service::with_hash(text, hash)?,
            None => Service::from_protocol_text(text)?,
        };
        let server_hash = server_svc.hash();
        self.server_services
            .insert(server_hash, Arc::new(server_svc));
        self.hashes.insert(svc.hash(), server_hash);
        Ok(())
    }

    /// The server service that responses to calls on `svc` resolve to.
    ///
    /// Defaults to the client's own service while the server's is
    /// unknown.
    #[must_use]
    pub fn server_service(&self, svc: &Arc<Service>) -> Arc<Service> {
        self.hashes
            .get(&svc.hash())
            .and_then(|hash| self.server_services.get(hash))
            .cloned()
            .unwrap_or_else(|| Arc::clone(svc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc(name: &str) -> Arc<Service> {
        Arc::new(
            Service::from_protocol_text(&format!(r#"{{"protocol":"{}"}}"#, name)).unwrap(),
        )
    }

    fn decode_request(bytes: &[u8]) -> HandshakeRequest {
        let mut reader = Reader::new(bytes);
        let decoded = HandshakeRequest::decode(&mut reader).unwrap();
        assert!(reader.is_empty());
        decoded
    }

    fn decode_response(bytes: &[u8]) -> HandshakeResponse {
        let mut reader = Reader::new(bytes);
        let decoded = HandshakeResponse::decode(&mut reader).unwrap();
        assert!(reader.is_empty());
        decoded
    }

    #[test]
    fn test_request_minimal_layout() {
        let request = HandshakeRequest {
            client_hash: Fingerprint::from_bytes([1; 16]),
            client_protocol: None,
            server_hash: Fingerprint::from_bytes([2; 16]),
            meta: HashMap::new(),
        };
        let encoded = request.encode();
        // fixed16 + null branch + fixed16 + null branch
        assert_eq!(encoded.len(), 16 + 1 + 16 + 1);
        assert_eq!(encoded[16], 0x00);
        assert_eq!(*encoded.last().unwrap(), 0x00);
        assert_eq!(decode_request(&encoded), request);
    }

    #[test]
    fn test_request_roundtrip_with_protocol_and_meta() {
        let request = HandshakeRequest {
            client_hash: Fingerprint::from_bytes([3; 16]),
            client_protocol: Some(r#"{"protocol":"Echo"}"#.to_owned()),
            server_hash: Fingerprint::from_bytes([4; 16]),
            meta: HashMap::from([(
                "avro.trace.deadline".to_owned(),
                Bytes::from_static(&[0x02]),
            )]),
        };
        assert_eq!(decode_request(&request.encode()), request);
    }

    #[test]
    fn test_response_match_enum_layout() {
        for (match_, byte) in [
            (HandshakeMatch::Both, 0x00),
            (HandshakeMatch::Client, 0x02),
            (HandshakeMatch::None, 0x04),
        ] {
            let encoded = HandshakeResponse::matched(match_).encode();
            assert_eq!(encoded[0], byte);
            assert_eq!(decode_response(&encoded).match_, match_);
        }
    }

    #[test]
    fn test_response_roundtrip_with_service() {
        let server = svc("Echo");
        let response = HandshakeResponse::matched(HandshakeMatch::Client).with_service(&server);
        let decoded = decode_response(&response.encode());
        assert_eq!(decoded.server_hash, Some(server.hash()));
        assert_eq!(decoded.server_protocol.as_deref(), Some(server.text()));
    }

    #[test]
    fn test_truncated_request_is_an_error() {
        let request = HandshakeRequest {
            client_hash: Fingerprint::from_bytes([1; 16]),
            client_protocol: None,
            server_hash: Fingerprint::from_bytes([2; 16]),
            meta: HashMap::new(),
        };
        let encoded = request.encode();
        let mut reader = Reader::new(&encoded[..20]);
        assert!(HandshakeRequest::decode(&mut reader).is_err());
    }

    #[test]
    fn test_negotiator_falls_back_to_client_hash() {
        let negotiator = ClientNegotiator::new();
        let request = negotiator.outgoing(&svc("Echo"), false, HashMap::new());
        assert_eq!(request.client_hash, request.server_hash);
        assert!(request.client_protocol.is_none());
    }

    #[test]
    fn test_negotiator_attaches_protocol_on_retry() {
        let client = svc("Echo");
        let negotiator = ClientNegotiator::new();
        let request = negotiator.outgoing(&client, true, HashMap::new());
        assert_eq!(request.client_protocol.as_deref(), Some(client.text()));
    }

    #[test]
    fn test_negotiator_learns_server_service() {
        let client = svc("Echo");
        let server = svc("Echo2");
        let mut negotiator = ClientNegotiator::new();
        assert_eq!(negotiator.server_service(&client).hash(), client.hash());

        let response =
            HandshakeResponse::matched(HandshakeMatch::Client).with_service(&server);
        negotiator.absorb(&client, &response).unwrap();

        assert_eq!(negotiator.server_service(&client).hash(), server.hash());
        let request = negotiator.outgoing(&client, false, HashMap::new());
        assert_eq!(request.server_hash, server.hash());
        assert_eq!(request.client_hash, client.hash());
    }

    #[test]
    fn test_negotiator_keys_by_client_service() {
        let discovery = svc("Discovery");
        let echo = svc("Echo");
        let server = svc("EchoServer");
        let mut negotiator = ClientNegotiator::new();

        let response =
            HandshakeResponse::matched(HandshakeMatch::Client).with_service(&server);
        negotiator.absorb(&discovery, &response).unwrap();

        // Only the discovery mapping was learned.
        assert_eq!(negotiator.server_service(&discovery).hash(), server.hash());
        assert_eq!(negotiator.server_service(&echo).hash(), echo.hash());
    }

    #[test]
    fn test_negotiator_rejects_unparseable_server_protocol() {
        let mut negotiator = ClientNegotiator::new();
        let response = HandshakeResponse {
            match_: HandshakeMatch::Client,
            server_protocol: Some("not json".to_owned()),
            server_hash: None,
            meta: HashMap::new(),
        };
        assert!(negotiator.absorb(&svc("Echo"), &response).is_err());
    }

    #[test]
    fn test_negotiator_ignores_bare_responses() {
        let client = svc("Echo");
        let mut negotiator = ClientNegotiator::new();
        negotiator
            .absorb(&client, &HandshakeResponse::matched(HandshakeMatch::Both))
            .unwrap();
        assert_eq!(negotiator.server_service(&client).name(), "Echo");
    }
}
