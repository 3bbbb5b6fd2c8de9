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

//! Services, packets, and the routing seam.
//!
//! A [`Service`] is a named protocol declaration with a 16-byte
//! fingerprint; the transport treats services as opaque tokens keyed by
//! that fingerprint. A [`Router`] owns the services one side exposes and
//! the [`Channel`] that calls flow through: on a gateway the channel is
//! the business handler, on a client it is the bridge itself.

use crate::error::{NettyError, WireError};
use crate::trace::Trace;
use async_trait::async_trait;
use bytes::Bytes;
use md5::{Digest, Md5};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::mpsc;

/// Protocol text of the well-known discovery service.
pub const DISCOVERY_PROTOCOL: &str = r#"{"protocol":"avro.netty.DiscoveryService"}"#;

/// Response header carrying a gateway's protocol list, as a JSON array.
pub const HEADER_PROTOCOLS: &str = "avro.protocols";

/// A 16-byte protocol fingerprint.
///
/// Computed as the MD5 digest of the canonical protocol text; treated
/// as opaque everywhere else.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 16]);

impl Fingerprint {
    /// Wraps raw fingerprint bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Fingerprints a protocol text.
    #[must_use]
    pub fn of(text: &str) -> Self {
        let digest = Md5::digest(text.as_bytes());
        Self(digest.into())
    }

    /// The raw fingerprint bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

/// A named protocol with a stable fingerprint.
///
/// Services are immutable once built and shared as `Arc<Service>`. The
/// stored text is the canonical (sorted-key) JSON rendering, so both
/// peers derive identical fingerprints from equivalent declarations.
#[derive(Debug, Clone)]
pub struct Service {
    name: String,
    protocol: Value,
    text: String,
    hash: Fingerprint,
}

impl Service {
    /// Builds a service from a protocol JSON text.
    ///
    /// The declaration must carry a `"protocol"` name field. The
    /// fingerprint is computed from the canonical rendering.
    pub fn from_protocol_text(text: &str) -> Result<Self, WireError> {
        let protocol: Value = serde_json::from_str(text)
            .map_err(|_| WireError::InvalidJson {
                what: "protocol declaration",
            })?;
        Self::from_protocol(protocol)
    }

    /// Builds a service from an already-parsed protocol declaration.
    pub fn from_protocol(protocol: Value) -> Result<Self, WireError> {
        let name = protocol
            .get("protocol")
            .and_then(Value::as_str)
            .ok_or(WireError::InvalidJson {
                what: "protocol name",
            })?
            .to_owned();
        let text = protocol.to_string();
        let hash = Fingerprint::of(&text);
        Ok(Self {
            name,
            protocol,
            text,
            hash,
        })
    }

    /// Builds a service whose fingerprint was learned from the wire
    /// rather than computed.
    pub fn with_hash(text: &str, hash: Fingerprint) -> Result<Self, WireError> {
        let mut svc = Self::from_protocol_text(text)?;
        svc.hash = hash;
        Ok(svc)
    }

    /// The well-known discovery service.
    #[must_use]
    pub fn discovery() -> Arc<Self> {
        static DISCOVERY: OnceLock<Arc<Service>> = OnceLock::new();
        Arc::clone(DISCOVERY.get_or_init(|| {
            Arc::new(Self::from_protocol_text(DISCOVERY_PROTOCOL).expect("static protocol text"))
        }))
    }

    /// The protocol name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The parsed protocol declaration.
    #[must_use]
    pub fn protocol(&self) -> &Value {
        &self.protocol
    }

    /// The canonical protocol text.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The protocol fingerprint.
    #[must_use]
    pub fn hash(&self) -> Fingerprint {
        self.hash
    }
}

/// One request or response in memory.
#[derive(Debug, Clone)]
pub struct Packet {
    /// The call id; assigned by the bridge on requests.
    pub id: i32,
    /// The service this packet belongs to.
    pub service: Arc<Service>,
    /// Out-of-band headers.
    pub headers: HashMap<String, Bytes>,
    /// The raw business payload.
    pub body: Bytes,
}

impl Packet {
    /// Creates a packet with no headers and an unassigned id.
    #[must_use]
    pub fn new(service: Arc<Service>, body: Bytes) -> Self {
        Self {
            id: 0,
            service,
            headers: HashMap::new(),
            body,
        }
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: Bytes) -> Self {
        self.headers.insert(key.into(), value);
        self
    }
}

/// Something calls can be forwarded into.
///
/// Gateways hand decoded requests to the router's channel; a client
/// router's channel is the bridge, which ships the call to the peer.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Issues a call and resolves with the matching response.
    async fn call(&self, trace: &Trace, request: Packet) -> Result<Packet, NettyError>;
}

/// Connection-scoped notifications from a router's transport.
#[derive(Debug, Clone)]
pub enum RouterEvent {
    /// A connection-scoped failure; the connection is gone.
    Error(Arc<NettyError>),
    /// The transport closed.
    Close,
}

/// A set of services and the channel that serves them.
pub struct Router {
    services: Vec<Arc<Service>>,
    channel: Arc<dyn Channel>,
    events_tx: mpsc::UnboundedSender<RouterEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<RouterEvent>>>,
}

impl Router {
    /// Creates a router over the given services and channel.
    #[must_use]
    pub fn new(services: Vec<Arc<Service>>, channel: Arc<dyn Channel>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            services,
            channel,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// The services this router exposes.
    #[must_use]
    pub fn services(&self) -> &[Arc<Service>] {
        &self.services
    }

    /// The channel calls are forwarded into.
    #[must_use]
    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    /// Resolves the service matching a client's service.
    ///
    /// Resolution is by protocol name; a router exposing exactly one
    /// service answers for any client.
    #[must_use]
    pub fn service(&self, client_svc: &Service) -> Option<Arc<Service>> {
        self.services
            .iter()
            .find(|svc| svc.name() == client_svc.name())
            .cloned()
            .or_else(|| match self.services.as_slice() {
                [only] => Some(Arc::clone(only)),
                _ => None,
            })
    }

    /// Emits a connection-scoped event to whoever is listening.
    pub fn emit(&self, event: RouterEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Takes the event receiver; `None` after the first call.
    #[must_use]
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<RouterEvent>> {
        self.events_rx.lock().expect("events lock poisoned").take()
    }

    pub(crate) fn event_sender(&self) -> mpsc::UnboundedSender<RouterEvent> {
        self.events_tx.clone()
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("services", &self.services.iter().map(|s| s.name()).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
