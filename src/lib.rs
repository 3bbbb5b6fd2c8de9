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

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

//! # avro-netty — framed RPC transport for Avro services
//!
//! This crate implements the Netty-style wire protocol used by Avro
//! RPC: a bidirectional framed transport that multiplexes many
//! in-flight request/response calls over a single duplex byte stream,
//! negotiates which protocol the peers speak via 16-byte fingerprint
//! handshakes (with one retry on mismatch), and carries distributed
//! trace context — deadlines and labels — end to end in handshake
//! metadata.
//!
//! ## Architecture
//!
//! The crate is organized in layers, bottom up:
//!
//! - [`codec`]: pure stream transformation. Frame groups (id, frame
//!   count, length-prefixed frames), the resumable decoder state
//!   machine, and the packet payload codec.
//! - [`handshake`]: the fingerprint exchange records and the client's
//!   negotiation caches.
//! - [`service`] / [`trace`]: the entities the transport moves calls
//!   between — services keyed by protocol fingerprint, routers owning a
//!   [`Channel`], and trace contexts with deadlines, labels, and
//!   exactly-once delivery finalizers.
//! - [`bridge`]: the client side. One [`NettyBridge`] per connection,
//!   tracking pending calls by id and resolving each exactly once.
//! - [`gateway`]: the server side. One [`NettyGateway`] per router,
//!   accepting any number of connections.
//!
//! ## Quick start
//!
//! Serve a router on one end of a duplex stream and discover it from
//! the other:
//!
//! ```rust,no_run
//! use avro_netty::{netty_router, NettyGateway, Router, RouterOptions, Service};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example(
//! #     handler: Arc<dyn avro_netty::Channel>,
//! #     server_side: tokio::io::DuplexStream,
//! #     client_side: tokio::io::DuplexStream,
//! # ) -> Result<(), avro_netty::NettyError> {
//! // Server: a gateway serving one Echo service.
//! let echo = Arc::new(Service::from_protocol_text(r#"{"protocol":"Echo"}"#)?);
//! let router = Arc::new(Router::new(vec![echo], handler));
//! let gateway = NettyGateway::new(router);
//! let (reader, writer) = tokio::io::split(server_side);
//! let connection = gateway.accept(reader, writer);
//!
//! // Client: discover the gateway's services, then call through the
//! // returned router's channel.
//! let (reader, writer) = tokio::io::split(client_side);
//! let options = RouterOptions { timeout: Some(Duration::from_secs(1)) };
//! let remote = netty_router(reader, writer, options).await?;
//! assert_eq!(remote.services().len(), 1);
//! # drop(connection);
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency model
//!
//! Each connection is served by one reader task and one writer task;
//! frame groups are written whole, so groups never interleave on a
//! stream. Responses complete calls in wire order, and every call is
//! completed exactly once — races between response arrival, deadline
//! expiry, and bridge teardown are settled by an atomic per-call claim
//! (see [`trace::Finalizer`]).
//!
//! Connection establishment, TLS, schema resolution, and method
//! dispatch are out of scope: the transport moves opaque packet bodies
//! between routers and leaves their interpretation to the layers above.

pub mod bridge;
pub mod codec;
pub mod error;
pub mod gateway;
pub mod handshake;
pub mod service;
pub mod trace;

pub use bridge::{netty_router, BridgeEvent, NettyBridge, RouterOptions};
pub use error::{codes, NettyError, SystemError, WireError};
pub use gateway::{GatewayConnection, NettyGateway};
pub use handshake::{ClientNegotiator, HandshakeMatch, HandshakeRequest, HandshakeResponse};
pub use service::{Channel, Fingerprint, Packet, Router, RouterEvent, Service};
pub use trace::{Finalizer, Trace};
