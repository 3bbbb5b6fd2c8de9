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

//! Server gateway.
//!
//! A [`NettyGateway`] accepts duplex connections and maps their calls
//! onto a [`Router`]. Per incoming request it resolves the client's
//! service from the handshake fingerprint, produces the handshake
//! response (`BOTH`, `CLIENT` with the server protocol attached, or
//! `NONE` instructing a retry), reconstructs the trace from the
//! handshake metadata, and forwards the call into the router's channel.
//! Handler responses and failures are marshalled back as response frame
//! groups on the connection's writer task.
//!
//! Connections are stateful: once a client's service is known, later
//! requests may omit the handshake entirely and reuse it. That mode is
//! only safe with one client per connection. The fingerprint-to-service
//! cache itself is shared by all connections of one gateway, so a
//! client that introduced itself on one connection is recognized on the
//! next.

use crate::codec::framing::{encode_message, Message, MessageDecoder};
use crate::codec::payload::{self, EMPTY_RESPONSE_BODY};
use crate::error::{codes, NettyError, SystemError};
use crate::handshake::{HandshakeMatch, HandshakeRequest, HandshakeResponse};
use crate::service::{Fingerprint, Packet, Router, RouterEvent, Service, HEADER_PROTOCOLS};
use crate::trace::{self, Trace, META_DEADLINE, META_LABELS};
use bytes::Bytes;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

enum OutMessage {
    /// A response frame group.
    Frame(Bytes),
    /// A final frame group; the writer shuts the stream down after it.
    FrameThenClose(Bytes),
}

/// Server side of the transport: accepts connections for a router.
pub struct NettyGateway {
    router: Arc<Router>,
    client_services: Arc<Mutex<HashMap<Fingerprint, Arc<Service>>>>,
}

impl NettyGateway {
    /// Creates a gateway serving the given router.
    #[must_use]
    pub fn new(router: Arc<Router>) -> Self {
        Self {
            router,
            client_services: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The router this gateway serves.
    #[must_use]
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Attaches a connection, spawning its reader and writer tasks.
    ///
    /// The returned handle owns the connection; dropping it aborts the
    /// tasks.
    pub fn accept<R, W>(&self, reader: R, writer: W) -> GatewayConnection
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(Notify::new());
        let writer_task = tokio::spawn(Self::writer_task(writer, out_rx, Arc::clone(&closed)));
        let reader_task = tokio::spawn(Self::connection_task(
            Arc::clone(&self.router),
            Arc::clone(&self.client_services),
            reader,
            out_tx,
            closed,
        ));
        GatewayConnection {
            tasks: vec![reader_task, writer_task],
        }
    }

    async fn writer_task<W>(
        mut writer: W,
        mut out_rx: mpsc::UnboundedReceiver<OutMessage>,
        closed: Arc<Notify>,
    ) where
        W: AsyncWrite + Unpin,
    {
        while let Some(message) = out_rx.recv().await {
            let (frame, close_after) = match message {
                OutMessage::Frame(frame) => (frame, false),
                OutMessage::FrameThenClose(frame) => (frame, true),
            };
            let write = async {
                writer.write_all(&frame).await?;
                writer.flush().await
            };
            if write.await.is_err() || close_after {
                break;
            }
        }
        let _ = writer.shutdown().await;
        // Stop the reader too; the connection is done. A stored permit
        // survives until the reader polls, so the signal cannot be lost.
        closed.notify_one();
    }

    async fn connection_task<R>(
        router: Arc<Router>,
        client_services: Arc<Mutex<HashMap<Fingerprint, Arc<Service>>>>,
        mut reader: R,
        out_tx: mpsc::UnboundedSender<OutMessage>,
        closed: Arc<Notify>,
    ) where
        R: AsyncRead + Unpin,
    {
        let mut decoder = MessageDecoder::<HandshakeRequest>::new();
        let mut client_svc: Option<Arc<Service>> = None;
        let mut chunk = vec![0u8; 8192];
        loop {
            let read = tokio::select! {
                read = reader.read(&mut chunk) => read,
                () = closed.notified() => return,
            };
            match read {
                Ok(0) => {
                    if let Err(err) = decoder.finish() {
                        error!(error = %err, "connection ended mid-frame");
                        router.emit(RouterEvent::Error(Arc::new(NettyError::Wire(err))));
                    }
                    router.emit(RouterEvent::Close);
                    return;
                }
                Ok(n) => {
                    let mut messages = Vec::new();
                    if let Err(err) = decoder.feed(&chunk[..n], &mut messages) {
                        error!(error = %err, "request decode failed");
                        router.emit(RouterEvent::Error(Arc::new(NettyError::Wire(err))));
                        return;
                    }
                    for message in messages {
                        let handled = Self::handle_request(
                            &router,
                            &client_services,
                            &mut client_svc,
                            &out_tx,
                            message,
                        );
                        if let Err(err) = handled {
                            error!(error = %err, "request handling failed");
                            router.emit(RouterEvent::Error(Arc::new(err)));
                            return;
                        }
                    }
                }
                Err(err) => {
                    error!(error = %err, "connection read failed");
                    router.emit(RouterEvent::Error(Arc::new(NettyError::Io(err))));
                    router.emit(RouterEvent::Close);
                    return;
                }
            }
        }
    }

    fn handle_request(
        router: &Arc<Router>,
        client_services: &Arc<Mutex<HashMap<Fingerprint, Arc<Service>>>>,
        client_svc: &mut Option<Arc<Service>>,
        out_tx: &mpsc::UnboundedSender<OutMessage>,
        message: Message<HandshakeRequest>,
    ) -> Result<(), NettyError> {
        let id = message.id;
        let (svc, trace, handshake_response) = match &message.handshake {
            None => match client_svc {
                // Stateful connection: reuse the service from the last
                // handshake; no handshake means no trace context either.
                Some(svc) => (Arc::clone(svc), Trace::new(), None),
                None => {
                    return Err(NettyError::Io(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "expected handshake",
                    )));
                }
            },
            Some(handshake) => {
                let trace = match handshake.meta.get(META_DEADLINE) {
                    Some(bytes) => Trace::with_deadline(trace::decode_deadline(bytes)?),
                    None => Trace::new(),
                };
                if !trace.active() {
                    debug!(id, "dropping request with expired deadline");
                    return Ok(());
                }
                if let Some(bytes) = handshake.meta.get(META_LABELS) {
                    trace.merge_labels(trace::decode_labels(bytes)?);
                }

                if handshake.client_hash == Service::discovery().hash() {
                    Self::respond_discovery(router, out_tx, id);
                    return Ok(());
                }

                let cached = {
                    let cache = client_services.lock().expect("client cache lock poisoned");
                    cache.get(&handshake.client_hash).cloned()
                };
                let svc = match cached {
                    Some(svc) => svc,
                    None => match &handshake.client_protocol {
                        None => {
                            Self::respond_unknown_client(router, out_tx, id);
                            return Ok(());
                        }
                        Some(text) => {
                            let svc =
                                Arc::new(Service::with_hash(text, handshake.client_hash)?);
                            client_services
                                .lock()
                                .expect("client cache lock poisoned")
                                .insert(handshake.client_hash, Arc::clone(&svc));
                            svc
                        }
                    },
                };

                let response = match router.service(&svc) {
                    Some(server_svc) if server_svc.hash() == handshake.server_hash => {
                        HandshakeResponse::matched(HandshakeMatch::Both)
                    }
                    Some(server_svc) => {
                        // The client did not know the server's protocol.
                        HandshakeResponse::matched(HandshakeMatch::Client)
                            .with_service(&server_svc)
                    }
                    None => {
                        warn!(id, client = svc.name(), "no service for client protocol");
                        let err = SystemError::new(
                            codes::CHANNEL_FAILURE,
                            format!("no service for protocol {}", svc.name()),
                        );
                        let frame = encode_message(
                            id,
                            Some(&HandshakeResponse::matched(HandshakeMatch::Both).encode()),
                            &payload::encode_system_error(&err, None),
                        );
                        let _ = out_tx.send(OutMessage::Frame(frame));
                        return Ok(());
                    }
                };
                (svc, trace, Some(response))
            }
        };

        *client_svc = Some(Arc::clone(&svc));
        let request = Packet {
            id,
            service: svc,
            headers: message.headers,
            body: message.body,
        };
        Self::dispatch(router, out_tx, trace, request, handshake_response);
        Ok(())
    }

    /// Answers a discovery ping with the router's protocol list.
    fn respond_discovery(
        router: &Arc<Router>,
        out_tx: &mpsc::UnboundedSender<OutMessage>,
        id: i32,
    ) {
        debug!(id, services = router.services().len(), "discovery ping");
        let protocols: Vec<_> = router
            .services()
            .iter()
            .map(|svc| svc.protocol().clone())
            .collect();
        let listing =
            serde_json::to_vec(&protocols).expect("protocol values are valid json");
        let mut headers = HashMap::new();
        headers.insert(HEADER_PROTOCOLS.to_owned(), Bytes::from(listing));

        let frame = encode_message(
            id,
            Some(&HandshakeResponse::matched(HandshakeMatch::Both).encode()),
            &payload::encode_payload(&headers, EMPTY_RESPONSE_BODY),
        );
        let _ = out_tx.send(OutMessage::Frame(frame));
    }

    /// Rejects an unrecognized client that sent no protocol text.
    ///
    /// A router exposing exactly one service attaches that service's
    /// protocol and fingerprint so the client can complete in a single
    /// retry.
    fn respond_unknown_client(
        router: &Arc<Router>,
        out_tx: &mpsc::UnboundedSender<OutMessage>,
        id: i32,
    ) {
        debug!(id, "unknown client protocol, requesting retry");
        let mut response = HandshakeResponse::matched(HandshakeMatch::None);
        if let [only] = router.services() {
            response = response.with_service(only);
        }
        let err = SystemError::new(
            codes::UNKNOWN_CLIENT_PROTOCOL,
            "unknown client protocol, retry with protocol attached",
        );
        let frame = encode_message(
            id,
            Some(&response.encode()),
            &payload::encode_system_error(&err, None),
        );
        let _ = out_tx.send(OutMessage::Frame(frame));
    }

    /// Forwards a request into the router's channel and marshals the
    /// outcome back onto the connection.
    fn dispatch(
        router: &Arc<Router>,
        out_tx: &mpsc::UnboundedSender<OutMessage>,
        trace: Trace,
        request: Packet,
        handshake_response: Option<HandshakeResponse>,
    ) {
        let channel = Arc::clone(router.channel());
        let out_tx = out_tx.clone();
        let id = request.id;
        tokio::spawn(async move {
            let handshake = handshake_response.map(|response| response.encode());
            match channel.call(&trace, request).await {
                Ok(response) => {
                    let frame = encode_message(
                        id,
                        handshake.as_deref(),
                        &payload::encode_payload(&response.headers, &response.body),
                    );
                    // A finished writer means the connection is gone;
                    // the response is dropped.
                    let _ = out_tx.send(OutMessage::Frame(frame));
                }
                Err(err) => {
                    let err = SystemError::or_code(codes::CHANNEL_FAILURE, err);
                    warn!(id, error = %err, "call failed");
                    let frame = encode_message(
                        id,
                        handshake.as_deref(),
                        &payload::encode_system_error(&err, Some(err.headers())),
                    );
                    let _ = out_tx.send(OutMessage::FrameThenClose(frame));
                }
            }
        });
    }
}

impl std::fmt::Debug for NettyGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NettyGateway")
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

/// Handle to one accepted connection.
///
/// Dropping the handle aborts the connection's tasks.
pub struct GatewayConnection {
    tasks: Vec<JoinHandle<()>>,
}

impl GatewayConnection {
    /// Waits for the connection to finish.
    pub async fn join(mut self) {
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }

    /// Aborts the connection's tasks.
    pub fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for GatewayConnection {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}
