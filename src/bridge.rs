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

//! Client bridge.
//!
//! A [`NettyBridge`] owns one duplex byte stream and multiplexes calls
//! over it: every outgoing request gets a fresh id, a handshake record
//! from the negotiator, and a slot in the pending map; the reader task
//! routes each decoded response back to its slot. A response reporting
//! no handshake match triggers exactly one resend with the protocol
//! text attached.
//!
//! # Architecture
//!
//! The bridge spawns two independent tasks:
//! - **Reader task**: decodes frame groups off the stream and completes
//!   pending calls.
//! - **Writer task**: drains encoded frame groups from a queue onto the
//!   stream, one full group per write, so groups never interleave.
//!
//! Delivery races (response arrival vs. deadline expiry vs. teardown)
//! are settled by each call's [`Finalizer`]: the first path to claim it
//! completes the call, every other path drops its result.
//!
//! [`netty_router`] is the discovery entry point: it builds a bridge
//! over the well-known discovery service, pings the peer for its
//! protocol list, and returns a [`Router`] whose channel is the bridge.

use crate::codec::framing::{encode_message, MessageDecoder, Message};
use crate::codec::payload::{self, EMPTY_RESPONSE_BODY};
use crate::error::{NettyError, WireError};
use crate::handshake::{ClientNegotiator, HandshakeMatch, HandshakeResponse};
use crate::service::{Channel, Packet, Router, RouterEvent, Service, HEADER_PROTOCOLS};
use crate::trace::{self, Finalizer, Trace, META_DEADLINE, META_LABELS};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Options for [`netty_router`].
#[derive(Debug, Clone, Default)]
pub struct RouterOptions {
    /// Deadline applied to the discovery ping; `None` means no deadline.
    pub timeout: Option<Duration>,
}

/// Notifications from a bridge's transport.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// The bridge was destroyed by this error.
    Error(Arc<NettyError>),
    /// The bridge finished closing.
    Close,
}

struct PendingCall {
    tx: oneshot::Sender<Result<Packet, NettyError>>,
    finalizer: Finalizer,
    service: Arc<Service>,
    meta: HashMap<String, Bytes>,
    headers: HashMap<String, Bytes>,
    body: Bytes,
    retried: bool,
}

struct BridgeState {
    closed: bool,
    pending: HashMap<i32, PendingCall>,
    out_tx: Option<mpsc::UnboundedSender<Bytes>>,
}

struct BridgeShared {
    negotiator: Mutex<ClientNegotiator>,
    state: Mutex<BridgeState>,
    next_id: AtomicI32,
    events_tx: mpsc::UnboundedSender<BridgeEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BridgeShared {
    fn send_frame(&self, frame: Bytes) -> Result<(), NettyError> {
        let state = self.state.lock().expect("bridge state lock poisoned");
        match &state.out_tx {
            Some(tx) if tx.send(frame).is_ok() => Ok(()),
            _ => Err(NettyError::Destroyed(None)),
        }
    }

    fn encode_request(
        &self,
        id: i32,
        svc: &Service,
        include_protocol: bool,
        meta: &HashMap<String, Bytes>,
        headers: &HashMap<String, Bytes>,
        body: &[u8],
    ) -> Bytes {
        let handshake = {
            let negotiator = self.negotiator.lock().expect("negotiator lock poisoned");
            negotiator.outgoing(svc, include_protocol, meta.clone())
        };
        let payload = payload::encode_payload(headers, body);
        encode_message(id, Some(&handshake.encode()), &payload)
    }

    /// Removes a pending call and fails it, if it is still tracked and
    /// undelivered. Used by trace deactivation and teardown.
    fn interrupt(&self, id: i32, err: NettyError) {
        let call = {
            let mut state = self.state.lock().expect("bridge state lock poisoned");
            let call = state.pending.remove(&id);
            Self::maybe_release(&mut state);
            call
        };
        if let Some(call) = call {
            if call.finalizer.claim() {
                let _ = call.tx.send(Err(err));
            }
        }
    }

    /// Routes one decoded response. A fatal error poisons the bridge.
    fn handle_response(
        self: &Arc<Self>,
        message: Message<HandshakeResponse>,
    ) -> Result<(), NettyError> {
        let svc = {
            let state = self.state.lock().expect("bridge state lock poisoned");
            state
                .pending
                .get(&message.id)
                .map(|call| Arc::clone(&call.service))
        };
        let Some(svc) = svc else {
            warn!(id = message.id, "no pending call for packet");
            return Ok(());
        };

        let server_svc = {
            let mut negotiator = self.negotiator.lock().expect("negotiator lock poisoned");
            if let Some(handshake) = &message.handshake {
                negotiator.absorb(&svc, handshake)?;
            }
            negotiator.server_service(&svc)
        };

        let mismatch = message
            .handshake
            .as_ref()
            .is_some_and(|hs| hs.match_ == HandshakeMatch::None);
        if mismatch {
            let retry = {
                let mut state = self.state.lock().expect("bridge state lock poisoned");
                match state.pending.get_mut(&message.id) {
                    Some(call) if !call.retried => {
                        call.retried = true;
                        Some((call.meta.clone(), call.headers.clone(), call.body.clone()))
                    }
                    _ => None,
                }
            };
            if let Some((meta, headers, body)) = retry {
                debug!(id = message.id, "handshake mismatch, resending with protocol");
                let frame = self.encode_request(message.id, &svc, true, &meta, &headers, &body);
                self.send_frame(frame)?;
                return Ok(());
            }
        }

        let call = {
            let mut state = self.state.lock().expect("bridge state lock poisoned");
            let call = state.pending.remove(&message.id);
            Self::maybe_release(&mut state);
            call
        };
        match call {
            Some(call) => {
                if call.finalizer.claim() {
                    let packet = Packet {
                        id: message.id,
                        service: server_svc,
                        headers: message.headers,
                        body: message.body,
                    };
                    let _ = call.tx.send(Ok(packet));
                }
            }
            None => warn!(id = message.id, "no pending call for packet"),
        }
        Ok(())
    }

    /// Tears the bridge down: stop accepting calls, fail every pending
    /// call, notify observers, and release the streams.
    fn destroy_with(&self, err: Option<NettyError>) {
        let drained = {
            let mut state = self.state.lock().expect("bridge state lock poisoned");
            state.closed = true;
            state.out_tx = None;
            state.pending.drain().map(|(_, call)| call).collect::<Vec<_>>()
        };
        if let Some(err) = &err {
            error!(error = %err, pending = drained.len(), "destroying bridge");
        }
        for call in drained {
            if call.finalizer.claim() {
                let _ = call.tx.send(Err(NettyError::Destroyed(None)));
            }
        }
        if let Some(err) = err {
            let _ = self.events_tx.send(BridgeEvent::Error(Arc::new(err)));
        }
        let _ = self.events_tx.send(BridgeEvent::Close);
        for task in self.tasks.lock().expect("task lock poisoned").drain(..) {
            task.abort();
        }
    }

    /// Marks the bridge closed; releases the streams once drained.
    fn close_internal(&self) {
        let mut state = self.state.lock().expect("bridge state lock poisoned");
        state.closed = true;
        Self::maybe_release(&mut state);
    }

    /// Drops the writer queue once the bridge is closed and no call is
    /// outstanding, letting the writer task flush and finish.
    fn maybe_release(state: &mut BridgeState) {
        if state.closed && state.pending.is_empty() {
            state.out_tx = None;
        }
    }

    /// End of input on the readable side.
    fn on_eof(&self, decoder_result: Result<(), WireError>) {
        match decoder_result {
            Err(err) => self.destroy_with(Some(NettyError::Wire(err))),
            Ok(()) => {
                let pending = {
                    let state = self.state.lock().expect("bridge state lock poisoned");
                    state.pending.len()
                };
                if pending > 0 {
                    self.destroy_with(Some(NettyError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "stream ended with calls in flight",
                    ))));
                } else {
                    self.close_internal();
                    let _ = self.events_tx.send(BridgeEvent::Close);
                }
            }
        }
    }
}

/// Client side of one duplex connection.
///
/// See the [module docs](self) for the task layout. Dropping the bridge
/// aborts its tasks; in-flight calls observe a destroyed bridge.
pub struct NettyBridge {
    shared: Arc<BridgeShared>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<BridgeEvent>>>,
}

impl NettyBridge {
    /// Creates a bridge over the given stream halves.
    ///
    /// Must be called from within a tokio runtime; the reader and writer
    /// tasks are spawned immediately.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(BridgeShared {
            negotiator: Mutex::new(ClientNegotiator::new()),
            state: Mutex::new(BridgeState {
                closed: false,
                pending: HashMap::new(),
                out_tx: Some(out_tx),
            }),
            next_id: AtomicI32::new(1),
            events_tx,
            tasks: Mutex::new(Vec::new()),
        });

        let reader_task = tokio::spawn(Self::reader_task(Arc::clone(&shared), reader));
        let writer_task = tokio::spawn(Self::writer_task(Arc::downgrade(&shared), writer, out_rx));
        {
            let mut tasks = shared.tasks.lock().expect("task lock poisoned");
            tasks.push(reader_task);
            tasks.push(writer_task);
        }

        Self {
            shared,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Takes the event receiver; `None` after the first call.
    #[must_use]
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<BridgeEvent>> {
        self.events_rx.lock().expect("events lock poisoned").take()
    }

    /// Issues a call and resolves with the matching response.
    ///
    /// The request is assigned a fresh id and tracked until the response
    /// arrives, the trace goes inactive, or the bridge is destroyed;
    /// exactly one of those completes the call. A failure to serialize
    /// the trace context fails only this call.
    pub async fn call(&self, trace: &Trace, request: Packet) -> Result<Packet, NettyError> {
        {
            let state = self.shared.state.lock().expect("bridge state lock poisoned");
            if state.closed {
                return Err(NettyError::Destroyed(None));
            }
        }
        if let Some(err) = trace.deactivation() {
            return Err(NettyError::System(err));
        }

        let mut meta = HashMap::new();
        meta.insert(META_LABELS.to_owned(), trace::encode_labels(&trace.labels())?);
        if let Some(deadline) = trace.deadline() {
            meta.insert(META_DEADLINE.to_owned(), trace::encode_deadline(deadline));
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let watcher = Arc::clone(&self.shared);
        let finalizer = trace.once_inactive(move |err| {
            watcher.interrupt(id, NettyError::System(err));
        });

        let frame = {
            let mut state = self.shared.state.lock().expect("bridge state lock poisoned");
            if state.closed {
                return Err(NettyError::Destroyed(None));
            }
            state.pending.insert(
                id,
                PendingCall {
                    tx,
                    finalizer,
                    service: Arc::clone(&request.service),
                    meta: meta.clone(),
                    headers: request.headers.clone(),
                    body: request.body.clone(),
                    retried: false,
                },
            );
            self.shared.encode_request(
                id,
                &request.service,
                false,
                &meta,
                &request.headers,
                &request.body,
            )
        };

        // The trace may have gone inactive between registration and
        // tracking; settle the slot it would have missed.
        if let Some(err) = trace.deactivation() {
            self.shared.interrupt(id, NettyError::System(err));
        }

        debug!(id, size = frame.len(), "sending call");
        if let Err(err) = self.shared.send_frame(frame) {
            self.shared.interrupt(id, NettyError::Destroyed(None));
            return Err(err);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(NettyError::Destroyed(None)),
        }
    }

    /// Discovers the peer's services.
    ///
    /// Issues a call on the well-known discovery service; a gateway
    /// answers immediately with its protocol list in the
    /// `avro.protocols` header, a single-service peer is learned from
    /// the handshake instead.
    pub async fn ping(&self, trace: &Trace) -> Result<Vec<Arc<Service>>, NettyError> {
        let request = Packet::new(Service::discovery(), Bytes::from_static(EMPTY_RESPONSE_BODY));
        let response = self.call(trace, request).await?;
        if let Some(err) = payload::decode_system_error(&response.body)? {
            return Err(err.with_headers(response.headers).into());
        }
        match response.headers.get(HEADER_PROTOCOLS) {
            Some(bytes) => {
                let protocols: Vec<Value> =
                    serde_json::from_slice(bytes).map_err(|_| WireError::InvalidJson {
                        what: "protocol list",
                    })?;
                let mut services = Vec::with_capacity(protocols.len());
                for protocol in protocols {
                    services.push(Arc::new(Service::from_protocol(protocol)?));
                }
                Ok(services)
            }
            None => Ok(vec![response.service]),
        }
    }

    /// Stops accepting new calls; in-flight calls complete, then the
    /// streams are released.
    pub fn close(&self) {
        self.shared.close_internal();
    }

    /// Tears the bridge down immediately, failing every pending call.
    ///
    /// The error, when given, reaches observers on the event stream.
    pub fn destroy(&self, err: Option<NettyError>) {
        self.shared.destroy_with(err);
    }

    async fn reader_task<R>(shared: Arc<BridgeShared>, mut reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut decoder = MessageDecoder::<HandshakeResponse>::new();
        let mut chunk = vec![0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => {
                    shared.on_eof(decoder.finish());
                    return;
                }
                Ok(n) => {
                    let mut messages = Vec::new();
                    if let Err(err) = decoder.feed(&chunk[..n], &mut messages) {
                        shared.destroy_with(Some(NettyError::Wire(err)));
                        return;
                    }
                    for message in messages {
                        debug!(id = message.id, "received response");
                        if let Err(err) = shared.handle_response(message) {
                            shared.destroy_with(Some(err));
                            return;
                        }
                    }
                }
                Err(err) => {
                    shared.destroy_with(Some(NettyError::Io(err)));
                    return;
                }
            }
        }
    }

    async fn writer_task<W>(
        shared: std::sync::Weak<BridgeShared>,
        mut writer: W,
        mut out_rx: mpsc::UnboundedReceiver<Bytes>,
    ) where
        W: AsyncWrite + Unpin,
    {
        while let Some(frame) = out_rx.recv().await {
            let write = async {
                writer.write_all(&frame).await?;
                writer.flush().await
            };
            if let Err(err) = write.await {
                if let Some(shared) = shared.upgrade() {
                    shared.destroy_with(Some(NettyError::Io(err)));
                }
                return;
            }
        }
        let _ = writer.shutdown().await;
        if let Some(shared) = shared.upgrade() {
            shared.close_internal();
        }
    }
}

#[async_trait]
impl Channel for NettyBridge {
    async fn call(&self, trace: &Trace, request: Packet) -> Result<Packet, NettyError> {
        NettyBridge::call(self, trace, request).await
    }
}

impl Drop for NettyBridge {
    fn drop(&mut self) {
        for task in self
            .shared
            .tasks
            .lock()
            .expect("task lock poisoned")
            .drain(..)
        {
            task.abort();
        }
    }
}

impl std::fmt::Debug for NettyBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock().expect("bridge state lock poisoned");
        f.debug_struct("NettyBridge")
            .field("closed", &state.closed)
            .field("pending", &state.pending.len())
            .finish()
    }
}

/// Discovers a peer's services and delivers a router over the bridge.
///
/// Builds a bridge around the well-known discovery service, pings the
/// peer (with `options.timeout` as the discovery deadline, if set), and
/// returns a [`Router`] whose channel is the bridge. Connection-scoped
/// bridge events are forwarded onto the router's event stream.
pub async fn netty_router<R, W>(
    reader: R,
    writer: W,
    options: RouterOptions,
) -> Result<Router, NettyError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let bridge = NettyBridge::new(reader, writer);
    let mut bridge_events = bridge.take_events().expect("fresh bridge events");
    let trace = match options.timeout {
        Some(timeout) => Trace::with_timeout(timeout),
        None => Trace::new(),
    };
    let services = bridge.ping(&trace).await?;
    debug!(services = services.len(), "discovery complete");

    let router = Router::new(services, Arc::new(bridge));
    let events_tx = router.event_sender();
    tokio::spawn(async move {
        while let Some(event) = bridge_events.recv().await {
            let forwarded = match event {
                BridgeEvent::Error(err) => RouterEvent::Error(err),
                BridgeEvent::Close => RouterEvent::Close,
            };
            if events_tx.send(forwarded).is_err() {
                return;
            }
        }
    });
    Ok(router)
}
