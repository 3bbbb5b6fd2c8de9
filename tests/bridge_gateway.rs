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

//! End-to-end tests: a real bridge talking to a real gateway over
//! in-memory duplex streams.

use async_trait::async_trait;
use avro_netty::{
    codes, netty_router, BridgeEvent, Channel, NettyBridge, NettyError, NettyGateway, Packet,
    Router, RouterOptions, Service, Trace,
};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{duplex, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::time::{sleep, timeout};

fn svc(name: &str) -> Arc<Service> {
    Arc::new(Service::from_protocol_text(&format!(r#"{{"protocol":"{}"}}"#, name)).unwrap())
}

/// Echoes request bodies back with a marker appended, counting calls.
struct EchoChannel {
    calls: AtomicU64,
    delay: Option<Duration>,
}

impl EchoChannel {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU64::new(0),
            delay: None,
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU64::new(0),
            delay: Some(delay),
        })
    }
}

#[async_trait]
impl Channel for EchoChannel {
    async fn call(&self, _trace: &Trace, request: Packet) -> Result<Packet, NettyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            sleep(delay).await;
        }
        let mut body = request.body.to_vec();
        body.extend_from_slice(b"!");
        Ok(Packet::new(request.service, Bytes::from(body)))
    }
}

type ClientHalves = (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>);

/// Wires a gateway to a fresh duplex pair, returning the client halves.
fn connect(gateway: &NettyGateway) -> (avro_netty::GatewayConnection, ClientHalves) {
    let (server_io, client_io) = duplex(1 << 16);
    let (server_reader, server_writer) = tokio::io::split(server_io);
    let connection = gateway.accept(server_reader, server_writer);
    (connection, tokio::io::split(client_io))
}

#[tokio::test]
async fn discovery_against_single_service_gateway() {
    let echo = svc("Echo");
    let router = Arc::new(Router::new(vec![Arc::clone(&echo)], EchoChannel::new()));
    let gateway = NettyGateway::new(router);
    let (_connection, (reader, writer)) = connect(&gateway);

    let options = RouterOptions {
        timeout: Some(Duration::from_secs(1)),
    };
    let remote = netty_router(reader, writer, options).await.unwrap();

    assert_eq!(remote.services().len(), 1);
    assert_eq!(remote.services()[0].name(), "Echo");
    assert_eq!(remote.services()[0].hash(), echo.hash());
}

#[tokio::test]
async fn discovery_against_multi_service_gateway() {
    let s1 = svc("Users");
    let s2 = svc("Orders");
    let router = Arc::new(Router::new(
        vec![Arc::clone(&s1), Arc::clone(&s2)],
        EchoChannel::new(),
    ));
    let gateway = NettyGateway::new(router);
    let (_connection, (reader, writer)) = connect(&gateway);

    let remote = netty_router(reader, writer, RouterOptions::default())
        .await
        .unwrap();

    assert_eq!(remote.services().len(), 2);
    assert_eq!(remote.services()[0].hash(), s1.hash());
    assert_eq!(remote.services()[1].hash(), s2.hash());
}

#[tokio::test]
async fn business_call_negotiates_and_completes() {
    // The first business call on a discovered service is unknown to the
    // gateway: it answers NONE, the bridge retries once with the
    // protocol text, and the call completes on the retried response.
    let handler = EchoChannel::new();
    let router = Arc::new(Router::new(
        vec![svc("Users"), svc("Orders")],
        Arc::clone(&handler) as Arc<dyn Channel>,
    ));
    let gateway = NettyGateway::new(router);
    let (_connection, (reader, writer)) = connect(&gateway);

    let remote = netty_router(reader, writer, RouterOptions::default())
        .await
        .unwrap();
    let users = Arc::clone(&remote.services()[0]);

    let trace = Trace::new();
    let request = Packet::new(users, Bytes::from_static(b"\x00hello"));
    let response = remote.channel().call(&trace, request).await.unwrap();

    assert_eq!(response.body.as_ref(), b"\x00hello!");
    // The handler ran once: the mismatched first attempt never reached it.
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

    // Negotiation is cached: a second call completes without a retry.
    let trace = Trace::new();
    let request = Packet::new(
        Arc::clone(&remote.services()[0]),
        Bytes::from_static(b"\x00again"),
    );
    let response = remote.channel().call(&trace, request).await.unwrap();
    assert_eq!(response.body.as_ref(), b"\x00again!");
    assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn deadline_expiry_interrupts_inflight_call() {
    let handler = EchoChannel::slow(Duration::from_millis(300));
    let router = Arc::new(Router::new(
        vec![svc("Echo")],
        Arc::clone(&handler) as Arc<dyn Channel>,
    ));
    let gateway = NettyGateway::new(router);
    let (_connection, (reader, writer)) = connect(&gateway);

    let remote = netty_router(reader, writer, RouterOptions::default())
        .await
        .unwrap();
    let echo = Arc::clone(&remote.services()[0]);

    let trace = Trace::with_timeout(Duration::from_millis(40));
    let request = Packet::new(echo, Bytes::from_static(b"\x00slow"));
    let err = remote.channel().call(&trace, request).await.unwrap_err();
    assert!(err.as_system().unwrap().is(codes::DEADLINE_EXCEEDED));

    // The late response is dropped quietly once the handler finishes.
    sleep(Duration::from_millis(400)).await;
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn garbage_on_the_stream_destroys_the_bridge() {
    let (client_io, mut server_io) = duplex(1 << 16);
    let (reader, writer) = tokio::io::split(client_io);
    let bridge = Arc::new(NettyBridge::new(reader, writer));
    let mut events = bridge.take_events().unwrap();

    let trace = Trace::new();
    let call = tokio::spawn({
        let bridge = Arc::clone(&bridge);
        let request = Packet::new(svc("Echo"), Bytes::from_static(b"\x00hi"));
        async move { bridge.call(&trace, request).await }
    });

    // Three stray bytes, then end of stream: trailing data.
    sleep(Duration::from_millis(20)).await;
    server_io.write_all(&[0xDE, 0xAD, 0xBE]).await.unwrap();
    server_io.shutdown().await.unwrap();
    drop(server_io);

    let err = timeout(Duration::from_secs(1), call)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(err.is_destroyed());

    match events.recv().await.unwrap() {
        BridgeEvent::Error(err) => assert!(err.is_wire()),
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn router_events_surface_connection_close() {
    let router = Arc::new(Router::new(vec![svc("Echo")], EchoChannel::new()));
    let gateway = NettyGateway::new(router);
    let (connection, (reader, writer)) = connect(&gateway);

    let remote = netty_router(reader, writer, RouterOptions::default())
        .await
        .unwrap();
    let mut events = remote.take_events().unwrap();

    // Tear the server side down; the client observes the close.
    connection.abort();
    let event = timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        avro_netty::RouterEvent::Close | avro_netty::RouterEvent::Error(_) => {}
    }
}

#[tokio::test]
async fn concurrent_calls_multiplex_over_one_connection() {
    let handler = EchoChannel::new();
    let router = Arc::new(Router::new(
        vec![svc("Echo")],
        Arc::clone(&handler) as Arc<dyn Channel>,
    ));
    let gateway = NettyGateway::new(router);
    let (_connection, (reader, writer)) = connect(&gateway);

    let remote = Arc::new(
        netty_router(reader, writer, RouterOptions::default())
            .await
            .unwrap(),
    );
    let echo = Arc::clone(&remote.services()[0]);

    let mut calls = Vec::new();
    for i in 0..32u8 {
        let remote = Arc::clone(&remote);
        let echo = Arc::clone(&echo);
        calls.push(tokio::spawn(async move {
            let trace = Trace::new();
            let body = Bytes::from(vec![0x00, i]);
            let response = remote
                .channel()
                .call(&trace, Packet::new(echo, body))
                .await
                .unwrap();
            assert_eq!(response.body.as_ref(), &[0x00, i, b'!']);
        }));
    }
    for call in calls {
        call.await.unwrap();
    }
    assert_eq!(handler.calls.load(Ordering::SeqCst), 32);
}
