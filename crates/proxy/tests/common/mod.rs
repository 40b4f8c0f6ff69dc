//! Shared setup for the proxy integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use proxy::{memory_channel, PeerEndpoint, ProxyConfig, ReceivedLog, RemoteProxy, StubRenderer};
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use wire::{Frame, InboundMessage, OutboundMessage, ResolvedInstruction};

pub const METHODS: &[&str] = &[
    "getParameter",
    "getShaderParameter",
    "clear",
    "clearColor",
    "bufferData",
    "drawArrays",
];

pub fn constants() -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("COLOR_BUFFER_BIT".into(), json!(16384));
    map.insert("ARRAY_BUFFER".into(), json!(34962));
    map
}

/// Proxy connected to a [`StubRenderer`]; the handle ends when the proxy closes.
pub async fn connect_stub(stub: StubRenderer) -> (RemoteProxy, ReceivedLog, JoinHandle<()>) {
    let (channel, inbound, peer) = memory_channel();
    let log = stub.log();
    let server = stub.spawn(peer);
    let gl = RemoteProxy::connect(Arc::new(channel), inbound, ProxyConfig::default())
        .await
        .unwrap();
    (gl, log, server)
}

/// Waits for every send, closes the proxy and lets the stub drain.
pub async fn shutdown(gl: RemoteProxy, server: JoinHandle<()>) {
    gl.flushed().await;
    gl.close().await.unwrap();
    server.await.unwrap();
}

/// Proxy whose renderer end is driven by the test itself.
pub async fn connect_manual(config: ProxyConfig) -> (RemoteProxy, PeerEndpoint) {
    let (channel, inbound, mut peer) = memory_channel();
    let (gl, ()) = tokio::join!(
        RemoteProxy::connect(Arc::new(channel), inbound, config),
        answer_handshake(&mut peer, constants(), METHODS),
    );
    (gl.unwrap(), peer)
}

/// Answers one `getConstants`/`getMethods` pair.
pub async fn answer_handshake(peer: &mut PeerEndpoint, constants: Map<String, Value>, methods: &[&str]) {
    for _ in 0..2 {
        let frame = peer.recv().await.unwrap();
        let reply = match frame.parse_outbound().unwrap() {
            OutboundMessage::GetConstants { .. } => InboundMessage::ConstantsReply {
                data: constants.clone(),
            },
            OutboundMessage::GetMethods { .. } => InboundMessage::MethodsReply {
                data: methods.iter().map(|m| (*m).to_owned()).collect(),
            },
            other => panic!("expected handshake request, got {}", other.kind()),
        };
        peer.send(Frame::inbound(&reply, None).unwrap()).unwrap();
    }
}

/// Next exec/query frame from the host, with its decoded instructions.
pub async fn next_command(peer: &mut PeerEndpoint) -> (Frame, Vec<ResolvedInstruction>) {
    let frame = peer.recv().await.unwrap();
    let instructions = match frame.parse_outbound().unwrap() {
        OutboundMessage::Exec { instructions } | OutboundMessage::Query { instructions } => {
            wire::decode(&instructions, &frame.buffers).unwrap()
        }
        other => panic!("expected a command, got {}", other.kind()),
    };
    (frame, instructions)
}

pub fn reply(data: Value, to: &Frame) -> Frame {
    Frame::inbound(&InboundMessage::QueryReply { data }, to.cmd_id()).unwrap()
}
