//! Reply correlation, timeouts, cancellation and the capability handshake.

mod common;

use std::sync::Arc;
use std::time::Duration;

use proxy::{
    args, memory_channel, Dispatch, ProxyConfig, ProxyError, RemoteProxy, ReplyError, StubRenderer,
};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde_json::json;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::Instant;
use wire::{ArgValue, Frame, FrameMetadata, InboundMessage, RemoteFailure};

#[tokio::test]
async fn replies_correlate_by_command_id_in_any_order() {
    let (gl, mut peer) = common::connect_manual(ProxyConfig::default()).await;
    let replies: Vec<_> = (0..6u64)
        .map(|i| (i, gl.query("getParameter", args![i]).unwrap()))
        .collect();

    let mut received = Vec::new();
    for _ in 0..replies.len() {
        let (frame, decoded) = common::next_command(&mut peer).await;
        let ArgValue::Json(arg) = &decoded[0].args[0] else {
            panic!("unexpected argument {:?}", decoded[0].args[0]);
        };
        let value = arg.as_u64().unwrap();
        received.push((frame, value));
    }
    received.shuffle(&mut StdRng::seed_from_u64(7));
    for (frame, value) in &received {
        peer.send(common::reply(json!(value * 10), frame)).unwrap();
    }

    for (i, reply) in replies {
        assert_eq!(reply.await, Ok(json!(i * 10)));
    }
    assert_eq!(gl.outstanding_queries(), 0);
}

#[tokio::test]
async fn remote_error_rejects_only_its_query() {
    let (gl, mut peer) = common::connect_manual(ProxyConfig::default()).await;
    let failing = gl.query("getParameter", args![1]).unwrap();
    let passing = gl.query("getParameter", args![2]).unwrap();

    let (first, _) = common::next_command(&mut peer).await;
    let (second, _) = common::next_command(&mut peer).await;
    let error = InboundMessage::QueryError {
        data: RemoteFailure {
            message: "INVALID_ENUM".into(),
        },
    };
    peer.send(Frame::inbound(&error, first.cmd_id()).unwrap())
        .unwrap();
    peer.send(common::reply(json!(2), &second)).unwrap();

    assert_eq!(
        failing.await,
        Err(ReplyError::Remote {
            message: "INVALID_ENUM".into()
        })
    );
    assert_eq!(passing.await, Ok(json!(2)));
}

#[tokio::test(start_paused = true)]
async fn unanswered_query_times_out_and_late_reply_is_dropped() {
    let (gl, mut peer) = common::connect_manual(ProxyConfig::default()).await;
    let limit = Duration::from_millis(100);
    let started = Instant::now();
    let reply = gl
        .query_with_timeout("getParameter", args![1], limit)
        .unwrap();
    let (frame, _) = common::next_command(&mut peer).await;

    let outcome = reply.wait().await;
    assert!(started.elapsed() >= limit);
    assert!(
        matches!(outcome, Err(ReplyError::Timeout { after, command }) if after == limit && Some(command) == frame.cmd_id())
    );
    assert_eq!(gl.outstanding_queries(), 0);

    let mut violations = gl.protocol_errors();
    peer.send(common::reply(json!(1), &frame)).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(violations.try_recv(), Err(TryRecvError::Empty));
    assert_eq!(reply.try_outcome(), Some(outcome));
}

#[tokio::test]
async fn unbounded_timeout_still_gets_its_reply() {
    let (gl, log, server) = common::connect_stub(StubRenderer::webgl_subset()).await;
    let reply = gl
        .query_with_timeout("getShaderParameter", args![], Duration::MAX)
        .unwrap();
    assert_eq!(reply.await, Ok(json!(true)));
    common::shutdown(gl, server).await;
    assert_eq!(log.commands().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn default_timeout_comes_from_config() {
    let config = ProxyConfig {
        query_timeout_ms: 250,
        ..ProxyConfig::default()
    };
    let (gl, _peer) = common::connect_manual(config).await;
    let started = Instant::now();
    let outcome = gl.query("getParameter", args![]).unwrap().await;
    assert!(matches!(outcome, Err(ReplyError::Timeout { .. })));
    assert!(started.elapsed() >= Duration::from_millis(250));
}

#[tokio::test]
async fn close_cancels_every_outstanding_query() {
    let (gl, _peer) = common::connect_manual(ProxyConfig::default()).await;
    let replies: Vec<_> = (0..3)
        .map(|i| gl.query("getParameter", args![i]).unwrap())
        .collect();
    assert_eq!(gl.outstanding_queries(), 3);

    assert_eq!(gl.close().await.unwrap(), 3);
    for reply in replies {
        assert_eq!(reply.await, Err(ReplyError::Cancelled));
    }
    assert_eq!(gl.close().await.unwrap(), 0);
    assert!(gl.is_closed());
    assert!(matches!(
        gl.query("getParameter", args![]),
        Err(ProxyError::Closed)
    ));
    assert!(matches!(gl.exec("clear", args![]), Err(ProxyError::Closed)));
}

#[tokio::test]
async fn closing_with_nothing_pending_reports_zero() {
    let (gl, _peer) = common::connect_manual(ProxyConfig::default()).await;
    assert_eq!(gl.close().await.unwrap(), 0);
}

#[tokio::test]
async fn peer_hangup_cancels_outstanding_queries() {
    let (gl, mut peer) = common::connect_manual(ProxyConfig::default()).await;
    let reply = gl.query("getParameter", args![]).unwrap();
    common::next_command(&mut peer).await;
    drop(peer);
    assert_eq!(reply.await, Err(ReplyError::Cancelled));
}

#[tokio::test]
async fn malformed_inbound_frames_are_broadcast() {
    let (gl, mut peer) = common::connect_manual(ProxyConfig::default()).await;
    let mut violations = gl.protocol_errors();

    peer.send(Frame {
        data: json!({ "type": "bogus" }),
        metadata: FrameMetadata::default(),
        buffers: Vec::new(),
    })
    .unwrap();
    assert!(!violations.recv().await.unwrap().message.is_empty());

    peer.send(Frame::inbound(&InboundMessage::QueryReply { data: json!(1) }, None).unwrap())
        .unwrap();
    assert!(violations.recv().await.unwrap().message.contains("cmd_id"));

    let reply = gl.query("getParameter", args![]).unwrap();
    let (frame, _) = common::next_command(&mut peer).await;
    peer.send(common::reply(json!("still alive"), &frame)).unwrap();
    assert_eq!(reply.await, Ok(json!("still alive")));
}

#[tokio::test]
async fn constants_resolve_locally() {
    let (gl, mut peer) = common::connect_manual(ProxyConfig::default()).await;
    assert!(matches!(
        gl.dispatch("COLOR_BUFFER_BIT").unwrap(),
        Dispatch::Constant(value) if value == json!(16384)
    ));
    assert_eq!(gl.constant("ARRAY_BUFFER").unwrap(), json!(34962));
    assert!(matches!(
        gl.dispatch("createShadr"),
        Err(ProxyError::UnknownCapability { name }) if name == "createShadr"
    ));
    gl.flushed().await;
    assert!(peer.from_host.try_recv().is_err());
}

#[tokio::test]
async fn nothing_resolves_before_the_handshake() {
    let (channel, inbound, _peer) = memory_channel();
    let gl = RemoteProxy::open(Arc::new(channel), inbound, ProxyConfig::default());
    assert!(gl.capabilities().is_none());
    assert!(matches!(
        gl.dispatch("clear"),
        Err(ProxyError::UnknownCapability { .. })
    ));
    assert!(matches!(
        gl.query("getParameter", args![]),
        Err(ProxyError::UnknownCapability { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn silent_renderer_fails_the_handshake() {
    let (channel, inbound, _peer) = memory_channel();
    let config = ProxyConfig {
        handshake_timeout_ms: 50,
        ..ProxyConfig::default()
    };
    let err = RemoteProxy::connect(Arc::new(channel), inbound, config)
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::HandshakeTimeout { after } if after == Duration::from_millis(50)));
}

#[tokio::test]
async fn refresh_replaces_the_capability_set() {
    let (gl, mut peer) = common::connect_manual(ProxyConfig::default()).await;
    assert!(gl.capabilities().unwrap().has_method("clear"));

    let (refreshed, ()) = tokio::join!(
        gl.refresh_capabilities(),
        common::answer_handshake(&mut peer, serde_json::Map::new(), &["drawElements"]),
    );
    let refreshed = refreshed.unwrap();
    assert!(refreshed.has_method("drawElements"));
    assert!(!refreshed.has_method("clear"));
    assert!(matches!(
        gl.exec("clear", args![]),
        Err(ProxyError::UnknownCapability { .. })
    ));
}
