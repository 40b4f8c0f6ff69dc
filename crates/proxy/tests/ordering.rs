//! Send order and out-of-band buffers, observed from the renderer side.

mod common;

use std::time::Duration;

use proxy::{args, ArgValue, BinaryArray, PendingReply, ProxyConfig, ReceivedKind, StubRenderer};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde_json::json;

#[tokio::test(start_paused = true)]
async fn execs_reach_renderer_in_initiation_order() {
    for seed in 0..5 {
        let (gl, log, server) = common::connect_stub(StubRenderer::webgl_subset()).await;
        let mut rng = StdRng::seed_from_u64(seed);
        let count: u64 = rng.gen_range(5..30);

        for i in 0..count {
            if rng.gen_bool(0.5) {
                let (resolver, value) = PendingReply::channel();
                let delay = Duration::from_millis(rng.gen_range(0..40));
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    resolver.resolve(json!(i));
                });
                gl.exec("clear", args![value]).unwrap();
            } else {
                gl.exec("clear", args![i]).unwrap();
            }
        }
        common::shutdown(gl, server).await;

        let seen: Vec<ArgValue> = log
            .commands()
            .into_iter()
            .map(|r| r.instructions[0].args[0].clone())
            .collect();
        let expected: Vec<ArgValue> = (0..count).map(|i| ArgValue::Json(json!(i))).collect();
        assert_eq!(seen, expected, "seed {seed}");
    }
}

#[tokio::test(start_paused = true)]
async fn query_waits_behind_an_exec_with_a_slow_argument() {
    let (gl, log, server) = common::connect_stub(StubRenderer::webgl_subset()).await;
    let (resolver, red) = PendingReply::channel();
    gl.exec("clearColor", args![red, 0.0, 0.0, 1.0]).unwrap();
    let status = gl.query("getShaderParameter", args![]).unwrap();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        resolver.resolve(json!(0.5));
    });

    assert_eq!(status.await, Ok(json!(true)));
    let kinds: Vec<_> = log.commands().into_iter().map(|r| r.kind).collect();
    assert_eq!(kinds, vec![ReceivedKind::Exec, ReceivedKind::Query]);
    common::shutdown(gl, server).await;
}

#[tokio::test]
async fn failed_dependency_skips_only_its_own_send() {
    let (gl, log, server) = common::connect_stub(StubRenderer::webgl_subset()).await;
    let (resolver, doomed) = PendingReply::channel();
    let skipped = gl.exec("clear", args![doomed]).unwrap().unwrap();
    gl.exec("clear", args![2]).unwrap();
    drop(resolver);

    assert!(skipped.transmitted().await.is_err());
    common::shutdown(gl, server).await;
    let commands = log.commands();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].instructions[0].args, vec![ArgValue::Json(json!(2))]);
}

#[tokio::test]
async fn batch_buffers_share_one_out_of_band_list() {
    let (gl, mut peer) = common::connect_manual(ProxyConfig::default()).await;
    let positions = BinaryArray::from_f32s(&[0.0, 1.0, 2.0]);
    let indices = BinaryArray::from_u16s(&[0, 1, 2]);

    gl.chunk(|gl| {
        gl.exec("bufferData", args![34962, positions.clone(), 35044])?;
        gl.exec("bufferData", args![34963, indices.clone(), 35044])?;
        Ok(())
    })
    .unwrap();

    let (frame, decoded) = common::next_command(&mut peer).await;
    assert_eq!(frame.data["type"], json!("exec"));
    assert_eq!(frame.data["instructions"][0]["args"][1], json!("buffer0"));
    assert_eq!(frame.data["instructions"][1]["args"][1], json!("buffer1"));
    assert_eq!(frame.buffers, vec![positions.clone(), indices.clone()]);
    assert_eq!(decoded[0].args[1], ArgValue::Buffer(positions));
    assert_eq!(decoded[1].args[1], ArgValue::Buffer(indices));
    assert_eq!(decoded[1].args[2], ArgValue::Json(json!(35044)));
}

#[tokio::test]
async fn returned_references_travel_as_ref_objects() {
    let (gl, mut peer) = common::connect_manual(ProxyConfig::default()).await;
    let target = gl.exec_returning("getParameter", args![1]).unwrap();
    gl.exec("drawArrays", args![target, 0, 3]).unwrap();

    let (first, _) = common::next_command(&mut peer).await;
    assert_eq!(first.data["instructions"][0]["ret"], json!(target.as_u64()));
    let (second, decoded) = common::next_command(&mut peer).await;
    assert_eq!(
        second.data["instructions"][0]["args"][0],
        json!({ "__ref__": target.as_u64() })
    );
    assert_eq!(decoded[0].args[0], ArgValue::Ref(target));
}
