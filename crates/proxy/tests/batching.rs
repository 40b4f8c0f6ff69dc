//! Chunks, branches and the rules that keep a batch from waiting on itself.

mod common;

use proxy::{args, ArgValue, ProxyConfig, ProxyError, ReceivedKind, StubRenderer};
use serde_json::json;

fn ops(instructions: &[wire::ResolvedInstruction]) -> Vec<&str> {
    instructions.iter().map(|i| i.op.as_str()).collect()
}

#[tokio::test]
async fn branch_query_inside_a_chunk_is_sent_after_the_batch() {
    let (gl, log, server) = common::connect_stub(StubRenderer::webgl_subset()).await;

    let status = gl
        .chunk(|gl| {
            gl.chunk(|gl| {
                let shader =
                    gl.exec_returning("createShader", args![gl.constant("FRAGMENT_SHADER")?])?;
                gl.exec("compileShader", args![shader])?;
                gl.branch().query(
                    "getShaderParameter",
                    args![shader, gl.constant("COMPILE_STATUS")?],
                )
            })
        })
        .unwrap();

    assert_eq!(status.await, Ok(json!(true)));
    common::shutdown(gl, server).await;

    let commands = log.commands();
    assert_eq!(commands.len(), 2);
    assert_eq!(commands[0].kind, ReceivedKind::Exec);
    assert_eq!(ops(&commands[0].instructions), ["createShader", "compileShader"]);
    assert_eq!(commands[1].kind, ReceivedKind::Query);
    assert_eq!(ops(&commands[1].instructions), ["getShaderParameter"]);

    let shader = commands[0].instructions[0].ret.unwrap();
    assert_eq!(commands[1].instructions[0].args[0], ArgValue::Ref(shader));
}

#[tokio::test]
async fn nested_chunks_flush_once() {
    let (gl, log, server) = common::connect_stub(StubRenderer::webgl_subset()).await;
    gl.chunk(|gl| {
        gl.exec("clearColor", args![0.0, 0.0, 0.0, 1.0])?;
        gl.chunk(|gl| {
            assert!(gl.in_batch());
            gl.exec("clear", args![16384])?;
            Ok(())
        })?;
        gl.exec("drawArrays", args![4, 0, 3])?;
        Ok(())
    })
    .unwrap();
    assert!(!gl.in_batch());
    common::shutdown(gl, server).await;

    let commands = log.commands();
    assert_eq!(commands.len(), 1);
    assert_eq!(
        ops(&commands[0].instructions),
        ["clearColor", "clear", "drawArrays"]
    );
}

#[tokio::test]
async fn batch_keeps_dispatch_order() {
    let (gl, log, server) = common::connect_stub(StubRenderer::webgl_subset()).await;
    gl.chunk(|gl| {
        let clear = gl.method("clear")?;
        gl.exec("clearColor", args![0.0, 0.0, 0.0, 1.0])?;
        clear.call(args![16384])?;
        Ok(())
    })
    .unwrap();
    common::shutdown(gl, server).await;
    assert_eq!(ops(&log.commands()[0].instructions), ["clear", "clearColor"]);
}

#[tokio::test]
async fn uncalled_instruction_fails_the_batch() {
    let (gl, log, server) = common::connect_stub(StubRenderer::webgl_subset()).await;
    let err = gl
        .chunk(|gl| {
            let forgotten = gl.method("clear")?;
            gl.exec("clearColor", args![0.0, 0.0, 0.0, 1.0])?;
            drop(forgotten);
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, ProxyError::UnflushedInstruction { operation } if operation == "clear"));

    // The lineage is still usable afterwards.
    gl.exec("clear", args![16384]).unwrap();
    common::shutdown(gl, server).await;
    let commands = log.commands();
    assert_eq!(commands.len(), 1);
    assert_eq!(ops(&commands[0].instructions), ["clear"]);
}

#[tokio::test]
async fn rejected_call_does_not_poison_the_batch() {
    let (gl, log, server) = common::connect_stub(StubRenderer::webgl_subset()).await;
    gl.chunk(|gl| {
        let rejected = gl.exec("clearColor", args![f64::NAN, 0.0, 0.0, 1.0]);
        assert!(matches!(rejected, Err(ProxyError::InvalidArgument { .. })));
        gl.exec("clear", args![16384])?;
        Ok(())
    })
    .unwrap();
    common::shutdown(gl, server).await;

    let commands = log.commands();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].kind, ReceivedKind::Exec);
    assert_eq!(ops(&commands[0].instructions), ["clear"]);
}

#[tokio::test]
async fn failing_body_sends_nothing() {
    let (gl, log, server) = common::connect_stub(StubRenderer::webgl_subset()).await;
    let err = gl
        .chunk(|gl| {
            gl.exec("clear", args![16384])?;
            gl.exec("noSuchCall", args![])?;
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, ProxyError::UnknownCapability { .. }));
    common::shutdown(gl, server).await;
    assert!(log.commands().is_empty());
}

#[tokio::test]
async fn query_on_the_batching_handle_is_rejected() {
    let (gl, _peer) = common::connect_manual(ProxyConfig::default()).await;
    let err = gl
        .chunk(|gl| gl.query("getParameter", args![1]).map(|_| ()))
        .unwrap_err();
    assert!(matches!(err, ProxyError::IllegalState { .. }));
    assert_eq!(gl.outstanding_queries(), 0);
}

#[tokio::test]
async fn batch_argument_from_a_later_query_is_rejected() {
    let (gl, log, server) = common::connect_stub(StubRenderer::webgl_subset()).await;
    let err = gl
        .chunk(|gl| {
            let location = gl.branch().query("getAttribLocation", args![])?;
            gl.exec("enableVertexAttribArray", args![location])?;
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, ProxyError::IllegalState { .. }));
    common::shutdown(gl, server).await;

    let kinds: Vec<_> = log.commands().into_iter().map(|r| r.kind).collect();
    assert_eq!(kinds, vec![ReceivedKind::Query]);
}

#[tokio::test]
async fn batch_argument_from_an_earlier_query_waits_for_it() {
    let (gl, log, server) = common::connect_stub(StubRenderer::webgl_subset()).await;
    let location = gl.query("getAttribLocation", args![]).unwrap();
    gl.chunk(|gl| {
        gl.exec("enableVertexAttribArray", args![&location])?;
        gl.exec("vertexAttribPointer", args![&location, 3, 5126, false, 0, 0])?;
        Ok(())
    })
    .unwrap();
    common::shutdown(gl, server).await;

    let commands = log.commands();
    assert_eq!(commands[0].kind, ReceivedKind::Query);
    assert_eq!(commands[1].kind, ReceivedKind::Exec);
    assert_eq!(commands[1].instructions[0].args, vec![ArgValue::Json(json!(0))]);
}

#[tokio::test]
async fn branches_batch_independently() {
    let (gl, log, server) = common::connect_stub(StubRenderer::webgl_subset()).await;
    let side = gl.branch();
    assert!(side.is_branch());
    assert_eq!(side.lineage_id(), gl.lineage_id());

    gl.chunk(|gl| {
        gl.exec("clear", args![16384])?;
        assert!(!side.in_batch());
        side.exec("drawArrays", args![4, 0, 3])?;
        Ok(())
    })
    .unwrap();

    assert!(matches!(side.close().await, Err(ProxyError::IllegalState { .. })));
    common::shutdown(gl, server).await;

    let commands = log.commands();
    assert_eq!(commands.len(), 2);
    assert_eq!(ops(&commands[0].instructions), ["clear"]);
    assert_eq!(ops(&commands[1].instructions), ["drawArrays"]);
}
