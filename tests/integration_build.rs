//! Build and context lifecycle integration tests
//!
//! Each test plays the worker side of the conversation by hand.

mod common;

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use common::{FakeWorker, connect, empty_result, wire_message};
use packwire::build::{BuildContext, ServeOptions, ServeRequest};
use packwire::protocol::{Map, Value};
use packwire::{BuildOptions, BuildService, PackwireError};

fn with_warning(mut result: Map, text: &str) -> Map {
    result.insert("warnings", Value::Array(vec![wire_message(text)]));
    result
}

/// Create a context, answering its `build` request with no errors.
async fn active_context(service: &BuildService, worker: &mut FakeWorker) -> BuildContext {
    let (context, ()) = tokio::join!(service.context(BuildOptions::with_entry_points(["a.ts"])), async {
        let (id, request) = worker.expect_request("build").await;
        assert_eq!(request.get("context").and_then(Value::as_bool), Some(true));
        worker.respond(id, empty_result()).await;
    });
    context.unwrap()
}

/// Send the `on-end` a context rebuild ends with and wait for the host's reply.
async fn send_on_end(worker: &mut FakeWorker, key: u32, result: Map) {
    let id = worker.request(result.with("command", "on-end").with("key", key)).await;
    worker.expect_response(id).await;
}

/// Integration test: a one-shot build with `write: false` returns its files
#[tokio::test]
async fn test_one_shot_build_returns_output_files() {
    let (channel, mut worker) = connect().await;
    let service = BuildService::new(channel);
    let options = BuildOptions {
        write: false,
        ..BuildOptions::with_entry_points(["a.ts"])
    };

    let (result, ()) = tokio::join!(service.build(options), async {
        let (id, request) = worker.expect_request("build").await;
        let entries = request.get("entries").and_then(Value::as_array).unwrap();
        assert_eq!(entries[0], Value::from(vec![String::new(), "a.ts".to_string()]));
        assert_eq!(request.get("write").and_then(Value::as_bool), Some(false));
        assert_eq!(request.get("context").and_then(Value::as_bool), Some(false));
        assert!(request.get("plugins").is_none());

        let file = Map::new()
            .with("path", "a.js")
            .with("contents", Bytes::from_static(b"console.log(1)\n"))
            .with("hash", "h1");
        worker
            .respond(id, empty_result().with("outputFiles", vec![Value::from(file)]))
            .await;
    });

    let result = result.unwrap();
    let mut files = result.output_files.unwrap();
    assert_eq!(files.len(), 1);
    let file = &mut files[0];
    assert_eq!(file.path.to_str(), Some("a.js"));
    assert_eq!(file.hash, "h1");
    assert_eq!(file.text(), "console.log(1)\n");
    assert_eq!(file.text(), "console.log(1)\n");

    file.set_contents(Bytes::from_static(b"changed"));
    assert_eq!(file.text(), "changed");
    assert!(worker.try_recv().await.is_none());
}

/// Integration test: errors in the build response reject the build
#[tokio::test]
async fn test_build_with_errors_fails() {
    let (channel, mut worker) = connect().await;
    let service = BuildService::new(channel);

    let (result, ()) = tokio::join!(service.build(BuildOptions::with_entry_points(["a.ts"])), async {
        let (id, _) = worker.expect_request("build").await;
        let response = empty_result().with("errors", Value::Array(vec![wire_message("Could not resolve \"x\"")]));
        worker.respond(id, response).await;
    });

    match result {
        Err(PackwireError::BuildFailed(failure)) => {
            assert_eq!(failure.operation, "Build");
            assert_eq!(failure.errors.len(), 1);
            assert_eq!(
                failure.to_string(),
                "Build failed with 1 error:\nerror: Could not resolve \"x\""
            );
        }
        other => panic!("expected BuildFailed, got {:?}", other),
    }
}

/// Integration test: invalid options are reported to the worker, then rejected
#[tokio::test]
async fn test_invalid_options_send_error_command() {
    let (channel, mut worker) = connect().await;
    let service = BuildService::new(channel);
    let options = BuildOptions {
        outfile: Some("out.js".into()),
        outdir: Some("dist".into()),
        ..BuildOptions::with_entry_points(["a.ts"])
    };

    let (result, ()) = tokio::join!(service.build(options), async {
        let (id, request) = worker.expect_request("error").await;
        assert!(request.get("flags").and_then(Value::as_array).is_some());
        let text = request
            .get("error")
            .and_then(|e| e.get("text"))
            .and_then(Value::as_str)
            .unwrap();
        assert!(text.contains("Cannot use both \"outfile\" and \"outdir\""));
        worker.respond(id, Map::new()).await;
    });

    let err = result.unwrap_err();
    assert!(matches!(err, PackwireError::BuildFailed(ref f) if f.operation == "Build"));
    assert!(err.to_string().contains("Cannot use both"));
    // nothing was built
    assert!(worker.try_recv().await.is_none());
}

/// Integration test: a build response of the wrong shape fails the build but not the channel
#[tokio::test]
async fn test_malformed_build_response_is_reported() {
    let (channel, mut worker) = connect().await;
    let service = BuildService::new(channel.clone());

    let (result, ()) = tokio::join!(service.build(BuildOptions::with_entry_points(["a.ts"])), async {
        let (id, _) = worker.expect_request("build").await;
        worker.respond(id, empty_result().with("outputFiles", "a.js")).await;
        let (id, request) = worker.expect_request("error").await;
        let text = request
            .get("error")
            .and_then(|e| e.get("text"))
            .and_then(Value::as_str)
            .unwrap();
        assert!(text.contains("outputFiles"));
        worker.respond(id, Map::new()).await;
    });

    let err = result.unwrap_err();
    assert!(matches!(err, PackwireError::BuildFailed(ref f) if f.operation == "Build"));
    assert!(!channel.is_closed());
    assert_eq!(channel.handles().live_count(), 0);
}

/// Integration test: concurrent rebuilds share one request and one result
#[tokio::test]
async fn test_concurrent_rebuilds_join() {
    let (channel, mut worker) = connect().await;
    let service = BuildService::new(channel);
    let context = active_context(&service, &mut worker).await;
    let key = context.key();

    let (first, second, ()) = tokio::join!(context.rebuild(), context.rebuild(), async {
        let (id, request) = worker.expect_request("rebuild").await;
        assert_eq!(request.get("key").and_then(Value::as_u32), Some(key));
        send_on_end(&mut worker, key, with_warning(empty_result(), "from on-end")).await;
        worker.respond(id, empty_result()).await;
    });

    let (first, second) = (first.unwrap(), second.unwrap());
    assert_eq!(first.warnings[0].text, "from on-end");
    assert_eq!(second.warnings[0].text, "from on-end");
    assert!(worker.try_recv().await.is_none());

    // the slot is free again once the rebuild settled
    let (third, ()) = tokio::join!(context.rebuild(), async {
        let (id, _) = worker.expect_request("rebuild").await;
        send_on_end(&mut worker, key, empty_result()).await;
        worker.respond(id, empty_result()).await;
    });
    assert!(third.unwrap().warnings.is_empty());
}

/// Integration test: a rebuild without `on-end` is retried once
#[tokio::test]
async fn test_rebuild_retries_once_without_on_end() {
    let (channel, mut worker) = connect().await;
    let service = BuildService::new(channel);
    let context = active_context(&service, &mut worker).await;
    let key = context.key();

    let (result, ()) = tokio::join!(context.rebuild(), async {
        let (id, _) = worker.expect_request("rebuild").await;
        worker.respond(id, empty_result()).await;

        let (id, _) = worker.expect_request("rebuild").await;
        send_on_end(&mut worker, key, with_warning(empty_result(), "second try")).await;
        worker.respond(id, empty_result()).await;
    });

    assert_eq!(result.unwrap().warnings[0].text, "second try");
    assert!(worker.try_recv().await.is_none());
}

/// Integration test: after two unsettled rebuilds the last response is the result
#[tokio::test]
async fn test_rebuild_falls_back_to_last_response() {
    let (channel, mut worker) = connect().await;
    let service = BuildService::new(channel);
    let context = active_context(&service, &mut worker).await;

    let (result, ()) = tokio::join!(context.rebuild(), async {
        let (id, _) = worker.expect_request("rebuild").await;
        worker.respond(id, empty_result()).await;
        let (id, _) = worker.expect_request("rebuild").await;
        worker.respond(id, with_warning(empty_result(), "from response")).await;
    });

    assert_eq!(result.unwrap().warnings[0].text, "from response");
    // no third attempt
    assert!(worker.try_recv().await.is_none());
}

/// Integration test: rebuild errors from `on-end` reject the rebuild
#[tokio::test]
async fn test_rebuild_failure_from_on_end() {
    let (channel, mut worker) = connect().await;
    let service = BuildService::new(channel);
    let context = active_context(&service, &mut worker).await;
    let key = context.key();

    let (result, ()) = tokio::join!(context.rebuild(), async {
        let (id, _) = worker.expect_request("rebuild").await;
        let failed = empty_result().with("errors", Value::Array(vec![wire_message("Unexpected end of file")]));
        send_on_end(&mut worker, key, failed).await;
        worker.respond(id, empty_result()).await;
    });

    match result {
        Err(PackwireError::BuildFailed(failure)) => assert_eq!(failure.errors[0].text, "Unexpected end of file"),
        other => panic!("expected BuildFailed, got {:?}", other),
    }
}

/// Integration test: dispose is idempotent and keeps the key until acknowledged
#[tokio::test]
async fn test_dispose_is_idempotent() {
    let (channel, mut worker) = connect().await;
    let service = BuildService::new(channel.clone());
    let context = active_context(&service, &mut worker).await;
    let key = context.key();
    assert!(channel.handles().contains(key));

    tokio::join!(context.dispose(), context.dispose(), async {
        let (id, request) = worker.expect_request("dispose").await;
        assert_eq!(request.get("key").and_then(Value::as_u32), Some(key));
        assert!(channel.handles().contains(key), "released before the ack");
        worker.respond(id, Map::new()).await;
    });

    assert!(!channel.handles().contains(key));
    assert_eq!(context.state(), packwire::build::LifecycleState::Disposed);
    // the second dispose sent nothing
    assert!(worker.try_recv().await.is_none());

    assert!(matches!(context.rebuild().await, Err(PackwireError::Disposed)));
    assert!(matches!(context.watch().await, Err(PackwireError::Disposed)));
    assert!(matches!(
        context.serve(ServeOptions::default()).await,
        Err(PackwireError::Disposed)
    ));
    context.cancel().await;
    context.dispose().await;
    assert!(worker.try_recv().await.is_none());
}

/// Integration test: cancel never surfaces an error
#[tokio::test]
async fn test_cancel_swallows_errors() {
    let (channel, mut worker) = connect().await;
    let service = BuildService::new(channel);
    let context = active_context(&service, &mut worker).await;

    tokio::join!(context.cancel(), async {
        let (id, _) = worker.expect_request("cancel").await;
        worker.respond(id, Map::new().with("error", "nothing to cancel")).await;
    });

    let _from_host = worker.close().await;
    context.cancel().await;
}

/// Integration test: watch sends one keyed request
#[tokio::test]
async fn test_watch() {
    let (channel, mut worker) = connect().await;
    let service = BuildService::new(channel);
    let context = active_context(&service, &mut worker).await;
    let key = context.key();

    let (result, ()) = tokio::join!(context.watch(), async {
        let (id, request) = worker.expect_request("watch").await;
        assert_eq!(request.get("key").and_then(Value::as_u32), Some(key));
        worker.respond(id, Map::new()).await;
    });
    result.unwrap();
}

/// Integration test: serve forwards each served request to the callback
#[tokio::test]
async fn test_serve_with_request_callback() {
    let (channel, mut worker) = connect().await;
    let service = BuildService::new(channel);
    let context = active_context(&service, &mut worker).await;
    let key = context.key();

    let seen: Arc<Mutex<Vec<ServeRequest>>> = Arc::default();
    let sink = Arc::clone(&seen);
    let on_request: Arc<dyn Fn(ServeRequest) + Send + Sync> = Arc::new(move |request: ServeRequest| {
        sink.lock().unwrap().push(request);
    });
    let options = ServeOptions {
        port: Some(8000),
        servedir: Some("www".into()),
        on_request: Some(on_request),
        ..Default::default()
    };

    let (served, ()) = tokio::join!(context.serve(options), async {
        let (id, request) = worker.expect_request("serve").await;
        assert_eq!(request.get("onRequest").and_then(Value::as_bool), Some(true));
        assert_eq!(request.get("port").and_then(Value::as_i32), Some(8000));
        assert_eq!(request.get("servedir").and_then(Value::as_str), Some("www"));
        assert!(request.get("host").is_none());
        worker
            .respond(id, Map::new().with("host", "127.0.0.1").with("port", 8000))
            .await;
    });
    let served = served.unwrap();
    assert_eq!(served.host, "127.0.0.1");
    assert_eq!(served.port, 8000);

    let args = Map::new()
        .with("remoteAddress", "127.0.0.1:50000")
        .with("method", "GET")
        .with("path", "/a.js")
        .with("status", 200)
        .with("timeInMS", 2);
    let id = worker
        .request(
            Map::new()
                .with("command", "serve-request")
                .with("key", key)
                .with("args", args),
        )
        .await;
    worker.expect_response(id).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].path, "/a.js");
    assert_eq!(seen[0].status, 200);
}

fn serve_request(key: u32, path: &str) -> Map {
    let args = Map::new()
        .with("remoteAddress", "127.0.0.1:50000")
        .with("method", "GET")
        .with("path", path)
        .with("status", 200)
        .with("timeInMS", 1);
    Map::new()
        .with("command", "serve-request")
        .with("key", key)
        .with("args", args)
}

/// Integration test: a served request reported before the serve ack still reaches the callback
#[tokio::test]
async fn test_serve_request_before_ack_reaches_callback() {
    let (channel, mut worker) = connect().await;
    let service = BuildService::new(channel);
    let context = active_context(&service, &mut worker).await;
    let key = context.key();

    let seen: Arc<Mutex<Vec<String>>> = Arc::default();
    let sink = Arc::clone(&seen);
    let options = ServeOptions {
        on_request: Some(Arc::new(move |request: ServeRequest| {
            sink.lock().unwrap().push(request.path);
        })),
        ..Default::default()
    };

    let (served, ()) = tokio::join!(context.serve(options), async {
        let (serve_id, _) = worker.expect_request("serve").await;
        let early = worker.request(serve_request(key, "/early.js")).await;
        let reply = worker.expect_response(early).await;
        assert!(reply.get("errors").is_none(), "unexpected reply {:?}", reply);
        worker
            .respond(serve_id, Map::new().with("host", "0.0.0.0").with("port", 8001))
            .await;
    });
    assert_eq!(served.unwrap().port, 8001);
    assert_eq!(*seen.lock().unwrap(), vec!["/early.js".to_string()]);
}

/// Integration test: a rejected serve stops routing served requests to the callback
#[tokio::test]
async fn test_failed_serve_removes_request_callback() {
    let (channel, mut worker) = connect().await;
    let service = BuildService::new(channel);
    let context = active_context(&service, &mut worker).await;
    let key = context.key();

    let calls = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&calls);
    let options = ServeOptions {
        on_request: Some(Arc::new(move |_: ServeRequest| {
            *counter.lock().unwrap() += 1;
        })),
        ..Default::default()
    };

    let (served, ()) = tokio::join!(context.serve(options), async {
        let (id, _) = worker.expect_request("serve").await;
        worker.respond(id, Map::new().with("error", "port in use")).await;
    });
    assert!(matches!(served, Err(PackwireError::Worker(ref m)) if m == "port in use"));

    let id = worker.request(serve_request(key, "/late.js")).await;
    let reply = worker.expect_response(id).await;
    let errors = reply.get("errors").and_then(Value::as_array).unwrap();
    assert_eq!(errors[0].get("text").and_then(Value::as_str), Some("Invalid command: serve-request"));
    assert_eq!(*calls.lock().unwrap(), 0);
}

/// Integration test: a context build with errors never becomes active
#[tokio::test]
async fn test_context_with_errors_fails() {
    let (channel, mut worker) = connect().await;
    let service = BuildService::new(channel.clone());

    let (result, ()) = tokio::join!(service.context(BuildOptions::with_entry_points(["a.ts"])), async {
        let (id, _) = worker.expect_request("build").await;
        let response = empty_result().with("errors", Value::Array(vec![wire_message("bad")]));
        worker.respond(id, response).await;
    });

    match result {
        Err(PackwireError::BuildFailed(failure)) => assert_eq!(failure.operation, "Context"),
        other => panic!("expected BuildFailed, got {:?}", other),
    }
    assert_eq!(channel.handles().live_count(), 0);
}

/// Integration test: transform sends the input and reads back code
#[tokio::test]
async fn test_transform() {
    let (channel, mut worker) = connect().await;
    let service = BuildService::new(channel);
    let options = packwire::TransformOptions::with_loader(packwire::build::Loader::Ts);

    let (result, ()) = tokio::join!(service.transform("let x: number = 1", options), async {
        let (id, request) = worker.expect_request("transform").await;
        assert_eq!(
            request.get("input").and_then(Value::to_bytes),
            Some(Bytes::from_static(b"let x: number = 1"))
        );
        assert_eq!(request.get("inputFS").and_then(Value::as_bool), Some(false));
        let response = empty_result().with("code", "let x = 1;\n").with("map", "");
        worker.respond(id, response).await;
    });

    assert_eq!(result.unwrap().code, "let x = 1;\n");
}
