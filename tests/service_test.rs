// tests/service_test.rs
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use sluice::adder;
use sluice::dispatch::Dispatcher;
use sluice::error::ErrorKind;
use sluice::stage::io::{FramedSink, FramedSource};
use sluice::{Chunk, Client, Envelope, PipelineConfig, Response, Server, Sink, Source};
use sluice_wire::response::{HANDLER_FAILED, NOT_IMPLEMENTED};
use tokio::io::AsyncWriteExt;

fn adder_server() -> Server {
    Server::new(
        adder::register(Dispatcher::builder()).build(),
        PipelineConfig::default(),
    )
}

async fn start() -> (Arc<Server>, String, tokio::task::JoinHandle<anyhow::Result<()>>) {
    let server = Arc::new(adder_server());
    let listener = Server::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let serving = server.clone();
    let task = tokio::spawn(async move { serving.serve(listener).await });
    (server, addr, task)
}

#[tokio::test]
async fn adder_answers_over_tcp() {
    let (server, addr, task) = start().await;
    let client = Client::connect(&addr, "returnPath")
        .await
        .unwrap()
        .with_timeout(Duration::from_secs(5));

    let rsp = client.act(adder::request(1, 2)).await.unwrap();
    assert_eq!(rsp.to_value(), json!({"status": "ok", "data": {"result": 3}}));

    // replies are matched by route, not by arrival order
    let (a, b) = tokio::join!(
        client.act(adder::request(10, 5)),
        client.act(adder::request(-4, 4)),
    );
    assert_eq!(a.unwrap(), Response::ok(json!({"result": 15})));
    assert_eq!(b.unwrap(), Response::ok(json!({"result": 0})));
    assert_eq!(client.pending(), 0);

    client.close().await.unwrap();
    server.shutdown();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn unknown_pattern_is_not_implemented() {
    let (server, addr, _task) = start().await;
    let client = Client::connect(&addr, "returnPath").await.unwrap();

    let rsp = client
        .act(Envelope::new().with("role", "adder").with("cmd", "subtract"))
        .await
        .unwrap();
    let error = rsp.error().unwrap();
    assert_eq!(error.code, NOT_IMPLEMENTED);
    assert_eq!(error.message, "Not Implemented");

    let rsp = client
        .act(Envelope::new().with("role", "adder").with("cmd", "add").with("first", "x"))
        .await
        .unwrap();
    assert_eq!(rsp.error().unwrap().code, HANDLER_FAILED);
    server.shutdown();
}

#[tokio::test]
async fn fire_and_forget_gets_no_reply() {
    let server = adder_server();
    let (near, far) = tokio::io::duplex(1024);
    let handle = server.attach(near, "in-memory".into());
    assert_eq!(server.connections(), 1);

    let (far_read, far_write) = tokio::io::split(far);
    let mut requests = FramedSink::new(far_write);
    let mut replies = FramedSource::new(far_read);

    requests
        .consume(Chunk::Record(adder::request(1, 1).into_value()))
        .await
        .unwrap();
    let mut asked = adder::request(2, 2);
    asked.insert("returnPath", "only-me");
    requests.consume(Chunk::Record(asked.into_value())).await.unwrap();
    requests.close().await.unwrap();

    let reply = replies.produce().await.unwrap().unwrap().into_record().unwrap();
    assert_eq!(reply["returnPath"], "only-me");
    assert_eq!(reply["data"]["result"], 4);
    assert_eq!(replies.produce().await.unwrap(), None);

    handle.wait().await.unwrap();
    assert_eq!(server.connections(), 0);
}

#[tokio::test]
async fn garbage_ends_the_connection_with_a_protocol_error() {
    let server = adder_server();
    let (near, mut far) = tokio::io::duplex(1024);
    let handle = server.attach(near, "garbage".into());

    far.write_all(b"this is not json\n").await.unwrap();
    let err = handle.wait().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
}

#[tokio::test]
async fn invalid_utf8_is_a_protocol_error() {
    let server = adder_server();
    let (near, mut far) = tokio::io::duplex(1024);
    let handle = server.attach(near, "binary".into());

    far.write_all(b"\xff\xfe\n").await.unwrap();
    let err = handle.wait().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
}

#[tokio::test]
async fn overlong_lines_end_the_connection() {
    let config = PipelineConfig {
        max_line: 32,
        ..PipelineConfig::default()
    };
    let server = Server::new(adder::register(Dispatcher::builder()).build(), config);
    let (near, mut far) = tokio::io::duplex(1024);
    let handle = server.attach(near, "chatty".into());

    far.write_all(&[b'x'; 256]).await.unwrap();
    let err = handle.wait().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert!(err.to_string().contains("32 bytes"), "{err}");
}

#[tokio::test]
async fn shutdown_tears_down_live_connections() {
    let (server, addr, task) = start().await;
    let client = Client::connect(&addr, "returnPath").await.unwrap();
    client.act(adder::request(0, 0)).await.unwrap();
    assert_eq!(server.connections(), 1);

    server.shutdown();
    task.await.unwrap().unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(2), client.act(adder::request(1, 1)))
        .await
        .expect("client must not hang after shutdown");
    assert!(outcome.is_err());
}

#[tokio::test]
async fn custom_reply_field_is_honoured() {
    let dispatcher = Dispatcher::builder()
        .reply_field("replyTo")
        .add(
            sluice::Pattern::try_from(json!({"cmd": "echo"})).unwrap(),
            |env: Envelope| async move { anyhow::Ok(env.get("msg").cloned().unwrap_or(Value::Null)) },
        )
        .build();
    let server = Server::new(dispatcher, PipelineConfig::default());
    let (near, far) = tokio::io::duplex(1024);
    let _handle = server.attach(near, "custom".into());

    let client = Client::new(sluice::Duplex::framed(far, "client"), "replyTo");
    let rsp = client
        .act(Envelope::new().with("cmd", "echo").with("msg", "hi"))
        .await
        .unwrap();
    assert_eq!(rsp, Response::ok(json!("hi")));
}
