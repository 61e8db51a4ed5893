//! End-to-end dispatch scenarios over the in-memory and file backends,
//! exercising the real interpreter executor.

use std::sync::Arc;
use std::time::Duration;

use msgscript::config::AppConfig;
use msgscript::dispatch::MessageDispatcher;
use msgscript::executor::modules::HostDeps;
use msgscript::executor::start_all_executors;
use msgscript::models::{Message, Reply, NO_SCRIPT_FOUND};
use msgscript::store::{FileScriptStore, MemoryScriptStore, ScriptStore};
use tokio_util::sync::CancellationToken;

fn dispatcher_over(store: Arc<dyn ScriptStore>, message_timeout: Duration) -> MessageDispatcher {
    let config = AppConfig::default();
    let registry = Arc::new(start_all_executors(
        &config,
        Arc::clone(&store),
        HostDeps::new(None, None),
        Vec::new(),
    ));
    MessageDispatcher::new(store, registry, message_timeout)
}

async fn memory_dispatcher(scripts: &[(&str, &str, &str)]) -> MessageDispatcher {
    let store = Arc::new(MemoryScriptStore::new());
    for (subject, name, content) in scripts {
        store.add_script(subject, name, content.as_bytes()).await.unwrap();
    }
    dispatcher_over(store, Duration::from_secs(5))
}

#[tokio::test(flavor = "multi_thread")]
async fn single_interpreter_script_raw_mode() {
    let dispatcher = memory_dispatcher(&[(
        "t.echo",
        "e1",
        "--* subject: t.echo\n--* name: e1\n--* html: false\n\
         fn OnMessage(subject, payload) { subject + payload }",
    )])
    .await;

    let msg = Message { subject: "t.echo".to_string(), payload: b"hi".to_vec(), ..Message::default() };
    let reply = dispatcher.dispatch(&msg, CancellationToken::new()).await;

    // The reply survives the wire round trip with the expected shape.
    let wire = serde_json::to_vec(&reply).unwrap();
    let decoded: Reply = serde_json::from_slice(&wire).unwrap();

    assert_eq!(decoded.error, "");
    assert!(!decoded.is_html);
    let result = decoded.results.get("e1").expect("result for e1");
    assert_eq!(result.payload, b"t.echohi".to_vec());
    assert_eq!(result.code, 0);
    assert!(!result.is_html);
}

#[tokio::test(flavor = "multi_thread")]
async fn two_scripts_on_one_subject_both_answer() {
    let dispatcher = memory_dispatcher(&[
        ("t.fan", "a", "--* name: a\nfn OnMessage(s, p) { \"A\" }"),
        ("t.fan", "b", "--* name: b\nfn OnMessage(s, p) { \"B\" }"),
    ])
    .await;

    let msg = Message { subject: "t.fan".to_string(), payload: b"x".to_vec(), ..Message::default() };
    let reply = dispatcher.dispatch(&msg, CancellationToken::new()).await;

    assert_eq!(reply.error, "");
    assert_eq!(reply.results.len(), 2);
    assert_eq!(reply.results.get("a").unwrap().payload, b"A".to_vec());
    assert_eq!(reply.results.get("b").unwrap().payload, b"B".to_vec());
}

#[tokio::test(flavor = "multi_thread")]
async fn no_script_for_subject_is_the_sentinel_reply() {
    let dispatcher = memory_dispatcher(&[]).await;

    let msg = Message { subject: "t.none".to_string(), payload: b"x".to_vec(), ..Message::default() };
    let reply = dispatcher.dispatch(&msg, CancellationToken::new()).await;

    assert_eq!(reply.error, NO_SCRIPT_FOUND);
    let wire = serde_json::to_value(&reply).unwrap();
    assert_eq!(wire["error"], "No script found for subject");
}

#[tokio::test(flavor = "multi_thread")]
async fn raw_wire_bytes_flow_through_as_payload() {
    let dispatcher = memory_dispatcher(&[(
        "t.raw",
        "r1",
        "--* name: r1\nfn OnMessage(subject, payload) { payload }",
    )])
    .await;

    // Not a JSON envelope: the dispatch loop wraps it raw.
    let msg = Message::from_wire("t.raw", b"plain bytes");
    assert!(msg.raw);

    let reply = dispatcher.dispatch(&msg, CancellationToken::new()).await;
    assert_eq!(reply.results.get("r1").unwrap().payload, b"plain bytes".to_vec());
}

#[tokio::test(flavor = "multi_thread")]
async fn html_script_result_carries_headers_and_status() {
    let dispatcher = memory_dispatcher(&[(
        "t.page",
        "p1",
        "--* name: p1\n--* html: true\n\
         fn GET(url, payload) { [\"<h1>ok</h1>\", 200, #{\"X-Src\": \"t\"}] }",
    )])
    .await;

    let msg = Message {
        subject: "t.page".to_string(),
        method: "GET".to_string(),
        url: "/sub".to_string(),
        ..Message::default()
    };
    let reply = dispatcher.dispatch(&msg, CancellationToken::new()).await;

    assert!(reply.is_html);
    let result = reply.results.get("p1").unwrap();
    assert_eq!(result.code, 200);
    assert_eq!(result.payload, b"<h1>ok</h1>".to_vec());
    assert_eq!(result.headers.get("X-Src").map(String::as_str), Some("t"));
}

#[tokio::test(flavor = "multi_thread")]
async fn slow_script_times_out_with_a_timeout_error() {
    let store = Arc::new(MemoryScriptStore::new());
    store
        .add_script(
            "t.slow",
            "s1",
            b"--* name: s1\nfn OnMessage(s, p) { let x = 0; loop { x += 1; } }",
        )
        .await
        .unwrap();
    let dispatcher = dispatcher_over(store, Duration::from_millis(200));

    let msg = Message { subject: "t.slow".to_string(), payload: b"x".to_vec(), ..Message::default() };
    let reply = dispatcher.dispatch(&msg, CancellationToken::new()).await;

    assert_eq!(reply.error, "");
    let result = reply.results.get("s1").unwrap();
    assert!(result.error.contains("timed out"), "got: {}", result.error);
}

#[cfg(feature = "wasm")]
#[tokio::test(flavor = "multi_thread")]
async fn executor_override_forces_the_wasm_path() {
    // The script declares the interpreter; the message forces wasm, whose
    // content-as-module-path lookup then fails in the wasm runtime.
    let dispatcher = memory_dispatcher(&[(
        "t.over",
        "o1",
        "--* name: o1\n--* executor: interpreter\n/no/such/module.wasm",
    )])
    .await;

    let msg = Message {
        subject: "t.over".to_string(),
        payload: b"x".to_vec(),
        executor: "wasm".to_string(),
        ..Message::default()
    };
    let reply = dispatcher.dispatch(&msg, CancellationToken::new()).await;

    let result = reply.results.get("o1").unwrap();
    assert!(result.error.contains("wasm module"), "got: {}", result.error);
}

#[cfg(not(feature = "container"))]
#[tokio::test(flavor = "multi_thread")]
async fn disabled_container_executor_yields_a_configuration_error() {
    let dispatcher = memory_dispatcher(&[(
        "t.ctn",
        "c1",
        "--* name: c1\n--* executor: container\n{\"image\": \"alpine\"}",
    )])
    .await;

    let msg = Message { subject: "t.ctn".to_string(), payload: b"x".to_vec(), ..Message::default() };
    let reply = dispatcher.dispatch(&msg, CancellationToken::new()).await;

    let result = reply.results.get("c1").unwrap();
    assert!(result.error.contains("container support"), "got: {}", result.error);
}

#[tokio::test(flavor = "multi_thread")]
async fn file_backend_serves_scripts_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("echo.rhai"),
        "--* subject: t.disk\n--* name: d1\nfn OnMessage(subject, payload) { payload + payload }",
    )
    .unwrap();

    let store = Arc::new(FileScriptStore::new(dir.path().to_str().unwrap(), None).unwrap());
    let dispatcher = dispatcher_over(store, Duration::from_secs(5));

    let msg = Message { subject: "t.disk".to_string(), payload: b"ab".to_vec(), ..Message::default() };
    let reply = dispatcher.dispatch(&msg, CancellationToken::new()).await;

    assert_eq!(reply.results.get("d1").unwrap().payload, b"abab".to_vec());
}

#[tokio::test(flavor = "multi_thread")]
async fn library_resolution_failure_fails_only_that_script() {
    let dispatcher = memory_dispatcher(&[
        ("t.mix", "ok", "--* name: ok\nfn OnMessage(s, p) { \"fine\" }"),
        ("t.mix", "broken", "--* name: broken\n--* require: absent\nfn OnMessage(s, p) { p }"),
    ])
    .await;

    let msg = Message { subject: "t.mix".to_string(), payload: b"x".to_vec(), ..Message::default() };
    let reply = dispatcher.dispatch(&msg, CancellationToken::new()).await;

    assert_eq!(reply.error, "");
    assert_eq!(reply.results.get("ok").unwrap().payload, b"fine".to_vec());
    assert!(reply.results.get("broken").unwrap().error.contains("absent"));
}
