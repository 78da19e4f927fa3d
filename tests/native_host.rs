// Drives the compiled host over native messaging framing. No network needed:
// the host is switched offline before any embedding request.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::{json, Value};

fn frame(v: &Value) -> Vec<u8> {
    let body = serde_json::to_vec(v).unwrap();
    let mut out = (body.len() as u32).to_le_bytes().to_vec();
    out.extend_from_slice(&body);
    out
}

fn unframe(mut bytes: &[u8]) -> Vec<Value> {
    let mut out = Vec::new();
    while bytes.len() >= 4 {
        let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        out.push(serde_json::from_slice(&bytes[4..4 + len]).unwrap());
        bytes = &bytes[4 + len..];
    }
    out
}

fn run_host(home: &std::path::Path, messages: &[Value]) -> Vec<Value> {
    let input: Vec<u8> = messages.iter().flat_map(frame).collect();
    let output = Command::cargo_bin("embed_host")
        .unwrap()
        .env("HOME", home)
        .env("EMBED_HOST_ASSET_DIR", home.join("models"))
        .env("EMBED_HOST_MODEL_BASE_URL", "http://127.0.0.1:9")
        .write_stdin(input)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    unframe(&output)
}

#[test]
fn hello_reports_version_and_asset_dir() {
    let home = tempfile::tempdir().unwrap();
    let replies = run_host(home.path(), &[json!({ "id": "1", "method": "hello", "params": { "appVersion": "2.0.0" } })]);

    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0]["id"], "1");
    assert_eq!(replies[0]["result"]["type"], "hello-response");
    let asset_dir = replies[0]["result"]["assetDir"].as_str().unwrap();
    assert!(predicate::str::ends_with("models").eval(asset_dir));
}

#[test]
fn unknown_method_is_an_error_payload() {
    let home = tempfile::tempdir().unwrap();
    let replies = run_host(home.path(), &[json!({ "id": "9", "method": "bogus" })]);

    let error = replies[0]["error"].as_str().unwrap();
    assert!(predicate::str::contains("Unknown method: bogus").eval(error));
}

#[test]
fn offline_embedding_fails_without_creating_assets() {
    let home = tempfile::tempdir().unwrap();
    let replies = run_host(
        home.path(),
        &[
            json!({ "id": "1", "method": "setOnline", "params": { "online": false } }),
            json!({ "id": "2", "method": "embedWorker", "params": { "text": "a cat" } }),
            json!({ "id": "3", "method": "embedInProcess" }),
            json!({ "id": "4", "method": "status" }),
        ],
    );

    assert_eq!(replies.len(), 4);
    assert_eq!(replies[0]["result"]["online"], false);
    for reply in &replies[1..3] {
        let error = reply["error"].as_str().unwrap();
        assert!(predicate::str::contains("offline").eval(error), "unexpected error: {error}");
    }

    let status = &replies[3]["result"];
    assert_eq!(status["online"], false);
    assert!(status["assets"].as_array().unwrap().iter().all(|a| a["present"] == false));
    assert!(!home.path().join("models").join("model.safetensors").exists());
}

#[test]
fn shutdown_stops_the_loop() {
    let home = tempfile::tempdir().unwrap();
    let replies = run_host(
        home.path(),
        &[
            json!({ "id": "1", "method": "shutdown" }),
            json!({ "id": "2", "method": "hello" }),
        ],
    );

    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0]["result"]["ok"], true);
}

#[test]
fn empty_stdin_exits_cleanly_and_logs_to_home() {
    let home = tempfile::tempdir().unwrap();
    let replies = run_host(home.path(), &[]);

    assert!(replies.is_empty());
    assert!(home.path().join(".embed-host").join("logs").is_dir());
}
