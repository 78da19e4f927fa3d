mod config;
mod embeddings;
mod logging;
mod native_messaging;
mod protocol;

use std::io::{stdin, stdout};
use std::sync::Arc;

use anyhow::Context;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::embeddings::assets::AssetSet;
use crate::embeddings::download::NetworkState;
use crate::embeddings::orchestrator::{Dispatch, EmbeddingOrchestrator};
use crate::protocol::{EmbedParams, EmbeddingResult, ResponseErr, ResponseOk, SetOnlineParams};

struct HostState {
    orchestrator: EmbeddingOrchestrator,
    // Requests run to completion one at a time, so this is never cancelled here.
    // Stuck calls end through the download read timeout and the worker reply timeout.
    cancel: CancellationToken,
    should_exit: bool,
}

fn main() {
    if let Err(e) = real_main() {
        // Keep stderr noisy for user bug reports; logs also go to file.
        eprintln!("[Embed host] fatal error: {e:?}");
        log::error!("Fatal error: {:?}", e);
        std::process::exit(1);
    }
}

fn real_main() -> anyhow::Result<()> {
    logging::init_logging()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config::runtime::WORKER_THREADS)
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    let assets = AssetSet::from_env()?;
    log::info!("Model assets directory: {}", assets.dir().display());

    let mut state = HostState {
        orchestrator: EmbeddingOrchestrator::with_candle(assets, Arc::new(NetworkState::default())),
        cancel: CancellationToken::new(),
        should_exit: false,
    };

    log::info!("=== Embed Host Started ===");
    log::info!("Waiting for messages from the app...");

    let mut in_stream = stdin();
    let mut out_stream = stdout();

    let mut message_count: u64 = 0;
    loop {
        let req = match native_messaging::read_message(&mut in_stream) {
            Ok(Some(r)) => r,
            Ok(None) => {
                log::info!("No more messages after {} messages, exiting", message_count);
                break;
            }
            Err(e) => {
                log::error!("Error reading message: {:?}", e);
                break;
            }
        };

        message_count += 1;
        log::info!(
            "Processing message #{}: {} (id: {})",
            message_count,
            req.method,
            req.id
        );

        let resp = runtime.block_on(handle_request(&mut state, &req.method, &req.id, &req.params));
        let out = match resp {
            Ok(v) => v,
            Err(e) => {
                log::error!("Handler error: {:?}", e);
                serde_json::to_value(ResponseErr {
                    id: req.id.clone(),
                    error: format!("{e:#}"),
                })?
            }
        };
        if let Err(e) = native_messaging::write_json(&mut out_stream, &out) {
            log::error!("Error sending response: {:?}", e);
            break;
        }
        if state.should_exit {
            log::info!("Exiting as requested by the app");
            break;
        }
    }

    runtime.block_on(state.orchestrator.shutdown());
    log::info!("=== Embed Host Stopped ===");
    Ok(())
}

async fn handle_request(state: &mut HostState, method: &str, msg_id: &str, params: &Value) -> anyhow::Result<Value> {
    match method {
        "hello" => handle_hello(state, msg_id, params),
        "status" => handle_status(state, msg_id).await,
        "setOnline" => handle_set_online(state, msg_id, params),
        "ensureAssets" => handle_ensure_assets(state, msg_id).await,
        "embedWorker" => handle_embed(state, msg_id, params, Dispatch::Worker).await,
        "embedInProcess" => handle_embed(state, msg_id, params, Dispatch::InProcess).await,
        "shutdown" => handle_shutdown(state, msg_id).await,
        _ => Ok(serde_json::to_value(ResponseErr {
            id: msg_id.to_string(),
            error: format!("Unknown method: {method}"),
        })?),
    }
}

fn ok<T: serde::Serialize>(msg_id: &str, result: T) -> anyhow::Result<Value> {
    Ok(serde_json::to_value(ResponseOk {
        id: msg_id.to_string(),
        result,
    })?)
}

fn handle_hello(state: &HostState, msg_id: &str, params: &Value) -> anyhow::Result<Value> {
    let app_version = params.get("appVersion").and_then(|v| v.as_str()).unwrap_or("unknown");
    log::info!(
        "Hello from app version {}, responding with host version {}",
        app_version,
        config::HOST_VERSION
    );

    ok(
        msg_id,
        serde_json::json!({
            "type": "hello-response",
            "hostVersion": config::HOST_VERSION,
            "platform": std::env::consts::OS,
            "model": config::embedding::EMBEDDING_MODEL_NAME,
            "assetDir": state.orchestrator.assets().dir().to_string_lossy(),
            "appVersion": app_version
        }),
    )
}

async fn handle_status(state: &HostState, msg_id: &str) -> anyhow::Result<Value> {
    let status = state.orchestrator.status().await;
    ok(msg_id, status)
}

fn handle_set_online(state: &HostState, msg_id: &str, params: &Value) -> anyhow::Result<Value> {
    let p: SetOnlineParams =
        serde_json::from_value(params.clone()).context("Missing required parameters: online")?;
    state.orchestrator.network().set_online(p.online);
    ok(msg_id, serde_json::json!({ "ok": true, "online": p.online }))
}

async fn handle_ensure_assets(state: &HostState, msg_id: &str) -> anyhow::Result<Value> {
    let downloaded = state.orchestrator.ensure_assets(&state.cancel).await?;
    ok(msg_id, serde_json::json!({ "ok": true, "downloaded": downloaded }))
}

async fn handle_embed(state: &HostState, msg_id: &str, params: &Value, dispatch: Dispatch) -> anyhow::Result<Value> {
    let input = protocol::parse_params::<EmbedParams>(params)
        .context("invalid embed params")?
        .into_input();
    let embeddings = state
        .orchestrator
        .get_text_embedding(&input, dispatch, &state.cancel)
        .await?;
    ok(msg_id, EmbeddingResult::from_embeddings(&embeddings))
}

async fn handle_shutdown(state: &mut HostState, msg_id: &str) -> anyhow::Result<Value> {
    state.orchestrator.shutdown().await;
    state.should_exit = true;
    ok(msg_id, serde_json::json!({ "ok": true }))
}
