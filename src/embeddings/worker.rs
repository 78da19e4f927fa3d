// worker.rs — Inference worker on a dedicated thread, reachable only by messages.
//
// The worker thread constructs and owns its own SessionManager; nothing is shared
// with the coordinator except the two channels. Every request carries a
// correlation id and a router task resolves the matching pending caller, so any
// number of requests may be in flight at once.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::session::{Embeddings, SessionLoader, SessionManager};
use super::tokenize::TokenBatch;
use crate::config;

pub const NO_MESSAGE_RECEIVED: &str = "NO MESSAGE RECEIVED";

#[derive(Debug)]
pub enum WorkerAction {
    GenerateTextEmbeddings { model_path: PathBuf, tokens: TokenBatch },
}

impl WorkerAction {
    pub fn name(&self) -> &'static str {
        match self {
            WorkerAction::GenerateTextEmbeddings { .. } => "generateTextEmbeddings",
        }
    }
}

#[derive(Debug)]
pub struct WorkerRequest {
    pub id: u64,
    /// `None` models a message without a registered action.
    pub action: Option<WorkerAction>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerReply {
    Embeddings(Embeddings),
    /// `{error: message}` across the context boundary.
    Error(String),
    /// Diagnostic answer to a request with no recognised action.
    NoMessage,
}

#[derive(Debug)]
enum WorkerEvent {
    Ready,
    Reply { id: u64, reply: WorkerReply },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Spawned,
    Idle,
    AwaitingReply,
    Terminated,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Spawned => "spawned",
            WorkerState::Idle => "idle",
            WorkerState::AwaitingReply => "awaiting-reply",
            WorkerState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("inference worker terminated")]
    Terminated,

    #[error("inference worker did not reply within {0:?}")]
    Timeout(Duration),

    #[error("inference request cancelled")]
    Cancelled,

    #[error("inference worker failed: {0}")]
    Remote(String),

    #[error("inference worker protocol error: {0}")]
    Protocol(String),

    #[error("failed to spawn inference worker: {0}")]
    Spawn(#[source] std::io::Error),
}

#[derive(Debug)]
enum Lifecycle {
    Spawned,
    Ready,
    Terminated,
}

struct Shared {
    lifecycle: Lifecycle,
    pending: HashMap<u64, oneshot::Sender<WorkerReply>>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

/// Removes a pending entry if the waiting caller goes away (timeout, cancel, drop).
struct PendingGuard<'a> {
    shared: &'a Mutex<Shared>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.shared).pending.remove(&self.id);
    }
}

pub struct WorkerChannel {
    requests: Mutex<Option<mpsc::UnboundedSender<WorkerRequest>>>,
    shared: Arc<Mutex<Shared>>,
    next_id: AtomicU64,
    reply_timeout: Duration,
}

impl WorkerChannel {
    /// Spawn the worker thread and its reply router. Must be called within a tokio runtime.
    pub fn spawn(loader: Arc<dyn SessionLoader>) -> Result<Self, WorkerError> {
        Self::spawn_with_timeout(loader, Duration::from_secs(config::worker::REPLY_TIMEOUT_SECS))
    }

    pub fn spawn_with_timeout(loader: Arc<dyn SessionLoader>, reply_timeout: Duration) -> Result<Self, WorkerError> {
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        std::thread::Builder::new()
            .name(config::worker::THREAD_NAME.to_string())
            .spawn(move || run_worker(SessionManager::new(loader), req_rx, event_tx))
            .map_err(WorkerError::Spawn)?;

        let shared = Arc::new(Mutex::new(Shared {
            lifecycle: Lifecycle::Spawned,
            pending: HashMap::new(),
        }));
        tokio::spawn(route_replies(Arc::clone(&shared), event_rx));

        log::info!("Inference worker spawned");
        Ok(Self {
            requests: Mutex::new(Some(req_tx)),
            shared,
            next_id: AtomicU64::new(1),
            reply_timeout,
        })
    }

    pub fn state(&self) -> WorkerState {
        let shared = lock(&self.shared);
        match shared.lifecycle {
            Lifecycle::Terminated => WorkerState::Terminated,
            _ if !shared.pending.is_empty() => WorkerState::AwaitingReply,
            Lifecycle::Spawned => WorkerState::Spawned,
            Lifecycle::Ready => WorkerState::Idle,
        }
    }

    /// Post one message and wait for its correlated reply.
    pub async fn request(
        &self,
        action: Option<WorkerAction>,
        cancel: &CancellationToken,
    ) -> Result<WorkerReply, WorkerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();

        {
            let mut shared = lock(&self.shared);
            if matches!(shared.lifecycle, Lifecycle::Terminated) {
                return Err(WorkerError::Terminated);
            }
            shared.pending.insert(id, reply_tx);
        }
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };

        let action_name = action.as_ref().map(WorkerAction::name).unwrap_or("<none>");
        log::debug!("Posting worker request #{} ({})", id, action_name);

        {
            let requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
            let sender = requests.as_ref().ok_or(WorkerError::Terminated)?;
            sender
                .send(WorkerRequest { id, action })
                .map_err(|_| WorkerError::Terminated)?;
        }

        tokio::select! {
            _ = cancel.cancelled() => Err(WorkerError::Cancelled),
            res = tokio::time::timeout(self.reply_timeout, reply_rx) => match res {
                Err(_) => {
                    log::warn!("Worker request #{} timed out after {:?}", id, self.reply_timeout);
                    Err(WorkerError::Timeout(self.reply_timeout))
                }
                Ok(Err(_)) => Err(WorkerError::Terminated),
                Ok(Ok(reply)) => Ok(reply),
            },
        }
    }

    pub async fn generate_text_embeddings(
        &self,
        model_path: PathBuf,
        tokens: TokenBatch,
        cancel: &CancellationToken,
    ) -> Result<Embeddings, WorkerError> {
        let action = WorkerAction::GenerateTextEmbeddings { model_path, tokens };
        match self.request(Some(action), cancel).await? {
            WorkerReply::Embeddings(e) => Ok(e),
            WorkerReply::Error(message) => Err(WorkerError::Remote(message)),
            WorkerReply::NoMessage => Err(WorkerError::Protocol(NO_MESSAGE_RECEIVED.to_string())),
        }
    }

    /// Close the request channel; the worker exits once it drains what it has.
    pub fn shutdown(&self) {
        let taken = self.requests.lock().unwrap_or_else(|e| e.into_inner()).take();
        if taken.is_some() {
            log::info!("Shutting down inference worker");
        }
    }
}

impl Drop for WorkerChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(
    mut sessions: SessionManager,
    mut requests: mpsc::UnboundedReceiver<WorkerRequest>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    if events.send(WorkerEvent::Ready).is_err() {
        return;
    }

    while let Some(WorkerRequest { id, action }) = requests.blocking_recv() {
        let reply = match action {
            None => {
                log::warn!("Worker request #{} carried no action", id);
                WorkerReply::NoMessage
            }
            Some(WorkerAction::GenerateTextEmbeddings { model_path, tokens }) => {
                match sessions.embed(&model_path, &tokens) {
                    Ok(embeddings) => WorkerReply::Embeddings(embeddings),
                    Err(e) => {
                        log::error!("Worker request #{} failed: {}", id, e);
                        WorkerReply::Error(e.to_string())
                    }
                }
            }
        };

        if events.send(WorkerEvent::Reply { id, reply }).is_err() {
            break;
        }
    }

    log::info!("Inference worker exiting ({} sessions loaded)", sessions.loaded_count());
}

async fn route_replies(shared: Arc<Mutex<Shared>>, mut events: mpsc::UnboundedReceiver<WorkerEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            WorkerEvent::Ready => {
                lock(&shared).lifecycle = Lifecycle::Ready;
                log::info!("Inference worker ready");
            }
            WorkerEvent::Reply { id, reply } => {
                let pending = lock(&shared).pending.remove(&id);
                match pending {
                    Some(tx) => {
                        let _ = tx.send(reply);
                    }
                    None => log::debug!("Dropping reply for abandoned worker request #{}", id),
                }
            }
        }
    }

    // Worker thread gone (shutdown or crash): fail everything still waiting.
    let mut state = lock(&shared);
    state.lifecycle = Lifecycle::Terminated;
    let orphaned = state.pending.len();
    state.pending.clear();
    if orphaned > 0 {
        log::warn!("Inference worker terminated with {} pending requests", orphaned);
    } else {
        log::info!("Inference worker terminated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::test_support::{token_batch, FakeLoader};
    use std::path::Path;

    async fn wait_for(channel: &WorkerChannel, want: WorkerState) {
        for _ in 0..200 {
            if channel.state() == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("worker never reached {want}, still {}", channel.state());
    }

    #[tokio::test]
    async fn test_single_input_yields_batch_of_one() {
        let channel = WorkerChannel::spawn(Arc::new(FakeLoader::default())).unwrap();
        let out = channel
            .generate_text_embeddings("/m/text".into(), token_batch(&["a cat"]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out.batch_size(), 1);
        assert_eq!(out.as_slice().len(), out.batch_size() * out.dims());
    }

    #[tokio::test]
    async fn test_no_action_gets_no_message_signal() {
        let channel = WorkerChannel::spawn(Arc::new(FakeLoader::default())).unwrap();
        let reply = channel.request(None, &CancellationToken::new()).await.unwrap();
        assert_eq!(reply, WorkerReply::NoMessage);

        // The channel stays usable afterwards.
        wait_for(&channel, WorkerState::Idle).await;
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_correlated() {
        let channel = WorkerChannel::spawn(Arc::new(FakeLoader::default())).unwrap();
        let cancel = CancellationToken::new();

        let (a, b, c) = tokio::join!(
            channel.generate_text_embeddings("/m/text".into(), token_batch(&["a cat"]), &cancel),
            channel.generate_text_embeddings("/m/text".into(), token_batch(&["one", "two"]), &cancel),
            channel.generate_text_embeddings("/m/text".into(), token_batch(&["x", "y", "z"]), &cancel),
        );

        assert_eq!(a.unwrap().batch_size(), 1);
        assert_eq!(b.unwrap().batch_size(), 2);
        assert_eq!(c.unwrap().batch_size(), 3);
    }

    #[tokio::test]
    async fn test_session_loaded_lazily_and_once() {
        let loader = Arc::new(FakeLoader::default());
        let channel = WorkerChannel::spawn(loader.clone()).unwrap();
        wait_for(&channel, WorkerState::Idle).await;
        assert_eq!(loader.loads(), 0);

        let cancel = CancellationToken::new();
        let first = channel
            .generate_text_embeddings("/m/text".into(), token_batch(&["a cat"]), &cancel)
            .await
            .unwrap();
        let second = channel
            .generate_text_embeddings("/m/text".into(), token_batch(&["a cat"]), &cancel)
            .await
            .unwrap();

        assert_eq!(loader.loads(), 1);
        assert_eq!(first.as_slice(), second.as_slice());
    }

    #[tokio::test]
    async fn test_inference_error_crosses_as_message() {
        let channel = WorkerChannel::spawn(Arc::new(FakeLoader::without_output())).unwrap();
        let err = channel
            .generate_text_embeddings("/m/text".into(), token_batch(&["a cat"]), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            WorkerError::Remote(message) => assert!(message.contains("no embedding returned")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_releases_pending_slot() {
        let loader = Arc::new(FakeLoader::slow(Duration::from_millis(300)));
        let channel = WorkerChannel::spawn_with_timeout(loader, Duration::from_millis(50)).unwrap();
        let cancel = CancellationToken::new();

        let err = channel
            .generate_text_embeddings(Path::new("/m/text").into(), token_batch(&["a cat"]), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Timeout(_)));
        assert_ne!(channel.state(), WorkerState::AwaitingReply);
    }

    #[tokio::test]
    async fn test_cancelled_request() {
        let loader = Arc::new(FakeLoader::slow(Duration::from_millis(300)));
        let channel = WorkerChannel::spawn(loader).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = channel
            .generate_text_embeddings("/m/text".into(), token_batch(&["a cat"]), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Cancelled));
    }

    #[tokio::test]
    async fn test_shutdown_terminates_channel() {
        let channel = WorkerChannel::spawn(Arc::new(FakeLoader::default())).unwrap();
        wait_for(&channel, WorkerState::Idle).await;

        channel.shutdown();
        wait_for(&channel, WorkerState::Terminated).await;

        let err = channel.request(None, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, WorkerError::Terminated));
    }
}
