// orchestrator.rs — Top-level embedding pipeline.
//
// ensure assets (download missing ones, one at a time) → prepare + tokenize input
// → dispatch to the worker thread or the in-process session → embeddings.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use super::assets::AssetSet;
use super::download::{DownloadError, Downloader, NetworkState, Progress};
use super::engine::BertSessionLoader;
use super::session::{Embeddings, InferenceError, SessionLoader, SessionManager};
use super::text_prep::{self, TextInput};
use super::tokenize::{HfTokenizerLoader, Tokenize, TokenizerLoader};
use super::worker::{WorkerChannel, WorkerError, WorkerState};

/// Where a request is executed. Both produce identical embeddings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Dedicated inference thread; keeps the coordinator responsive.
    Worker,
    /// Directly on the calling task.
    InProcess,
}

#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error("failed to prepare asset directory {}: {source}", path.display())]
    AssetDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("tokenizer failed: {0:#}")]
    Tokenize(#[source] anyhow::Error),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetStatus {
    pub name: String,
    pub path: String,
    pub present: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorStatus {
    pub asset_dir: String,
    pub assets: Vec<AssetStatus>,
    pub online: bool,
    /// `None` until the first worker dispatch.
    pub worker: Option<String>,
}

pub struct EmbeddingOrchestrator {
    assets: AssetSet,
    downloader: Downloader,
    tokenizer_loader: Arc<dyn TokenizerLoader>,
    session_loader: Arc<dyn SessionLoader>,
    tokenizer: OnceCell<Arc<dyn Tokenize>>,
    worker: tokio::sync::Mutex<Option<Arc<WorkerChannel>>>,
    in_process: Mutex<SessionManager>,
    // Single-writer discipline for the temp/final file pairs.
    acquire: tokio::sync::Mutex<()>,
}

impl EmbeddingOrchestrator {
    pub fn new(
        assets: AssetSet,
        network: Arc<NetworkState>,
        tokenizer_loader: Arc<dyn TokenizerLoader>,
        session_loader: Arc<dyn SessionLoader>,
    ) -> Self {
        Self {
            assets,
            downloader: Downloader::new(network),
            tokenizer_loader,
            in_process: Mutex::new(SessionManager::new(Arc::clone(&session_loader))),
            session_loader,
            tokenizer: OnceCell::new(),
            worker: tokio::sync::Mutex::new(None),
            acquire: tokio::sync::Mutex::new(()),
        }
    }

    /// HuggingFace tokenizer + candle BERT.
    pub fn with_candle(assets: AssetSet, network: Arc<NetworkState>) -> Self {
        Self::new(
            assets,
            network,
            Arc::new(HfTokenizerLoader),
            Arc::new(BertSessionLoader),
        )
    }

    pub fn assets(&self) -> &AssetSet {
        &self.assets
    }

    pub fn network(&self) -> &NetworkState {
        self.downloader.network()
    }

    /// Download every missing asset, sequentially. Returns how many were fetched.
    /// Assets already on disk cause no network I/O.
    pub async fn ensure_assets(&self, cancel: &CancellationToken) -> Result<usize, EmbedError> {
        let _held = self.acquire.lock().await;
        if self.assets.all_present() {
            log::debug!("Model assets already present in {}", self.assets.dir().display());
            return Ok(0);
        }
        // Nothing touches the disk while offline.
        if !self.network().is_online() {
            return Err(DownloadError::Offline.into());
        }

        let mut downloaded = 0;
        for asset in self.assets.missing() {
            if let Some(parent) = asset.dest.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| EmbedError::AssetDir {
                        path: parent.to_path_buf(),
                        source,
                    })?;
            }

            let downloader = self.downloader.clone();
            let asset = asset.clone();
            let name = asset.name.clone();
            let cancel = cancel.clone();
            let report = tokio::task::spawn_blocking(move || {
                let mut next_mark = 10.0;
                downloader.download(&asset, &cancel, &mut |p| {
                    if let Progress::Percent(pct) = p {
                        if pct >= next_mark {
                            log::info!("Downloading model: {}... {:.0}%", asset.name, pct);
                            next_mark = (pct / 10.0).floor() * 10.0 + 10.0;
                        }
                    }
                })
            })
            .await??;
            log::info!("{} committed: {} bytes, sha256 {}", name, report.bytes, report.sha256);
            downloaded += 1;
        }

        if downloaded > 0 {
            log::info!("Model assets ready in {} ({} downloaded)", self.assets.dir().display(), downloaded);
        }
        Ok(downloaded)
    }

    pub async fn get_text_embedding(
        &self,
        input: &TextInput,
        dispatch: Dispatch,
        cancel: &CancellationToken,
    ) -> Result<Embeddings, EmbedError> {
        self.ensure_assets(cancel).await?;

        let rows = text_prep::prepare_inputs(input).map_err(EmbedError::Tokenize)?;
        let tokenizer = self.tokenizer().await?;
        let tokens = tokenizer.tokenize(&rows).map_err(EmbedError::Tokenize)?;
        let model_path = self.assets.weights_path();

        let embeddings = match dispatch {
            Dispatch::Worker => {
                let worker = self.worker().await?;
                worker.generate_text_embeddings(model_path, tokens, cancel).await?
            }
            Dispatch::InProcess => {
                let mut sessions = self.in_process.lock().unwrap_or_else(|e| e.into_inner());
                sessions.embed(&model_path, &tokens)?
            }
        };

        log::info!(
            "Embedded {} input(s) via {:?} (dims={})",
            embeddings.batch_size(),
            dispatch,
            embeddings.dims()
        );
        Ok(embeddings)
    }

    pub async fn status(&self) -> OrchestratorStatus {
        let assets = self
            .assets
            .assets()
            .iter()
            .map(|a| AssetStatus {
                name: a.name.clone(),
                path: a.dest.to_string_lossy().into_owned(),
                present: a.exists(),
            })
            .collect();
        let worker = self.worker.lock().await.as_ref().map(|w| w.state().to_string());

        OrchestratorStatus {
            asset_dir: self.assets.dir().to_string_lossy().into_owned(),
            assets,
            online: self.network().is_online(),
            worker,
        }
    }

    pub async fn shutdown(&self) {
        if let Some(worker) = self.worker.lock().await.take() {
            worker.shutdown();
        }
    }

    /// Loaded on first use, after the assets exist. A failed load is retried next time.
    async fn tokenizer(&self) -> Result<Arc<dyn Tokenize>, EmbedError> {
        let tokenizer = self
            .tokenizer
            .get_or_try_init(|| async {
                let loader = Arc::clone(&self.tokenizer_loader);
                let path = self.assets.tokenizer_path();
                tokio::task::spawn_blocking(move || loader.load(&path))
                    .await?
                    .map_err(EmbedError::Tokenize)
            })
            .await?;
        Ok(Arc::clone(tokenizer))
    }

    /// Spawned on first worker dispatch; respawned if the previous one terminated.
    async fn worker(&self) -> Result<Arc<WorkerChannel>, WorkerError> {
        let mut slot = self.worker.lock().await;
        if let Some(worker) = slot.as_ref() {
            if worker.state() != WorkerState::Terminated {
                return Ok(Arc::clone(worker));
            }
            log::warn!("Inference worker terminated, spawning a new one");
        }

        let worker = Arc::new(WorkerChannel::spawn(Arc::clone(&self.session_loader))?);
        *slot = Some(Arc::clone(&worker));
        Ok(worker)
    }
}
