// session.rs — Lazily loaded inference sessions, cached by model path.
//
// A SessionManager is owned by exactly one execution context (the worker thread,
// or the in-process dispatcher). Sessions live until their owner is dropped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::tokenize::TokenBatch;

/// Flattened `[batch_size, dims]` embedding output.
#[derive(Debug, Clone, PartialEq)]
pub struct Embeddings {
    data: Vec<f32>,
    batch_size: usize,
}

impl Embeddings {
    pub fn new(data: Vec<f32>, batch_size: usize) -> Result<Self, InferenceError> {
        if batch_size == 0 || data.is_empty() {
            return Err(InferenceError::MissingOutput(format!(
                "empty output ({} values, batch size {batch_size})",
                data.len()
            )));
        }
        if data.len() % batch_size != 0 {
            return Err(InferenceError::ShapeMismatch {
                len: data.len(),
                batch_size,
            });
        }
        Ok(Self { data, batch_size })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn dims(&self) -> usize {
        self.data.len() / self.batch_size
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    #[cfg(test)]
    pub fn row(&self, i: usize) -> Option<&[f32]> {
        let dims = self.dims();
        self.data.get(i * dims..(i + 1) * dims)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("failed to load model {}: {source:#}", path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("no embedding returned from text model: {0}")]
    MissingOutput(String),

    #[error("embedding output of {len} values does not divide into {batch_size} rows")]
    ShapeMismatch { len: usize, batch_size: usize },

    #[error("inference failed: {0:#}")]
    Compute(#[source] anyhow::Error),
}

/// A loaded, execution-ready model.
pub trait InferenceSession: Send + Sync {
    fn run(&self, tokens: &TokenBatch) -> Result<Embeddings, InferenceError>;
}

/// Loads a session from a model file. Loading may be expensive.
pub trait SessionLoader: Send + Sync {
    fn load(&self, model_path: &Path) -> anyhow::Result<Arc<dyn InferenceSession>>;
}

pub struct SessionManager {
    loader: Arc<dyn SessionLoader>,
    sessions: HashMap<PathBuf, Arc<dyn InferenceSession>>,
}

impl SessionManager {
    pub fn new(loader: Arc<dyn SessionLoader>) -> Self {
        Self {
            loader,
            sessions: HashMap::new(),
        }
    }

    /// Return the cached session for `model_path`, loading it on first use.
    /// A failed load is not cached; the next call tries again.
    pub fn ensure_session(&mut self, model_path: &Path) -> Result<Arc<dyn InferenceSession>, InferenceError> {
        if let Some(session) = self.sessions.get(model_path) {
            return Ok(Arc::clone(session));
        }

        log::info!("Loading inference session for {}", model_path.display());
        let session = self.loader.load(model_path).map_err(|source| InferenceError::Load {
            path: model_path.to_path_buf(),
            source,
        })?;
        self.sessions.insert(model_path.to_path_buf(), Arc::clone(&session));
        Ok(session)
    }

    pub fn run(&self, session: &dyn InferenceSession, tokens: &TokenBatch) -> Result<Embeddings, InferenceError> {
        let out = session.run(tokens)?;
        if out.batch_size() != tokens.batch_size {
            return Err(InferenceError::MissingOutput(format!(
                "expected {} rows, model returned {}",
                tokens.batch_size,
                out.batch_size()
            )));
        }
        Ok(out)
    }

    /// `ensure_session` + `run`.
    pub fn embed(&mut self, model_path: &Path, tokens: &TokenBatch) -> Result<Embeddings, InferenceError> {
        let session = self.ensure_session(model_path)?;
        self.run(session.as_ref(), tokens)
    }

    pub fn loaded_count(&self) -> usize {
        self.sessions.len()
    }
}
