// engine.rs — Candle BERT session with attention-mask-aware mean pooling.
//
// Loads all-MiniLM-L6-v2 from safetensors (config.json sits next to the weights),
// runs a padded batch in one forward pass and returns L2-normalised sentence
// embeddings, one row per input.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig};

use super::session::{Embeddings, InferenceError, InferenceSession, SessionLoader};
use super::tokenize::TokenBatch;
use crate::config;

pub struct BertSession {
    model: BertModel,
    device: Device,
    hidden_size: usize,
}

impl BertSession {
    /// Load from the weights file; `config.json` must be in the same directory.
    pub fn load(weights_path: &Path) -> anyhow::Result<Self> {
        let device = Device::Cpu;

        let model_dir = weights_path
            .parent()
            .with_context(|| format!("weights path {} has no parent directory", weights_path.display()))?;
        let config_path = model_dir.join(config::embedding::CONFIG_FILE);
        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("read {}", config_path.display()))?;
        let bert_config: BertConfig = serde_json::from_str(&config_str)
            .with_context(|| format!("parse {}", config_path.display()))?;

        log::info!(
            "Loading embedding model: hidden_size={}, layers={}, heads={}",
            bert_config.hidden_size,
            bert_config.num_hidden_layers,
            bert_config.num_attention_heads,
        );

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_path.to_path_buf()], DType::F32, &device)
                .with_context(|| format!("load weights from {}", weights_path.display()))?
        };
        let model = BertModel::load(vb, &bert_config).context("load BERT model")?;

        if bert_config.hidden_size != config::embedding::EMBEDDING_DIMS {
            log::warn!(
                "Model hidden size {} differs from configured EMBEDDING_DIMS {}",
                bert_config.hidden_size,
                config::embedding::EMBEDDING_DIMS
            );
        }
        log::info!("Embedding model loaded successfully (dims={})", bert_config.hidden_size);

        Ok(Self::new(model, device, bert_config.hidden_size))
    }

    fn new(model: BertModel, device: Device, hidden_size: usize) -> Self {
        Self {
            model,
            device,
            hidden_size,
        }
    }

    fn forward(&self, tokens: &TokenBatch) -> anyhow::Result<Tensor> {
        let shape = (tokens.batch_size, tokens.seq_len);
        let input_ids = Tensor::from_vec(tokens.input_ids.clone(), shape, &self.device)?;
        let attention_mask = Tensor::from_vec(tokens.attention_mask.clone(), shape, &self.device)?;
        let token_type_ids = input_ids.zeros_like()?;

        // [batch, seq_len, hidden_size]
        let hidden = self
            .model
            .forward(&input_ids, &token_type_ids, Some(&attention_mask))?;

        let pooled = mean_pooling(&hidden, &attention_mask)?;
        l2_normalize(&pooled)
    }
}

impl InferenceSession for BertSession {
    fn run(&self, tokens: &TokenBatch) -> Result<Embeddings, InferenceError> {
        if tokens.batch_size == 0 || tokens.seq_len == 0 {
            return Err(InferenceError::MissingOutput("empty token batch".into()));
        }

        let pooled = self.forward(tokens).map_err(InferenceError::Compute)?;
        let (batch_size, dims) = pooled
            .dims2()
            .map_err(|e| InferenceError::MissingOutput(format!("unexpected output rank: {e}")))?;
        if dims != self.hidden_size {
            return Err(InferenceError::MissingOutput(format!(
                "output width {dims}, model hidden size {}",
                self.hidden_size
            )));
        }

        let data: Vec<f32> = pooled
            .flatten_all()
            .and_then(|t| t.to_vec1())
            .map_err(|e| InferenceError::Compute(e.into()))?;

        Embeddings::new(data, batch_size)
    }
}

pub struct BertSessionLoader;

impl SessionLoader for BertSessionLoader {
    fn load(&self, model_path: &Path) -> anyhow::Result<Arc<dyn InferenceSession>> {
        Ok(Arc::new(BertSession::load(model_path)?))
    }
}

/// Attention-mask-aware mean pooling.
///
/// input_embeds: [batch, seq_len, hidden_size]
/// attention_mask: [batch, seq_len] (1 for real tokens, 0 for padding)
/// output: [batch, hidden_size]
fn mean_pooling(input_embeds: &Tensor, attention_mask: &Tensor) -> anyhow::Result<Tensor> {
    let mask_expanded = attention_mask
        .to_dtype(DType::F32)?
        .unsqueeze(2)?
        .broadcast_as(input_embeds.shape())?;

    let sum_embeddings = (input_embeds * &mask_expanded)?.sum(1)?;

    // Clamp to avoid div by zero on an all-padding row.
    let sum_mask = mask_expanded.sum(1)?.clamp(1e-9, f64::MAX)?;

    Ok((sum_embeddings / sum_mask)?)
}

/// L2 normalize a tensor along the last dimension.
fn l2_normalize(tensor: &Tensor) -> anyhow::Result<Tensor> {
    let norm = tensor.sqr()?.sum_keepdim(1)?.sqrt()?;
    let norm = norm.clamp(1e-12, f64::MAX)?;
    Ok(tensor.broadcast_div(&norm)?)
}
