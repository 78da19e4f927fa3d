// tokenize.rs — Text to model-ready token tensors.
//
// The tokenizer itself is opaque to the pipeline: anything implementing `Tokenize`
// and producing a row-major [batch, seq_len] id/mask pair will do.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use tokenizers::{PaddingParams, Tokenizer, TruncationParams};

use crate::config;

/// Row-major `[batch_size, seq_len]` token ids plus attention mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBatch {
    pub input_ids: Vec<i64>,
    pub attention_mask: Vec<i64>,
    pub batch_size: usize,
    pub seq_len: usize,
}

impl TokenBatch {
    pub fn new(
        input_ids: Vec<i64>,
        attention_mask: Vec<i64>,
        batch_size: usize,
        seq_len: usize,
    ) -> anyhow::Result<Self> {
        let expected = batch_size * seq_len;
        if input_ids.len() != expected || attention_mask.len() != expected {
            bail!(
                "token batch shape mismatch: {} ids / {} mask values for [{batch_size}, {seq_len}]",
                input_ids.len(),
                attention_mask.len()
            );
        }
        Ok(Self {
            input_ids,
            attention_mask,
            batch_size,
            seq_len,
        })
    }

    #[cfg(test)]
    pub fn row_ids(&self, row: usize) -> &[i64] {
        &self.input_ids[row * self.seq_len..(row + 1) * self.seq_len]
    }

    #[cfg(test)]
    pub fn row_mask(&self, row: usize) -> &[i64] {
        &self.attention_mask[row * self.seq_len..(row + 1) * self.seq_len]
    }
}

/// Pure, deterministic text -> tokens conversion.
pub trait Tokenize: Send + Sync {
    fn tokenize(&self, texts: &[String]) -> anyhow::Result<TokenBatch>;
}

pub trait TokenizerLoader: Send + Sync {
    fn load(&self, path: &Path) -> anyhow::Result<Arc<dyn Tokenize>>;
}

/// HuggingFace `tokenizer.json` tokenizer, padded to the longest row of a batch.
pub struct HfTokenizer {
    inner: Tokenizer,
}

impl HfTokenizer {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let inner = Tokenizer::from_file(path)
            .map_err(|e| anyhow::anyhow!("load tokenizer {}: {e}", path.display()))?;
        let tokenizer = Self::from_tokenizer(inner)?;
        log::info!("Tokenizer loaded from {}", path.display());
        Ok(tokenizer)
    }

    fn from_tokenizer(mut inner: Tokenizer) -> anyhow::Result<Self> {
        inner.with_padding(Some(PaddingParams::default()));
        inner
            .with_truncation(Some(TruncationParams {
                max_length: config::embedding::MAX_TOKENS,
                ..Default::default()
            }))
            .map_err(|e| anyhow::anyhow!("configure truncation: {e}"))?;
        Ok(Self { inner })
    }
}

impl Tokenize for HfTokenizer {
    fn tokenize(&self, texts: &[String]) -> anyhow::Result<TokenBatch> {
        if texts.is_empty() {
            bail!("no input text to tokenize");
        }

        let encodings = self
            .inner
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| anyhow::anyhow!("tokenize: {e}"))?;

        let seq_len = encodings.iter().map(|e| e.get_ids().len()).max().unwrap_or(0);
        let batch_size = encodings.len();
        let mut input_ids = Vec::with_capacity(batch_size * seq_len);
        let mut attention_mask = Vec::with_capacity(batch_size * seq_len);

        for enc in &encodings {
            let ids = enc.get_ids();
            input_ids.extend(ids.iter().map(|&id| id as i64));
            attention_mask.extend(enc.get_attention_mask().iter().map(|&m| m as i64));
            // Batch-longest padding already equalises rows; this only covers a
            // tokenizer.json that overrides the padding config.
            for _ in ids.len()..seq_len {
                input_ids.push(0);
                attention_mask.push(0);
            }
        }

        TokenBatch::new(input_ids, attention_mask, batch_size, seq_len).context("assemble token batch")
    }
}

pub struct HfTokenizerLoader;

impl TokenizerLoader for HfTokenizerLoader {
    fn load(&self, path: &Path) -> anyhow::Result<Arc<dyn Tokenize>> {
        Ok(Arc::new(HfTokenizer::from_file(path)?))
    }
}
