use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use zerocopy::byteorder::little_endian::F32;
use zerocopy::IntoBytes;

use crate::config;
use crate::embeddings::session::Embeddings;
use crate::embeddings::text_prep::TextInput;

#[derive(Debug, Deserialize)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize)]
pub struct ResponseOk<T: Serialize> {
    pub id: String,
    pub result: T,
}

#[derive(Debug, Serialize)]
pub struct ResponseErr {
    pub id: String,
    pub error: String,
}

/// `embedWorker` / `embedInProcess` params. `texts` wins over `text`.
#[derive(Debug, Default, Deserialize)]
pub struct EmbedParams {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub texts: Option<Vec<String>>,
}

impl EmbedParams {
    pub fn into_input(self) -> TextInput {
        match (self.texts, self.text) {
            (Some(texts), _) => TextInput::Many(texts),
            (None, Some(text)) => TextInput::One(text),
            (None, None) => TextInput::One(config::embedding::DEFAULT_TEST_INPUT.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SetOnlineParams {
    pub online: bool,
}

/// Flat embedding buffer as it crosses to the UI: base64 of little-endian f32s,
/// interpretable as `batchSize × dims`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingResult {
    pub array_buffer: String,
    pub batch_size: usize,
    pub dims: usize,
}

impl EmbeddingResult {
    pub fn from_embeddings(e: &Embeddings) -> Self {
        Self {
            array_buffer: encode_f32_le(e.as_slice()),
            batch_size: e.batch_size(),
            dims: e.dims(),
        }
    }
}

pub fn encode_f32_le(values: &[f32]) -> String {
    let le: Vec<F32> = values.iter().map(|&v| F32::new(v)).collect();
    base64::engine::general_purpose::STANDARD.encode(le.as_bytes())
}

/// Parse params, treating a missing/null params object as all defaults.
pub fn parse_params<T>(params: &Value) -> anyhow::Result<T>
where
    T: for<'de> Deserialize<'de> + Default,
{
    if params.is_null() {
        return Ok(T::default());
    }
    Ok(serde_json::from_value(params.clone())?)
}
