// text_prep.rs — Input text preparation before tokenization.
//
// Accepts a single text or a sequence of texts and normalises each row:
// trimmed, and word-truncated so the tokenizer rarely has to cut mid-sentence.

use anyhow::bail;
use serde::Deserialize;

use crate::config;

/// "text | sequence of text" as accepted by the embedding entry points.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum TextInput {
    One(String),
    Many(Vec<String>),
}

impl TextInput {
    pub fn len(&self) -> usize {
        match self {
            TextInput::One(_) => 1,
            TextInput::Many(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<&str> for TextInput {
    fn from(s: &str) -> Self {
        TextInput::One(s.to_string())
    }
}

impl From<String> for TextInput {
    fn from(s: String) -> Self {
        TextInput::One(s)
    }
}

impl From<Vec<String>> for TextInput {
    fn from(v: Vec<String>) -> Self {
        TextInput::Many(v)
    }
}

/// One normalised row per input text. An empty sequence is rejected: a batch
/// of zero rows has no embedding to return.
pub fn prepare_inputs(input: &TextInput) -> anyhow::Result<Vec<String>> {
    if input.is_empty() {
        bail!("no input text to embed");
    }
    let mut rows = Vec::with_capacity(input.len());
    match input {
        TextInput::One(text) => rows.push(prepare_text(text)),
        TextInput::Many(texts) => rows.extend(texts.iter().map(|t| prepare_text(t))),
    }
    Ok(rows)
}

fn prepare_text(text: &str) -> String {
    truncate_words(text.trim(), config::embedding::MAX_INPUT_WORDS)
}

/// Truncate text to the first N whitespace-delimited words.
pub fn truncate_words(text: &str, max_words: usize) -> String {
    let mut count = 0;
    let mut end = 0;
    let mut in_word = false;

    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            if in_word {
                count += 1;
                in_word = false;
                if count >= max_words {
                    break;
                }
            }
        } else {
            in_word = true;
        }
        end = i + c.len_utf8();
    }

    text[..end].trim().to_string()
}
