// embeddings/ — On-demand model acquisition plus text-embedding inference.
//
// Provides:
// - Asset paths and streaming download with atomic commit
// - Tokenization hand-off and lazily loaded inference sessions (candle BERT)
// - An isolated inference worker reachable by correlated messages
// - The orchestrator tying them together

pub mod assets;
pub mod download;
pub mod engine;
pub mod orchestrator;
pub mod session;
pub mod text_prep;
pub mod tokenize;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;
