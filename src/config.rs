// IMPORTANT:
// Keep ALL numeric values centralized here (repo rule: no hardcoded numeric values scattered around).

// NOTE: HOST_VERSION must stay in sync with the `version` field in Cargo.toml.
pub const HOST_VERSION: &str = "0.1.0";

pub mod logging {
    pub const LOG_DIR_REL: &str = ".embed-host/logs";
    pub const LOG_FILE_NAME: &str = "embed_host.log";

    pub const LOG_ROTATE_SIZE_BYTES: u64 = 10 * 1024 * 1024;
    pub const LOG_ROTATE_KEEP_FILES: usize = 5;
}

pub mod native_messaging {
    pub const MAX_MESSAGE_SIZE_BYTES: u32 = 128 * 1024 * 1024;
}

pub mod runtime {
    pub const WORKER_THREADS: usize = 2;
}

pub mod download {
    // One read from the response body; bounds peak memory of a transfer.
    pub const CHUNK_SIZE_BYTES: usize = 256 * 1024;

    pub const CONNECT_TIMEOUT_SECS: u64 = 30;
    // Applies per read, so a stalled body fails instead of hanging forever.
    pub const READ_TIMEOUT_SECS: u64 = 60;

    pub const TEMP_SUFFIX: &str = ".tmp";
}

pub mod embedding {
    pub const EMBEDDING_DIMS: usize = 384;
    pub const EMBEDDING_MODEL_NAME: &str = "all-MiniLM-L6-v2";

    // Max word-piece tokens for all-MiniLM-L6-v2 (model context limit is 256).
    pub const MAX_TOKENS: usize = 256;
    // Word-level pre-truncation; word-piece expands ~1.3x, so this stays under MAX_TOKENS.
    pub const MAX_INPUT_WORDS: usize = 190;

    // Env override: EMBED_HOST_MODEL_BASE_URL
    pub const MODEL_BASE_URL: &str =
        "https://huggingface.co/sentence-transformers/all-MiniLM-L6-v2/resolve/main";

    // Env override: EMBED_HOST_ASSET_DIR
    pub const MODEL_DIR_REL: &str = ".embed-host/models/all-MiniLM-L6-v2";

    pub const CONFIG_FILE: &str = "config.json";
    pub const TOKENIZER_FILE: &str = "tokenizer.json";
    pub const WEIGHTS_FILE: &str = "model.safetensors";

    // SHA256 hashes for integrity verification. Only enforced against MODEL_BASE_URL;
    // a mirror set through EMBED_HOST_MODEL_BASE_URL is trusted as-is.
    pub const CONFIG_JSON_SHA256: &str =
        "953f9c0d463486b10a6871cc2fd59f223b2c70184f49815e7efbcab5d8908b41";
    pub const TOKENIZER_JSON_SHA256: &str =
        "be50c3628f2bf5bb5e3a7f17b1f74611b2561a3a27eeab05e5aa30f411572037";
    pub const MODEL_SAFETENSORS_SHA256: &str =
        "53aa51172d142c89d9012cce15ae4d6cc0ca6895895114379cacb4fab128d9db";

    // Used when the UI asks for a test embedding without providing text.
    pub const DEFAULT_TEST_INPUT: &str = "A man and his dog at the beach";
}

pub mod worker {
    pub const THREAD_NAME: &str = "inference-worker";

    // First reply includes the one-time model load, so keep this generous.
    pub const REPLY_TIMEOUT_SECS: u64 = 120;
}
