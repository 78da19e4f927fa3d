// assets.rs — Where model assets live locally and where they come from.
//
// Paths are deterministic: <asset dir>/<file name>. The asset dir defaults to
// ~/.embed-host/models/<model>/ and can be moved with EMBED_HOST_ASSET_DIR.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::{config, logging};

/// A model file required for inference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetDescriptor {
    /// Human-readable name used in progress logs.
    pub name: String,
    pub url: String,
    pub dest: PathBuf,
    /// Expected SHA-256 (lowercase hex). `None` skips the integrity check.
    pub sha256: Option<String>,
}

impl AssetDescriptor {
    pub fn new(name: impl Into<String>, url: impl Into<String>, dest: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            dest: dest.into(),
            sha256: None,
        }
    }

    pub fn with_sha256(mut self, sha256: impl Into<String>) -> Self {
        self.sha256 = Some(sha256.into());
        self
    }

    pub fn exists(&self) -> bool {
        self.dest.is_file()
    }

    pub fn temp_path(&self) -> PathBuf {
        temp_path_for(&self.dest)
    }
}

/// `<dest>.tmp`, the sibling a download streams into before commit.
pub fn temp_path_for(dest: &Path) -> PathBuf {
    let mut name: OsString = dest.as_os_str().to_owned();
    name.push(config::download::TEMP_SUFFIX);
    PathBuf::from(name)
}

/// The full set of files the text model needs, fixed for the process lifetime.
#[derive(Debug, Clone)]
pub struct AssetSet {
    dir: PathBuf,
    assets: Vec<AssetDescriptor>,
}

impl AssetSet {
    /// Resolve the asset directory and base URL from the environment (or defaults).
    pub fn from_env() -> anyhow::Result<Self> {
        let dir = asset_dir()?;
        let base_url = std::env::var("EMBED_HOST_MODEL_BASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| config::embedding::MODEL_BASE_URL.to_string());
        Ok(Self::new(dir, &base_url))
    }

    /// Digests from `config::embedding` are attached only when `base_url` is the
    /// default model location.
    pub fn new(dir: impl Into<PathBuf>, base_url: &str) -> Self {
        let dir = dir.into();
        let base = base_url.trim_end_matches('/');
        let assets = [
            ("Model config", config::embedding::CONFIG_FILE),
            ("Tokenizer", config::embedding::TOKENIZER_FILE),
            ("Text model", config::embedding::WEIGHTS_FILE),
        ]
        .into_iter()
        .map(|(name, file)| AssetDescriptor::new(name, format!("{base}/{file}"), dir.join(file)))
        .collect();

        let set = Self { dir, assets };
        if base != config::embedding::MODEL_BASE_URL {
            log::info!("Using model mirror {base}; pinned digests not enforced");
            return set;
        }
        set.with_digest(config::embedding::CONFIG_FILE, config::embedding::CONFIG_JSON_SHA256)
            .with_digest(config::embedding::TOKENIZER_FILE, config::embedding::TOKENIZER_JSON_SHA256)
            .with_digest(config::embedding::WEIGHTS_FILE, config::embedding::MODEL_SAFETENSORS_SHA256)
    }

    /// Require `sha256` for the asset stored as `file_name`. Unknown names are ignored.
    pub fn with_digest(mut self, file_name: &str, sha256: &str) -> Self {
        self.assets = self
            .assets
            .into_iter()
            .map(|a| {
                if a.dest.file_name().is_some_and(|n| n == file_name) {
                    a.with_sha256(sha256)
                } else {
                    a
                }
            })
            .collect();
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn assets(&self) -> &[AssetDescriptor] {
        &self.assets
    }

    pub fn tokenizer_path(&self) -> PathBuf {
        self.dir.join(config::embedding::TOKENIZER_FILE)
    }

    pub fn weights_path(&self) -> PathBuf {
        self.dir.join(config::embedding::WEIGHTS_FILE)
    }

    pub fn missing(&self) -> Vec<&AssetDescriptor> {
        self.assets.iter().filter(|a| !a.exists()).collect()
    }

    pub fn all_present(&self) -> bool {
        self.assets.iter().all(AssetDescriptor::exists)
    }
}

/// Application-private directory holding the model files.
pub fn asset_dir() -> anyhow::Result<PathBuf> {
    if let Ok(v) = std::env::var("EMBED_HOST_ASSET_DIR") {
        if !v.trim().is_empty() {
            return Ok(PathBuf::from(v));
        }
    }
    let home = logging::home_dir()
        .context("cannot determine home directory (neither HOME nor USERPROFILE is set)")?;
    Ok(home.join(config::embedding::MODEL_DIR_REL))
}
