// download.rs — Streaming model download with atomic commit.
//
// The body is streamed chunk by chunk into `<dest>.tmp` and renamed onto `dest`
// only after the whole transfer succeeded, so `dest` is either absent or complete.
// Any failure after the request was opened removes both the temp file and `dest`.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use super::assets::AssetDescriptor;
use crate::config;

/// Connectivity as reported by the desktop app (`setOnline`). Starts online.
#[derive(Debug)]
pub struct NetworkState {
    online: AtomicBool,
}

impl NetworkState {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::SeqCst);
        if was != online {
            log::info!("Network state changed: online={}", online);
        }
    }
}

impl Default for NetworkState {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Emitted after every chunk written.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Progress {
    /// Share of the declared content length received so far, 0..=100.
    Percent(f64),
    /// Cumulative bytes, when the server did not declare a length.
    Bytes(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub bytes: u64,
    /// Lowercase hex SHA-256 of the committed file.
    pub sha256: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("application is offline")]
    Offline,

    #[error("transfer from {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("HTTP {status} downloading {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("failed writing {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("SHA256 mismatch for {name}: expected {expected}, got {actual}")]
    Integrity {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("download of {0} cancelled")]
    Cancelled(String),
}

/// Blocking HTTP downloader. Run it under `spawn_blocking` from async code.
#[derive(Clone)]
pub struct Downloader {
    agent: ureq::Agent,
    network: Arc<NetworkState>,
}

impl Downloader {
    pub fn new(network: Arc<NetworkState>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(config::download::CONNECT_TIMEOUT_SECS))
            .timeout_read(Duration::from_secs(config::download::READ_TIMEOUT_SECS))
            .build();
        Self { agent, network }
    }

    pub fn network(&self) -> &NetworkState {
        &self.network
    }

    /// Fetch `asset.url` into `asset.dest`. Does not check whether `dest` already exists.
    pub fn download(
        &self,
        asset: &AssetDescriptor,
        cancel: &CancellationToken,
        on_progress: &mut dyn FnMut(Progress),
    ) -> Result<DownloadReport, DownloadError> {
        if !self.network.is_online() {
            return Err(DownloadError::Offline);
        }
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled(asset.name.clone()));
        }

        log::info!("Downloading {} from {}", asset.name, asset.url);

        let resp = match self.agent.get(&asset.url).call() {
            Ok(resp) => resp,
            Err(ureq::Error::Status(status, _)) => {
                return Err(DownloadError::HttpStatus {
                    url: asset.url.clone(),
                    status,
                });
            }
            Err(e) => {
                return Err(DownloadError::Transport {
                    url: asset.url.clone(),
                    source: Box::new(e),
                });
            }
        };

        // A missing or zero length degrades progress to byte counts.
        let total = resp
            .header("Content-Length")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|&n| n > 0);

        stream_to_file(resp.into_reader(), total, asset, cancel, on_progress)
    }
}

/// Stream `body` into `<dest>.tmp` and commit it onto `dest` by rename.
///
/// On any error both the temp file and `dest` are removed (best effort) and the
/// original error is returned.
pub fn stream_to_file<R: Read>(
    mut body: R,
    total: Option<u64>,
    asset: &AssetDescriptor,
    cancel: &CancellationToken,
    on_progress: &mut dyn FnMut(Progress),
) -> Result<DownloadReport, DownloadError> {
    let tmp = asset.temp_path();
    let result = write_and_commit(&mut body, total, asset, &tmp, cancel, on_progress);
    if let Err(e) = &result {
        log::warn!("Download of {} failed: {}", asset.name, e);
        discard_partial(&tmp, &asset.dest);
    }
    result
}

fn write_and_commit(
    body: &mut dyn Read,
    total: Option<u64>,
    asset: &AssetDescriptor,
    tmp: &Path,
    cancel: &CancellationToken,
    on_progress: &mut dyn FnMut(Progress),
) -> Result<DownloadReport, DownloadError> {
    let persist = |source: io::Error| DownloadError::Persistence {
        path: tmp.to_path_buf(),
        source,
    };
    let transport = |source: io::Error| DownloadError::Transport {
        url: asset.url.clone(),
        source: Box::new(source),
    };

    let mut file = File::create(tmp).map_err(persist)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; config::download::CHUNK_SIZE_BYTES];
    let mut received: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled(asset.name.clone()));
        }

        let n = match body.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(transport(e)),
        };

        let chunk = &buf[..n];
        file.write_all(chunk).map_err(persist)?;
        hasher.update(chunk);
        received += n as u64;

        let progress = match total {
            Some(total) => Progress::Percent((received as f64 * 100.0) / total as f64),
            None => Progress::Bytes(received),
        };
        match progress {
            Progress::Percent(p) => log::debug!("Downloading {}... {:.1}%", asset.name, p),
            Progress::Bytes(b) => log::debug!("Downloading {}... {} bytes", asset.name, b),
        }
        on_progress(progress);
    }

    if let Some(total) = total {
        if received != total {
            return Err(transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("body ended after {received} of {total} bytes"),
            )));
        }
    }

    file.flush().map_err(persist)?;
    file.sync_all().map_err(persist)?;
    drop(file);

    let actual = hex::encode(hasher.finalize());
    if let Some(expected) = &asset.sha256 {
        if !expected.trim().eq_ignore_ascii_case(&actual) {
            return Err(DownloadError::Integrity {
                name: asset.name.clone(),
                expected: expected.clone(),
                actual,
            });
        }
        log::info!("SHA256 verified for {} ({})", asset.name, &actual[..12]);
    }

    fs::rename(tmp, &asset.dest).map_err(|source| DownloadError::Persistence {
        path: asset.dest.clone(),
        source,
    })?;

    log::info!(
        "Downloaded {} ({} bytes) to {}",
        asset.name,
        received,
        asset.dest.display()
    );

    Ok(DownloadReport {
        bytes: received,
        sha256: actual,
    })
}

fn discard_partial(tmp: &Path, dest: &Path) {
    for path in [tmp, dest] {
        match fs::remove_file(path) {
            Ok(()) => log::info!("Removed partial download {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Could not remove {}: {}", path.display(), e),
        }
    }
}
