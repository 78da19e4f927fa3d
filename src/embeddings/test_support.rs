// Shared fixtures for the embedding pipeline tests: deterministic tokenizer and
// session fakes, a chunked body reader and a loopback HTTP server.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::TcpListener;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::session::{Embeddings, InferenceError, InferenceSession, SessionLoader};
use super::tokenize::{TokenBatch, Tokenize, TokenizerLoader};

pub const FAKE_DIMS: usize = 8;

/// Bytes as token ids, wrapped in 101/102 and padded with 0 to the longest row.
pub struct FakeTokenizer;

impl Tokenize for FakeTokenizer {
    fn tokenize(&self, texts: &[String]) -> anyhow::Result<TokenBatch> {
        anyhow::ensure!(!texts.is_empty(), "no input text to tokenize");
        let rows: Vec<Vec<i64>> = texts
            .iter()
            .map(|t| {
                let mut ids = vec![101];
                ids.extend(t.bytes().map(i64::from));
                ids.push(102);
                ids
            })
            .collect();
        let seq_len = rows.iter().map(Vec::len).max().unwrap_or(0);

        let mut ids: Vec<i64> = Vec::new();
        let mut mask: Vec<i64> = Vec::new();
        for row in &rows {
            ids.extend(row);
            mask.extend(std::iter::repeat(1).take(row.len()));
            ids.extend(std::iter::repeat(0).take(seq_len - row.len()));
            mask.extend(std::iter::repeat(0).take(seq_len - row.len()));
        }
        TokenBatch::new(ids, mask, rows.len(), seq_len)
    }
}

pub struct FakeTokenizerLoader;

impl TokenizerLoader for FakeTokenizerLoader {
    fn load(&self, _path: &Path) -> anyhow::Result<Arc<dyn Tokenize>> {
        Ok(Arc::new(FakeTokenizer))
    }
}

pub fn token_batch(texts: &[&str]) -> TokenBatch {
    let texts: Vec<String> = texts.iter().map(|t| t.to_string()).collect();
    FakeTokenizer.tokenize(&texts).unwrap()
}

struct FakeSession {
    no_output: bool,
    delay: Duration,
}

impl InferenceSession for FakeSession {
    fn run(&self, tokens: &TokenBatch) -> Result<Embeddings, InferenceError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.no_output {
            return Embeddings::new(Vec::new(), tokens.batch_size);
        }

        let mut data = Vec::with_capacity(tokens.batch_size * FAKE_DIMS);
        for row in 0..tokens.batch_size {
            // Padding must not influence a row's embedding.
            let seed = tokens
                .row_ids(row)
                .iter()
                .zip(tokens.row_mask(row))
                .filter(|(_, m)| **m == 1)
                .fold(17u64, |acc, (&id, _)| acc.wrapping_mul(31).wrapping_add(id as u64));
            for j in 0..FAKE_DIMS {
                let v = seed.wrapping_mul(j as u64 + 7) % 1000;
                data.push(v as f32 / 1000.0);
            }
        }
        Embeddings::new(data, tokens.batch_size)
    }
}

#[derive(Default)]
pub struct FakeLoader {
    attempts: AtomicUsize,
    fail_first: usize,
    no_output: bool,
    delay: Duration,
}

impl FakeLoader {
    pub fn failing_first(n: usize) -> Self {
        Self {
            fail_first: n,
            ..Default::default()
        }
    }

    pub fn without_output() -> Self {
        Self {
            no_output: true,
            ..Default::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    /// Load attempts, failed ones included.
    pub fn loads(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl SessionLoader for FakeLoader {
    fn load(&self, model_path: &Path) -> anyhow::Result<Arc<dyn InferenceSession>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.fail_first {
            anyhow::bail!("simulated load failure for {}", model_path.display());
        }
        Ok(Arc::new(FakeSession {
            no_output: self.no_output,
            delay: self.delay,
        }))
    }
}

/// Response body delivered in fixed chunks, optionally failing part way through.
pub struct ChunkedBody {
    chunks: VecDeque<Vec<u8>>,
    fail_after: Option<usize>,
    served: usize,
}

impl ChunkedBody {
    pub fn uniform(count: usize, size: usize) -> Self {
        let chunks = (0..count)
            .map(|c| (0..size).map(|i| ((c * 7 + i) % 256) as u8).collect())
            .collect();
        Self {
            chunks,
            fail_after: None,
            served: 0,
        }
    }

    pub fn failing_after(mut self, chunks: usize) -> Self {
        self.fail_after = Some(chunks);
        self
    }

    pub fn concat(&self) -> Vec<u8> {
        self.chunks.iter().flatten().copied().collect()
    }
}

impl Read for ChunkedBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.fail_after == Some(self.served) {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer"));
        }
        let Some(mut chunk) = self.chunks.pop_front() else {
            return Ok(0);
        };
        if chunk.len() > buf.len() {
            let rest = chunk.split_off(buf.len());
            self.chunks.push_front(rest);
        } else {
            self.served += 1;
        }
        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }
}

/// Loopback HTTP/1.1 server answering a fixed number of requests, then exiting.
pub struct TestServer {
    pub url: String,
    requests: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl TestServer {
    /// `routes`: path -> (status, body). Unknown paths get 404.
    pub fn start(routes: HashMap<String, (u16, Vec<u8>)>, connections: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&requests);

        let handle = std::thread::spawn(move || {
            for _ in 0..connections {
                let Ok((mut stream, _)) = listener.accept() else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);

                let mut head = Vec::new();
                let mut byte = [0u8; 1];
                while !head.ends_with(b"\r\n\r\n") {
                    match stream.read(&mut byte) {
                        Ok(1) => head.push(byte[0]),
                        _ => break,
                    }
                }
                let head = String::from_utf8_lossy(&head);
                let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();

                let (status, body) = routes
                    .get(&path)
                    .cloned()
                    .unwrap_or((404, b"not found".to_vec()));
                let reason = if status == 200 { "OK" } else { "Error" };
                let header = format!(
                    "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nContent-Type: application/octet-stream\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = stream.write_all(header.as_bytes());
                let _ = stream.write_all(&body);
                let _ = stream.flush();
            }
        });

        Self {
            url: format!("http://{addr}"),
            requests,
            handle,
        }
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn join(self) {
        let _ = self.handle.join();
    }
}

/// Single-request server for `<url>/model.bin`; `url` points straight at the file.
pub fn serve_once(status: u16, body: Vec<u8>) -> TestServer {
    let mut routes = HashMap::new();
    routes.insert("/model.bin".to_string(), (status, body));
    let mut server = TestServer::start(routes, 1);
    server.url.push_str("/model.bin");
    server
}
