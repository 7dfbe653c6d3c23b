use crate::engine::{InputBinding, SessionConfig};
use crate::errors::{InpaintError, Result};
use crate::model_cache::{ModelBlob, ProgressReporter};
use crate::traits::{InpaintSession, ModelSource, ModelStore, SessionFactory};
use async_trait::async_trait;
use ndarray::prelude::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Colour written into filled pixels by [`FillSession`].
pub const MOCK_FILL_VALUE: u8 = 127;

/// In-memory model source for tests: counts fetches, can simulate latency
/// and network failures.
#[derive(Debug, Default)]
pub struct InMemoryModelSource {
    models: HashMap<String, Vec<u8>>,
    delay: Duration,
    fetches: AtomicUsize,
    failures_left: AtomicUsize,
}

impl InMemoryModelSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, name: &str, bytes: Vec<u8>) -> Self {
        self.models.insert(name.to_string(), bytes);
        self
    }

    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// The next `count` fetches fail as if the connection dropped.
    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelSource for InMemoryModelSource {
    async fn fetch(&self, name: &str, progress: &ProgressReporter) -> Result<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(InpaintError::model_unavailable(
                name,
                "model download",
                std::io::Error::new(std::io::ErrorKind::ConnectionReset, "simulated network error"),
            ));
        }

        let bytes = self.models.get(name).cloned().ok_or_else(|| {
            InpaintError::model_unavailable(name, "model lookup", "unknown model")
        })?;

        let total = bytes.len() as u64;
        let step = (bytes.len() / 4).max(1);
        let mut received = 0;
        while received < bytes.len() {
            received = (received + step).min(bytes.len());
            progress.advance(received as u64, Some(total));
        }
        Ok(bytes)
    }
}

/// In-memory model store that counts saves.
#[derive(Debug, Default)]
pub struct InMemoryModelStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    saves: AtomicUsize,
}

impl InMemoryModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(self, name: &str, bytes: Vec<u8>) -> Self {
        self.blobs.lock().insert(name.to_string(), bytes);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.blobs.lock().contains_key(name)
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelStore for InMemoryModelStore {
    async fn load(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.lock().get(name).cloned())
    }

    async fn save(&self, name: &str, bytes: &[u8]) -> Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.blobs.lock().insert(name.to_string(), bytes.to_vec());
        Ok(())
    }
}

/// Stand-in for the inpainting network: keeps unmasked pixels and paints
/// masked ones with [`MOCK_FILL_VALUE`].
#[derive(Debug)]
pub struct FillSession {
    binding: InputBinding,
    runs: AtomicUsize,
    failures_left: AtomicUsize,
}

impl FillSession {
    pub fn new() -> Self {
        Self {
            binding: InputBinding {
                image: "image".to_string(),
                mask: "mask".to_string(),
                output: "output".to_string(),
            },
            runs: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(0),
        }
    }

    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }
}

impl Default for FillSession {
    fn default() -> Self {
        Self::new()
    }
}

impl InpaintSession for FillSession {
    fn binding(&self) -> &InputBinding {
        &self.binding
    }

    fn run(&self, image: ArrayView4<u8>, mask: ArrayView4<u8>) -> Result<Array4<u8>> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(InpaintError::inference("session run", "simulated runtime failure"));
        }

        let mut output = image.to_owned();
        let mask = mask.index_axis(Axis(1), 0);
        for mut channel in output.axis_iter_mut(Axis(1)) {
            let mut channel = channel.index_axis_mut(Axis(0), 0);
            ndarray::Zip::from(&mut channel)
                .and(mask.index_axis(Axis(0), 0))
                .for_each(|pixel, &m| {
                    if m != 0 {
                        *pixel = MOCK_FILL_VALUE;
                    }
                });
        }
        Ok(output)
    }
}

/// Session factory for tests. Counts constructions and can fail them.
#[derive(Debug, Default)]
pub struct MockSessionFactory {
    delay: Duration,
    creations: AtomicUsize,
    fail_creation: bool,
    run_failures: usize,
    last_config: Mutex<Option<SessionConfig>>,
    last_model: Mutex<Option<ModelBlob>>,
}

impl MockSessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks construction for `delay`, widening the window for races.
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub const fn failing(mut self) -> Self {
        self.fail_creation = true;
        self
    }

    /// Sessions built by this factory fail their first `count` runs.
    pub const fn with_failing_runs(mut self, count: usize) -> Self {
        self.run_failures = count;
        self
    }

    pub fn creation_count(&self) -> usize {
        self.creations.load(Ordering::SeqCst)
    }

    pub fn last_config(&self) -> Option<SessionConfig> {
        self.last_config.lock().clone()
    }

    pub fn last_model(&self) -> Option<ModelBlob> {
        self.last_model.lock().clone()
    }
}

impl SessionFactory for MockSessionFactory {
    fn create(&self, model: &ModelBlob, config: &SessionConfig) -> Result<Box<dyn InpaintSession>> {
        self.creations.fetch_add(1, Ordering::SeqCst);
        *self.last_config.lock() = Some(config.clone());
        *self.last_model.lock() = Some(model.clone());
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.fail_creation {
            return Err(InpaintError::session_init(
                "loading model",
                "simulated backend failure",
            ));
        }
        let session = FillSession::new();
        session.fail_next(self.run_failures);
        Ok(Box::new(session))
    }
}

/// Raw HTTP/1.1 response with an explicit `Content-Length`, which may
/// disagree with the body to simulate broken servers.
pub fn http_response(status: &str, content_length: u64, body: &[u8]) -> Vec<u8> {
    let mut response = format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status, content_length
    )
    .into_bytes();
    response.extend_from_slice(body);
    response
}

/// Answers a single request on a loopback port with `response`, then closes
/// the connection. Returns the URL to request.
pub async fn serve_once(response: Vec<u8>) -> std::io::Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => request.extend_from_slice(&buf[..n]),
            }
        }
        let _ = stream.write_all(&response).await;
        let _ = stream.shutdown().await;
    });
    Ok(format!("http://{}/asset", addr))
}
