//! Shared test infrastructure for integration tests
//!
//! Provides TestServer, which spawns the real binary against a temporary
//! data directory, plus small WebDAV request helpers.

#![allow(dead_code)]

use rand::{Rng, SeedableRng};
use reqwest::{Client, Method, Response};
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::sleep;

/// Port counter to avoid conflicts between tests.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(19400);

/// User every test server request is made as
pub const USER: &str = "alice";

/// Test server wrapper that spawns a real webdav_ingest binary
pub struct TestServer {
    process: Child,
    port: u16,
    data_dir: TempDir,
    client: Client,
}

impl TestServer {
    // ── Factory methods ──

    /// Start a test server with default settings
    pub async fn start() -> Self {
        Self::spawn_with_config("").await
    }

    /// Start a test server with a per-user quota
    pub async fn with_quota(quota_bytes: u64) -> Self {
        Self::spawn_with_config(&format!("quota_bytes = {}\n", quota_bytes)).await
    }

    /// Start a test server with a custom max upload size
    pub async fn with_max_upload_size(max: u64) -> Self {
        Self::spawn_with_config(&format!("max_upload_size = {}\n", max)).await
    }

    // ── Shared spawn logic ──

    /// Allocate a port, write a TOML config, spawn the server and wait for
    /// readiness. All factory methods delegate here.
    async fn spawn_with_config(extra: &str) -> Self {
        let port = PORT_COUNTER.fetch_add(1, Ordering::SeqCst);
        let data_dir = TempDir::new().expect("Failed to create temp dir");
        let store = data_dir.path().join("store");

        let config = format!(
            "listen_addr = \"127.0.0.1:{}\"\ndata_dir = \"{}\"\n{}",
            port,
            store.display(),
            extra
        );
        let config_path = data_dir.path().join("test.toml");
        std::fs::write(&config_path, config).expect("Failed to write test config");

        let process = Command::new(env!("CARGO_BIN_EXE_webdav_ingest"))
            .env("WDI_CONFIG", &config_path)
            .env("RUST_LOG", "webdav_ingest=warn")
            .spawn()
            .expect("Failed to start server");

        let mut server = Self {
            process,
            port,
            data_dir,
            client: Client::new(),
        };
        server.wait_ready().await;
        server
    }

    // ── Instance methods ──

    async fn wait_ready(&mut self) {
        let addr = format!("127.0.0.1:{}", self.port);
        for _ in 0..150 {
            if std::net::TcpStream::connect(&addr).is_ok() {
                sleep(Duration::from_millis(100)).await;
                return;
            }

            if let Ok(Some(status)) = self.process.try_wait() {
                panic!("Server exited before becoming ready: {}", status);
            }

            sleep(Duration::from_millis(100)).await;
        }

        let _ = self.process.kill();
        panic!("Timed out waiting for server on {}", addr);
    }

    /// Get the HTTP endpoint URL
    pub fn endpoint(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// URL of `path` in the test user's files
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/remote.php/dav/files/{}/{}",
            self.endpoint(),
            USER,
            path.trim_start_matches('/')
        )
    }

    /// On-disk directory backing the test user's files
    pub fn files_dir(&self) -> PathBuf {
        self.data_dir.path().join("store").join(USER).join("files")
    }

    /// On-disk chunk directory of the test user
    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir.path().join("store").join(USER).join("uploads")
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub async fn put(&self, path: &str, body: impl Into<reqwest::Body>) -> Response {
        self.client
            .put(self.url(path))
            .body(body)
            .send()
            .await
            .expect("PUT failed")
    }

    /// PUT one chunk of a chunked transfer
    pub async fn put_chunk(
        &self,
        name: &str,
        transfer_id: u64,
        count: u32,
        index: u32,
        body: Vec<u8>,
    ) -> Response {
        let path = format!("{}-chunking-{}-{}-{}", name, transfer_id, count, index);
        self.client
            .put(self.url(&path))
            .header("OC-Chunked", "1")
            .body(body)
            .send()
            .await
            .expect("chunk PUT failed")
    }

    pub async fn get(&self, path: &str) -> Response {
        self.client
            .get(self.url(path))
            .send()
            .await
            .expect("GET failed")
    }

    pub async fn request(&self, method: &str, path: &str) -> reqwest::RequestBuilder {
        let method = Method::from_bytes(method.as_bytes()).expect("valid method");
        self.client.request(method, self.url(path))
    }

    pub async fn mkcol(&self, path: &str) -> Response {
        self.request("MKCOL", path)
            .await
            .send()
            .await
            .expect("MKCOL failed")
    }

    /// MOVE or COPY `src` to `dst` with an optional `Overwrite` header
    pub async fn transfer(
        &self,
        method: &str,
        src: &str,
        dst: &str,
        overwrite: Option<bool>,
    ) -> Response {
        let mut req = self
            .request(method, src)
            .await
            .header("Destination", self.url(dst));
        if let Some(o) = overwrite {
            req = req.header("Overwrite", if o { "T" } else { "F" });
        }
        req.send().await.expect("MOVE/COPY failed")
    }

    /// Get the child process PID
    pub fn pid(&self) -> u32 {
        self.process.id()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.process.kill();
        let _ = self.process.wait();
    }
}

/// Names of staging files anywhere below `dir`
pub fn staging_files(dir: &Path) -> Vec<String> {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|n| n.contains(".ocTransferId") && n.ends_with(".part"))
        .collect()
}

/// Generate deterministic pseudo-random binary data
pub fn generate_binary(size: usize, seed: u64) -> Vec<u8> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; size];
    rng.fill(&mut data[..]);
    data
}
