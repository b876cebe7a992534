//! Shared utilities for integration tests.
//!
//! The media tool is replaced by small shell scripts, so these tests only
//! run on unix.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use media_gateway::config::GatewayConfig;
use media_gateway::http::HttpServer;
use media_gateway::lifecycle::Shutdown;
use media_gateway::worker::{ConcurrencyGate, MediaTool};
use tempfile::TempDir;

pub const API_KEY: &str = "test-key";

/// Answers `--dump-json <url>` with a small JSON document echoing the URL,
/// and streams `STREAMDATA` for anything else.
pub const OK_TOOL: &str = r#"
if [ "$1" = "--dump-json" ]; then
  printf '{"title":"Sample","webpage_url":"%s"}' "$2"
  exit 0
fi
printf 'STREAMDATA'
"#;

/// Write an executable `#!/bin/sh` script into `dir`.
pub fn write_tool(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-yt-dlp");
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

pub fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.auth.api_key = API_KEY.to_string();
    config.workers.max_concurrent = Some(2);
    config
}

/// A gateway running on an ephemeral port with a scripted media tool.
pub struct TestGateway {
    pub addr: SocketAddr,
    pub dir: TempDir,
    pub gate: ConcurrencyGate,
    shutdown: Shutdown,
}

impl TestGateway {
    pub async fn start(tool_script: &str) -> Self {
        Self::start_with(tool_script, test_config()).await
    }

    pub async fn start_with(tool_script: &str, mut config: GatewayConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let binary = write_tool(dir.path(), tool_script);
        config.workers.binary_path = binary.clone();

        let tool = MediaTool::new(&binary, 1).unwrap();
        let server = HttpServer::new(config, tool);
        let gate = server.gate();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let shutdown = Shutdown::new();
        let server_shutdown = shutdown.subscribe();
        tokio::spawn(async move {
            let _ = server.run(listener, server_shutdown).await;
        });

        Self {
            addr,
            dir,
            gate,
            shutdown,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Path of a file inside the gateway's scratch directory.
    pub fn scratch(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn stop(&self) {
        self.shutdown.trigger();
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .timeout(Duration::from_secs(20))
        .build()
        .unwrap()
}

pub async fn download(
    client: &reqwest::Client,
    gateway: &TestGateway,
    body: serde_json::Value,
) -> reqwest::Response {
    client
        .post(gateway.url("/api/video/download"))
        .header("X-API-KEY", API_KEY)
        .json(&body)
        .send()
        .await
        .expect("gateway unreachable")
}

/// Whether `pid` still names a live process.
pub fn process_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Poll `check` until it holds or `limit` passes.
pub async fn eventually<F>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    check()
}
