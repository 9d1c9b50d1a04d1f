use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use super::RuntimeError;

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How a llama-server child process is launched.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerLaunch {
    pub model_path: PathBuf,
    pub port: u16,
    pub context_size: usize,
    pub batch_size: usize,
    pub threads: Option<usize>,
    pub gpu_layers: i32,
    /// Serve embeddings instead of completions.
    pub embedding: bool,
    pub startup_timeout: Duration,
}

/// Owns one llama-server child process and the HTTP client talking to it.
#[derive(Clone)]
pub struct LlamaServer {
    inner: Arc<Mutex<ServerProcess>>,
    client: Client,
    launch: ServerLaunch,
}

struct ServerProcess {
    child: Option<Child>,
    binary: PathBuf,
}

impl LlamaServer {
    pub fn new(launch: ServerLaunch, configured_binary: Option<&Path>, project_root: &Path) -> Self {
        let binary = find_server_binary(configured_binary, project_root);
        Self {
            inner: Arc::new(Mutex::new(ServerProcess {
                child: None,
                binary,
            })),
            client: Client::new(),
            launch,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.launch.port)
    }

    /// Starts the server unless a live child is already attached.
    pub async fn ensure_running(&self) -> Result<(), RuntimeError> {
        let mut process = self.inner.lock().await;

        if let Some(child) = process.child.as_mut() {
            match child.try_wait() {
                Ok(None) => return Ok(()),
                Ok(Some(status)) => {
                    tracing::warn!("llama-server exited with {}; restarting", status);
                }
                Err(e) => {
                    tracing::warn!("Failed to poll llama-server: {}; restarting", e);
                }
            }
            process.child = None;
        }

        let child = self.spawn(&process.binary)?;
        process.child = Some(child);

        // The lock stays held until the server answers its health check.
        if let Err(err) = self.wait_for_health().await {
            if let Some(mut child) = process.child.take() {
                let _ = child.kill().await;
            }
            return Err(err);
        }
        Ok(())
    }

    fn spawn(&self, binary: &Path) -> Result<Child, RuntimeError> {
        let launch = &self.launch;
        let mut cmd = Command::new(binary);
        cmd.arg("-m").arg(&launch.model_path);
        cmd.arg("--host").arg("127.0.0.1");
        cmd.arg("--port").arg(launch.port.to_string());
        cmd.arg("-c").arg(launch.context_size.to_string());
        cmd.arg("-b").arg(launch.batch_size.to_string());
        if let Some(threads) = launch.threads {
            cmd.arg("-t").arg(threads.to_string());
        }
        if launch.gpu_layers >= 0 {
            cmd.arg("-ngl").arg(launch.gpu_layers.to_string());
        }
        if launch.embedding {
            cmd.arg("--embeddings").arg("--pooling").arg("mean");
        }

        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        tracing::info!(
            "Starting llama-server {} for {}",
            binary.display(),
            launch.model_path.display()
        );
        let mut child = cmd.spawn().map_err(|e| {
            RuntimeError::Server(format!(
                "failed to spawn {}: {}",
                binary.display(),
                e
            ))
        })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut reader = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    tracing::debug!("[llama-server] {}", line);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    tracing::debug!("[llama-server-err] {}", line);
                }
            });
        }

        Ok(child)
    }

    async fn wait_for_health(&self) -> Result<(), RuntimeError> {
        let url = format!("{}/health", self.base_url());
        let attempts = (self.launch.startup_timeout.as_millis() / HEALTH_POLL_INTERVAL.as_millis())
            .max(1);
        for _ in 0..attempts {
            if let Ok(res) = self.client.get(&url).send().await {
                if res.status().is_success() {
                    return Ok(());
                }
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
        Err(RuntimeError::Server(format!(
            "timed out waiting for llama-server on port {}",
            self.launch.port
        )))
    }
}

fn find_server_binary(configured: Option<&Path>, project_root: &Path) -> PathBuf {
    if let Some(path) = configured {
        return path.to_path_buf();
    }

    let candidates = [
        project_root.join("bin/llama-server.exe"),
        project_root.join("bin/llama-server"),
    ];
    for path in candidates {
        if path.exists() {
            return path;
        }
    }

    which::which("llama-server").unwrap_or_else(|_| PathBuf::from("llama-server"))
}

/// Splits a byte stream into complete lines across chunk boundaries.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line);
            lines.push(text.trim_end_matches(['\r', '\n']).to_string());
        }
        lines
    }

    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).trim_end().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_binary_wins() {
        let root = tempfile::tempdir().unwrap();
        let chosen = find_server_binary(Some(Path::new("/opt/llama/llama-server")), root.path());
        assert_eq!(chosen, PathBuf::from("/opt/llama/llama-server"));
    }

    #[test]
    fn project_bin_dir_is_searched() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("bin")).unwrap();
        std::fs::write(root.path().join("bin/llama-server"), b"").unwrap();
        let chosen = find_server_binary(None, root.path());
        assert_eq!(chosen, root.path().join("bin/llama-server"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn concurrent_callers_wait_for_health() {
        use std::os::unix::fs::PermissionsExt;

        let root = tempfile::tempdir().unwrap();
        let binary = root.path().join("silent-server");
        std::fs::write(&binary, "#!/bin/sh\nsleep 5\n").unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let launch = ServerLaunch {
            model_path: PathBuf::from("model.gguf"),
            port,
            context_size: 256,
            batch_size: 32,
            threads: None,
            gpu_layers: -1,
            embedding: false,
            startup_timeout: Duration::from_millis(500),
        };
        let server = LlamaServer::new(launch, Some(&binary), root.path());

        let (first, second) = tokio::join!(server.ensure_running(), server.ensure_running());
        assert!(first.is_err());
        assert!(second.is_err());
        assert!(server.inner.lock().await.child.is_none());
    }

    #[test]
    fn line_buffer_joins_split_lines() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(b"data: {\"content\":").is_empty());
        let lines = buffer.push(b"\"hi\"}\r\ndata: [DONE]\n");
        assert_eq!(lines, vec!["data: {\"content\":\"hi\"}", "data: [DONE]"]);
        assert_eq!(buffer.finish(), None);
    }
}
