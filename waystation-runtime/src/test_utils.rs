//! Test doubles for crates that depend on the runtime.
//!
//! Enabled with the `test-utils` feature; nothing here ships in a normal
//! build.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use waystation_core::types::RunnerKind;

use crate::error::{RuntimeError, RuntimeResult};
use crate::runner::{
    Availability, ContainerRunner, ExecOutput, InspectResult, PullProgress, RunSpec,
    RunningContainer, RuntimeEvent,
};

/// Scriptable in-memory runner.
#[derive(Default)]
pub struct StubRunner {
    pub run_port: Mutex<Option<u16>>,
    pub run_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
    pub daemon_running: AtomicBool,
    pub image_present: AtomicBool,
    pub inspect: Mutex<HashMap<String, InspectResult>>,
    pub last_env: Mutex<Vec<(String, String)>>,
}

impl StubRunner {
    /// Healthy runner whose containers come up on `run_port`.
    pub fn ready(run_port: u16) -> Arc<Self> {
        let runner = Arc::new(Self::default());
        *runner.run_port.lock() = Some(run_port);
        runner.daemon_running.store(true, Ordering::SeqCst);
        runner.image_present.store(true, Ordering::SeqCst);
        runner
    }

    /// Installed runner whose daemon is down.
    pub fn daemon_down() -> Arc<Self> {
        let runner = Arc::new(Self::default());
        runner.image_present.store(true, Ordering::SeqCst);
        runner
    }
}

#[async_trait]
impl ContainerRunner for StubRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Docker
    }
    async fn availability(&self) -> Availability {
        Availability {
            installed: true,
            running: self.daemon_running.load(Ordering::SeqCst),
            can_start: true,
        }
    }
    async fn start_daemon(&self) -> RuntimeResult<()> {
        self.daemon_running.store(true, Ordering::SeqCst);
        Ok(())
    }
    async fn image_exists(&self, _image: &str) -> RuntimeResult<bool> {
        Ok(self.image_present.load(Ordering::SeqCst))
    }
    async fn pull_image(
        &self,
        _image: &str,
        _progress: mpsc::Sender<PullProgress>,
    ) -> RuntimeResult<()> {
        self.image_present.store(true, Ordering::SeqCst);
        Ok(())
    }
    async fn run(&self, spec: &RunSpec) -> RuntimeResult<RunningContainer> {
        if !self.daemon_running.load(Ordering::SeqCst) {
            return Err(RuntimeError::Unavailable("daemon down".into()));
        }
        self.run_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_env.lock() = spec.env.clone();
        let port = self.run_port.lock().unwrap_or(0);
        self.inspect.lock().insert(
            spec.agent_slug.clone(),
            InspectResult {
                running: true,
                port: Some(port),
            },
        );
        Ok(RunningContainer {
            container_id: format!("cid-{}", spec.agent_slug),
            port,
        })
    }
    async fn stop(&self, agent_slug: &str) -> RuntimeResult<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.inspect
            .lock()
            .insert(agent_slug.to_string(), InspectResult::default());
        Ok(())
    }
    async fn inspect(&self, agent_slug: &str) -> RuntimeResult<InspectResult> {
        Ok(self
            .inspect
            .lock()
            .get(agent_slug)
            .copied()
            .unwrap_or_default())
    }
    async fn exec(
        &self,
        _agent_slug: &str,
        _cmd: &[String],
        _stdin: Option<&str>,
    ) -> RuntimeResult<ExecOutput> {
        Ok(ExecOutput {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
        })
    }
    async fn events(&self, _agent_slug: &str) -> RuntimeResult<mpsc::Receiver<RuntimeEvent>> {
        let (tx, rx) = mpsc::channel(1);
        std::mem::forget(tx);
        Ok(rx)
    }
}

/// What the stub agent server saw.
#[derive(Default)]
pub struct StubAgentLog {
    /// Bodies of POST /sessions requests.
    pub prompts: Mutex<Vec<String>>,
}

/// Minimal in-container agent stand-in: answers `GET /healthz` with 200
/// and records `POST /sessions` bodies. Returns the listen port.
pub async fn spawn_stub_agent() -> (u16, Arc<StubAgentLog>) {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .expect("bind stub agent");
    let port = listener.local_addr().expect("local addr").port();
    let log = Arc::new(StubAgentLog::default());

    let server_log = log.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let log = server_log.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                // Read headers, then the content-length body.
                let (head_len, body_start) = loop {
                    let Ok(n) = socket.read(&mut chunk).await else {
                        return;
                    };
                    if n == 0 {
                        return;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(pos) = find_header_end(&buf) {
                        break (pos, pos + 4);
                    }
                };
                let head = String::from_utf8_lossy(&buf[..head_len]).to_string();
                let content_length = head
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())?
                    })
                    .unwrap_or(0);
                while buf.len() < body_start + content_length {
                    let Ok(n) = socket.read(&mut chunk).await else {
                        return;
                    };
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
                if head.starts_with("POST /sessions") {
                    let body =
                        String::from_utf8_lossy(&buf[body_start..body_start + content_length])
                            .to_string();
                    log.prompts.lock().push(body);
                }
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\n{}")
                    .await;
            });
        }
    });
    (port, log)
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}
