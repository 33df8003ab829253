//! CLI-backed container runner.
//!
//! Docker, Podman, and the macOS-native `container` binary are driven
//! through their CLIs with `tokio::process`. Argument differences are
//! localized here; everything above this file speaks the
//! [`ContainerRunner`] trait.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use waystation_core::types::RunnerKind;

use crate::error::{RuntimeError, RuntimeResult};
use crate::ports::alloc_free_port;
use crate::runner::{
    container_name, Availability, ContainerRunner, ExecOutput, InspectResult, PullProgress,
    RunSpec, RunningContainer, RuntimeEvent, AGENT_CONTAINER_PORT,
};

/// How long `start_daemon` waits for the daemon to come up.
const DAEMON_START_TIMEOUT: Duration = Duration::from_secs(30);

/// Shells out to a container runtime CLI.
pub struct CliRunner {
    kind: RunnerKind,
}

impl CliRunner {
    pub fn new(kind: RunnerKind) -> Self {
        Self { kind }
    }

    fn cli(&self) -> &'static str {
        self.kind.cli()
    }

    async fn output(&self, args: &[&str]) -> RuntimeResult<std::process::Output> {
        Command::new(self.cli())
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    RuntimeError::Unavailable(format!("{} is not installed", self.cli()))
                } else {
                    RuntimeError::Io(e)
                }
            })
    }

    /// Run a command and require success, returning trimmed stdout.
    async fn run_checked(&self, args: &[&str]) -> RuntimeResult<String> {
        let output = self.output(args).await?;
        if !output.status.success() {
            return Err(RuntimeError::CommandFailed {
                command: format!("{} {}", self.cli(), args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn daemon_running(&self) -> bool {
        let args: &[&str] = match self.kind {
            RunnerKind::Docker => &["info", "--format", "{{.ServerVersion}}"],
            RunnerKind::Podman => &["info", "--format", "{{.Version.Version}}"],
            RunnerKind::Native => &["system", "status"],
        };
        matches!(self.output(args).await, Ok(output) if output.status.success())
    }

    async fn binary_installed(&self) -> bool {
        matches!(
            self.output(&["--version"]).await,
            Ok(output) if output.status.success()
        )
    }
}

/// Parse one pull progress line, e.g.
/// `a3ed95caeb02: Downloading [=====>   ]  10.5MB/21MB`.
pub(crate) fn parse_pull_progress(line: &str) -> Option<PullProgress> {
    let (layer, rest) = line.split_once(':')?;
    let layer = layer.trim();
    if layer.is_empty() || layer.contains(' ') {
        return None;
    }
    let rest = rest.trim();
    if rest.starts_with("Pull complete") || rest.starts_with("Already exists") {
        return Some(PullProgress {
            layer: layer.to_string(),
            percent: 100,
        });
    }
    // Last whitespace-separated token of a progress line is `cur/total`.
    let sizes = rest.split_whitespace().last()?;
    let (current, total) = sizes.split_once('/')?;
    let current = parse_size(current)?;
    let total = parse_size(total)?;
    if total == 0.0 {
        return None;
    }
    let percent = ((current / total) * 100.0).clamp(0.0, 100.0) as u8;
    Some(PullProgress {
        layer: layer.to_string(),
        percent,
    })
}

fn parse_size(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    let split = raw
        .find(|ch: char| ch.is_ascii_alphabetic())
        .unwrap_or(raw.len());
    let value: f64 = raw[..split].parse().ok()?;
    let multiplier = match raw[split..].to_ascii_lowercase().as_str() {
        "" | "b" => 1.0,
        "kb" | "kib" => 1024.0,
        "mb" | "mib" => 1024.0 * 1024.0,
        "gb" | "gib" => 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some(value * multiplier)
}

/// Parse `docker port` output (`127.0.0.1:49154`) into the host port.
pub(crate) fn parse_port_mapping(raw: &str) -> Option<u16> {
    raw.lines()
        .next()?
        .trim()
        .rsplit_once(':')?
        .1
        .parse()
        .ok()
}

#[async_trait]
impl ContainerRunner for CliRunner {
    fn kind(&self) -> RunnerKind {
        self.kind
    }

    async fn availability(&self) -> Availability {
        let installed = self.binary_installed().await;
        if !installed {
            return Availability::default();
        }
        let running = self.daemon_running().await;
        Availability {
            installed,
            running,
            can_start: true,
        }
    }

    async fn start_daemon(&self) -> RuntimeResult<()> {
        match self.kind {
            RunnerKind::Docker => {
                #[cfg(target_os = "macos")]
                {
                    Command::new("open")
                        .args(["-a", "Docker"])
                        .status()
                        .await?;
                }
                #[cfg(not(target_os = "macos"))]
                {
                    Command::new("systemctl")
                        .args(["start", "docker"])
                        .status()
                        .await?;
                }
            }
            RunnerKind::Podman => {
                self.run_checked(&["machine", "start"]).await?;
            }
            RunnerKind::Native => {
                self.run_checked(&["system", "start"]).await?;
            }
        }

        let deadline = tokio::time::Instant::now() + DAEMON_START_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            if self.daemon_running().await {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        Err(RuntimeError::Unavailable(format!(
            "{} daemon did not come up within {:?}",
            self.cli(),
            DAEMON_START_TIMEOUT
        )))
    }

    async fn image_exists(&self, image: &str) -> RuntimeResult<bool> {
        let output = self.output(&["image", "inspect", image]).await?;
        Ok(output.status.success())
    }

    async fn pull_image(
        &self,
        image: &str,
        progress: mpsc::Sender<PullProgress>,
    ) -> RuntimeResult<()> {
        let mut child = Command::new(self.cli())
            .args(["pull", image])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    RuntimeError::Unavailable(format!("{} is not installed", self.cli()))
                } else {
                    RuntimeError::Io(e)
                }
            })?;

        if let Some(stdout) = child.stdout.take() {
            let progress = progress.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(update) = parse_pull_progress(&line) {
                        // Drop updates if the consumer lags; progress is
                        // advisory.
                        let _ = progress.try_send(update);
                    }
                }
            });
        }

        let mut stderr_text = String::new();
        if let Some(stderr) = child.stderr.take() {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                stderr_text.push_str(&line);
                stderr_text.push('\n');
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(RuntimeError::ImagePull(stderr_text.trim().to_string()));
        }
        Ok(())
    }

    async fn run(&self, spec: &RunSpec) -> RuntimeResult<RunningContainer> {
        let port = alloc_free_port().await?;
        let name = container_name(&spec.agent_slug);
        let cpus = spec.limits.cpu.to_string();
        let publish = format!("127.0.0.1:{}:{}", port, AGENT_CONTAINER_PORT);

        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--rm".into(),
            "--name".into(),
            name,
            "--cpus".into(),
            cpus,
            "--memory".into(),
            spec.limits.memory.clone(),
            "-p".into(),
            publish,
        ];
        for (key, value) in &spec.env {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }
        for (host, container) in &spec.mounts {
            args.push("-v".into());
            args.push(format!("{}:{}", host.display(), container));
        }
        args.push(spec.image.clone());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let container_id = self.run_checked(&arg_refs).await?;
        Ok(RunningContainer { container_id, port })
    }

    async fn stop(&self, agent_slug: &str) -> RuntimeResult<()> {
        let name = container_name(agent_slug);
        let output = self.output(&["stop", &name]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
            if !stderr.contains("no such container") && !stderr.contains("not found") {
                return Err(RuntimeError::CommandFailed {
                    command: format!("{} stop {}", self.cli(), name),
                    stderr: stderr.trim().to_string(),
                });
            }
        }
        // The native runtime does not remove on stop.
        if self.kind == RunnerKind::Native {
            let _ = self.output(&["rm", &name]).await;
        }
        Ok(())
    }

    async fn inspect(&self, agent_slug: &str) -> RuntimeResult<InspectResult> {
        let name = container_name(agent_slug);
        let output = self
            .output(&["inspect", "--format", "{{.State.Running}}", &name])
            .await?;
        if !output.status.success() {
            // No such container.
            return Ok(InspectResult::default());
        }
        let running = String::from_utf8_lossy(&output.stdout).trim() == "true";
        if !running {
            return Ok(InspectResult {
                running: false,
                port: None,
            });
        }
        let port_raw = self
            .output(&["port", &name, &AGENT_CONTAINER_PORT.to_string()])
            .await?;
        let port = if port_raw.status.success() {
            parse_port_mapping(&String::from_utf8_lossy(&port_raw.stdout))
        } else {
            None
        };
        Ok(InspectResult {
            running: true,
            port,
        })
    }

    async fn exec(
        &self,
        agent_slug: &str,
        cmd: &[String],
        stdin: Option<&str>,
    ) -> RuntimeResult<ExecOutput> {
        let name = container_name(agent_slug);
        let mut args: Vec<&str> = vec!["exec", "-i", &name];
        args.extend(cmd.iter().map(String::as_str));

        let mut child = Command::new(self.cli())
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let (Some(mut handle), Some(input)) = (child.stdin.take(), stdin) {
            handle.write_all(input.as_bytes()).await?;
            drop(handle);
        }

        let output = child.wait_with_output().await?;
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn events(&self, agent_slug: &str) -> RuntimeResult<mpsc::Receiver<RuntimeEvent>> {
        let name = container_name(agent_slug);
        let filter = format!("container={}", name);
        let mut child = Command::new(self.cli())
            .args(["events", "--filter", &filter, "--format", "{{.Status}}"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take().ok_or_else(|| {
            RuntimeError::CommandFailed {
                command: format!("{} events", self.cli()),
                stderr: "no stdout".into(),
            }
        })?;

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            // Owns the child; killed on drop when the receiver goes away.
            let _child = child;
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let action = line.trim().to_string();
                if action.is_empty() {
                    continue;
                }
                if tx.send(RuntimeEvent { action }).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pull_progress_downloading() {
        let update = parse_pull_progress(
            "a3ed95caeb02: Downloading [=====>     ]  10.5MB/21MB",
        )
        .unwrap();
        assert_eq!(update.layer, "a3ed95caeb02");
        assert_eq!(update.percent, 50);
    }

    #[test]
    fn test_parse_pull_progress_complete() {
        let update = parse_pull_progress("a3ed95caeb02: Pull complete").unwrap();
        assert_eq!(update.percent, 100);
    }

    #[test]
    fn test_parse_pull_progress_ignores_chatter() {
        assert!(parse_pull_progress("latest: Pulling from library/alpine").is_none());
        assert!(parse_pull_progress("Digest: sha256:abcdef").is_none());
        assert!(parse_pull_progress("Status: Downloaded newer image").is_none());
        assert!(parse_pull_progress("").is_none());
    }

    #[test]
    fn test_parse_size_units() {
        assert_eq!(parse_size("512"), Some(512.0));
        assert_eq!(parse_size("1kB"), Some(1024.0));
        assert_eq!(parse_size("2MB"), Some(2.0 * 1024.0 * 1024.0));
        assert!(parse_size("weird").is_none());
    }

    #[test]
    fn test_parse_port_mapping() {
        assert_eq!(parse_port_mapping("127.0.0.1:49154\n"), Some(49154));
        assert_eq!(parse_port_mapping("0.0.0.0:8081"), Some(8081));
        assert_eq!(parse_port_mapping("garbage"), None);
    }
}
