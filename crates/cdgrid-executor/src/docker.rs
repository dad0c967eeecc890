//! Docker CLI executor.
//!
//! Each operation shells out to the `docker` binary. Launch performs an
//! optional registry login, an optional image pull, then `docker run
//! --detach`; the printed container id becomes the [`ExecutorHandle`].

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{ExecutorError, ExecutorResult};
use crate::types::{ContainerState, ExecutorHandle, Inspection, LaunchAction};
use crate::{ExecFuture, Executor};

/// Label attached to every launched container.
pub const JOB_LABEL: &str = "cdgrid.job-id";

/// Settings for [`DockerExecutor`].
///
/// Registry credentials are never read from the config file; the daemon
/// fills them in from its command line or environment.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Path or name of the docker CLI.
    pub binary: String,
    /// Automation image, including tag.
    pub image: String,
    /// Registry to log in to before pulling. `None` uses Docker Hub.
    pub registry: Option<String>,
    #[serde(skip)]
    pub username: Option<String>,
    #[serde(skip)]
    pub password: Option<String>,
    /// Pull the image before every launch.
    pub pull: bool,
    pub network: Option<String>,
    pub pid_mode: Option<String>,
    /// Bind mounts in `host:container[:mode]` form.
    pub volumes: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Image command for a deployment; receives `<target> <job_id>`.
    pub deploy_command: String,
    /// Image command for the maintenance run; receives no arguments.
    pub announce_command: String,
    /// Upper bound for any single docker invocation.
    pub command_timeout_secs: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            image: "ghcr.io/epfl-enac/enacit-ansible:latest".to_string(),
            registry: None,
            username: None,
            password: None,
            pull: true,
            network: None,
            pid_mode: None,
            volumes: Vec::new(),
            env: BTreeMap::new(),
            deploy_command: "app-deploy".to_string(),
            announce_command: "announce-apps".to_string(),
            command_timeout_secs: 300,
        }
    }
}

impl fmt::Debug for DockerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DockerConfig")
            .field("binary", &self.binary)
            .field("image", &self.image)
            .field("registry", &self.registry)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("pull", &self.pull)
            .field("network", &self.network)
            .field("pid_mode", &self.pid_mode)
            .field("volumes", &self.volumes)
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .field("deploy_command", &self.deploy_command)
            .field("announce_command", &self.announce_command)
            .field("command_timeout_secs", &self.command_timeout_secs)
            .finish()
    }
}

struct CommandOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

/// [`Executor`] backed by the docker CLI.
#[derive(Debug, Clone)]
pub struct DockerExecutor {
    config: DockerConfig,
}

impl DockerExecutor {
    pub fn new(config: DockerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DockerConfig {
        &self.config
    }

    async fn docker(&self, args: &[String], stdin: Option<&str>) -> io::Result<CommandOutput> {
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(binary = %self.config.binary, command = ?args.first(), "running docker");
        let mut child = cmd.spawn()?;
        if let Some(input) = stdin
            && let Some(mut pipe) = child.stdin.take()
        {
            pipe.write_all(input.as_bytes()).await?;
        }

        let limit = Duration::from_secs(self.config.command_timeout_secs);
        let output = timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "docker command timed out"))??;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn login(&self) -> ExecutorResult<()> {
        let (Some(username), Some(password)) = (&self.config.username, &self.config.password)
        else {
            return Ok(());
        };
        let args = login_args(username, self.config.registry.as_deref());
        let out = self
            .docker(&args, Some(password))
            .await
            .map_err(|e| ExecutorError::Launch(format!("registry login: {e}")))?;
        if !out.success {
            return Err(ExecutorError::Launch(format!(
                "registry login failed: {}",
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn pull(&self) -> ExecutorResult<()> {
        let args = vec!["pull".to_string(), self.config.image.clone()];
        let out = self
            .docker(&args, None)
            .await
            .map_err(|e| ExecutorError::Launch(format!("image pull: {e}")))?;
        if !out.success {
            return Err(ExecutorError::Launch(format!(
                "image pull failed for {}: {}",
                self.config.image,
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Arguments for `docker run` of `action`.
    pub fn run_args(&self, action: &LaunchAction) -> Vec<String> {
        let cfg = &self.config;
        let mut args = vec![
            "run".to_string(),
            "--detach".to_string(),
            "--label".to_string(),
            format!("{JOB_LABEL}={}", action.job_id()),
        ];
        if let Some(network) = &cfg.network {
            args.extend(["--network".to_string(), network.clone()]);
        }
        if let Some(pid_mode) = &cfg.pid_mode {
            args.extend(["--pid".to_string(), pid_mode.clone()]);
        }
        for volume in &cfg.volumes {
            args.extend(["--volume".to_string(), volume.clone()]);
        }
        for (key, value) in &cfg.env {
            args.extend(["--env".to_string(), format!("{key}={value}")]);
        }
        args.push(cfg.image.clone());
        match action {
            LaunchAction::Deploy { target, job_id } => {
                args.extend([cfg.deploy_command.clone(), target.clone(), job_id.clone()]);
            }
            LaunchAction::AnnounceApps { .. } => args.push(cfg.announce_command.clone()),
        }
        args
    }

    /// Both output streams of the container, interleaved in write order.
    async fn read_logs(&self, handle: &ExecutorHandle) -> ExecutorResult<String> {
        let args = vec![
            "logs".to_string(),
            "--timestamps".to_string(),
            handle.to_string(),
        ];
        let out = self
            .docker(&args, None)
            .await
            .map_err(|e| ExecutorError::Inspect(e.to_string()))?;
        if !out.success {
            return Err(classify_failure(handle, &out.stderr));
        }
        Ok(merge_log_streams(&out.stdout, &out.stderr))
    }
}

impl Executor for DockerExecutor {
    fn launch<'a>(&'a self, action: &'a LaunchAction) -> ExecFuture<'a, ExecutorHandle> {
        Box::pin(async move {
            self.login().await?;
            if self.config.pull {
                self.pull().await?;
            }

            let args = self.run_args(action);
            let out = self.docker(&args, None).await.map_err(|e| {
                ExecutorError::Launch(format!("failed to run {}: {e}", self.config.binary))
            })?;
            if !out.success {
                return Err(ExecutorError::Launch(format!(
                    "docker run failed: {}",
                    out.stderr.trim()
                )));
            }
            let id = out.stdout.trim();
            if id.is_empty() {
                return Err(ExecutorError::Launch(
                    "docker run printed no container id".to_string(),
                ));
            }

            let handle = ExecutorHandle::new(id);
            info!(job_id = %action.job_id(), container = %handle.short(), "executor launched");
            Ok(handle)
        })
    }

    fn inspect<'a>(&'a self, handle: &'a ExecutorHandle) -> ExecFuture<'a, Inspection> {
        Box::pin(async move {
            let args = vec![
                "inspect".to_string(),
                "--format".to_string(),
                "{{.State.Status}} {{.State.ExitCode}}".to_string(),
                handle.to_string(),
            ];
            let out = self
                .docker(&args, None)
                .await
                .map_err(|e| ExecutorError::Inspect(e.to_string()))?;
            if !out.success {
                return Err(classify_failure(handle, &out.stderr));
            }
            let state = parse_state(&out.stdout).ok_or_else(|| {
                ExecutorError::Inspect(format!(
                    "unrecognised container state {:?}",
                    out.stdout.trim()
                ))
            })?;

            let logs = self.read_logs(handle).await?;
            Ok(Inspection { state, logs })
        })
    }

    fn terminate<'a>(&'a self, handle: &'a ExecutorHandle) -> ExecFuture<'a, ()> {
        Box::pin(async move {
            let args = vec!["rm".to_string(), "--force".to_string(), handle.to_string()];
            let out = self
                .docker(&args, None)
                .await
                .map_err(|e| ExecutorError::Terminate(e.to_string()))?;
            if !out.success {
                return match classify_failure(handle, &out.stderr) {
                    ExecutorError::NotFound(id) => Err(ExecutorError::NotFound(id)),
                    _ => {
                        warn!(container = %handle.short(), stderr = %out.stderr.trim(), "docker rm failed");
                        Err(ExecutorError::Terminate(out.stderr.trim().to_string()))
                    }
                };
            }
            debug!(container = %handle.short(), "container removed");
            Ok(())
        })
    }
}

fn login_args(username: &str, registry: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "login".to_string(),
        "--username".to_string(),
        username.to_string(),
        "--password-stdin".to_string(),
    ];
    if let Some(registry) = registry {
        args.push(registry.to_string());
    }
    args
}

/// Parse `"<status> <exit code>"` as printed by `docker inspect --format`.
fn parse_state(raw: &str) -> Option<ContainerState> {
    let mut parts = raw.split_whitespace();
    let status = parts.next()?;
    let exit_code = parts.next().and_then(|code| code.parse().ok());
    match status {
        "created" | "running" | "restarting" | "paused" => Some(ContainerState::Running),
        "exited" | "dead" | "removing" => Some(ContainerState::Exited { exit_code }),
        _ => None,
    }
}

/// Sort key of a `docker logs --timestamps` line: the whole seconds and
/// the fraction scaled to nanoseconds, so trimmed fractions still compare.
type LineKey<'a> = (&'a str, u32);

fn line_key(timestamp: &str) -> Option<LineKey<'_>> {
    let bytes = timestamp.as_bytes();
    if bytes.len() < 20 || bytes[10] != b'T' || !bytes[..4].iter().all(u8::is_ascii_digit) {
        return None;
    }
    let (secs, rest) = timestamp.split_at(19);
    let digits: String = rest
        .strip_prefix('.')
        .unwrap_or_default()
        .chars()
        .take_while(char::is_ascii_digit)
        .take(9)
        .collect();
    let nanos = format!("{digits:0<9}").parse().ok()?;
    Some((secs, nanos))
}

/// Split a timestamped stream into `(key, text)` lines. A line without a
/// timestamp keeps the key of the line before it.
fn keyed_lines(stream: &str) -> Vec<(LineKey<'_>, &str)> {
    let mut last: LineKey<'_> = ("", 0);
    stream
        .split_inclusive('\n')
        .map(|line| {
            if let Some((timestamp, text)) = line.split_once(' ')
                && let Some(key) = line_key(timestamp)
            {
                last = key;
                return (key, text);
            }
            (last, line)
        })
        .collect()
}

/// Interleave the stdout and stderr of `docker logs --timestamps` by time
/// and strip the timestamps. Ties go to stdout.
pub fn merge_log_streams(stdout: &str, stderr: &str) -> String {
    let out = keyed_lines(stdout);
    let err = keyed_lines(stderr);
    let mut merged = String::with_capacity(stdout.len() + stderr.len());
    let (mut i, mut j) = (0, 0);
    while i < out.len() || j < err.len() {
        let take_out = match (out.get(i), err.get(j)) {
            (Some(o), Some(e)) => o.0 <= e.0,
            (Some(_), None) => true,
            _ => false,
        };
        let text = if take_out {
            i += 1;
            out[i - 1].1
        } else {
            j += 1;
            err[j - 1].1
        };
        if !merged.is_empty() && !merged.ends_with('\n') {
            merged.push('\n');
        }
        merged.push_str(text);
    }
    merged
}

fn classify_failure(handle: &ExecutorHandle, stderr: &str) -> ExecutorError {
    if stderr.to_ascii_lowercase().contains("no such") {
        ExecutorError::NotFound(handle.to_string())
    } else {
        ExecutorError::Inspect(stderr.trim().to_string())
    }
}
