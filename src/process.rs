//! External process invocation.
//!
//! Every external program this orchestrator touches (the `vagrant` CLI,
//! `rsync`, `ssh`, `diff3`) goes through the [`Invoker`] capability instead of
//! ad-hoc exec calls. The two shipped implementations are [`LocalInvoker`]
//! (spawn on the host) and [`SshInvoker`] (wrap the request into an `ssh`
//! argv against a VM's connection info). Tests substitute scripted doubles.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::error::{Result, SandboxError};
use crate::vm::ssh::SshInfo;

/// How process output is handled while the process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Append chunks to the capture buffers only.
    #[default]
    Capture,
    /// Forward chunks to the callback only.
    Stream,
    /// Both capture and forward.
    Both,
}

impl OutputMode {
    fn captures(self) -> bool {
        matches!(self, OutputMode::Capture | OutputMode::Both)
    }

    fn streams(self) -> bool {
        matches!(self, OutputMode::Stream | OutputMode::Both)
    }
}

/// Callback receiving output chunks as they are read. The second argument is
/// true for stderr chunks. Chunks from the two streams arrive in no defined
/// order relative to each other; within one stream, order is preserved.
pub type StreamCallback = Arc<dyn Fn(&[u8], bool) + Send + Sync>;

/// A single external invocation.
#[derive(Clone)]
pub struct InvokeRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Bounded execution: expiry forcibly terminates the process, the same
    /// way an external cancellation would.
    pub timeout: Option<Duration>,
    pub output_mode: OutputMode,
    pub on_output: Option<StreamCallback>,
}

impl InvokeRequest {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            env: Vec::new(),
            timeout: None,
            output_mode: OutputMode::Capture,
            on_output: None,
        }
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn timeout(mut self, limit: Option<Duration>) -> Self {
        self.timeout = limit;
        self
    }

    pub fn output(mut self, mode: OutputMode, callback: Option<StreamCallback>) -> Self {
        self.output_mode = mode;
        self.on_output = callback;
        self
    }
}

impl std::fmt::Debug for InvokeRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvokeRequest")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("cwd", &self.cwd)
            .field("timeout", &self.timeout)
            .field("output_mode", &self.output_mode)
            .finish()
    }
}

/// Result of a completed invocation.
///
/// A nonzero exit code is an ordinary result, not an error. `error` is set
/// only when the process result itself could not be obtained (the wait
/// failed); a process that could not be spawned at all surfaces as `Err`
/// from [`Invoker::invoke`] instead, since no result exists.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub command: String,
    pub args: Vec<String>,
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.error.is_none()
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Stderr if non-empty, otherwise stdout. Used to attach process output
    /// to failure reports.
    pub fn failure_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout_lossy()
        } else {
            self.stderr_lossy()
        }
    }
}

/// Capability for running an external process to completion.
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(&self, req: InvokeRequest) -> Result<CommandResult>;
}

/// Runs processes directly on the host.
pub struct LocalInvoker;

#[async_trait]
impl Invoker for LocalInvoker {
    async fn invoke(&self, req: InvokeRequest) -> Result<CommandResult> {
        let started_at = Utc::now();
        let start = tokio::time::Instant::now();
        let deadline = req.timeout.map(|limit| start + limit);

        let mut cmd = tokio::process::Command::new(&req.program);
        cmd.args(&req.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &req.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &req.env {
            cmd.env(key, value);
        }

        debug!(program = %req.program, args = ?req.args, "invoking process");

        let mut child = cmd.spawn().map_err(|e| {
            SandboxError::operation_failed(
                "spawn process",
                anyhow::anyhow!("{}: {}", req.program, e),
            )
        })?;

        // Each stream gets its own reader task with its own buffer; the
        // buffers are joined back by value once both streams hit EOF.
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_task = tokio::spawn(drain_stream(
            stdout,
            false,
            req.output_mode,
            req.on_output.clone(),
        ));
        let err_task = tokio::spawn(drain_stream(
            stderr,
            true,
            req.output_mode,
            req.on_output.clone(),
        ));

        // Both readers must reach EOF before the process result is finalized,
        // so the captured buffers are complete when the exit code is read.
        let drain = async {
            let out = out_task.await.unwrap_or_default();
            let err = err_task.await.unwrap_or_default();
            (out, err)
        };
        tokio::pin!(drain);

        let (stdout_buf, stderr_buf) = match deadline {
            Some(at) => match tokio::time::timeout_at(at, drain.as_mut()).await {
                Ok(bufs) => bufs,
                Err(_) => {
                    warn!(program = %req.program, "invocation deadline expired, terminating process");
                    let _ = child.start_kill();
                    // The pipes close once the process is gone, so the
                    // readers finish promptly.
                    drain.await
                }
            },
            None => drain.await,
        };

        // Streams are closed; reap the process. The deadline still applies in
        // case the child closed its pipes but kept running.
        let wait_result = match deadline {
            Some(at) => match tokio::time::timeout_at(at, child.wait()).await {
                Ok(res) => res,
                Err(_) => {
                    warn!(program = %req.program, "process outlived its closed streams, terminating");
                    let _ = child.start_kill();
                    child.wait().await
                }
            },
            None => child.wait().await,
        };

        let finished_at = Utc::now();
        let duration = start.elapsed();

        let (exit_code, error) = match wait_result {
            // A termination by signal has no exit code; report -1.
            Ok(status) => (status.code().unwrap_or(-1), None),
            Err(e) => (-1, Some(e.to_string())),
        };

        Ok(CommandResult {
            command: req.program,
            args: req.args,
            exit_code,
            stdout: stdout_buf,
            stderr: stderr_buf,
            error,
            started_at,
            finished_at,
            duration,
        })
    }
}

/// Read one stream to EOF, capturing and/or forwarding each chunk.
async fn drain_stream<R>(
    reader: Option<R>,
    is_stderr: bool,
    mode: OutputMode,
    callback: Option<StreamCallback>,
) -> Vec<u8>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let mut captured = Vec::new();
    let Some(mut reader) = reader else {
        return captured;
    };
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = &buf[..n];
                if mode.captures() {
                    captured.extend_from_slice(chunk);
                }
                if mode.streams() {
                    if let Some(cb) = &callback {
                        cb(chunk, is_stderr);
                    }
                }
            }
            // A read error means the pipe is unusable; the process result
            // will tell the rest of the story.
            Err(_) => break,
        }
    }
    captured
}

/// Runs a shell command inside a VM through `ssh`.
///
/// The request's `program` is the remote shell command line; host-side `cwd`
/// and `env` do not apply — the remote working directory and environment ride
/// inside the command string assembled by the caller.
pub struct SshInvoker {
    inner: Arc<dyn Invoker>,
    info: SshInfo,
}

impl SshInvoker {
    pub fn new(inner: Arc<dyn Invoker>, info: SshInfo) -> Self {
        Self { inner, info }
    }
}

#[async_trait]
impl Invoker for SshInvoker {
    async fn invoke(&self, req: InvokeRequest) -> Result<CommandResult> {
        let remote_command = if req.args.is_empty() {
            req.program.clone()
        } else {
            // Join any argv form into a single remote command line.
            let mut line = req.program.clone();
            for arg in &req.args {
                line.push(' ');
                line.push_str(arg);
            }
            line
        };

        let ssh_req = InvokeRequest {
            program: "ssh".to_string(),
            args: self.info.ssh_args(&remote_command),
            cwd: None,
            env: Vec::new(),
            timeout: req.timeout,
            output_mode: req.output_mode,
            on_output: req.on_output,
        };
        self.inner.invoke(ssh_req).await
    }
}
