//! The command spawner contract and the default process-backed executor.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use runtime_core::{SandboxState, StdioStream};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::debug;

use crate::error::ToolError;
use crate::session::{EnvSnapshot, SessionHandle};

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Receives raw output as the command produces it.
#[derive(Clone)]
pub struct OutputSink {
    emit: Arc<dyn Fn(StdioStream, &[u8]) + Send + Sync>,
}

impl OutputSink {
    pub fn new<F>(emit: F) -> Self
    where
        F: Fn(StdioStream, &[u8]) + Send + Sync + 'static,
    {
        Self {
            emit: Arc::new(emit),
        }
    }

    pub fn stdout(&self, data: &[u8]) {
        (self.emit)(StdioStream::Stdout, data);
    }

    pub fn stderr(&self, data: &[u8]) {
        (self.emit)(StdioStream::Stderr, data);
    }

    pub fn write(&self, stream: StdioStream, data: &[u8]) {
        (self.emit)(stream, data);
    }
}

impl std::fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("OutputSink")
    }
}

/// Everything an executor needs for one attempt.
#[derive(Debug)]
pub struct ExecCommandRequest<H> {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub env: EnvSnapshot,
    pub attempt: u32,
    pub sandbox_state: SandboxState,
    pub session_id: String,
    pub session: Arc<H>,
    pub output: OutputSink,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutcome {
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    /// Measured by the runner when absent or zero
    pub duration_ms: Option<u64>,
}

impl ExecOutcome {
    pub fn exited(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            ..Default::default()
        }
    }
}

/// Spawns the command for one attempt and streams its output into the
/// request's sink. Returning an error signals a launch failure.
#[async_trait]
pub trait CommandExecutor<H: SessionHandle>: Send + Sync {
    async fn execute(&self, request: ExecCommandRequest<H>) -> Result<ExecOutcome, ToolError>;
}

/// Runs the command as a child process with the session's environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessExecutor;

#[async_trait]
impl<H: SessionHandle> CommandExecutor<H> for ProcessExecutor {
    async fn execute(&self, request: ExecCommandRequest<H>) -> Result<ExecOutcome, ToolError> {
        let started = Instant::now();
        let mut command = Command::new(&request.command);
        command
            .args(&request.args)
            .env_clear()
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &request.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(ToolError::Spawn)?;
        debug!(
            command = %request.command,
            pid = ?child.id(),
            attempt = request.attempt,
            "Spawned command"
        );

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let sink = &request.output;
        let (stdout_result, stderr_result, status) = tokio::join!(
            pump(stdout, sink, StdioStream::Stdout),
            pump(stderr, sink, StdioStream::Stderr),
            child.wait(),
        );
        stdout_result.map_err(|e| ToolError::failed(format!("Failed to read stdout: {e}")))?;
        stderr_result.map_err(|e| ToolError::failed(format!("Failed to read stderr: {e}")))?;
        let status = status.map_err(|e| ToolError::failed(format!("Failed to wait for command: {e}")))?;

        Ok(ExecOutcome {
            exit_code: status.code(),
            signal: exit_signal(&status),
            duration_ms: Some(started.elapsed().as_millis() as u64),
        })
    }
}

async fn pump<R>(reader: Option<R>, sink: &OutputSink, stream: StdioStream) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(());
    };
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        sink.write(stream, &buf[..n]);
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;

    status.signal().map(|signal| {
        let name = match signal {
            1 => "SIGHUP",
            2 => "SIGINT",
            3 => "SIGQUIT",
            6 => "SIGABRT",
            9 => "SIGKILL",
            13 => "SIGPIPE",
            15 => "SIGTERM",
            other => return format!("SIG{other}"),
        };
        name.to_string()
    })
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<String> {
    None
}
