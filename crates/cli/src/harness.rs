//! Local collaborators wired into the runtime by the binary.

use async_trait::async_trait;
use orchestrator::{
    ApprovalContext, ApprovalGrant, ApprovalPrompter, SessionCreateContext, SessionFactory,
    SessionHandle,
};
use runtime_core::{ExecEventPayload, StdioStream};
use streaming::StreamFrame;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

/// Holds nothing but its id: the manager keeps the environment and every
/// attempt spawns a fresh process.
pub struct LocalSession {
    id: String,
}

#[async_trait]
impl SessionHandle for LocalSession {
    async fn dispose(&self) -> orchestrator::Result<()> {
        debug!(session_id = %self.id, "Local session released");
        Ok(())
    }
}

pub struct LocalSessionFactory;

#[async_trait]
impl SessionFactory for LocalSessionFactory {
    type Handle = LocalSession;

    async fn create(&self, context: &SessionCreateContext) -> orchestrator::Result<LocalSession> {
        debug!(
            session_id = %context.id,
            persisted = context.persisted,
            env_vars = context.env.len(),
            "Creating local session"
        );
        Ok(LocalSession {
            id: context.id.clone(),
        })
    }
}

/// Asks on the terminal; anything but `y`/`yes` denies.
pub struct TerminalPrompter;

#[async_trait]
impl ApprovalPrompter for TerminalPrompter {
    async fn request_approval(&self, context: &ApprovalContext) -> ApprovalGrant {
        let mut prompt = format!("Allow {} ({})", context.tool, context.key);
        if let Some(description) = &context.description {
            prompt.push_str(&format!(": {description}"));
        }
        prompt.push_str("? [y/N] ");

        let mut stderr = tokio::io::stderr();
        if stderr.write_all(prompt.as_bytes()).await.is_err() || stderr.flush().await.is_err() {
            return ApprovalGrant::denied("terminal unavailable");
        }

        let mut answer = String::new();
        match BufReader::new(tokio::io::stdin()).read_line(&mut answer).await {
            Ok(_) if parse_answer(&answer) => ApprovalGrant::granted(),
            Ok(_) => ApprovalGrant::denied("declined at prompt"),
            Err(e) => ApprovalGrant::denied(format!("failed to read answer: {e}")),
        }
    }
}

fn parse_answer(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// One printable line per frame.
pub fn render_frame(frame: &StreamFrame) -> String {
    let event = &frame.event;
    let prefix = format!("[{:>4}] {:<10}", frame.sequence, event.kind());
    match &event.payload {
        ExecEventPayload::Begin(begin) => format!(
            "{prefix} attempt={} session={} sandbox={} {} {}",
            event.attempt,
            begin.session_id,
            begin.sandbox_state.as_str(),
            begin.command,
            begin.args.join(" ")
        ),
        ExecEventPayload::Chunk(chunk) => {
            let stream = match chunk.stream {
                StdioStream::Stdout => "out",
                StdioStream::Stderr => "err",
            };
            format!("{prefix} {stream}| {}", chunk.data.trim_end_matches('\n'))
        }
        ExecEventPayload::Retry(retry) => format!(
            "{prefix} attempt={} delay={}ms sandbox={} {}",
            event.attempt,
            retry.delay_ms,
            retry.sandbox_state.as_str(),
            retry.error_message
        ),
        ExecEventPayload::End(end) => format!(
            "{prefix} attempt={} status={} exit={} duration={}ms",
            event.attempt,
            end.status.as_str(),
            end.exit_code
                .map(|c| c.to_string())
                .or_else(|| end.signal.clone())
                .unwrap_or_else(|| "-".to_string()),
            end.duration_ms
        ),
    }
}
