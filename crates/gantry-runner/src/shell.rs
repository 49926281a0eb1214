//! Shell-based step execution on the host.

use async_trait::async_trait;
use gantry_core::Result;
use gantry_core::ports::{OutputLine, OutputStream, StepContext, StepExecution, StepExecutor};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Executes step commands through the step's declared shell.
pub struct ShellExecutor;

impl ShellExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepExecutor for ShellExecutor {
    async fn execute(
        &self,
        ctx: &StepContext,
        output: mpsc::Sender<OutputLine>,
    ) -> Result<StepExecution> {
        let start = std::time::Instant::now();

        info!(node = %ctx.node, step = %ctx.step.name, command = %ctx.step.run, "executing step");

        let work_dir = match &ctx.step.working_directory {
            Some(dir) => ctx.workspace.join(dir),
            None => ctx.workspace.clone(),
        };

        // kill_on_drop so that cancellation or timeout dropping this future
        // tears the process down.
        let mut child = Command::new(&ctx.step.shell)
            .arg("-c")
            .arg(&ctx.step.run)
            .current_dir(&work_dir)
            .envs(&ctx.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                gantry_core::Error::Internal(format!("failed to spawn process: {}", e))
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stdout_handle = stdout.map(|stdout| {
            let tx = output.clone();
            let node = ctx.node.clone();
            let step = ctx.step.name.clone();
            tokio::spawn(stream_lines(stdout, tx, node, step, OutputStream::Stdout))
        });

        let stderr_handle = stderr.map(|stderr| {
            let tx = output;
            let node = ctx.node.clone();
            let step = ctx.step.name.clone();
            tokio::spawn(stream_lines(stderr, tx, node, step, OutputStream::Stderr))
        });

        let status = child.wait().await.map_err(|e| {
            gantry_core::Error::Internal(format!("failed to wait for process: {}", e))
        })?;

        if let Some(handle) = stdout_handle {
            let _ = handle.await;
        }
        if let Some(handle) = stderr_handle {
            let _ = handle.await;
        }

        let exit_code = status.code().unwrap_or(-1);
        let duration_ms = start.elapsed().as_millis() as u64;

        debug!(node = %ctx.node, step = %ctx.step.name, exit_code, duration_ms, "step completed");

        Ok(StepExecution {
            exit_code,
            success: status.success(),
            duration_ms,
        })
    }
}

async fn stream_lines<R>(
    reader: R,
    tx: mpsc::Sender<OutputLine>,
    node: String,
    step: String,
    stream: OutputStream,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let reader = BufReader::new(reader);
    let mut lines = reader.lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let out = OutputLine {
            node: node.clone(),
            step: step.clone(),
            stream,
            content: line,
            timestamp: chrono::Utc::now(),
        };
        if tx.send(out).await.is_err() {
            break;
        }
    }
}
