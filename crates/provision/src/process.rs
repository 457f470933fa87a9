//! External tool invocation
//!
//! Provisioning backends shell out to `terraform`, `vagrant` and `ssh`.
//! Those tools only support coarse interruption: when the governing
//! [`RunContext`] ends the tool's process group receives SIGINT, gets a
//! grace period to wind down, and is killed if it is still running
//! afterwards.
//!
//! Processes a tool leaves behind can keep its output pipes open after the
//! tool itself exited. Reading that output is bounded by the same grace
//! period (or the context, whichever ends first); the leftovers are then
//! killed with the rest of the process group.

use std::borrow::Cow;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use testbed_common::{Error, Result};

use crate::context::RunContext;

/// Default grace period for an interrupted tool
pub const DEFAULT_GRACE: Duration = Duration::from_secs(30);

/// Time to finish reading output once leftover processes were killed
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Description of a tool invocation
#[derive(Debug, Clone)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    pub dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    /// Time the tool gets to exit after SIGINT
    pub grace: Duration,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            dir: None,
            env: HashMap::new(),
            grace: DEFAULT_GRACE,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// `program arg1 arg2 ...`, for logging
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Operation name used in errors: `program subcommand`
    fn operation(&self) -> String {
        match self.args.first() {
            Some(sub) => format!("{} {}", self.program, sub),
            None => self.program.clone(),
        }
    }
}

/// Captured output of a finished tool
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub status: ExitStatus,
    /// Raw standard output, which may be binary
    pub stdout: Vec<u8>,
    pub stderr: String,
    pub duration: Duration,
}

impl ToolOutput {
    /// Standard output decoded as UTF-8, with invalid sequences replaced
    pub fn stdout_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }
}

/// Run a tool to completion under `ctx`
///
/// Returns [`Error::Interrupted`] if the context ended first,
/// [`Error::Tool`] on a nonzero exit and [`Error::ToolNotFound`] if the
/// program cannot be found.
pub async fn run_tool(ctx: &RunContext, cmd: ToolCommand) -> Result<ToolOutput> {
    if let Some(cause) = ctx.err() {
        return Err(Error::Interrupted {
            operation: cmd.operation(),
            cause,
        });
    }

    let mut command = Command::new(&cmd.program);
    command
        .args(&cmd.args)
        .envs(&cmd.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    if let Some(dir) = &cmd.dir {
        command.current_dir(dir);
    }

    debug!(command = %cmd.display(), dir = ?cmd.dir, "spawning tool");
    let start = Instant::now();

    let mut child = command.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::ToolNotFound(cmd.program.clone())
        } else {
            Error::Io(e)
        }
    })?;

    let group = child.id().map(|pid| Pid::from_raw(pid as i32));
    let stdout_task = child.stdout.take().map(|out| tokio::spawn(drain(out)));
    let stderr_task = child.stderr.take().map(|err| tokio::spawn(drain(err)));

    let waited = tokio::select! {
        status = child.wait() => Ok(status?),
        cause = ctx.done() => Err(cause),
    };

    let status = match waited {
        Ok(status) => status,
        Err(cause) => {
            warn!(command = %cmd.display(), %cause, "interrupting tool");
            interrupt(&mut child, cmd.grace).await;
            // grandchildren may still hold the pipes open
            for task in [stdout_task, stderr_task].into_iter().flatten() {
                task.abort();
            }
            return Err(Error::Interrupted {
                operation: cmd.operation(),
                cause,
            });
        }
    };

    let readers: Vec<_> = [&stdout_task, &stderr_task]
        .into_iter()
        .flatten()
        .map(|task| task.abort_handle())
        .collect();
    let mut output = Box::pin(async { (collect(stdout_task).await, collect(stderr_task).await) });

    let drained = tokio::select! {
        output = &mut output => Ok(output),
        _ = tokio::time::sleep(cmd.grace) => Err(None),
        cause = ctx.done() => Err(Some(cause)),
    };
    let (stdout, stderr) = match drained {
        Ok(output) => output,
        Err(cause) => {
            warn!(
                command = %cmd.display(),
                "tool exited but its output is still open, killing leftover processes"
            );
            if let Some(group) = group {
                if let Err(e) = killpg(group, Signal::SIGKILL) {
                    debug!(error = %e, "no leftover processes in tool group");
                }
            }
            let output = match tokio::time::timeout(REAP_TIMEOUT, &mut output).await {
                Ok(output) => output,
                Err(_) => {
                    // left the process group, stop reading
                    for reader in &readers {
                        reader.abort();
                    }
                    (Vec::new(), Vec::new())
                }
            };
            if let Some(cause) = cause {
                return Err(Error::Interrupted {
                    operation: cmd.operation(),
                    cause,
                });
            }
            output
        }
    };
    let stderr = String::from_utf8_lossy(&stderr).into_owned();
    let duration = start.elapsed();

    if !status.success() {
        return Err(Error::Tool {
            tool: cmd.operation(),
            status: status.to_string(),
            stderr: tail(&stderr, 40),
        });
    }

    debug!(command = %cmd.display(), elapsed_ms = duration.as_millis() as u64, "tool finished");
    Ok(ToolOutput {
        status,
        stdout,
        stderr,
        duration,
    })
}

/// SIGINT the tool's process group, wait for `grace`, then SIGKILL it
async fn interrupt(child: &mut Child, grace: Duration) {
    let Some(pid) = child.id() else {
        return;
    };
    let group = Pid::from_raw(pid as i32);
    if let Err(e) = killpg(group, Signal::SIGINT) {
        debug!(pid, error = %e, "failed to deliver SIGINT");
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            info!(%status, "interrupted tool exited");
        }
        Ok(Err(e)) => {
            warn!(error = %e, "failed waiting for interrupted tool");
        }
        Err(_) => {
            warn!(grace_secs = grace.as_secs(), "tool ignored interrupt, killing");
            if let Err(e) = killpg(group, Signal::SIGKILL) {
                warn!(pid, error = %e, "failed to kill tool process group");
            }
            if let Err(e) = child.kill().await {
                debug!(error = %e, "tool already gone");
            }
        }
    }
    // stragglers that outlived the group leader
    let _ = killpg(group, Signal::SIGKILL);
}

async fn drain<R: AsyncRead + Unpin>(mut reader: R) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await?;
    Ok(buf)
}

async fn collect(task: Option<tokio::task::JoinHandle<std::io::Result<Vec<u8>>>>) -> Vec<u8> {
    match task {
        Some(task) => match task.await {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => {
                warn!(error = %e, "failed to read tool output");
                Vec::new()
            }
            Err(e) if e.is_cancelled() => Vec::new(),
            Err(e) => {
                warn!(error = %e, "tool output reader panicked");
                Vec::new()
            }
        },
        None => Vec::new(),
    }
}

/// Last `lines` lines of `text`
fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.trim_end().lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
