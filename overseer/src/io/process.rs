//! Bounded subprocess execution for `git` and the `gh` CLI.
//!
//! Every call gets a wall-clock limit and a cap on captured output. Both
//! pipes are drained on their own threads while the child runs, so a chatty
//! child can never block on a full pipe. A grandchild that inherits a pipe
//! and outlives the child (an ssh helper, a credential prompt) can hold it
//! open for at most [`PIPE_GRACE`] after the child is gone.

use std::io::{Read, Write};
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// What a finished (or killed) child left behind.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Stdout bytes discarded past the capture limit.
    pub stdout_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Stdout as text if the command finished in time with exit status 0.
    ///
    /// Truncated stdout is an error: a partial JSON document from `gh` is
    /// worse than none.
    pub fn into_success(self, label: &str) -> Result<String> {
        if self.timed_out {
            return Err(anyhow!("{label} timed out"));
        }
        if !self.status.success() {
            let stderr = String::from_utf8_lossy(&self.stderr);
            return Err(anyhow!("{label} failed ({}): {}", self.status, stderr.trim()));
        }
        if self.stdout_truncated > 0 {
            return Err(anyhow!(
                "{label} output exceeded limit by {} bytes",
                self.stdout_truncated
            ));
        }
        String::from_utf8(self.stdout).with_context(|| format!("{label} stdout is not utf-8"))
    }
}

/// How long captured pipes may stay open after the child has exited.
pub const PIPE_GRACE: Duration = Duration::from_secs(2);

type Captured = Receiver<Result<(Vec<u8>, usize)>>;

/// Run `cmd`, optionally feeding `stdin`, killing it after `timeout`.
#[instrument(skip_all, fields(program = ?cmd.get_program(), timeout_secs = timeout.as_secs()))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn {:?}", cmd.get_program()))?;
    let (stdout, stderr) = take_pipes(&mut child)?;
    let stdout = capture(stdout, output_limit_bytes);
    let stderr = capture(stderr, output_limit_bytes);

    if let Some(input) = stdin
        && let Err(err) = feed_stdin(&mut child, input)
    {
        reap(&mut child);
        return Err(err);
    }

    let (status, timed_out) = wait_or_kill(&mut child, timeout)?;
    let (stdout, stdout_truncated) = collect(stdout, timed_out).context("collect stdout")?;
    let (stderr, stderr_truncated) = collect(stderr, timed_out).context("collect stderr")?;
    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "child output truncated");
    }
    debug!(exit_code = ?status.code(), timed_out, "child finished");

    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        timed_out,
    })
}

fn take_pipes(child: &mut Child) -> Result<(ChildStdout, ChildStderr)> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    Ok((stdout, stderr))
}

/// Write all of `input` and close the pipe so the child sees EOF.
fn feed_stdin(child: &mut Child, input: &[u8]) -> Result<()> {
    let mut pipe = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("stdin was not piped"))?;
    pipe.write_all(input).context("write stdin")
}

/// Kill and wait for a child abandoned on an error path.
fn reap(child: &mut Child) {
    if let Err(err) = child.kill() {
        debug!(err = %err, "kill abandoned child");
    }
    if let Err(err) = child.wait() {
        warn!(err = %err, "reap abandoned child");
    }
}

fn wait_or_kill(child: &mut Child, timeout: Duration) -> Result<(ExitStatus, bool)> {
    if let Some(status) = child.wait_timeout(timeout).context("wait for child")? {
        return Ok((status, false));
    }
    warn!(timeout_secs = timeout.as_secs(), "child timed out, killing");
    child.kill().context("kill child")?;
    let status = child.wait().context("reap killed child")?;
    Ok((status, true))
}

fn capture<R: Read + Send + 'static>(reader: R, limit: usize) -> Captured {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        // Send fails only once the caller has abandoned this pipe.
        let _ = tx.send(drain_limited(reader, limit));
    });
    rx
}

/// Output drained from one pipe. A pipe still held open by a grandchild is
/// abandoned after [`PIPE_GRACE`]: empty output for a killed child, an error
/// otherwise.
fn collect(captured: Captured, timed_out: bool) -> Result<(Vec<u8>, usize)> {
    match captured.recv_timeout(PIPE_GRACE) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) if timed_out => {
            warn!("pipe still held open after kill, discarding output");
            Ok((Vec::new(), 0))
        }
        Err(RecvTimeoutError::Timeout) => Err(anyhow!(
            "pipe still open {}s after the child exited",
            PIPE_GRACE.as_secs()
        )),
        Err(RecvTimeoutError::Disconnected) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Read `reader` to EOF, keeping at most `limit` bytes and counting the rest.
fn drain_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut kept = Vec::new();
    let mut dropped = 0_usize;
    let mut chunk = [0_u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read child output")?;
        if n == 0 {
            return Ok((kept, dropped));
        }
        let room = limit.saturating_sub(kept.len()).min(n);
        kept.extend_from_slice(&chunk[..room]);
        dropped += n - room;
    }
}
