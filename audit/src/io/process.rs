//! Helpers for running child processes with timeouts and bounded output.
//!
//! Every child is placed in its own process group so that a timeout terminates
//! the whole tree (test workers, coverage subprocesses), not just the direct
//! child. Pipes are drained on reader threads to avoid deadlocks, and the
//! deadline also covers descendants that keep those pipes open after the
//! direct child exits.

use std::collections::{BTreeMap, VecDeque};
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::error::ProcessError;

/// How long readers may keep draining after the process group was killed.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// A fully specified child invocation.
#[derive(Debug, Clone)]
pub struct CommandSpec<'a> {
    pub argv: &'a [String],
    pub cwd: &'a Path,
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// One captured stream: the first quarter of the limit plus the most recent
/// bytes, with everything in between dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedStream {
    /// Head followed by tail.
    pub bytes: Vec<u8>,
    /// Bytes dropped between head and tail.
    pub truncated: usize,
    head_len: usize,
}

impl CapturedStream {
    /// Lossy text with a marker where bytes were dropped.
    pub fn to_text(&self) -> String {
        if self.truncated == 0 {
            return String::from_utf8_lossy(&self.bytes).into_owned();
        }
        let (head, tail) = self.bytes.split_at(self.head_len);
        let mut text = String::from_utf8_lossy(head).into_owned();
        text.push_str(&format!("\n[... truncated {} bytes ...]\n", self.truncated));
        text.push_str(&String::from_utf8_lossy(tail));
        text
    }
}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: CapturedStream,
    pub stderr: CapturedStream,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Exit code, or `-N` when the process was terminated by signal `N`.
    pub fn return_code(&self) -> Option<i64> {
        return_code(&self.status)
    }

    /// Stdout followed by stderr, lossily decoded, with truncation markers.
    pub fn combined_output(&self) -> String {
        let mut buf = self.stdout.to_text();
        let stderr = self.stderr.to_text();
        if !stderr.is_empty() {
            if !buf.is_empty() && !buf.ends_with('\n') {
                buf.push('\n');
            }
            buf.push_str(&stderr);
        }
        buf
    }
}

#[cfg(unix)]
pub fn return_code(status: &ExitStatus) -> Option<i64> {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .map(i64::from)
        .or_else(|| status.signal().map(|signal| -i64::from(signal)))
}

#[cfg(not(unix))]
pub fn return_code(status: &ExitStatus) -> Option<i64> {
    // Windows NTSTATUS codes arrive as negative i32; report them unsigned.
    status.code().map(|code| i64::from(code as u32))
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// `output_limit_bytes` bounds the amount of each stream kept in memory; the
/// start and the end of the stream survive truncation. The timeout is a
/// deadline for the child and for every process still holding its output
/// pipes. When it passes, the whole process group is killed and `timed_out`
/// is set. Group members left behind by a child that exited normally are
/// killed as well.
#[instrument(skip_all, fields(program = spec.argv.first().map(String::as_str), timeout_secs = spec.timeout.as_secs()))]
pub fn run_command_with_timeout(spec: &CommandSpec<'_>) -> Result<CommandOutput, ProcessError> {
    let (program, args) = spec.argv.split_first().ok_or(ProcessError::EmptyCommand)?;
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(spec.cwd)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    isolate_process_group(&mut cmd);

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(ProcessError::Spawn {
                program: program.clone(),
                source: e,
            });
        }
    };
    let deadline = Instant::now() + spec.timeout;

    let stdout = child.stdout.take().ok_or(ProcessError::MissingPipe("stdout"))?;
    let stderr = child.stderr.take().ok_or(ProcessError::MissingPipe("stderr"))?;
    let limit = spec.output_limit_bytes;
    let stdout_rx = spawn_reader(stdout, limit);
    let stderr_rx = spawn_reader(stderr, limit);

    let mut timed_out = false;
    let status = match child.wait_timeout(spec.timeout).map_err(ProcessError::Wait)? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = spec.timeout.as_secs(),
                "command timed out, killing process group"
            );
            timed_out = true;
            kill_process_group(&mut child)?;
            child.wait().map_err(ProcessError::Wait)?
        }
    };

    let stdout = receive_before(&stdout_rx, deadline)?;
    let stderr = receive_before(&stderr_rx, deadline)?;
    if !timed_out && (stdout.is_none() || stderr.is_none()) {
        warn!(
            timeout_secs = spec.timeout.as_secs(),
            "descendants kept output open past the timeout, killing process group"
        );
        timed_out = true;
    }
    if let Err(err) = signal_process_group(child.id()) {
        warn!(err = %err, "failed to kill leftover process group members");
    }
    let grace = Instant::now() + KILL_GRACE;
    let stdout = match stdout {
        Some(stream) => stream,
        None => receive_before(&stdout_rx, grace)?.unwrap_or_default(),
    };
    let stderr = match stderr {
        Some(stream) => stream,
        None => receive_before(&stderr_rx, grace)?.unwrap_or_default(),
    };

    if stdout.truncated > 0 || stderr.truncated > 0 {
        warn!(
            stdout_truncated = stdout.truncated,
            stderr_truncated = stderr.truncated,
            "output truncated"
        );
    }

    debug!(exit_code = ?return_code(&status), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        timed_out,
    })
}

#[cfg(unix)]
fn isolate_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn isolate_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
fn kill_process_group(child: &mut Child) -> Result<(), ProcessError> {
    match signal_process_group(child.id()) {
        Ok(()) => Ok(()),
        // Fall back to the direct child so the wait below cannot hang.
        Err(err) => child.kill().map_err(|_| ProcessError::Kill(err)),
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) -> Result<(), ProcessError> {
    child.kill().map_err(ProcessError::Kill)
}

/// SIGKILL every process in the group led by `pgid`. An empty group is not an error.
#[cfg(unix)]
fn signal_process_group(pgid: u32) -> std::io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = i32::try_from(pgid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(std::io::Error::from(errno)),
    }
}

#[cfg(not(unix))]
fn signal_process_group(_pgid: u32) -> std::io::Result<()> {
    Ok(())
}

type ReaderResult = Result<CapturedStream, ProcessError>;

fn spawn_reader<R: Read + Send + 'static>(reader: R, limit: usize) -> mpsc::Receiver<ReaderResult> {
    let (tx, rx) = mpsc::sync_channel(1);
    thread::spawn(move || {
        // The receiver is gone only if the caller stopped waiting.
        let _ = tx.send(read_stream_limited(reader, limit));
    });
    rx
}

/// The reader's result, or `None` if it is still running at `deadline`.
fn receive_before(
    rx: &mpsc::Receiver<ReaderResult>,
    deadline: Instant,
) -> Result<Option<CapturedStream>, ProcessError> {
    match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
        Ok(result) => result.map(Some),
        Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(ProcessError::ReaderPanicked),
    }
}

/// Drain `reader`, keeping the first quarter of `limit` and the last
/// three quarters.
fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> ReaderResult {
    let head_limit = limit / 4;
    let tail_limit = limit - head_limit;
    let mut head = Vec::new();
    let mut tail: VecDeque<u8> = VecDeque::new();
    let mut total = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).map_err(ProcessError::Read)?;
        if n == 0 {
            break;
        }
        total += n;
        let into_head = n.min(head_limit - head.len());
        head.extend_from_slice(&chunk[..into_head]);
        tail.extend(&chunk[into_head..n]);
        if tail.len() > tail_limit {
            let excess = tail.len() - tail_limit;
            tail.drain(..excess);
        }
    }

    let head_len = head.len();
    let truncated = total - head_len - tail.len();
    let mut bytes = head;
    bytes.extend(tail);
    Ok(CapturedStream {
        bytes,
        truncated,
        head_len,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn spec<'a>(argv: &'a [String], cwd: &'a Path, timeout: Duration) -> CommandSpec<'a> {
        CommandSpec {
            argv,
            cwd,
            env: BTreeMap::new(),
            timeout,
            output_limit_bytes: 1024,
        }
    }

    #[test]
    fn captures_output_and_exit_code() {
        let temp = tempfile::tempdir().expect("tempdir");
        let argv = sh("echo out; echo err >&2; exit 3");
        let output = run_command_with_timeout(&spec(&argv, temp.path(), Duration::from_secs(10)))
            .expect("run");
        assert_eq!(output.return_code(), Some(3));
        assert!(!output.timed_out);
        assert_eq!(output.combined_output(), "out\nerr\n");
    }

    #[test]
    fn passes_environment() {
        let temp = tempfile::tempdir().expect("tempdir");
        let argv = sh("printf %s \"$AUDIT_SHARD_INDEX\"");
        let mut spec = spec(&argv, temp.path(), Duration::from_secs(10));
        spec.env.insert("AUDIT_SHARD_INDEX".to_string(), "2".to_string());
        let output = run_command_with_timeout(&spec).expect("run");
        assert_eq!(output.stdout.bytes, b"2");
    }

    #[test]
    fn timeout_kills_the_whole_process_group() {
        let temp = tempfile::tempdir().expect("tempdir");
        // The grandchild holds stdout open; only a group kill lets the readers finish.
        let argv = sh("sleep 30 & sleep 30");
        let started = Instant::now();
        let output = run_command_with_timeout(&spec(&argv, temp.path(), Duration::from_millis(200)))
            .expect("run");
        assert!(output.timed_out);
        assert_eq!(output.return_code(), Some(-9));
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[test]
    fn truncates_beyond_limit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let argv = sh("head -c 4096 /dev/zero");
        let output = run_command_with_timeout(&spec(&argv, temp.path(), Duration::from_secs(10)))
            .expect("run");
        assert_eq!(output.stdout.bytes.len(), 1024);
        assert_eq!(output.stdout.truncated, 3072);
    }

    #[test]
    fn truncation_keeps_the_end_of_the_stream() {
        let temp = tempfile::tempdir().expect("tempdir");
        let argv = sh("echo first; head -c 5000 /dev/zero | tr '\\0' x; echo; echo '1 failed, 9 passed in 0.1s'");
        let output = run_command_with_timeout(&spec(&argv, temp.path(), Duration::from_secs(10)))
            .expect("run");
        let text = output.combined_output();
        assert!(text.starts_with("first\n"), "{text}");
        assert!(text.contains("[... truncated"), "{text}");
        assert!(text.ends_with("1 failed, 9 passed in 0.1s\n"), "{text}");
    }

    #[test]
    fn reader_keeps_head_and_tail_in_memory() {
        let input: Vec<u8> = (0..100u8).collect();
        let captured = read_stream_limited(input.as_slice(), 20).expect("read");
        assert_eq!(captured.truncated, 80);
        assert_eq!(&captured.bytes[..5], &[0, 1, 2, 3, 4]);
        assert_eq!(&captured.bytes[5..], &input[85..]);
    }

    #[test]
    fn timeout_covers_descendants_holding_output_open() {
        let temp = tempfile::tempdir().expect("tempdir");
        // The subshell's sleep inherits stdout and outlives the direct child.
        let argv = sh("(sleep 30 &); echo '1 passed in 0.1s'; exit 0");
        let started = Instant::now();
        let output = run_command_with_timeout(&spec(&argv, temp.path(), Duration::from_millis(500)))
            .expect("run");
        assert!(output.timed_out);
        assert_eq!(output.return_code(), Some(0));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(output.combined_output().contains("1 passed"));
    }

    #[test]
    fn leftover_group_members_are_killed_after_exit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let marker = temp.path().join("survivor");
        let script = format!(
            "(sleep 1; touch '{}') >/dev/null 2>&1 & exit 0",
            marker.display()
        );
        let argv = sh(&script);
        let output = run_command_with_timeout(&spec(&argv, temp.path(), Duration::from_secs(10)))
            .expect("run");
        assert!(!output.timed_out);
        std::thread::sleep(Duration::from_millis(1500));
        assert!(!marker.exists());
    }

    #[test]
    fn empty_command_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let argv: Vec<String> = Vec::new();
        let err = run_command_with_timeout(&spec(&argv, temp.path(), Duration::from_secs(1)))
            .expect_err("empty");
        assert!(matches!(err, ProcessError::EmptyCommand));
    }
}
