//! Subprocess transports shared by the backend adapters.
//!
//! Both transports own exactly one child process per turn, feed its output
//! through a [`LineBuffer`] into a tool-specific [`LineParser`], and push the
//! resulting chunks into an [`OutputBridge`]. Cancellation kills the child and
//! closes the bridge without a terminal chunk.

use std::collections::HashMap;
use std::io::{ErrorKind, Read};
use std::path::PathBuf;
use std::process::Stdio;

use portable_pty::{native_pty_system, CommandBuilder, PtyPair, PtySize};
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::bridge::{LineBuffer, OutputBridge};
use super::types::{BackendRun, ChatChunk, InstallStatus};

/// Windows constant to hide console windows when spawning CLI subprocesses.
#[cfg(target_os = "windows")]
pub const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Incremental parser for one tool's line-delimited JSON protocol.
///
/// Lines that do not parse must yield no chunks; they are never errors.
pub trait LineParser: Send {
    fn parse_line(&mut self, line: &str) -> Vec<ChatChunk>;
}

/// Everything needed to launch one backend turn.
#[derive(Debug)]
pub struct ProcessSpec {
    pub label: &'static str,
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    /// Side-channel files owned by this turn, deleted when the driver ends on every path.
    pub temp_files: Vec<NamedTempFile>,
}

impl ProcessSpec {
    pub fn new(label: &'static str, program: impl Into<String>) -> Self {
        Self {
            label,
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            temp_files: Vec::new(),
        }
    }

    pub fn arg(&mut self, arg: impl Into<String>) -> &mut Self {
        self.args.push(arg.into());
        self
    }
}

/// Launches `spec` over plain pipes and returns its chunk sequence.
pub fn spawn_piped(
    spec: ProcessSpec,
    parser: Box<dyn LineParser>,
    cancel: &CancellationToken,
) -> BackendRun {
    let bridge = OutputBridge::new();
    let kill = cancel.child_token();
    tokio::spawn(drive_piped(spec, parser, bridge.clone(), kill.clone()));
    BackendRun::new(bridge.into_stream(), kill)
}

/// Launches `spec` inside a pseudo-terminal and returns its chunk sequence.
pub fn spawn_pty(
    spec: ProcessSpec,
    parser: Box<dyn LineParser>,
    cancel: &CancellationToken,
) -> BackendRun {
    let bridge = OutputBridge::new();
    let kill = cancel.child_token();
    tokio::spawn(drive_pty(spec, parser, bridge.clone(), kill.clone()));
    BackendRun::new(bridge.into_stream(), kill)
}

/// A run that fails before anything is spawned.
pub fn failed_run(label: &str, message: impl std::fmt::Display) -> BackendRun {
    let bridge = OutputBridge::new();
    spawn_failed(&bridge, label, message);
    BackendRun::new(bridge.into_stream(), CancellationToken::new())
}

fn feed(parser: &mut dyn LineParser, bridge: &OutputBridge, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    for chunk in parser.parse_line(line) {
        bridge.push(chunk);
    }
}

fn spawn_failed(bridge: &OutputBridge, label: &str, err: impl std::fmt::Display) {
    log::error!("Failed to spawn {} CLI: {}", label, err);
    bridge.push(ChatChunk::error(format!("Failed to spawn {} CLI: {}", label, err)));
    bridge.finish();
}

async fn drive_piped(
    spec: ProcessSpec,
    mut parser: Box<dyn LineParser>,
    bridge: OutputBridge,
    kill: CancellationToken,
) {
    let ProcessSpec {
        label,
        program,
        args,
        env,
        cwd,
        temp_files,
    } = spec;

    let mut command = Command::new(&program);
    command
        .args(&args)
        .env_clear()
        .envs(&env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &cwd {
        command.current_dir(dir);
    }

    #[cfg(target_os = "windows")]
    command.creation_flags(CREATE_NO_WINDOW);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => return spawn_failed(&bridge, label, e),
    };
    log::info!("{} CLI spawned: pid={:?}", label, child.id());

    let Some(mut stdout) = child.stdout.take() else {
        let _ = child.kill().await;
        return spawn_failed(&bridge, label, "stdout was not captured");
    };
    if let Some(stderr) = child.stderr.take() {
        spawn_stderr_drain(stderr, label);
    }

    let mut lines = LineBuffer::new();
    let mut buf = vec![0u8; 8192];
    let cancelled = loop {
        tokio::select! {
            _ = kill.cancelled() => break true,
            read = stdout.read(&mut buf) => match read {
                Ok(0) => break false,
                Ok(n) => {
                    for line in lines.push(&buf[..n]) {
                        feed(parser.as_mut(), &bridge, &line);
                    }
                }
                Err(e) => {
                    log::warn!("Error reading {} stdout: {}", label, e);
                    break false;
                }
            }
        }
    };

    if !cancelled {
        if let Some(rest) = lines.finish() {
            feed(parser.as_mut(), &bridge, &rest);
        }
    }

    let status = if cancelled {
        None
    } else {
        tokio::select! {
            _ = kill.cancelled() => None,
            status = child.wait() => Some(status),
        }
    };

    drop(temp_files);
    match status {
        None => {
            let _ = child.kill().await;
            log::info!("{} CLI killed on cancellation", label);
            bridge.close();
        }
        Some(Ok(status)) => {
            log::debug!("{} CLI exited: {}", label, status);
            bridge.exit(status.code(), false);
        }
        Some(Err(e)) => {
            log::warn!("Failed to wait for {} CLI: {}", label, e);
            bridge.exit(None, false);
        }
    }
}

async fn drive_pty(
    spec: ProcessSpec,
    mut parser: Box<dyn LineParser>,
    bridge: OutputBridge,
    kill: CancellationToken,
) {
    let ProcessSpec {
        label,
        program,
        args,
        env,
        cwd,
        temp_files,
    } = spec;

    let pty_system = native_pty_system();
    // Wide enough that tools never reflow their JSON output.
    let pair = match pty_system.openpty(PtySize {
        rows: 24,
        cols: 500,
        pixel_width: 0,
        pixel_height: 0,
    }) {
        Ok(pair) => pair,
        Err(e) => return spawn_failed(&bridge, label, e),
    };
    let PtyPair { master, slave } = pair;

    let mut builder = CommandBuilder::new(&program);
    builder.args(&args);
    builder.env_clear();
    for (key, value) in &env {
        builder.env(key, value);
    }
    if let Some(dir) = &cwd {
        builder.cwd(dir);
    }

    let mut child = match slave.spawn_command(builder) {
        Ok(child) => child,
        Err(e) => return spawn_failed(&bridge, label, e),
    };
    // Only the child keeps the slave open, so the reader sees EOF when it exits.
    drop(slave);
    log::info!("{} CLI spawned in pty: pid={:?}", label, child.process_id());

    let mut killer = child.clone_killer();
    let mut reader = match master.try_clone_reader() {
        Ok(reader) => reader,
        Err(e) => {
            let _ = killer.kill();
            return spawn_failed(&bridge, label, e);
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                // Linux reports EIO on the master once the child side closes.
                Err(_) => break,
            }
        }
    });
    let mut wait = tokio::task::spawn_blocking(move || child.wait());

    let mut stripper = AnsiStripper::new();
    let mut lines = LineBuffer::new();
    let cancelled = loop {
        tokio::select! {
            _ = kill.cancelled() => break true,
            bytes = rx.recv() => match bytes {
                Some(bytes) => {
                    let clean = stripper.strip(&bytes);
                    for line in lines.push(&clean) {
                        feed(parser.as_mut(), &bridge, &line);
                    }
                }
                None => break false,
            }
        }
    };

    if !cancelled {
        if let Some(rest) = lines.finish() {
            feed(parser.as_mut(), &bridge, &rest);
        }
    }

    let status = if cancelled {
        None
    } else {
        tokio::select! {
            _ = kill.cancelled() => None,
            status = &mut wait => Some(status),
        }
    };

    drop(temp_files);
    match status {
        None => {
            let _ = killer.kill();
            log::info!("{} CLI killed on cancellation", label);
            bridge.close();
        }
        Some(Ok(Ok(status))) => {
            log::debug!("{} CLI exited: code={}", label, status.exit_code());
            bridge.exit(Some(status.exit_code() as i32), false);
        }
        Some(Ok(Err(e))) => {
            log::warn!("Failed to wait for {} CLI: {}", label, e);
            bridge.exit(None, false);
        }
        Some(Err(e)) => {
            log::warn!("{} wait task failed: {}", label, e);
            bridge.exit(None, false);
        }
    }
    drop(master);
}

/// Spawn a tokio task that drains stderr line-by-line, logging non-empty lines.
///
/// Prevents deadlock when the child process writes to stderr faster than we consume it.
pub fn spawn_stderr_drain(
    stderr: tokio::process::ChildStderr,
    label: &'static str,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(stderr).lines();
        while let Some(line) = lines.next_line().await.unwrap_or(None) {
            if !line.trim().is_empty() {
                log::debug!("[{label} stderr] {}", line.trim());
            }
        }
    })
}

/// True if `command` resolves on PATH (or is an existing executable path).
pub fn cli_on_path(command: &str) -> bool {
    which::which(command).is_ok()
}

/// Resolves `command` on PATH and asks it for its version.
pub async fn check_cli_installed(command: &str) -> InstallStatus {
    let path = match which::which(command) {
        Ok(path) => path,
        Err(_) => return InstallStatus::default(),
    };

    let version = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        Command::new(&path)
            .arg("--version")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output(),
    )
    .await
    .ok()
    .and_then(|output| output.ok())
    .filter(|output| output.status.success())
    .map(|output| String::from_utf8_lossy(&output.stdout).trim().to_string())
    .filter(|version| !version.is_empty());

    InstallStatus {
        installed: true,
        version,
        path: Some(path.display().to_string()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AnsiState {
    Ground,
    Escape,
    Csi,
    Osc,
    OscEscape,
    Charset,
}

/// Removes terminal escape sequences from a byte stream.
///
/// State survives across calls so sequences split between reads are still removed.
#[derive(Debug)]
pub struct AnsiStripper {
    state: AnsiState,
}

impl Default for AnsiStripper {
    fn default() -> Self {
        Self::new()
    }
}

impl AnsiStripper {
    pub fn new() -> Self {
        Self {
            state: AnsiState::Ground,
        }
    }

    pub fn strip(&mut self, input: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(input.len());
        for &b in input {
            self.state = match self.state {
                AnsiState::Ground => match b {
                    0x1b => AnsiState::Escape,
                    b'\n' | b'\r' | b'\t' => {
                        out.push(b);
                        AnsiState::Ground
                    }
                    0x00..=0x1f | 0x7f => AnsiState::Ground,
                    _ => {
                        out.push(b);
                        AnsiState::Ground
                    }
                },
                AnsiState::Escape => match b {
                    b'[' => AnsiState::Csi,
                    b']' | b'P' | b'X' | b'^' | b'_' => AnsiState::Osc,
                    b'(' | b')' | b'*' | b'+' => AnsiState::Charset,
                    _ => AnsiState::Ground,
                },
                AnsiState::Csi => match b {
                    0x40..=0x7e => AnsiState::Ground,
                    _ => AnsiState::Csi,
                },
                AnsiState::Osc => match b {
                    0x07 => AnsiState::Ground,
                    0x1b => AnsiState::OscEscape,
                    _ => AnsiState::Osc,
                },
                AnsiState::OscEscape => match b {
                    b'\\' => AnsiState::Ground,
                    _ => AnsiState::Osc,
                },
                AnsiState::Charset => AnsiState::Ground,
            };
        }
        out
    }
}
