//! Process runner: executes one script as a child process.
//!
//! Inline source is written to a uniquely named temp file inside the scripts
//! directory and removed when the run ends, however it ends. Output is
//! captured with a per-stream cap (the tail is kept). A run that outlives its
//! timeout has its whole process group killed.

use async_trait::async_trait;
use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::records::RunOutcome;
use crate::scripts::{Script, ScriptKind, ScriptSource};
use tempo_core::config::{RunnerConfig, TempoConfig};
use tempo_core::error::{Result, TempoError};

/// Where `node` usually lives when it is not on the daemon's PATH.
const NODE_FALLBACKS: [&str; 4] = [
    "/opt/homebrew/bin/node",
    "/usr/local/bin/node",
    "/usr/bin/node",
    "/bin/node",
];

/// How long readers may keep draining after the process is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Separator between stdout and stderr in a successful run's output.
pub const STDERR_SEPARATOR: &str = "\n[STDERR]\n";

/// Per-run environment supplied by the scheduler.
#[derive(Debug, Clone, Default)]
pub struct RunEnv {
    /// Global variables available to every script.
    pub vars: Vec<(String, String)>,
}

/// Executes a script and reports how it ended.
///
/// Implementations never fail outright: infrastructure problems are reported
/// as an error-classified [`RunOutcome`].
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn run(&self, script: &Script, env: &RunEnv) -> RunOutcome;
}

/// Runs scripts with the local python/node/bash interpreters.
pub struct ProcessRunner {
    config: RunnerConfig,
    scripts_dir: PathBuf,
}

impl ProcessRunner {
    pub fn new(config: RunnerConfig, scripts_dir: PathBuf) -> Self {
        Self {
            config,
            scripts_dir,
        }
    }

    pub fn from_config(config: &TempoConfig) -> Self {
        Self::new(config.runner.clone(), config.scripts_dir())
    }

    pub fn scripts_dir(&self) -> &Path {
        &self.scripts_dir
    }

    /// Locate the interpreter executable for a script kind.
    pub fn resolve_interpreter(&self, kind: ScriptKind) -> Result<PathBuf> {
        let program = match kind {
            ScriptKind::Python => &self.config.interpreters.python,
            ScriptKind::Nodejs => &self.config.interpreters.nodejs,
            ScriptKind::Shell => &self.config.interpreters.shell,
        };
        if let Ok(path) = which::which(program) {
            return Ok(path);
        }
        if kind == ScriptKind::Nodejs {
            if let Ok(path) = which::which("nodejs") {
                return Ok(path);
            }
            if let Some(path) = NODE_FALLBACKS.iter().map(Path::new).find(|p| p.is_file()) {
                return Ok(path.to_path_buf());
            }
        }
        Err(TempoError::Execution(format!(
            "interpreter '{program}' for {kind} scripts was not found"
        )))
    }

    /// Child environment: allowlisted ambient variables, then globals, then
    /// module search paths pointing at the scripts directory.
    pub fn build_env(&self, env: &RunEnv) -> Vec<(OsString, OsString)> {
        let mut vars: Vec<(OsString, OsString)> = self
            .config
            .inherit_env
            .iter()
            .filter_map(|key| std::env::var_os(key).map(|v| (OsString::from(key), v)))
            .collect();
        vars.extend(
            env.vars
                .iter()
                .map(|(k, v)| (OsString::from(k), OsString::from(v))),
        );
        vars.push((
            "NODE_PATH".into(),
            self.scripts_dir.join("node_modules").into_os_string(),
        ));
        vars.push(("PYTHONPATH".into(), self.scripts_dir.clone().into_os_string()));
        vars
    }

    fn timeout_for(&self, script: &Script) -> Duration {
        Duration::from_secs(script.timeout_secs.unwrap_or(self.config.timeout_secs))
    }

    async fn execute(&self, script: &Script, env: &RunEnv) -> Result<RunOutcome> {
        let interpreter = self.resolve_interpreter(script.kind)?;
        tokio::fs::create_dir_all(&self.scripts_dir)
            .await
            .map_err(|e| TempoError::Execution(format!("Create scripts dir: {e}")))?;

        // `_temp` lives until the end of this function; dropping it deletes the file.
        let (script_path, _temp) = match &script.source {
            ScriptSource::Path { path } => {
                let path = PathBuf::from(path);
                let path = if path.is_relative() {
                    self.scripts_dir.join(path)
                } else {
                    path
                };
                if !path.is_file() {
                    return Err(TempoError::Execution(format!(
                        "script file not found: {}",
                        path.display()
                    )));
                }
                (path, None)
            }
            ScriptSource::Inline { code } => {
                let temp = write_temp_source(&self.scripts_dir, script.kind, code)?;
                (temp.to_path_buf(), Some(temp))
            }
        };

        let timeout = self.timeout_for(script);
        tracing::debug!(
            "▶️ Running '{}' with {} (timeout {}s)",
            script.name,
            interpreter.display(),
            timeout.as_secs()
        );

        let mut cmd = Command::new(&interpreter);
        cmd.arg(&script_path)
            .current_dir(&self.scripts_dir)
            .env_clear()
            .envs(self.build_env(env))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            TempoError::Execution(format!("Failed to start {}: {e}", interpreter.display()))
        })?;

        let cap = self.config.max_output_bytes;
        let stdout = Capture::start(child.stdout.take(), cap);
        let stderr = Capture::start(child.stderr.take(), cap);

        let waited = tokio::time::timeout(timeout, child.wait()).await;
        let status = match waited {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                kill_tree(&mut child).await;
                return Err(TempoError::Execution(format!("Wait for process: {e}")));
            }
            Err(_) => {
                kill_tree(&mut child).await;
                None
            }
        };

        let stdout = stdout.finish().await;
        let stderr = stderr.finish().await;

        Ok(match status {
            Some(status) => classify(status, stdout, stderr),
            None => {
                tracing::warn!(
                    "⏱️ Script '{}' timed out after {}s",
                    script.name,
                    timeout.as_secs()
                );
                RunOutcome::timeout(
                    stdout,
                    with_stderr(format!("timed out after {}s", timeout.as_secs()), &stderr),
                )
            }
        })
    }
}

#[async_trait]
impl ScriptRunner for ProcessRunner {
    async fn run(&self, script: &Script, env: &RunEnv) -> RunOutcome {
        match self.execute(script, env).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!("⚠️ Script '{}' could not run: {e}", script.name);
                RunOutcome::error(e.to_string())
            }
        }
    }
}

fn write_temp_source(dir: &Path, kind: ScriptKind, code: &str) -> Result<tempfile::TempPath> {
    let mut file = tempfile::Builder::new()
        .prefix("tempo_")
        .suffix(&format!(".{}", kind.extension()))
        .tempfile_in(dir)
        .map_err(|e| TempoError::Execution(format!("Create temp file: {e}")))?;
    file.write_all(code.as_bytes())
        .and_then(|_| file.flush())
        .map_err(|e| TempoError::Execution(format!("Write temp file: {e}")))?;
    Ok(file.into_temp_path())
}

fn classify(status: ExitStatus, stdout: String, stderr: String) -> RunOutcome {
    if status.success() {
        let mut output = stdout;
        if !stderr.is_empty() {
            output.push_str(STDERR_SEPARATOR);
            output.push_str(&stderr);
        }
        return RunOutcome::success(output);
    }
    let reason = match status.code() {
        Some(code) => format!("exited with code {code}"),
        None => signal_reason(&status),
    };
    RunOutcome::failed(stdout, with_stderr(reason, &stderr))
}

#[cfg(unix)]
fn signal_reason(status: &ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(sig) => format!("terminated by signal {sig}"),
        None => "terminated without an exit code".into(),
    }
}

#[cfg(not(unix))]
fn signal_reason(_status: &ExitStatus) -> String {
    "terminated without an exit code".into()
}

fn with_stderr(reason: String, stderr: &str) -> String {
    if stderr.is_empty() {
        reason
    } else {
        format!("{reason}\n{stderr}")
    }
}

/// Kill the child and everything it started.
async fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
    let _ = child.kill().await;
}

/// Background reader filling a shared tail buffer.
struct Capture {
    buf: Arc<Mutex<TailBuffer>>,
    task: Option<JoinHandle<()>>,
}

impl Capture {
    fn start<R>(reader: Option<R>, cap: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(TailBuffer::new(cap)));
        let task = reader.map(|mut reader| {
            let buf = buf.clone();
            tokio::spawn(async move {
                let mut chunk = [0u8; 8192];
                loop {
                    match reader.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if let Ok(mut b) = buf.lock() {
                                b.push(&chunk[..n]);
                            }
                        }
                    }
                }
            })
        });
        Self { buf, task }
    }

    /// Wait briefly for EOF, then take whatever was captured.
    /// A descendant that inherited the pipe can keep it open forever.
    async fn finish(mut self) -> String {
        if let Some(mut task) = self.task.take()
            && tokio::time::timeout(DRAIN_GRACE, &mut task).await.is_err()
        {
            task.abort();
        }
        match self.buf.lock() {
            Ok(mut b) => b.take(),
            Err(_) => String::new(),
        }
    }
}

/// Keeps the last `cap` bytes written to it.
#[derive(Debug)]
pub struct TailBuffer {
    cap: usize,
    data: Vec<u8>,
    dropped: usize,
}

impl TailBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            data: Vec::new(),
            dropped: 0,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
        // Compact lazily so pushes stay amortized O(n)
        if self.data.len() >= self.cap * 2 {
            self.compact();
        }
    }

    fn compact(&mut self) {
        if self.data.len() > self.cap {
            let excess = self.data.len() - self.cap;
            self.data.drain(..excess);
            self.dropped += excess;
        }
    }

    /// Retained text. When bytes were dropped, the text starts at the next
    /// line boundary and carries a truncation marker.
    pub fn take(&mut self) -> String {
        self.compact();
        let mut data = std::mem::take(&mut self.data);
        let mut dropped = std::mem::take(&mut self.dropped);
        if dropped == 0 {
            return String::from_utf8_lossy(&data).into_owned();
        }
        if let Some(nl) = data.iter().position(|b| *b == b'\n') {
            data.drain(..=nl);
            dropped += nl + 1;
        }
        format!(
            "[... {dropped} bytes truncated ...]\n{}",
            String::from_utf8_lossy(&data)
        )
    }
}
