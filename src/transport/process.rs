use std::ffi::OsString;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{ChildStderr, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::KiraError;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Markers in tool stderr that retrying will not fix.
const PERMANENT_MARKERS: &[&str] = &[
    "not found",
    "no such",
    "nosuchkey",
    "nosuchbucket",
    "404",
    "403",
    "access denied",
    "accessdenied",
    "forbidden",
    "unauthorized",
    "invalidaccesskeyid",
    "signaturedoesnotmatch",
    "permission denied",
    "authentication failed",
    "invalid credentials",
    "requester pays",
    "user project",
];

/// An external tool invocation with a hard deadline.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(String, String)>,
    cwd: Option<PathBuf>,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.envs.push((key.to_string(), value.to_string()));
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    /// Arguments as they will be passed, lossily converted for display.
    pub fn argv(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.to_string_lossy().to_string())
            .collect()
    }

    pub fn env_vars(&self) -> &[(String, String)] {
        &self.envs
    }

    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.display().to_string())
    }

    /// Runs to completion and returns stdout. A run that outlives `timeout` is
    /// killed and reported as `AttemptTimedOut`.
    pub fn run(&self, timeout: Duration) -> Result<String, KiraError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        tracing::debug!(program = %self.program.display(), args = ?self.args, "spawning tool");

        let mut child = cmd.spawn().map_err(|err| {
            KiraError::download(format!("failed to start {}: {err}", self.program_name()), false)
        })?;
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let deadline = Instant::now() + timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(err) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(KiraError::download(err.to_string(), true));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    program = %self.program_name(),
                    timeout_secs = timeout.as_secs(),
                    "tool exceeded attempt timeout, killing"
                );
                let _ = child.kill();
                let _ = child.wait();
                return Err(KiraError::AttemptTimedOut(timeout.as_secs()));
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
        };

        let stdout = join(stdout);
        let stderr = join(stderr);
        if status.success() {
            return Ok(stdout);
        }
        let message = if stderr.trim().is_empty() {
            format!("{} exited with {status}", self.program_name())
        } else {
            format!("{}: {}", self.program_name(), stderr.trim())
        };
        Err(classify_failure(message))
    }
}

fn drain<R: Read + Send + 'static>(mut source: R) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = source.read_to_end(&mut buffer);
        String::from_utf8_lossy(&buffer).to_string()
    })
}

fn join(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

pub(crate) fn drain_stderr(stderr: ChildStderr) -> JoinHandle<String> {
    drain(stderr)
}

/// Maps a failed tool run to a permanent or transient download error.
pub fn classify_failure(message: String) -> KiraError {
    let lowered = message.to_ascii_lowercase();
    let permanent = PERMANENT_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker));
    KiraError::download(message, !permanent)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn classify_tool_messages() {
        let not_found = classify_failure("aws: An error occurred (404) when calling".to_string());
        assert!(!not_found.is_transient());
        let denied =
            classify_failure("ascp: Session Stop (Error: Permission denied)".to_string());
        assert!(!denied.is_transient());
        let reset = classify_failure("curl: connection reset by peer".to_string());
        assert!(reset.is_transient());
    }

    #[cfg(unix)]
    #[test]
    fn kills_hung_tool() {
        let started = Instant::now();
        let err = ToolCommand::new("sleep")
            .arg("5")
            .run(Duration::from_millis(200))
            .unwrap_err();
        assert_matches!(err, KiraError::AttemptTimedOut(_));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[test]
    fn reports_stderr_of_failed_tool() {
        let err = ToolCommand::new("sh")
            .args(["-c", "echo 'object not found' >&2; exit 1"])
            .run(Duration::from_secs(10))
            .unwrap_err();
        assert_matches!(err, KiraError::Download { transient: false, .. });
    }

    #[cfg(unix)]
    #[test]
    fn returns_stdout() {
        let out = ToolCommand::new("sh")
            .args(["-c", "echo my-project"])
            .run(Duration::from_secs(10))
            .unwrap();
        assert_eq!(out.trim(), "my-project");
    }
}
