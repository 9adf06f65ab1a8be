//! Running compiled seed binaries with argument-driven inputs.

use std::{
    io::Read,
    path::Path,
    process::{Child, Command, Stdio},
    time::{Duration, Instant},
};

use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Captured outcome of one child process run.
///
/// On signal termination `exit_code` follows the POSIX `128 + signal`
/// convention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("spawning {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("child did not finish within {:?}", timeout)]
    Timeout { timeout: Duration },
    #[error("reading child output: {0}")]
    Io(#[from] std::io::Error),
}

/// Capability to run a binary with arguments and capture its outcome.
///
/// Every invocation spawns a fresh child; no state is shared between probes
/// beyond the binary file itself.
pub trait Executor {
    fn execute_with_args(
        &self,
        binary: &Path,
        args: &[String],
    ) -> Result<ExecutionResult, ExecError>;
}

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Spawns the binary directly, polling for exit and killing on timeout.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    timeout: Duration,
    kill_signal: Signal,
}

impl ProcessExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            kill_signal: Signal::SIGKILL,
        }
    }

    pub fn with_kill_signal(mut self, kill_signal: Signal) -> Self {
        self.kill_signal = kill_signal;
        self
    }

    fn wait_with_timeout(&self, child: &mut Child) -> Result<std::process::ExitStatus, ExecError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                let pid = Pid::from_raw(child.id() as i32);
                if let Err(errno) = signal::kill(pid, self.kill_signal) {
                    warn!(%errno, "Failed to deliver kill signal, falling back to SIGKILL");
                    child.kill()?;
                }
                child.wait()?;
                return Err(ExecError::Timeout {
                    timeout: self.timeout,
                });
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Executor for ProcessExecutor {
    fn execute_with_args(
        &self,
        binary: &Path,
        args: &[String],
    ) -> Result<ExecutionResult, ExecError> {
        let mut child = Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ExecError::Spawn {
                binary: binary.display().to_string(),
                source,
            })?;

        let status = self.wait_with_timeout(&mut child)?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stdout.take() {
            pipe.read_to_string(&mut stdout)?;
        }
        if let Some(mut pipe) = child.stderr.take() {
            pipe.read_to_string(&mut stderr)?;
        }

        let exit_code = decode_exit_status(status);
        debug!(binary = %binary.display(), exit_code, "Child finished");
        Ok(ExecutionResult {
            exit_code,
            stdout,
            stderr,
        })
    }
}

fn decode_exit_status(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signo)) => 128 + signo,
        (None, None) => {
            warn!("Child exit status carried neither code nor signal");
            -1
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn sh() -> PathBuf {
        PathBuf::from("/bin/sh")
    }

    #[test]
    fn captures_exit_code_and_output() {
        let executor = ProcessExecutor::new(Duration::from_secs(5));
        let result = executor
            .execute_with_args(
                &sh(),
                &["-c".to_owned(), "echo out; echo err >&2; exit 3".to_owned()],
            )
            .unwrap();
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
    }

    #[test]
    fn signal_death_maps_to_128_plus_signo() {
        let executor = ProcessExecutor::new(Duration::from_secs(5));
        let result = executor
            .execute_with_args(&sh(), &["-c".to_owned(), "kill -s SEGV $$".to_owned()])
            .unwrap();
        assert_eq!(result.exit_code, 128 + libc::SIGSEGV);
    }

    #[test]
    fn timeout_kills_the_child() {
        let executor = ProcessExecutor::new(Duration::from_millis(100));
        let error = executor
            .execute_with_args(&sh(), &["-c".to_owned(), "sleep 10".to_owned()])
            .unwrap_err();
        assert!(matches!(error, ExecError::Timeout { .. }));
    }

    #[test]
    fn missing_binary_is_a_spawn_error() {
        let executor = ProcessExecutor::new(Duration::from_secs(1));
        let error = executor
            .execute_with_args(Path::new("/nonexistent/prog"), &[])
            .unwrap_err();
        assert!(matches!(error, ExecError::Spawn { .. }));
    }
}
