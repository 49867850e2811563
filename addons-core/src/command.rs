//! Subprocess plumbing shared by every collaborator wrapper.
//!
//! Commands are described as [`CommandSpec`] values (program plus an explicit
//! argument vector, never a shell string) and executed through a
//! [`CommandRunner`], so wrappers can be exercised without spawning processes.

use std::{
    fmt::{self, Display},
    io::{self, Read, Write},
    process::{Child, Command, ExitStatus, Stdio},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tracing::{debug, trace, warn};

use crate::error::{AddonError, Result};

/// Abstract command representation so we can test without spawning processes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    /// Kill the process if it has not exited after this long.
    pub timeout: Option<Duration>,
}

/// Display raw command string
impl Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{arg}'")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
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

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    /// Copy whose timeout is no longer than `window`, when one is given.
    pub(crate) fn bounded(&self, window: Option<Duration>) -> Self {
        let mut spec = self.clone();
        if let Some(window) = window {
            spec.timeout = Some(spec.timeout.map_or(window, |current| current.min(window)));
        }
        spec
    }

    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        let stdin = if self.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        };
        cmd.stdin(stdin);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd
    }
}

/// Exit code and captured output of a finished command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Stdout of a successful command; a non-zero exit becomes
    /// [`AddonError::CommandFailed`].
    pub fn into_stdout(self, spec: &CommandSpec) -> Result<String> {
        if self.success() {
            Ok(self.stdout)
        } else {
            Err(AddonError::CommandFailed {
                command: spec.to_string(),
                code: self.code,
                stdout: self.stdout,
                stderr: self.stderr,
            })
        }
    }
}

/// Guard for a process started in the background; the child is terminated
/// when the guard is dropped.
#[derive(Debug)]
pub struct BackgroundProcess {
    program: String,
    child: Option<Child>,
}

impl BackgroundProcess {
    /// A guard with no process behind it, for runners that do not spawn.
    pub fn detached(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            child: None,
        }
    }

    pub fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(err) = child.kill() {
                warn!(
                    program = %self.program,
                    error = %err,
                    "failed to kill background process"
                );
            }
            let _ = child.wait();
        }
    }
}

impl Drop for BackgroundProcess {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Executes command specs.
pub trait CommandRunner: Send + Sync + fmt::Debug {
    /// Run to completion. Only a failure to start the process is an `Err`; a
    /// non-zero exit is reported through [`CommandOutput::code`].
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Start without waiting.
    fn spawn(&self, spec: &CommandSpec) -> Result<BackgroundProcess>;
}

/// Production runner on [`std::process::Command`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

/// How often a child with a timeout is checked for exit.
const WAIT_SLICE: Duration = Duration::from_millis(10);

fn drain(mut pipe: impl Read + Send + 'static) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

/// `None` when `limit` passed first.
fn wait_within(child: &mut Child, limit: Duration) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + limit;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        thread::sleep(WAIT_SLICE.min(deadline - now));
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        debug!(command = %spec, "running");
        let spawn_err = |source| AddonError::Spawn {
            program: spec.program.clone(),
            source,
        };

        let mut child = spec.to_command().spawn().map_err(spawn_err)?;
        // Fed from a thread: the child may fill stdout before reading stdin.
        let writer = match (spec.stdin.clone(), child.stdin.take()) {
            (Some(input), Some(mut pipe)) => Some(thread::spawn(move || pipe.write_all(&input))),
            _ => None,
        };
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let status = match spec.timeout {
            Some(limit) => match wait_within(&mut child, limit).map_err(spawn_err)? {
                Some(status) => status,
                None => {
                    if let Err(err) = child.kill() {
                        warn!(command = %spec, error = %err, "failed to kill timed out command");
                    }
                    let _ = child.wait();
                    // Readers stay detached: a grandchild may still hold the pipes.
                    warn!(command = %spec, ?limit, "command timed out");
                    return Err(AddonError::TimedOut {
                        command: spec.to_string(),
                        limit,
                    });
                }
            },
            None => child.wait().map_err(spawn_err)?,
        };

        if let Some(writer) = writer {
            match writer.join() {
                Ok(Err(err)) if err.kind() == io::ErrorKind::BrokenPipe => {
                    debug!(command = %spec, "command exited before reading all of stdin");
                }
                Ok(Err(err)) => warn!(command = %spec, error = %err, "failed to write stdin"),
                _ => {}
            }
        }
        let collect = |reader: Option<JoinHandle<Vec<u8>>>| {
            let bytes = reader
                .map(|handle| handle.join().unwrap_or_default())
                .unwrap_or_default();
            String::from_utf8_lossy(&bytes).into_owned()
        };
        let output = CommandOutput {
            code: status.code(),
            stdout: collect(stdout),
            stderr: collect(stderr),
        };
        trace!(command = %spec, code = ?output.code, stdout = %output.stdout, "finished");
        Ok(output)
    }

    fn spawn(&self, spec: &CommandSpec) -> Result<BackgroundProcess> {
        debug!(command = %spec, "spawning in background");
        let mut cmd = spec.to_command();
        cmd.stdout(Stdio::null()).stderr(Stdio::null());
        let child = cmd.spawn().map_err(|source| AddonError::Spawn {
            program: spec.program.clone(),
            source,
        })?;
        Ok(BackgroundProcess {
            program: spec.program.clone(),
            child: Some(child),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_quotes_args_with_spaces() {
        let spec = CommandSpec::new("kubectl")
            .args(["get", "--raw"])
            .arg("/api/v1/namespaces/kube-system/services/https:kubernetes-dashboard:/proxy/")
            .arg("a b");
        assert_eq!(
            spec.to_string(),
            "kubectl get --raw \
             /api/v1/namespaces/kube-system/services/https:kubernetes-dashboard:/proxy/ 'a b'"
        );
    }

    #[test]
    fn args_are_not_shell_split() {
        let spec = CommandSpec::new("kubectl").arg("get configmap; rm -rf /");
        assert_eq!(spec.args.len(), 1);
    }

    #[test]
    fn into_stdout_maps_non_zero_exit() {
        let spec = CommandSpec::new("kubectl").arg("get").arg("msp");
        let err = CommandOutput::failed(1, "NotFound")
            .into_stdout(&spec)
            .unwrap_err();
        match err {
            AddonError::CommandFailed { command, code, .. } => {
                assert_eq!(command, "kubectl get msp");
                assert_eq!(code, Some(1));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn system_runner_captures_stdout() {
        let spec = CommandSpec::new("echo").arg("hello");
        let out = SystemRunner.run(&spec).unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn system_runner_feeds_stdin() {
        let spec = CommandSpec::new("cat").stdin("kind: Pod\n");
        let out = SystemRunner.run(&spec).unwrap();
        assert_eq!(out.stdout, "kind: Pod\n");
    }

    #[test]
    fn missing_binary_is_a_spawn_error() {
        let spec = CommandSpec::new("definitely-not-a-real-binary-4242");
        let err = SystemRunner.run(&spec).unwrap_err();
        assert!(matches!(err, AddonError::Spawn { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn early_exit_with_unread_stdin_reports_the_exit_code() {
        let spec = CommandSpec::new("false").stdin(vec![0u8; 4 << 20]);
        let out = SystemRunner.run(&spec).unwrap();
        assert_eq!(out.code, Some(1));
        let err = out.into_stdout(&spec).unwrap_err();
        assert!(matches!(err, AddonError::CommandFailed { .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn large_stdin_and_stdout_do_not_deadlock() {
        let input = "x".repeat(1 << 20);
        let spec = CommandSpec::new("cat").stdin(input.clone());
        let out = SystemRunner.run(&spec).unwrap();
        assert_eq!(out.stdout.len(), input.len());
    }

    #[test]
    fn hung_command_is_killed_at_its_timeout() {
        let spec = CommandSpec::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(200));
        let started = Instant::now();
        let err = SystemRunner.run(&spec).unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(err, AddonError::TimedOut { .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn timeout_does_not_wait_for_grandchildren_holding_output() {
        let spec = CommandSpec::new("sh")
            .args(["-c", "sleep 5; true"])
            .timeout(Duration::from_millis(200));
        let started = Instant::now();
        assert!(SystemRunner.run(&spec).is_err());
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn bounded_keeps_the_tighter_limit() {
        let secs = Duration::from_secs;
        let spec = CommandSpec::new("kubectl").timeout(secs(120));
        assert_eq!(spec.bounded(Some(secs(7))).timeout, Some(secs(7)));
        assert_eq!(spec.bounded(Some(secs(300))).timeout, Some(secs(120)));
        assert_eq!(spec.bounded(None).timeout, Some(secs(120)));
        assert_eq!(
            CommandSpec::new("microk8s").bounded(Some(secs(3))).timeout,
            Some(secs(3))
        );
    }

    #[test]
    fn background_process_is_killed_on_drop() {
        let spec = CommandSpec::new("sleep").arg("30");
        let guard = SystemRunner.spawn(&spec).unwrap();
        assert!(guard.child.is_some());
        drop(guard);
    }
}
