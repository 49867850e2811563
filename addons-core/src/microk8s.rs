//! Distribution CLI wrappers: addon enable/disable, status, and datastore
//! backup/restore.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    command::{CommandRunner, CommandSpec},
    error::{AddonError, Result},
    kubectl::retry_for,
    poll::{Check, Clock, ConditionPoller, SystemClock},
};

pub const DEFAULT_ADDON_TIMEOUT: Duration = Duration::from_secs(300);

/// One row of `status --format yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddonStatus {
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusDocument {
    #[serde(default)]
    addons: Vec<AddonStatus>,
}

/// Parse the `addons:` list out of `status --format yaml`.
pub fn parse_status(raw: &str) -> Result<Vec<AddonStatus>> {
    serde_yaml::from_str::<StatusDocument>(raw)
        .map(|doc| doc.addons)
        .map_err(|err| AddonError::malformed("yaml", "microk8s status", err))
}

#[derive(Debug, Clone)]
pub struct Microk8s {
    runner: Arc<dyn CommandRunner>,
    clock: Arc<dyn Clock>,
    binary: PathBuf,
}

impl Microk8s {
    pub fn new(runner: Arc<dyn CommandRunner>, binary: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            clock: Arc::new(SystemClock),
            binary: binary.into(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn spec<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new(self.binary.display().to_string()).args(args)
    }

    fn run_until_success(&self, spec: CommandSpec, timeout: Duration) -> Result<String> {
        ConditionPoller::new(spec.to_string(), retry_for(timeout))
            .with_clock(self.clock.clone())
            .poll_within(|window| {
                let attempt = spec.bounded(window);
                self.runner.run(&attempt)?.into_stdout(&attempt).map(Check::Ready)
            })?
            .into_last_error(spec.to_string())
    }

    /// `enable NAME ARGS…`, retried until it succeeds.
    pub fn enable(&self, addon: &str, args: &[&str], timeout: Duration) -> Result<String> {
        info!(%addon, ?args, "enabling addon");
        let spec = self.spec(["enable", addon]).args(args.iter().copied());
        self.run_until_success(spec, timeout)
    }

    pub fn disable(&self, addon: &str, args: &[&str], timeout: Duration) -> Result<String> {
        info!(%addon, ?args, "disabling addon");
        let spec = self.spec(["disable", addon]).args(args.iter().copied());
        self.run_until_success(spec, timeout)
    }

    /// Single `enable` attempt; returns the exit code (`None` on signal).
    pub fn enable_expecting_failure(&self, addon: &str) -> Result<Option<i32>> {
        let output = self.runner.run(&self.spec(["enable", addon]))?;
        Ok(output.code)
    }

    pub fn reset(&self, timeout: Duration) -> Result<String> {
        info!("resetting cluster");
        self.run_until_success(self.spec(["reset"]), timeout)
    }

    pub fn status(&self) -> Result<Vec<AddonStatus>> {
        let spec = self.spec(["status", "--format", "yaml"]);
        let raw = self.runner.run(&spec)?.into_stdout(&spec)?;
        parse_status(&raw)
    }

    /// `ARGS --help`, for the help-text scenario.
    pub fn help(&self, args: &[&str]) -> Result<String> {
        let spec = self.spec(args.iter().copied()).arg("--help");
        self.runner.run(&spec)?.into_stdout(&spec)
    }
}

#[derive(Debug, Clone)]
pub struct Dbctl {
    runner: Arc<dyn CommandRunner>,
    binary: PathBuf,
}

impl Dbctl {
    pub fn new(runner: Arc<dyn CommandRunner>, binary: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            binary: binary.into(),
        }
    }

    /// `--debug backup -o OUT`. dbctl appends `.tar.gz` to `OUT`.
    pub fn backup(&self, output: &Path) -> Result<PathBuf> {
        let spec = CommandSpec::new(self.binary.display().to_string())
            .args(["--debug", "backup", "-o"])
            .arg(output.display().to_string());
        self.runner.run(&spec)?.into_stdout(&spec)?;
        let mut archive = output.as_os_str().to_owned();
        archive.push(".tar.gz");
        Ok(PathBuf::from(archive))
    }

    pub fn restore(&self, archive: &Path) -> Result<()> {
        let spec = CommandSpec::new(self.binary.display().to_string())
            .args(["--debug", "restore"])
            .arg(archive.display().to_string());
        self.runner.run(&spec)?.into_stdout(&spec)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeClock, ScriptedRunner};

    const STATUS: &str = r#"
microk8s:
  running: true
high-availability:
  enabled: false
addons:
- name: dashboard
  repository: core
  description: The Kubernetes dashboard
  version: 2.7.0
  status: enabled
- name: gpu
  repository: core
  description: Automatic enablement of Nvidia CUDA
  status: disabled
"#;

    #[test]
    fn parses_status_yaml() {
        let addons = parse_status(STATUS).unwrap();
        assert_eq!(addons.len(), 2);
        assert_eq!(addons[0].status, "enabled");
        assert_eq!(addons[1].name, "gpu");
        assert_eq!(addons[1].status, "disabled");
    }

    #[test]
    fn status_without_addons_is_empty() {
        assert!(parse_status("microk8s:\n  running: false\n").unwrap().is_empty());
        assert!(parse_status("addons: {").is_err());
    }

    #[test]
    fn enable_retries_until_success() {
        let runner = ScriptedRunner::new();
        runner.fail(1, "microk8s is not running").ok("Addon dashboard is enabled\n");
        let clock = FakeClock::shared();
        let microk8s =
            Microk8s::new(runner.clone(), "/snap/bin/microk8s").with_clock(clock.clone());
        microk8s
            .enable("metallb", &["10.64.140.43-10.64.140.49"], DEFAULT_ADDON_TIMEOUT)
            .unwrap();
        assert_eq!(
            runner.commands()[1],
            "/snap/bin/microk8s enable metallb 10.64.140.43-10.64.140.49"
        );
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(1)]);
        // Each try is limited to what is left of the addon timeout.
        let limits: Vec<_> = runner.calls().iter().map(|spec| spec.timeout).collect();
        assert_eq!(
            limits,
            vec![
                Some(DEFAULT_ADDON_TIMEOUT),
                Some(DEFAULT_ADDON_TIMEOUT - Duration::from_secs(1))
            ]
        );
    }

    #[test]
    fn enable_expecting_failure_reports_exit_code() {
        let runner = ScriptedRunner::new();
        runner.fail(1, "Addon foo was not found in any repository");
        let microk8s = Microk8s::new(runner.clone(), "microk8s");
        assert_eq!(microk8s.enable_expecting_failure("foo").unwrap(), Some(1));
        assert_eq!(runner.calls().len(), 1);
    }

    #[test]
    fn backup_returns_archive_path() {
        let runner = ScriptedRunner::new();
        let dbctl = Dbctl::new(runner.clone(), "microk8s.dbctl");
        let archive = dbctl.backup(Path::new("/tmp/backup-1")).unwrap();
        assert_eq!(archive, PathBuf::from("/tmp/backup-1.tar.gz"));
        dbctl.restore(&archive).unwrap();
        assert_eq!(
            runner.commands(),
            vec![
                "microk8s.dbctl --debug backup -o /tmp/backup-1",
                "microk8s.dbctl --debug restore /tmp/backup-1.tar.gz",
            ]
        );
    }
}
