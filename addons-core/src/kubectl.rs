//! Thin wrapper around the cluster CLI.

use std::{path::PathBuf, sync::Arc, time::Duration};

use serde_json::Value as JsonValue;
use serde_yaml::Value as YamlValue;
use tracing::{debug, info};

use crate::{
    command::{BackgroundProcess, CommandRunner, CommandSpec},
    error::{AddonError, Result},
    poll::{Check, Clock, ConditionPoller, PollOutcome, PollPolicy, SystemClock},
};

/// Poll interval for commands retried until they succeed.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Longest a single cluster CLI call may run before it is killed. Calls made
/// inside a deadline-bounded poll get the time left instead, when shorter.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// `RETRY_INTERVAL` polling bounded by `timeout`.
pub fn retry_for(timeout: Duration) -> PollPolicy {
    PollPolicy::deadline(timeout, RETRY_INTERVAL)
}

#[derive(Debug, Clone)]
pub struct Kubectl {
    runner: Arc<dyn CommandRunner>,
    clock: Arc<dyn Clock>,
    binary: PathBuf,
}

impl Kubectl {
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

    pub(crate) fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// A poller sharing this wrapper's clock.
    pub fn poller(
        &self,
        label: impl Into<String>,
        policy: PollPolicy,
    ) -> ConditionPoller<Arc<dyn Clock>> {
        ConditionPoller::new(label, policy).with_clock(self.clock.clone())
    }

    pub fn spec<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new(self.binary.display().to_string())
            .args(args)
            .timeout(COMMAND_TIMEOUT)
    }

    /// Run once; a non-zero exit is an error.
    pub fn run<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = self.spec(args);
        self.runner.run(&spec)?.into_stdout(&spec)
    }

    /// Re-run until the command exits zero or the budget is spent. When
    /// `accept` is given, a failing run whose trimmed stdout equals it is
    /// also accepted (`auth can-i` exits 1 while printing `no`). Stderr is
    /// ignored for that comparison.
    pub fn run_until_success(
        &self,
        args: &[&str],
        policy: PollPolicy,
        accept: Option<&str>,
    ) -> Result<String> {
        let spec = self.spec(args.iter().copied());
        self.poller(spec.to_string(), policy)
            .poll_within(|window| {
                let attempt = spec.bounded(window);
                let output = self.runner.run(&attempt)?;
                if !output.success()
                    && let Some(expected) = accept
                    && output.stdout.trim() == expected
                {
                    return Ok(Check::Ready(expected.to_string()));
                }
                output.into_stdout(&attempt).map(Check::Ready)
            })?
            .into_last_error(spec.to_string())
    }

    /// Apply a manifest passed on stdin.
    pub fn apply_manifest(&self, manifest: &str) -> Result<String> {
        let spec = self.spec(["apply", "-f", "-"]).stdin(manifest);
        let out = self.runner.run(&spec)?.into_stdout(&spec)?;
        debug!(output = %out.trim(), "applied manifest");
        Ok(out)
    }

    pub fn delete_manifest(&self, manifest: &str) -> Result<String> {
        let spec = self.spec(["delete", "-f", "-"]).stdin(manifest);
        self.runner.run(&spec)?.into_stdout(&spec)
    }

    /// `get ARGS -o json`, parsed.
    pub fn get_json(&self, args: &[&str]) -> Result<JsonValue> {
        let spec = self.spec(args.iter().copied()).args(["-o", "json"]);
        let stdout = self.runner.run(&spec)?.into_stdout(&spec)?;
        serde_json::from_str(&stdout)
            .map_err(|err| AddonError::malformed("json", spec.to_string(), err))
    }

    /// `get ARGS -o yaml`, parsed.
    pub fn get_yaml(&self, args: &[&str]) -> Result<YamlValue> {
        self.get_yaml_within(args, None)
    }

    pub(crate) fn get_yaml_within(
        &self,
        args: &[&str],
        window: Option<Duration>,
    ) -> Result<YamlValue> {
        let spec = self
            .spec(args.iter().copied())
            .args(["-o", "yaml"])
            .bounded(window);
        let stdout = self.runner.run(&spec)?.into_stdout(&spec)?;
        serde_yaml::from_str(&stdout)
            .map_err(|err| AddonError::malformed("yaml", spec.to_string(), err))
    }

    pub fn jsonpath(&self, args: &[&str], expr: &str) -> Result<String> {
        let spec = self
            .spec(args.iter().copied())
            .args(["-o".to_string(), format!("jsonpath={expr}")]);
        self.runner.run(&spec)?.into_stdout(&spec)
    }

    /// `auth can-i VERB RESOURCE --as=USER [--as-group=GROUP]…`, retried
    /// within `policy` until the API server gives an answer.
    pub fn can_i(
        &self,
        verb: &str,
        resource: &str,
        as_user: &str,
        groups: &[&str],
        policy: PollPolicy,
    ) -> Result<bool> {
        let mut args = vec![
            "auth".to_string(),
            "can-i".into(),
            verb.into(),
            resource.into(),
            format!("--as={as_user}"),
        ];
        args.extend(groups.iter().map(|group| format!("--as-group={group}")));
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let answer = self.run_until_success(&args, policy, Some("no"))?;
        match answer.trim() {
            "yes" => Ok(true),
            "no" => Ok(false),
            other => Err(AddonError::malformed(
                "can-i answer",
                args.join(" "),
                other,
            )),
        }
    }

    /// Poll `ARGS` until its stdout contains `needle`. Exhaustion is returned
    /// to the caller.
    pub fn wait_for_output(
        &self,
        args: &[&str],
        needle: &str,
        policy: PollPolicy,
    ) -> Result<PollOutcome<String>> {
        let spec = self.spec(args.iter().copied());
        self.poller(format!("`{spec}` contains {needle:?}"), policy)
            .poll_within(|window| {
                let attempt = spec.bounded(window);
                let stdout = self.runner.run(&attempt)?.into_stdout(&attempt)?;
                Ok(if stdout.contains(needle) {
                    Check::Ready(stdout)
                } else {
                    Check::Pending
                })
            })
    }

    /// `port-forward TARGET LOCAL:REMOTE [-n NS]` in the background.
    pub fn port_forward(
        &self,
        namespace: &str,
        target: &str,
        local: u16,
        remote: u16,
    ) -> Result<BackgroundProcess> {
        let spec = self.spec([
            "port-forward".to_string(),
            "-n".into(),
            namespace.into(),
            target.into(),
            format!("{local}:{remote}"),
        ]);
        info!(%target, local, remote, "starting port-forward");
        self.runner.spawn(&spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        command::CommandOutput,
        testing::{FakeClock, ScriptedRunner},
    };

    fn kubectl(runner: &Arc<ScriptedRunner>) -> Kubectl {
        Kubectl::new(runner.clone(), "/snap/microk8s/current/kubectl")
            .with_clock(FakeClock::shared())
    }

    #[test]
    fn apply_manifest_pipes_stdin() {
        let runner = ScriptedRunner::new();
        runner.ok("pod/nginx created\n");
        kubectl(&runner).apply_manifest("kind: Pod\n").unwrap();
        let calls = runner.calls();
        assert_eq!(calls[0].args, vec!["apply", "-f", "-"]);
        assert_eq!(calls[0].stdin.as_deref(), Some(&b"kind: Pod\n"[..]));
    }

    #[test]
    fn run_until_success_retries_failures() {
        let runner = ScriptedRunner::new();
        runner
            .fail(1, "connection refused")
            .fail(1, "connection refused")
            .ok("NAME STATUS\nmyclaim Bound\n");
        let out = kubectl(&runner)
            .run_until_success(&["get", "pvc"], retry_for(Duration::from_secs(30)), None)
            .unwrap();
        assert!(out.contains("Bound"));
        assert_eq!(runner.calls().len(), 3);
    }

    fn denied(stderr: &str) -> Result<CommandOutput> {
        Ok(CommandOutput {
            code: Some(1),
            stdout: "no\n".into(),
            stderr: stderr.into(),
        })
    }

    #[test]
    fn run_until_success_accepts_expected_failure_output() {
        let runner = ScriptedRunner::new();
        runner.push(denied(""));
        let out = kubectl(&runner)
            .run_until_success(
                &["auth", "can-i", "view", "pod"],
                retry_for(Duration::from_secs(5)),
                Some("no"),
            )
            .unwrap();
        assert_eq!(out, "no");
        assert_eq!(runner.calls().len(), 1);
    }

    #[test]
    fn run_until_success_ignores_stderr_warnings_when_accepting() {
        let runner = ScriptedRunner::new();
        runner.push(denied("Warning: verb 'view' is not a known verb\n"));
        let out = kubectl(&runner)
            .run_until_success(
                &["auth", "can-i", "view", "pod"],
                retry_for(Duration::from_secs(5)),
                Some("no"),
            )
            .unwrap();
        assert_eq!(out, "no");
        assert_eq!(runner.calls().len(), 1);
    }

    #[test]
    fn run_until_success_surfaces_last_failure() {
        let runner = ScriptedRunner::new();
        for _ in 0..10 {
            runner.fail(1, "the server could not find the requested resource");
        }
        let err = kubectl(&runner)
            .run_until_success(&["get", "ing"], retry_for(Duration::from_secs(3)), None)
            .unwrap_err();
        assert!(matches!(err, AddonError::CommandFailed { .. }));
        // t = 0, 1, 2, 3
        assert_eq!(runner.calls().len(), 4);
    }

    #[test]
    fn get_json_rejects_garbage_without_retry() {
        let runner = ScriptedRunner::new();
        runner.ok("{not json");
        let err = kubectl(&runner).get_json(&["get", "msp", "pool-a"]).unwrap_err();
        assert!(matches!(err, AddonError::Malformed { format: "json", .. }));
        assert_eq!(runner.calls()[0].args, vec!["get", "msp", "pool-a", "-o", "json"]);
    }

    #[test]
    fn jsonpath_is_a_single_argument() {
        let runner = ScriptedRunner::new();
        runner.ok("forward . 8.8.8.8");
        let out = kubectl(&runner)
            .jsonpath(
                &["get", "configmap", "coredns", "-n", "kube-system"],
                "{.data.Corefile}",
            )
            .unwrap();
        assert_eq!(out, "forward . 8.8.8.8");
        assert_eq!(
            runner.calls()[0].args.last().map(String::as_str),
            Some("jsonpath={.data.Corefile}")
        );
    }

    #[test]
    fn can_i_reads_yes_and_no() {
        let runner = ScriptedRunner::new();
        runner.push(denied("Warning: verb 'view' is not a known verb\n"));
        runner.ok("yes\n");
        let kubectl = kubectl(&runner);
        let policy = retry_for(Duration::from_secs(60));
        let sa = "system:serviceaccount:default:default";
        assert!(!kubectl.can_i("view", "pod", sa, &[], policy).unwrap());
        assert!(
            kubectl
                .can_i("view", "pod", "admin", &["system:masters"], policy)
                .unwrap()
        );
        assert_eq!(
            runner.commands()[1],
            "/snap/microk8s/current/kubectl auth can-i view pod \
             --as=admin --as-group=system:masters"
        );
    }

    #[test]
    fn can_i_retries_until_the_api_server_answers() {
        let runner = ScriptedRunner::new();
        runner
            .fail(1, "The connection to the server was refused")
            .ok("yes\n");
        let allowed = kubectl(&runner)
            .can_i("view", "pod", "admin", &[], retry_for(Duration::from_secs(60)))
            .unwrap();
        assert!(allowed);
        assert_eq!(runner.calls().len(), 2);
    }

    #[test]
    fn polled_calls_never_outlive_the_deadline() {
        let runner = ScriptedRunner::new();
        for _ in 0..5 {
            runner.ok("NAME STATUS\nmyclaim Pending\n");
        }
        let policy = PollPolicy::deadline(Duration::from_secs(4), Duration::from_secs(2));
        let outcome = kubectl(&runner)
            .wait_for_output(&["get", "pvc"], "Bound", policy)
            .unwrap();
        assert!(!outcome.is_ready());
        let limits: Vec<_> = runner.calls().iter().map(|spec| spec.timeout).collect();
        let secs = |n| Some(Duration::from_secs(n));
        assert_eq!(limits, vec![secs(4), secs(2), secs(1)]);

        // Attempt-bounded polls keep the per-command ceiling.
        let runner = ScriptedRunner::new();
        kubectl(&runner)
            .wait_for_output(&["get", "pvc"], "", PollPolicy::attempts(0, Duration::ZERO))
            .unwrap();
        assert_eq!(runner.calls()[0].timeout, Some(COMMAND_TIMEOUT));
    }

    #[test]
    fn wait_for_output_reports_exhaustion() {
        let runner = ScriptedRunner::new();
        for _ in 0..3 {
            runner.ok("NAME STATUS\nmyclaim Pending\n");
        }
        let outcome = kubectl(&runner)
            .wait_for_output(
                &["get", "pvc"],
                "Bound",
                PollPolicy::attempts(2, Duration::from_secs(2)),
            )
            .unwrap();
        assert!(!outcome.is_ready());
        assert_eq!(outcome.attempts(), 3);
    }

    #[test]
    fn port_forward_spawns_in_background() {
        let runner = ScriptedRunner::new();
        let _guard = kubectl(&runner)
            .port_forward("default", "pod/nginx", 5123, 80)
            .unwrap();
        assert_eq!(
            runner.calls()[0].args,
            vec!["port-forward", "-n", "default", "pod/nginx", "5123:80"]
        );
    }
}
