//! Waiting for a pod's first container to reach a given state.

use std::{fmt, time::Duration};

use serde_yaml::Value;
use tracing::info;

use crate::{
    error::{AddonError, Result},
    kubectl::Kubectl,
    poll::{Check, PollPolicy},
};

pub const POD_POLL_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_POD_TIMEOUT: Duration = Duration::from_secs(600);

/// Which pod to inspect. Without a name, the first pod matching the label
/// (or the first pod in the namespace) is used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSelector {
    pub namespace: String,
    pub name: Option<String>,
    pub label: Option<String>,
}

impl PodSelector {
    pub fn labelled(namespace: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: None,
            label: Some(label.into()),
        }
    }

    pub fn named(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: Some(name.into()),
            label: None,
        }
    }

    fn args(&self) -> Vec<String> {
        let mut args = vec!["get".to_string(), "po".into()];
        if let Some(name) = &self.name {
            args.push(name.clone());
        }
        args.extend(["-n".to_string(), self.namespace.clone()]);
        if let Some(label) = &self.label {
            args.extend(["-l".to_string(), label.clone()]);
        }
        args
    }
}

impl fmt::Display for PodSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/", self.namespace)?;
        match (&self.name, &self.label) {
            (Some(name), _) => write!(f, "{name}"),
            (None, Some(label)) => write!(f, "[{label}]"),
            (None, None) => write!(f, "*"),
        }
    }
}

/// State key of a container status (`running`, `waiting`, `terminated`)
/// and its reason, when the runtime reports one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    pub state: String,
    pub reason: Option<String>,
}

impl ContainerState {
    pub fn matches(&self, desired: &str, reason: Option<&str>) -> bool {
        self.state == desired
            && reason.is_none_or(|wanted| self.reason.as_deref() == Some(wanted))
    }
}

/// First container state of the pod document (or first item of a list).
/// `None` when there is no pod yet or its containers have no status.
pub fn first_container_state(doc: &Value) -> Option<ContainerState> {
    let pod = match doc.get("items") {
        Some(items) => items.get(0)?,
        None => doc,
    };
    let state = pod
        .get("status")?
        .get("containerStatuses")?
        .get(0)?
        .get("state")?
        .as_mapping()?;
    let (key, details) = state.iter().next()?;
    Some(ContainerState {
        state: key.as_str()?.to_string(),
        reason: details
            .get("reason")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

impl Kubectl {
    /// Current state of the selected pod's first container. A failing
    /// `get` (pod not created yet) surfaces as a transient error.
    pub fn pod_state(&self, selector: &PodSelector) -> Result<Option<ContainerState>> {
        self.pod_state_within(selector, None)
    }

    fn pod_state_within(
        &self,
        selector: &PodSelector,
        window: Option<Duration>,
    ) -> Result<Option<ContainerState>> {
        let args = selector.args();
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let doc = self.get_yaml_within(&args, window)?;
        Ok(first_container_state(&doc))
    }

    /// Poll every [`POD_POLL_INTERVAL`] until the pod's first container is in
    /// `desired` (and `reason`, when given). Exhaustion is an error.
    pub fn wait_for_pod_state(
        &self,
        selector: &PodSelector,
        desired: &str,
        reason: Option<&str>,
        timeout: Duration,
    ) -> Result<ContainerState> {
        let what = format!("pod {selector} to be {desired}");
        let policy = PollPolicy::deadline(timeout, POD_POLL_INTERVAL);
        let state = self
            .poller(what.clone(), policy)
            .poll_within(|window| {
                Ok(match self.pod_state_within(selector, window)? {
                    Some(state) if state.matches(desired, reason) => Check::Ready(state),
                    _ => Check::Pending,
                })
            })?
            .into_result(what)?;
        info!(pod = %selector, state = %state.state, "pod ready");
        Ok(state)
    }

    pub fn wait_for_running(&self, selector: &PodSelector, timeout: Duration) -> Result<()> {
        self.wait_for_pod_state(selector, "running", None, timeout)
            .map(|_| ())
    }
}

/// Turn a pod wait failure into a validator failure that names the pod.
pub(crate) fn not_running(selector: &PodSelector, err: AddonError) -> AddonError {
    match err {
        AddonError::Exhausted { .. } => {
            AddonError::validation(format!("pod {selector} did not start: {err}"))
        }
        other => other,
    }
}
