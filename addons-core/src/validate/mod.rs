//! Addon validators run against a live cluster.
//!
//! Each validator waits for the addon's workloads, exercises the feature
//! (apply a manifest, hit an endpoint, read a configmap) and cleans up what
//! it created. A validator either passes, is skipped on hosts where the
//! addon is not supported, or fails with [`AddonError::Validation`] (or the
//! underlying error when the cluster could not be queried).

mod cluster;
pub mod manifests;
mod workloads;

use std::{
    fmt,
    path::PathBuf,
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use tracing::{info, warn};

use crate::{
    command::CommandRunner,
    config::AddonsConfig,
    error::{AddonError, Result},
    http::HttpProbe,
    kubectl::Kubectl,
    microk8s::{Dbctl, Microk8s},
    pods::{DEFAULT_POD_TIMEOUT, PodSelector, not_running},
    poll::Clock,
    services::machine,
};

/// Where the ingress test workload answers from this host.
pub const INGRESS_URL: &str = "http://microbot.127.0.0.1.nip.io/";
/// Local end of the port-forward exercised by the forward validator.
pub const FORWARD_PORT: u16 = 5123;

/// Host architecture, as it matters for image names and addon support.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arch {
    Amd64,
    Arm64,
    S390x,
    Other(String),
}

impl Arch {
    /// Architecture of the running kernel. Falls back to the architecture
    /// this binary was built for when `uname` fails.
    pub fn host() -> Self {
        match machine() {
            Ok(machine) => Self::from_machine(&machine),
            Err(err) => {
                warn!(error = %err, "uname failed, using build architecture");
                Self::from_machine(std::env::consts::ARCH)
            }
        }
    }

    /// Map a machine name (`uname -m` style) to an architecture.
    pub fn from_machine(machine: &str) -> Self {
        match machine {
            "x86_64" | "amd64" => Arch::Amd64,
            "aarch64" | "arm64" => Arch::Arm64,
            "s390x" => Arch::S390x,
            other => Arch::Other(other.to_string()),
        }
    }

    pub fn is_x86_64(&self) -> bool {
        matches!(self, Arch::Amd64)
    }

    /// Suffix used by multi-arch image names.
    pub fn image_suffix(&self) -> &str {
        match self {
            Arch::Amd64 => "amd64",
            Arch::Arm64 => "arm64",
            Arch::S390x => "s390x",
            Arch::Other(other) => other.as_str(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Passed,
    Skipped(String),
}

impl Verdict {
    pub(crate) fn x86_only(arch: &Arch, what: &str) -> Option<Self> {
        (!arch.is_x86_64()).then(|| {
            Verdict::Skipped(format!(
                "{what} tests are only relevant in x86 architectures"
            ))
        })
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Passed => write!(f, "passed"),
            Verdict::Skipped(reason) => write!(f, "skipped ({reason})"),
        }
    }
}

/// Per-run parameters of the validators that take them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidatorOptions {
    /// Comma-separated ranges or upstream servers.
    pub ip_ranges: Option<String>,
    pub size: Option<String>,
    pub storage_class: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Validator {
    Dashboard,
    Storage,
    Ingress,
    Gpu,
    Registry,
    RegistryCustom,
    Forward,
    MetricsServer,
    Prometheus,
    Observability,
    Rbac,
    MetallbConfig,
    CorednsConfig,
    Mayastor,
    CertManager,
    BackupRestore,
}

impl Validator {
    pub const ALL: [Validator; 16] = [
        Validator::Dashboard,
        Validator::Storage,
        Validator::Ingress,
        Validator::Gpu,
        Validator::Registry,
        Validator::RegistryCustom,
        Validator::Forward,
        Validator::MetricsServer,
        Validator::Prometheus,
        Validator::Observability,
        Validator::Rbac,
        Validator::MetallbConfig,
        Validator::CorednsConfig,
        Validator::Mayastor,
        Validator::CertManager,
        Validator::BackupRestore,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Validator::Dashboard => "dashboard",
            Validator::Storage => "storage",
            Validator::Ingress => "ingress",
            Validator::Gpu => "gpu",
            Validator::Registry => "registry",
            Validator::RegistryCustom => "registry_custom",
            Validator::Forward => "forward",
            Validator::MetricsServer => "metrics_server",
            Validator::Prometheus => "prometheus",
            Validator::Observability => "observability",
            Validator::Rbac => "rbac",
            Validator::MetallbConfig => "metallb_config",
            Validator::CorednsConfig => "coredns_config",
            Validator::Mayastor => "mayastor",
            Validator::CertManager => "cert_manager",
            Validator::BackupRestore => "backup_restore",
        }
    }
}

impl fmt::Display for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Validator {
    type Err = AddonError;

    fn from_str(raw: &str) -> Result<Self> {
        let wanted = raw.trim().replace('-', "_");
        Validator::ALL
            .into_iter()
            .find(|validator| validator.name() == wanted)
            .ok_or_else(|| AddonError::Config(format!("unknown validator {raw:?}")))
    }
}

/// Collaborators shared by the validators.
#[derive(Debug, Clone)]
pub struct ValidationContext {
    pub kubectl: Kubectl,
    pub microk8s: Microk8s,
    pub dbctl: Dbctl,
    pub http: HttpProbe,
    pub docker: PathBuf,
    /// Host directory backing the hostpath storage class.
    pub storage_dir: PathBuf,
    /// Where backup archives are written.
    pub work_dir: PathBuf,
    pub arch: Arch,
    pub pod_timeout: Duration,
    /// Base URL of the ingress test workload.
    pub ingress_url: String,
    pub forward_port: u16,
}

impl ValidationContext {
    pub fn from_config(config: &AddonsConfig, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        Ok(Self {
            kubectl: Kubectl::new(runner.clone(), config.kubectl_path()),
            microk8s: Microk8s::new(runner.clone(), &config.microk8s),
            dbctl: Dbctl::new(runner, &config.dbctl),
            http: HttpProbe::new(Duration::from_secs(10))?,
            docker: config.docker.clone(),
            storage_dir: config.default_storage_dir(),
            work_dir: std::env::temp_dir(),
            arch: Arch::host(),
            pod_timeout: DEFAULT_POD_TIMEOUT,
            ingress_url: INGRESS_URL.to_string(),
            forward_port: FORWARD_PORT,
        })
    }

    /// Route every poll loop through `clock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.kubectl = self.kubectl.with_clock(clock.clone());
        self.microk8s = self.microk8s.with_clock(clock);
        self
    }

    pub fn run(&self, validator: Validator, options: &ValidatorOptions) -> Result<Verdict> {
        info!(%validator, "validating");
        let verdict = match validator {
            Validator::Dashboard => workloads::dashboard(self),
            Validator::Storage => workloads::storage(self),
            Validator::Ingress => workloads::ingress(self),
            Validator::Gpu => workloads::gpu(self),
            Validator::Registry => workloads::registry(self),
            Validator::RegistryCustom => workloads::registry_custom(
                self,
                options.size.as_deref().unwrap_or(workloads::CUSTOM_REGISTRY_SIZE),
                options
                    .storage_class
                    .as_deref()
                    .unwrap_or(workloads::CUSTOM_REGISTRY_CLASS),
            ),
            Validator::Forward => workloads::forward(self),
            Validator::MetricsServer => workloads::metrics_server(self),
            Validator::Mayastor => workloads::mayastor(self),
            Validator::Prometheus => cluster::prometheus(self),
            Validator::Observability => cluster::observability(self),
            Validator::Rbac => cluster::rbac(self),
            Validator::MetallbConfig => cluster::metallb_config(
                self,
                options.ip_ranges.as_deref().unwrap_or(cluster::DEFAULT_METALLB_RANGES),
            ),
            Validator::CorednsConfig => cluster::coredns_config(
                self,
                options.ip_ranges.as_deref().unwrap_or(cluster::DEFAULT_DNS_SERVERS),
            ),
            Validator::CertManager => cluster::cert_manager(self),
            Validator::BackupRestore => cluster::backup_restore(self),
        }?;
        info!(%validator, %verdict, "validator finished");
        Ok(verdict)
    }

    /// Wait for the selected pod to be running within `pod_timeout`.
    pub fn wait_running(&self, selector: &PodSelector) -> Result<()> {
        self.wait_running_for(selector, self.pod_timeout)
    }

    pub fn wait_running_for(&self, selector: &PodSelector, timeout: Duration) -> Result<()> {
        self.kubectl
            .wait_for_running(selector, timeout)
            .map_err(|err| not_running(selector, err))
    }
}

/// `Validation` error unless `condition` holds.
pub(crate) fn ensure(condition: bool, msg: impl FnOnce() -> String) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(AddonError::validation(msg()))
    }
}
