//! End-to-end scenarios: enable addons, validate them, disable them.
//!
//! Scenarios run in order on the calling thread and the cluster is reset
//! once all of them have run. Host architecture and [`SuiteFlags`] decide
//! which scenarios are skipped.

use std::{collections::BTreeMap, fmt, str::FromStr, time::Duration};

use tracing::{error, info, warn};

use crate::{
    config::parse_bool,
    error::{AddonError, Result},
    microk8s::DEFAULT_ADDON_TIMEOUT,
    pods::PodSelector,
    validate::{Arch, ValidationContext, Validator, ValidatorOptions, Verdict, manifests},
};

const SLOW_ADDON_TIMEOUT: Duration = Duration::from_secs(500);
const RESET_TIMEOUT: Duration = Duration::from_secs(600);
const DNS_SERVERS: &str = "8.8.8.8,1.1.1.1";
const METALLB_RANGES: &str =
    "192.168.0.105-192.168.0.105,192.168.0.110-192.168.0.111,192.168.1.240/28";

/// Environment switches of the suite.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SuiteFlags {
    /// Strictly confined snap; GPU support is expected to fail.
    pub strict: bool,
    pub under_time_pressure: bool,
    pub skip_observability: bool,
    pub skip_prometheus: bool,
    pub test_mayastor: bool,
}

impl SuiteFlags {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |key: &str| lookup(key).and_then(|v| parse_bool(&v)).unwrap_or(false);
        Self {
            strict: flag("STRICT"),
            under_time_pressure: flag("UNDER_TIME_PRESSURE"),
            skip_observability: flag("SKIP_OBSERVABILITY"),
            skip_prometheus: flag("SKIP_PROMETHEUS"),
            test_mayastor: flag("TEST_MAYASTOR"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scenario {
    InvalidAddon,
    HelpText,
    BasicS390x,
    Basic,
    Gpu,
    Observability,
    Rbac,
    Metallb,
    BackupRestore,
    Mayastor,
    CertManager,
}

impl Scenario {
    pub const ALL: [Scenario; 11] = [
        Scenario::InvalidAddon,
        Scenario::HelpText,
        Scenario::BasicS390x,
        Scenario::Basic,
        Scenario::Gpu,
        Scenario::Observability,
        Scenario::Rbac,
        Scenario::Metallb,
        Scenario::BackupRestore,
        Scenario::Mayastor,
        Scenario::CertManager,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Scenario::InvalidAddon => "invalid_addon",
            Scenario::HelpText => "help_text",
            Scenario::BasicS390x => "basic_s390x",
            Scenario::Basic => "basic",
            Scenario::Gpu => "gpu",
            Scenario::Observability => "observability",
            Scenario::Rbac => "rbac",
            Scenario::Metallb => "metallb",
            Scenario::BackupRestore => "backup_restore",
            Scenario::Mayastor => "mayastor",
            Scenario::CertManager => "cert_manager",
        }
    }

    /// Why this scenario does not run on `arch` with `flags`, if it doesn't.
    pub fn skip_reason(&self, flags: &SuiteFlags, arch: &Arch) -> Option<&'static str> {
        let x86 = arch.is_x86_64();
        match self {
            Scenario::BasicS390x if *arch != Arch::S390x => {
                Some("this test is for the limited set of addons s390x has")
            }
            Scenario::Basic if *arch == Arch::S390x => Some("not available on s390x"),
            Scenario::Gpu if flags.strict => {
                Some("GPU tests are expected to fail in strict confinement")
            }
            Scenario::Gpu if flags.under_time_pressure => Some("under time pressure"),
            Scenario::Gpu if !x86 => Some("GPU tests are only relevant in x86 architectures"),
            Scenario::Observability if !x86 => {
                Some("observability is only relevant in x86 architectures")
            }
            Scenario::Observability if flags.skip_observability || flags.skip_prometheus => {
                Some("observability skipped by environment")
            }
            Scenario::Metallb if !x86 => {
                Some("metallb tests are only relevant in x86 architectures")
            }
            Scenario::Metallb if flags.under_time_pressure => Some("under time pressure"),
            Scenario::Mayastor if !x86 => {
                Some("mayastor tests are only relevant in x86 architectures")
            }
            Scenario::Mayastor if flags.under_time_pressure => Some("under time pressure"),
            Scenario::Mayastor if !flags.test_mayastor => {
                Some("mayastor tests are skipped without TEST_MAYASTOR")
            }
            Scenario::CertManager if !x86 => {
                Some("cert-manager tests are not available on this architecture yet")
            }
            _ => None,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Scenario {
    type Err = AddonError;

    fn from_str(raw: &str) -> Result<Self> {
        let wanted = raw.trim().replace('-', "_");
        Scenario::ALL
            .into_iter()
            .find(|scenario| scenario.name() == wanted)
            .ok_or_else(|| AddonError::Config(format!("unknown scenario {raw:?}")))
    }
}

/// Outcome of one scenario.
#[derive(Debug)]
pub struct ScenarioResult {
    pub scenario: Scenario,
    pub outcome: Result<Verdict>,
}

#[derive(Debug, Default)]
pub struct SuiteReport {
    pub results: Vec<ScenarioResult>,
    /// Set when the final cluster reset failed.
    pub reset_error: Option<AddonError>,
}

impl SuiteReport {
    pub fn failures(&self) -> impl Iterator<Item = &ScenarioResult> {
        self.results.iter().filter(|result| result.outcome.is_err())
    }

    pub fn success(&self) -> bool {
        self.failures().next().is_none() && self.reset_error.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct Suite {
    ctx: ValidationContext,
    flags: SuiteFlags,
}

impl Suite {
    pub fn new(ctx: ValidationContext, flags: SuiteFlags) -> Self {
        Self { ctx, flags }
    }

    /// Run `scenarios` in order, then reset the cluster.
    pub fn run(&self, scenarios: &[Scenario]) -> SuiteReport {
        let mut report = SuiteReport::default();
        for &scenario in scenarios {
            let outcome = self.run_scenario(scenario);
            match &outcome {
                Ok(verdict) => info!(%scenario, %verdict, "scenario finished"),
                Err(err) => error!(%scenario, error = %err, "scenario failed"),
            }
            report.results.push(ScenarioResult { scenario, outcome });
        }
        if let Err(err) = self.ctx.microk8s.reset(RESET_TIMEOUT) {
            warn!(error = %err, "cluster reset failed");
            report.reset_error = Some(err);
        }
        report
    }

    pub fn run_scenario(&self, scenario: Scenario) -> Result<Verdict> {
        if let Some(reason) = scenario.skip_reason(&self.flags, &self.ctx.arch) {
            return Ok(Verdict::Skipped(reason.to_string()));
        }
        info!(%scenario, "running scenario");
        match scenario {
            Scenario::InvalidAddon => self.invalid_addon(),
            Scenario::HelpText => self.help_text(),
            Scenario::BasicS390x => self.basic_s390x(),
            Scenario::Basic => self.basic(),
            Scenario::Gpu => self.gpu(),
            Scenario::Observability => self.observability(),
            Scenario::Rbac => self.rbac(),
            Scenario::Metallb => self.metallb(),
            Scenario::BackupRestore => self.validate(Validator::BackupRestore),
            Scenario::Mayastor => self.mayastor(),
            Scenario::CertManager => self.cert_manager(),
        }
    }

    fn enable(&self, addon: &str) -> Result<()> {
        self.ctx.microk8s.enable(addon, &[], DEFAULT_ADDON_TIMEOUT).map(|_| ())
    }

    fn enable_for(&self, addon: &str, timeout: Duration) -> Result<()> {
        self.ctx.microk8s.enable(addon, &[], timeout).map(|_| ())
    }

    fn disable(&self, addon: &str) -> Result<()> {
        self.ctx.microk8s.disable(addon, &[], DEFAULT_ADDON_TIMEOUT).map(|_| ())
    }

    fn validate(&self, validator: Validator) -> Result<Verdict> {
        self.validate_with(validator, &ValidatorOptions::default())
    }

    fn validate_with(&self, validator: Validator, options: &ValidatorOptions) -> Result<Verdict> {
        self.ctx.run(validator, options)
    }

    fn dns_options() -> ValidatorOptions {
        ValidatorOptions {
            ip_ranges: Some(DNS_SERVERS.into()),
            ..Default::default()
        }
    }

    fn enable_dns(&self) -> Result<()> {
        self.enable_for(&format!("dns:{DNS_SERVERS}"), SLOW_ADDON_TIMEOUT)?;
        self.ctx
            .wait_running(&PodSelector::labelled("kube-system", "k8s-app=kube-dns"))?;
        self.validate_with(Validator::CorednsConfig, &Self::dns_options())?;
        Ok(())
    }

    fn invalid_addon(&self) -> Result<Verdict> {
        match self.ctx.microk8s.enable_expecting_failure("foo")? {
            Some(1) => Ok(Verdict::Passed),
            code => Err(AddonError::validation(format!(
                "enabling an unknown addon exited with {code:?}, expected 1"
            ))),
        }
    }

    fn addon_states(&self) -> Result<BTreeMap<String, String>> {
        Ok(self
            .ctx
            .microk8s
            .status()?
            .into_iter()
            .map(|addon| (addon.name, addon.status))
            .collect())
    }

    /// `--help` on every addon must leave every addon's state untouched.
    fn help_text(&self) -> Result<Verdict> {
        let states = self.addon_states()?;
        let expected: BTreeMap<String, String> = states
            .keys()
            .map(|name| {
                let state = if name == "ha-cluster" { "enabled" } else { "disabled" };
                (name.clone(), state.to_string())
            })
            .collect();
        let check = |stage: &str, states: BTreeMap<String, String>| {
            compare_states(&expected, &states, stage)
        };
        check("initially", states)?;

        for name in expected.keys() {
            self.ctx.microk8s.help(&["enable", name.as_str(), "--"])?;
        }
        check("after enable --help", self.addon_states()?)?;

        for name in expected.keys() {
            self.ctx.microk8s.help(&["disable", name.as_str(), "--"])?;
        }
        check("after disable --help", self.addon_states()?)?;
        Ok(Verdict::Passed)
    }

    fn basic_s390x(&self) -> Result<Verdict> {
        self.enable_dns()?;
        self.enable("metrics-server")?;
        self.enable("dashboard")?;
        self.validate(Validator::Dashboard)?;
        self.validate(Validator::Forward)?;
        self.validate(Validator::MetricsServer)?;
        self.disable("metrics-server")?;
        self.disable("dashboard")?;
        Ok(Verdict::Passed)
    }

    fn basic(&self) -> Result<Verdict> {
        self.enable_dns()?;
        self.enable("ingress")?;
        self.enable("metrics-server")?;
        self.validate(Validator::Ingress)?;
        self.disable("ingress")?;
        self.enable("dashboard")?;
        self.validate(Validator::Dashboard)?;
        self.enable("hostpath-storage")?;
        self.validate(Validator::Storage)?;
        self.enable("registry")?;
        self.validate(Validator::Registry)?;
        self.disable("registry")?;

        let size = "25Gi";
        let storage_class = "registry-test-sc";
        self.ctx.kubectl.apply_manifest(manifests::REGISTRY_SC.body())?;
        let size_arg = format!("--size={size}");
        let class_arg = format!("--storageclass={storage_class}");
        self.ctx.microk8s.enable(
            "registry",
            &[size_arg.as_str(), class_arg.as_str()],
            DEFAULT_ADDON_TIMEOUT,
        )?;
        self.validate_with(
            Validator::RegistryCustom,
            &ValidatorOptions {
                size: Some(size.into()),
                storage_class: Some(storage_class.into()),
                ..Default::default()
            },
        )?;
        self.disable("registry")?;
        self.ctx.kubectl.delete_manifest(manifests::REGISTRY_SC.body())?;

        self.validate(Validator::Forward)?;
        self.validate(Validator::MetricsServer)?;
        self.disable("metrics-server")?;
        self.disable("dashboard")?;
        // dns stays enabled: disabling it freezes terminating pods until reset
        self.disable("hostpath-storage:destroy-storage")?;
        Ok(Verdict::Passed)
    }

    fn gpu(&self) -> Result<Verdict> {
        if let Err(err) = self.enable("gpu") {
            warn!(error = %err, "could not enable GPU support");
            return Ok(Verdict::Skipped("could not enable GPU support".into()));
        }
        let verdict = self.validate(Validator::Gpu)?;
        self.disable("gpu")?;
        Ok(verdict)
    }

    fn observability(&self) -> Result<Verdict> {
        self.enable("observability")?;
        self.validate(Validator::Observability)?;
        self.disable("observability")?;
        self.ctx.microk8s.reset(RESET_TIMEOUT)?;
        Ok(Verdict::Passed)
    }

    fn rbac(&self) -> Result<Verdict> {
        self.enable("rbac")?;
        self.validate(Validator::Rbac)?;
        self.disable("rbac")?;
        Ok(Verdict::Passed)
    }

    fn metallb(&self) -> Result<Verdict> {
        self.enable_for(&format!("metallb:{METALLB_RANGES}"), SLOW_ADDON_TIMEOUT)?;
        self.validate_with(
            Validator::MetallbConfig,
            &ValidatorOptions {
                ip_ranges: Some(METALLB_RANGES.into()),
                ..Default::default()
            },
        )?;
        self.disable("metallb")?;
        Ok(Verdict::Passed)
    }

    fn mayastor(&self) -> Result<Verdict> {
        self.enable_for("mayastor", SLOW_ADDON_TIMEOUT)?;
        self.validate(Validator::Mayastor)?;
        self.disable("mayastor")?;
        Ok(Verdict::Passed)
    }

    fn cert_manager(&self) -> Result<Verdict> {
        for addon in ["dns", "ingress", "cert-manager", "host-access:ip=100.100.100.100"] {
            self.enable(addon)?;
        }
        self.validate(Validator::CertManager)?;
        for addon in ["ingress", "cert-manager", "host-access"] {
            self.disable(addon)?;
        }
        Ok(Verdict::Passed)
    }
}

fn compare_states(
    expected: &BTreeMap<String, String>,
    actual: &BTreeMap<String, String>,
    stage: &str,
) -> Result<()> {
    if expected == actual {
        return Ok(());
    }
    let changed: Vec<String> = actual
        .iter()
        .filter(|(name, state)| expected.get(*name) != Some(*state))
        .map(|(name, state)| format!("{name}={state}"))
        .collect();
    Err(AddonError::validation(format!(
        "addon states differ {stage}: {}",
        changed.join(", ")
    )))
}
