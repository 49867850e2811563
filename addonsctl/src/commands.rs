//! Subcommand handlers.

use std::{process::ExitCode, sync::Arc, time::Duration};

use addons_core::{
    AddonsConfig, CommandRunner, ConditionPoller, HttpProbe, Kubectl, Microk8s, PodSelector,
    PollOutcome, PollPolicy, PoolManager, Scenario, ServiceManager, Suite, SuiteFlags,
    SystemRunner, ValidationContext, ValidatorOptions, ensure_root,
};
use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use crate::{Cli, Command, PoolsAction, ServicesAction, WaitTarget};

/// Attempts used when neither `--attempts` nor `--timeout` is given.
const DEFAULT_ATTEMPTS: u32 = 30;

/// Poll budget flags shared by the `wait` subcommands.
#[derive(Debug, Args)]
pub(crate) struct Budget {
    /// Retries after the first attempt (default 30 when no timeout is set)
    #[arg(long)]
    attempts: Option<u32>,
    /// Pause between attempts [default: 2s for output, 5s for http]
    #[arg(long, value_parser = humantime::parse_duration)]
    interval: Option<Duration>,
    /// Give up after this long, e.g. 90s or 5m
    #[arg(long, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,
}

impl Budget {
    fn policy(&self, default_interval: Duration) -> PollPolicy {
        let max_attempts = match (self.attempts, self.timeout) {
            (None, None) => Some(DEFAULT_ATTEMPTS),
            (attempts, _) => attempts,
        };
        PollPolicy {
            max_attempts,
            interval: self.interval.unwrap_or(default_interval),
            timeout: self.timeout,
        }
    }
}

pub(crate) fn run(cli: Cli) -> Result<ExitCode> {
    let config =
        AddonsConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);

    match cli.command {
        Command::Pools { action } => pools(&config, runner, action),
        Command::Services { action } => services(&config, runner, action),
        Command::Wait { target } => wait(&config, runner, target),
        Command::Validate {
            validator,
            ip_ranges,
            size,
            storage_class,
        } => {
            let ctx = ValidationContext::from_config(&config, runner)?;
            let options = ValidatorOptions {
                ip_ranges,
                size,
                storage_class,
            };
            let verdict = ctx.run(validator, &options)?;
            println!("{validator}: {verdict}");
            Ok(ExitCode::SUCCESS)
        }
        Command::Suite { scenarios } => suite(&config, runner, scenarios),
        Command::Status => {
            let addons = Microk8s::new(runner, &config.microk8s).status()?;
            let width = addons.iter().map(|a| a.name.len()).max().unwrap_or(0);
            for addon in addons {
                println!("{:width$}  {}", addon.name, addon.status);
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn pools(
    config: &AddonsConfig,
    runner: Arc<dyn CommandRunner>,
    action: PoolsAction,
) -> Result<ExitCode> {
    let kubectl = Kubectl::new(runner, config.kubectl_path());
    let manager = PoolManager::from_config(kubectl, config)?;
    match action {
        PoolsAction::Add {
            devices,
            sizes,
            node,
        } => {
            for name in manager.add(&devices, &sizes, node.as_deref())? {
                println!("{name}");
            }
        }
        PoolsAction::List => print!("{}", manager.list()?),
        PoolsAction::Remove { pool, force, purge } => {
            // Shown before the in-use check so a refusal still names the pool.
            println!("{}", manager.describe(&pool)?);
            let removed = manager.remove(&pool, force, purge)?;
            for path in removed.purged {
                println!("Removed {}", path.display());
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn services(
    config: &AddonsConfig,
    runner: Arc<dyn CommandRunner>,
    action: ServicesAction,
) -> Result<ExitCode> {
    ensure_root()?;
    let manager = ServiceManager::new(runner, &config.snapctl);
    match action {
        ServicesAction::Stop => {
            println!("Stopping services");
            manager.stop_cluster_services()?;
        }
        ServicesAction::Start => {
            println!("Starting services");
            manager.start_cluster_services()?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Print the ready value, or why the loop gave up.
fn finish<T>(what: &str, outcome: PollOutcome<T>, show: impl FnOnce(T)) -> ExitCode {
    match outcome {
        PollOutcome::Ready {
            value,
            attempts,
            elapsed,
        } => {
            info!(%what, attempts, ?elapsed, "condition met");
            show(value);
            ExitCode::SUCCESS
        }
        PollOutcome::Exhausted {
            attempts,
            elapsed,
            last_error,
        } => {
            eprintln!(
                "ERROR: gave up waiting for {what} after {attempts} attempts ({})",
                humantime::format_duration(elapsed)
            );
            if let Some(err) = last_error {
                eprintln!("last error: {err}");
            }
            ExitCode::from(1)
        }
    }
}

fn wait(
    config: &AddonsConfig,
    runner: Arc<dyn CommandRunner>,
    target: WaitTarget,
) -> Result<ExitCode> {
    match target {
        WaitTarget::Pod {
            namespace,
            name,
            label,
            state,
            reason,
            timeout,
        } => {
            let kubectl = Kubectl::new(runner, config.kubectl_path());
            let selector = PodSelector {
                namespace,
                name,
                label,
            };
            let reached =
                kubectl.wait_for_pod_state(&selector, &state, reason.as_deref(), timeout)?;
            match reached.reason {
                Some(reason) => println!("{selector} {} ({reason})", reached.state),
                None => println!("{selector} {}", reached.state),
            }
            Ok(ExitCode::SUCCESS)
        }
        WaitTarget::Output {
            contains,
            budget,
            args,
        } => {
            let kubectl = Kubectl::new(runner, config.kubectl_path());
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            let outcome = kubectl.wait_for_output(
                &args,
                &contains,
                budget.policy(Duration::from_secs(2)),
            )?;
            let what = format!("`{}` to contain {contains:?}", args.join(" "));
            Ok(finish(&what, outcome, |stdout| print!("{stdout}")))
        }
        WaitTarget::Http {
            url,
            status,
            contains,
            budget,
        } => {
            let probe = HttpProbe::new(Duration::from_secs(10))?;
            let outcome = ConditionPoller::new(url.clone(), budget.policy(Duration::from_secs(5)))
                .poll(|| probe.check(&url, status, contains.as_deref()))?;
            let what = format!("{url} to answer {status}");
            Ok(finish(&what, outcome, |response| {
                println!("{url} answered {}", response.status);
            }))
        }
    }
}

fn suite(
    config: &AddonsConfig,
    runner: Arc<dyn CommandRunner>,
    scenarios: Vec<Scenario>,
) -> Result<ExitCode> {
    let scenarios = if scenarios.is_empty() {
        Scenario::ALL.to_vec()
    } else {
        scenarios
    };
    let ctx = ValidationContext::from_config(config, runner)?;
    let report = Suite::new(ctx, SuiteFlags::from_env()).run(&scenarios);

    for result in &report.results {
        match &result.outcome {
            Ok(verdict) => println!("{:<16} {verdict}", result.scenario.name()),
            Err(err) => println!("{:<16} FAILED: {err}", result.scenario.name()),
        }
    }
    if let Some(err) = &report.reset_error {
        eprintln!("ERROR: cluster reset failed: {err}");
    }
    Ok(if report.success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}
