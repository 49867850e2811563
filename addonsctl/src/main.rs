//! `addonsctl`: mayastor pool helpers, cluster service control, condition
//! waits and addon validation for microk8s.

use std::{path::PathBuf, process::ExitCode, time::Duration};

use addons_core::{AddonError, Scenario, Validator};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[derive(Parser)]
#[command(
    name = "addonsctl",
    version,
    about = "Addon helpers and cluster validation for microk8s"
)]
struct Cli {
    /// TOML file overriding binary paths and data directories
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage mayastor storage pools
    Pools {
        #[command(subcommand)]
        action: PoolsAction,
    },
    /// Stop or start the cluster daemons (requires root)
    Services {
        #[command(subcommand)]
        action: ServicesAction,
    },
    /// Block until a cluster condition holds
    Wait {
        #[command(subcommand)]
        target: WaitTarget,
    },
    /// Run a single addon validator against the live cluster
    Validate {
        /// Validator name, e.g. dashboard, storage, coredns_config
        validator: Validator,
        /// Comma-separated IP ranges (metallb_config) or DNS servers (coredns_config)
        #[arg(long)]
        ip_ranges: Option<String>,
        /// Expected registry claim size (registry_custom)
        #[arg(long)]
        size: Option<String>,
        /// Expected registry storage class (registry_custom)
        #[arg(long)]
        storage_class: Option<String>,
    },
    /// Run end-to-end scenarios, then reset the cluster
    Suite {
        /// Scenarios to run; all of them when omitted
        scenarios: Vec<Scenario>,
    },
    /// Show addon status
    Status,
}

#[derive(Subcommand)]
enum PoolsAction {
    /// Create pools from block devices or new image files
    Add {
        /// Block device to back a pool (repeatable)
        #[arg(long = "device")]
        devices: Vec<String>,
        /// Size of an image file to create and back a pool with (repeatable)
        #[arg(long = "size")]
        sizes: Vec<String>,
        /// Node to create the pools on; defaults to this host
        #[arg(long)]
        node: Option<String>,
    },
    /// List pools
    List,
    /// Remove a pool
    Remove {
        pool: String,
        /// Remove even if the pool has used capacity
        #[arg(long)]
        force: bool,
        /// Also delete backing image files
        #[arg(long)]
        purge: bool,
    },
}

#[derive(Subcommand)]
enum ServicesAction {
    /// Stop kubelite and the datastore
    Stop,
    /// Start the datastore and kubelite
    Start,
}

#[derive(Subcommand)]
enum WaitTarget {
    /// Wait for a pod's first container to reach a state
    Pod {
        #[arg(long, short = 'n', default_value = "default")]
        namespace: String,
        #[arg(long)]
        name: Option<String>,
        /// Label selector, e.g. k8s-app=kube-dns
        #[arg(long, short = 'l')]
        label: Option<String>,
        #[arg(long, default_value = "running")]
        state: String,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long, default_value = "600s", value_parser = humantime::parse_duration)]
        timeout: Duration,
    },
    /// Re-run a kubectl command until its output contains some text
    Output {
        #[arg(long)]
        contains: String,
        #[command(flatten)]
        budget: commands::Budget,
        /// kubectl arguments, after `--`
        #[arg(last = true, required = true)]
        args: Vec<String>,
    },
    /// Poll a URL until it answers with the expected status
    Http {
        url: String,
        #[arg(long, default_value_t = 200)]
        status: u16,
        #[arg(long)]
        contains: Option<String>,
        #[command(flatten)]
        budget: commands::Budget,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match commands::run(cli) {
        Ok(code) => code,
        Err(err) => report(&err),
    }
}

/// Exit status callers of the addon scripts rely on: 4 for service manager
/// failures, 1 for everything else.
fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<AddonError>() {
        Some(AddonError::Service { .. }) => 4,
        _ => 1,
    }
}

fn report(err: &anyhow::Error) -> ExitCode {
    match err.downcast_ref::<AddonError>() {
        Some(AddonError::NeedsRoot) => {
            eprintln!("Elevated permissions are needed for this addon.");
            eprintln!("Please try again, this time using 'sudo'.");
        }
        Some(AddonError::PoolNotFound(_)) => println!("Nothing to do"),
        _ => eprintln!("ERROR: {err:#}"),
    }
    ExitCode::from(exit_code(err))
}
