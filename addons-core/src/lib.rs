//! Addon helpers and live-cluster validation for a snap-packaged Kubernetes
//! distribution.
//!
//! Everything here shells out to the cluster CLI, the snap service manager
//! or the distribution CLI through a [`CommandRunner`], and synchronises
//! with eventually-consistent cluster state through [`ConditionPoller`].
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//!
//! use addons_core::{AddonsConfig, Kubectl, PollPolicy, SystemRunner};
//!
//! # fn main() -> addons_core::Result<()> {
//! let config = AddonsConfig::from_env();
//! let kubectl = Kubectl::new(Arc::new(SystemRunner), config.kubectl_path());
//! let outcome = kubectl.wait_for_output(
//!     &["get", "pvc"],
//!     "Bound",
//!     PollPolicy::attempts(50, Duration::from_secs(2)),
//! )?;
//! println!("bound: {}", outcome.is_ready());
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod config;
pub mod error;
pub mod http;
pub mod kubectl;
pub mod microk8s;
pub mod pods;
pub mod poll;
pub mod pools;
pub mod services;
pub mod suite;
pub mod validate;

#[cfg(test)]
mod testing;

pub use command::{BackgroundProcess, CommandOutput, CommandRunner, CommandSpec, SystemRunner};
pub use config::AddonsConfig;
pub use error::{AddonError, Result};
pub use http::{HttpProbe, HttpResponse};
pub use kubectl::Kubectl;
pub use microk8s::{AddonStatus, Dbctl, Microk8s};
pub use pods::{ContainerState, PodSelector};
pub use poll::{Check, Clock, ConditionPoller, PollOutcome, PollPolicy, SystemClock, poll_until};
pub use pools::PoolManager;
pub use services::{ServiceManager, ensure_root};
pub use suite::{Scenario, Suite, SuiteFlags, SuiteReport};
pub use validate::{Arch, ValidationContext, Validator, ValidatorOptions, Verdict};
