//! Starting and stopping the distribution's daemons through the snap
//! service manager.

use std::{ffi::CStr, path::PathBuf, sync::Arc};

use tracing::{error, info};

use crate::{
    command::{CommandRunner, CommandSpec},
    error::{AddonError, Result},
};

/// Daemons restarted around configuration changes, in stop order.
pub const CLUSTER_SERVICES: [&str; 2] = ["microk8s.daemon-kubelite", "microk8s.daemon-k8s-dqlite"];

#[derive(Debug, Clone)]
pub struct ServiceManager {
    runner: Arc<dyn CommandRunner>,
    snapctl: PathBuf,
}

impl ServiceManager {
    pub fn new(runner: Arc<dyn CommandRunner>, snapctl: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            snapctl: snapctl.into(),
        }
    }

    pub fn start(&self, service: &str) -> Result<()> {
        self.control("start", service)
    }

    pub fn stop(&self, service: &str) -> Result<()> {
        self.control("stop", service)
    }

    fn control(&self, action: &'static str, service: &str) -> Result<()> {
        let spec = CommandSpec::new(self.snapctl.display().to_string()).args([action, service]);
        info!(%service, action, "service control");
        self.runner
            .run(&spec)
            .and_then(|output| output.into_stdout(&spec))
            .map(|_| ())
            .map_err(|source| {
                error!(%service, action, error = %source, "service control failed");
                AddonError::Service {
                    action,
                    service: service.to_string(),
                    source: Box::new(source),
                }
            })
    }

    /// Stop kubelite, then the datastore.
    pub fn stop_cluster_services(&self) -> Result<()> {
        CLUSTER_SERVICES
            .iter()
            .try_for_each(|service| self.stop(service))
    }

    /// Start the datastore, then kubelite.
    pub fn start_cluster_services(&self) -> Result<()> {
        CLUSTER_SERVICES
            .iter()
            .rev()
            .try_for_each(|service| self.start(service))
    }
}

/// Fails with [`AddonError::NeedsRoot`] unless running as uid 0.
pub fn ensure_root() -> Result<()> {
    // SAFETY: geteuid has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };
    if euid == 0 {
        Ok(())
    } else {
        Err(AddonError::NeedsRoot)
    }
}

/// Host name as reported by the kernel.
pub fn hostname() -> Result<String> {
    let mut buf = [0u8; 256];
    // SAFETY: the pointer and length describe `buf`, which outlives the call.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return Err(AddonError::io("gethostname", std::io::Error::last_os_error()));
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}

/// Hardware name of the running kernel, as `uname -m` prints it.
pub fn machine() -> Result<String> {
    // SAFETY: `utsname` is plain data; all zeroes is a valid value.
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    // SAFETY: `uts` is a live, writable `utsname`.
    let rc = unsafe { libc::uname(&mut uts) };
    if rc != 0 {
        return Err(AddonError::io("uname", std::io::Error::last_os_error()));
    }
    // SAFETY: the kernel NUL-terminates every `utsname` field.
    let machine = unsafe { CStr::from_ptr(uts.machine.as_ptr()) };
    Ok(machine.to_string_lossy().into_owned())
}
