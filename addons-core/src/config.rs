//! Paths of the external binaries and data directories the helpers work
//! with.
//!
//! Defaults follow the snap layout (`$SNAP`, `$SNAP_COMMON`). An optional
//! TOML file overrides the defaults, and `ADDONS_*` environment variables
//! override the file.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AddonError, Result};

const DEFAULT_SNAP: &str = "/snap/microk8s/current";
const DEFAULT_SNAP_COMMON: &str = "/var/snap/microk8s/common";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AddonsConfig {
    pub snap: PathBuf,
    pub snap_common: PathBuf,
    /// Cluster CLI. Falls back to the snap's kubectl wrapper.
    pub kubectl: Option<PathBuf>,
    pub microk8s: PathBuf,
    pub dbctl: PathBuf,
    pub snapctl: PathBuf,
    pub docker: PathBuf,
    /// Prefix for commands that need root (image file creation). `None`
    /// runs them directly.
    pub sudo: Option<PathBuf>,
    pub pool_template: Option<PathBuf>,
    /// Local node name. Falls back to the host name.
    pub node_name: Option<String>,
}

impl Default for AddonsConfig {
    fn default() -> Self {
        Self {
            snap: PathBuf::from(DEFAULT_SNAP),
            snap_common: PathBuf::from(DEFAULT_SNAP_COMMON),
            kubectl: None,
            microk8s: PathBuf::from("/snap/bin/microk8s"),
            dbctl: PathBuf::from("/snap/bin/microk8s.dbctl"),
            snapctl: PathBuf::from("snapctl"),
            docker: PathBuf::from("docker"),
            sudo: Some(PathBuf::from("sudo")),
            pool_template: None,
            node_name: None,
        }
    }
}

impl AddonsConfig {
    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Self {
        Self::default().with_env(|key| std::env::var(key).ok())
    }

    /// Optional TOML file, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let base = match path {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .map_err(|source| AddonError::io(path, source))?;
                Self::from_toml_str(&raw, &path.display().to_string())?
            }
            None => Self::default(),
        };
        Ok(base.with_env(|key| std::env::var(key).ok()))
    }

    pub fn from_toml_str(raw: &str, origin: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|err| AddonError::malformed("toml", origin, err))
    }

    /// Apply overrides from `lookup`; empty values are ignored.
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = var("SNAP") {
            self.snap = v.into();
        }
        if let Some(v) = var("SNAP_COMMON") {
            self.snap_common = v.into();
        }
        if let Some(v) = var("ADDONS_KUBECTL") {
            self.kubectl = Some(v.into());
        }
        if let Some(v) = var("ADDONS_MICROK8S") {
            self.microk8s = v.into();
        }
        if let Some(v) = var("ADDONS_DBCTL") {
            self.dbctl = v.into();
        }
        if let Some(v) = var("ADDONS_SNAPCTL") {
            self.snapctl = v.into();
        }
        if let Some(v) = var("ADDONS_DOCKER") {
            self.docker = v.into();
        }
        if let Some(v) = var("ADDONS_SUDO") {
            self.sudo = match parse_bool(&v) {
                Some(false) => None,
                Some(true) => Some(PathBuf::from("sudo")),
                None => Some(v.into()),
            };
        }
        if let Some(v) = var("ADDONS_POOL_TEMPLATE") {
            self.pool_template = Some(v.into());
        }
        if let Some(v) = var("ADDONS_NODE_NAME") {
            self.node_name = Some(v);
        }
        self
    }

    /// The configured kubectl, else the snap wrapper when present, else
    /// whatever `kubectl` is on `PATH`.
    pub fn kubectl_path(&self) -> PathBuf {
        if let Some(path) = &self.kubectl {
            return path.clone();
        }
        let wrapper = self.snap.join("microk8s-kubectl.wrapper");
        if wrapper.exists() {
            return wrapper;
        }
        match which::which("kubectl") {
            Ok(found) => {
                debug!(path = %found.display(), "using kubectl from PATH");
                found
            }
            Err(_) => wrapper,
        }
    }

    pub fn mayastor_data_dir(&self) -> PathBuf {
        self.snap_common.join("mayastor").join("data")
    }

    pub fn default_storage_dir(&self) -> PathBuf {
        self.snap_common.join("default-storage")
    }
}

/// Parse a boolean value from a raw string, accepting common env-style forms.
///
/// Accepted truthy values (case-insensitive): `"1"`, `"true"`, `"yes"`, `"on"`.
/// Accepted falsy values: `"0"`, `"false"`, `"no"`, `"off"`.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn snap_env_moves_data_dirs() {
        let cfg = AddonsConfig::default().with_env(lookup(&[
            ("SNAP", "/snap/microk8s/1234"),
            ("SNAP_COMMON", "/tmp/common"),
        ]));
        assert_eq!(cfg.snap, PathBuf::from("/snap/microk8s/1234"));
        assert_eq!(
            cfg.mayastor_data_dir(),
            PathBuf::from("/tmp/common/mayastor/data")
        );
        assert_eq!(
            cfg.default_storage_dir(),
            PathBuf::from("/tmp/common/default-storage")
        );
    }

    #[test]
    fn configured_kubectl_wins() {
        let cfg = AddonsConfig::default()
            .with_env(lookup(&[("ADDONS_KUBECTL", "/opt/bin/kubectl")]));
        assert_eq!(cfg.kubectl_path(), PathBuf::from("/opt/bin/kubectl"));
    }

    #[test]
    fn blank_env_values_are_ignored() {
        let cfg = AddonsConfig::default()
            .with_env(lookup(&[("SNAP_COMMON", "  "), ("ADDONS_NODE_NAME", "")]));
        assert_eq!(cfg, AddonsConfig::default());
    }

    #[test]
    fn sudo_can_be_disabled() {
        let cfg = AddonsConfig::default().with_env(lookup(&[("ADDONS_SUDO", "off")]));
        assert_eq!(cfg.sudo, None);
        let cfg = AddonsConfig::default()
            .with_env(lookup(&[("ADDONS_SUDO", "/usr/bin/doas")]));
        assert_eq!(cfg.sudo, Some(PathBuf::from("/usr/bin/doas")));
    }

    #[test]
    fn toml_overrides_defaults() {
        let cfg = AddonsConfig::from_toml_str(
            r#"
snap_common = "/data/common"
kubectl = "/usr/local/bin/kubectl"
node_name = "worker-1"
"#,
            "test.toml",
        )
        .unwrap();
        assert_eq!(cfg.snap_common, PathBuf::from("/data/common"));
        assert_eq!(cfg.node_name.as_deref(), Some("worker-1"));
        assert_eq!(cfg.snap, PathBuf::from(DEFAULT_SNAP));
    }

    #[test]
    fn unknown_toml_keys_are_malformed() {
        let err = AddonsConfig::from_toml_str("kubeclt = \"x\"", "test.toml")
            .unwrap_err();
        assert!(matches!(err, AddonError::Malformed { format: "toml", .. }));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("addons.toml");
        fs::write(&path, "docker = \"/usr/bin/podman\"\n").unwrap();
        let cfg = AddonsConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.docker, PathBuf::from("/usr/bin/podman"));
    }

    #[test]
    fn parse_bool_accepts_env_forms() {
        assert_eq!(parse_bool("True"), Some(true));
        assert_eq!(parse_bool("yes"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
