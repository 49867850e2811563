//! Mayastor storage pools backed by block devices or sparse image files.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde_json::Value as JsonValue;
use serde_yaml::Value;
use tracing::{info, warn};

use crate::{
    command::CommandSpec,
    config::AddonsConfig,
    error::{AddonError, Result},
    kubectl::Kubectl,
    services::hostname,
};

pub const POOL_NAMESPACE: &str = "mayastor";

/// Image paths as seen from inside the io-engine container.
const CONTAINER_DATA_DIR: &str = "/data/";

const DEFAULT_TEMPLATE: &str = include_str!("../templates/mayastorpool-pool-template.yaml");

/// Copy of `template` describing a pool of `device` on `node`, named
/// `pool-{node}-{basename(device)}`.
pub fn format_pool(template: &Value, node: &str, device: &str) -> Result<Value> {
    let device_name = Path::new(device)
        .file_name()
        .map_or_else(|| device.to_string(), |name| name.to_string_lossy().into_owned());

    let mut pool = template.clone();
    let metadata = pool
        .get_mut("metadata")
        .and_then(Value::as_mapping_mut)
        .ok_or_else(|| AddonError::malformed("pool template", "metadata", "not a mapping"))?;
    metadata.insert("name".into(), format!("pool-{node}-{device_name}").into());

    let spec = pool
        .get_mut("spec")
        .and_then(Value::as_mapping_mut)
        .ok_or_else(|| AddonError::malformed("pool template", "spec", "not a mapping"))?;
    spec.insert("node".into(), node.into());
    spec.insert("disks".into(), Value::Sequence(vec![device.into()]));
    Ok(pool)
}

/// What `remove` did.
#[derive(Debug, Clone, PartialEq)]
pub struct RemovedPool {
    pub name: String,
    pub spec: JsonValue,
    pub purged: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct PoolManager {
    kubectl: Kubectl,
    template: Value,
    data_dir: PathBuf,
    sudo: Option<PathBuf>,
    local_node: String,
}

impl PoolManager {
    pub fn new(
        kubectl: Kubectl,
        template: Value,
        data_dir: impl Into<PathBuf>,
        sudo: Option<PathBuf>,
        local_node: impl Into<String>,
    ) -> Self {
        Self {
            kubectl,
            template,
            data_dir: data_dir.into(),
            sudo,
            local_node: local_node.into(),
        }
    }

    /// Template, data dir, sudo prefix and local node taken from `config`.
    pub fn from_config(kubectl: Kubectl, config: &AddonsConfig) -> Result<Self> {
        let template = match &config.pool_template {
            Some(path) => {
                let raw = fs::read_to_string(path).map_err(|source| AddonError::io(path, source))?;
                parse_template(&raw, &path.display().to_string())?
            }
            None => parse_template(DEFAULT_TEMPLATE, "embedded pool template")?,
        };
        let local_node = match &config.node_name {
            Some(node) => node.clone(),
            None => hostname()?,
        };
        Ok(Self::new(
            kubectl,
            template,
            config.mayastor_data_dir(),
            config.sudo.clone(),
            local_node,
        ))
    }

    fn apply_pool(&self, node: &str, device: &str) -> Result<String> {
        let pool = format_pool(&self.template, node, device)?;
        let manifest = serde_yaml::to_string(&pool)
            .map_err(|err| AddonError::malformed("pool template", "serialize", err))?;
        self.kubectl.apply_manifest(&manifest)?;
        let name = pool
            .get("metadata")
            .and_then(|meta| meta.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        info!(pool = %name, %node, %device, "pool applied");
        Ok(name)
    }

    /// Create one pool per device, then one sparse image file plus pool per
    /// size. Image files can only be created on the local node.
    pub fn add(
        &self,
        devices: &[String],
        sizes: &[String],
        node: Option<&str>,
    ) -> Result<Vec<String>> {
        let node = node.unwrap_or(&self.local_node);
        let mut created = devices
            .iter()
            .map(|device| self.apply_pool(node, device))
            .collect::<Result<Vec<_>>>()?;

        if sizes.is_empty() {
            return Ok(created);
        }
        if node != self.local_node {
            return Err(AddonError::RemoteNode { action: "Creating" });
        }

        let mut next = self.image_count()? + 1;
        for size in sizes {
            while self.data_dir.join(format!("{next}.img")).exists() {
                next += 1;
            }
            let host_path = self.data_dir.join(format!("{next}.img"));
            self.truncate(&host_path, size)?;
            created.push(self.apply_pool(node, &format!("{CONTAINER_DATA_DIR}{next}.img"))?);
            next += 1;
        }
        Ok(created)
    }

    fn image_count(&self) -> Result<usize> {
        let entries = match fs::read_dir(&self.data_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(AddonError::io(&self.data_dir, err)),
        };
        let mut count = 0;
        for entry in entries {
            let entry = entry.map_err(|err| AddonError::io(&self.data_dir, err))?;
            if entry.path().extension().is_some_and(|ext| ext == "img") {
                count += 1;
            }
        }
        Ok(count)
    }

    fn truncate(&self, path: &Path, size: &str) -> Result<()> {
        let args = [
            "truncate".to_string(),
            "-s".into(),
            size.into(),
            path.display().to_string(),
        ];
        let spec = match &self.sudo {
            Some(sudo) => CommandSpec::new(sudo.display().to_string()).args(args),
            None => CommandSpec::new("truncate").args(args.into_iter().skip(1)),
        };
        info!(path = %path.display(), %size, "creating image file");
        self.kubectl.runner().run(&spec)?.into_stdout(&spec)?;
        Ok(())
    }

    pub fn list(&self) -> Result<String> {
        self.kubectl.run(["get", "msp", "-n", POOL_NAMESPACE])
    }

    fn fetch(&self, pool: &str) -> Result<JsonValue> {
        match self.kubectl.get_json(&["get", "msp", "-n", POOL_NAMESPACE, pool]) {
            Err(AddonError::CommandFailed { .. }) => {
                Err(AddonError::PoolNotFound(pool.to_string()))
            }
            other => other,
        }
    }

    /// The stored `spec` of `pool`.
    pub fn describe(&self, pool: &str) -> Result<JsonValue> {
        let msp = self.fetch(pool)?;
        Ok(msp.get("spec").cloned().unwrap_or(JsonValue::Null))
    }

    /// Delete `pool`. Pools with used capacity are kept unless `force`.
    /// `purge` also removes the backing image files, local node only.
    pub fn remove(&self, pool: &str, force: bool, purge: bool) -> Result<RemovedPool> {
        let msp = self.fetch(pool)?;
        let pool_spec = msp.get("spec").cloned().unwrap_or(JsonValue::Null);
        info!(%pool, spec = %pool_spec, "found pool");

        let idle = msp
            .pointer("/status/used")
            .and_then(JsonValue::as_f64)
            .is_some_and(|used| used == 0.0);
        if !force && !idle {
            return Err(AddonError::PoolInUse(pool.to_string()));
        }

        self.kubectl
            .run(["delete", "msp", "-n", POOL_NAMESPACE, pool])?;
        info!(%pool, force, "pool deleted");

        let mut removed = RemovedPool {
            name: pool.to_string(),
            spec: pool_spec,
            purged: Vec::new(),
        };
        if !purge {
            return Ok(removed);
        }

        let node = removed.spec.get("node").and_then(JsonValue::as_str).unwrap_or_default();
        if node != self.local_node {
            return Err(AddonError::RemoteNode { action: "Purging" });
        }

        let disks = removed
            .spec
            .get("disks")
            .and_then(JsonValue::as_array)
            .cloned()
            .unwrap_or_default();
        for disk in disks.iter().filter_map(JsonValue::as_str) {
            let Some(image) = disk
                .strip_prefix(CONTAINER_DATA_DIR)
                .filter(|name| name.ends_with(".img"))
            else {
                continue;
            };
            let path = self.data_dir.join(image);
            info!(path = %path.display(), "removing image file");
            match fs::remove_file(&path) {
                Ok(()) => removed.purged.push(path),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    warn!(path = %path.display(), "image file already gone");
                }
                Err(err) => return Err(AddonError::io(path, err)),
            }
        }
        Ok(removed)
    }
}

fn parse_template(raw: &str, origin: &str) -> Result<Value> {
    serde_yaml::from_str(raw).map_err(|err| AddonError::malformed("yaml", origin, err))
}
