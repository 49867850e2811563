use std::{path::PathBuf, time::Duration};

use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T, E = AddonError> = std::result::Result<T, E>;

/// Every failure the addon helpers and validators can report.
///
/// Variants are split by how a poll loop must treat them: see
/// [`AddonError::is_transient`].
#[derive(Debug, Error)]
pub enum AddonError {
    #[error("failed to run {program}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` exited with {}: {}", exit_label(.code), .stderr.trim())]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    #[error("`{command}` did not finish within {limit:?}")]
    TimedOut { command: String, limit: Duration },
    #[error("malformed {format} from {context}: {reason}")]
    Malformed {
        format: &'static str,
        context: String,
        reason: String,
    },
    #[error("gave up waiting for {what} after {attempts} attempts ({elapsed:?})")]
    Exhausted {
        what: String,
        attempts: u32,
        elapsed: Duration,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("i/o error on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("request to {url} failed")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("elevated permissions are needed for this addon")]
    NeedsRoot,
    #[error("failed to {action} service {service}")]
    Service {
        action: &'static str,
        service: String,
        #[source]
        source: Box<AddonError>,
    },
    #[error("pool {0} not found")]
    PoolNotFound(String),
    #[error("pool {0} is in use, use --force to remove")]
    PoolInUse(String),
    #[error("{action} mayastor pools in other nodes is not supported yet")]
    RemoteNode { action: &'static str },
    #[error("validation failed: {0}")]
    Validation(String),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "signal".to_string(),
    }
}

impl AddonError {
    /// Whether a poll loop should swallow this error and try again.
    ///
    /// Non-zero exits, commands killed at their time limit and HTTP
    /// transport failures mean the target has not converged yet. Missing
    /// binaries, malformed output and bad configuration will not fix
    /// themselves and abort the loop.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AddonError::CommandFailed { .. }
                | AddonError::TimedOut { .. }
                | AddonError::Http { .. }
        )
    }

    pub(crate) fn malformed(
        format: &'static str,
        context: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        AddonError::Malformed {
            format,
            context: context.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AddonError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        AddonError::Validation(msg.into())
    }
}
