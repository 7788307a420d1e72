//! Lifecycle Hook Runner (C5): pre-check/pre-update/post-update/post-check
//! commands executed inside a container via the runtime's exec facility.

use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::runtime::{ContainerRecord, RuntimeClient};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

const LABEL_PRE_CHECK: &str = "com.centurylinklabs.watchtower.lifecycle.pre-check";
const LABEL_POST_CHECK: &str = "com.centurylinklabs.watchtower.lifecycle.post-check";
const LABEL_PRE_UPDATE: &str = "com.centurylinklabs.watchtower.lifecycle.pre-update";
const LABEL_POST_UPDATE: &str = "com.centurylinklabs.watchtower.lifecycle.post-update";
const LABEL_PRE_UPDATE_TIMEOUT: &str = "com.centurylinklabs.watchtower.lifecycle.pre-update-timeout";
const LABEL_POST_UPDATE_TIMEOUT: &str = "com.centurylinklabs.watchtower.lifecycle.post-update-timeout";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPoint {
    PreCheck,
    PreUpdate,
    PostUpdate,
    PostCheck,
}

impl HookPoint {
    fn label(self) -> &'static str {
        match self {
            HookPoint::PreCheck => LABEL_PRE_CHECK,
            HookPoint::PreUpdate => LABEL_PRE_UPDATE,
            HookPoint::PostUpdate => LABEL_POST_UPDATE,
            HookPoint::PostCheck => LABEL_POST_CHECK,
        }
    }

    /// Only pre-update / post-update carry a configurable timeout label;
    /// the two check hooks always use the 1s default.
    fn timeout_label(self) -> Option<&'static str> {
        match self {
            HookPoint::PreUpdate => Some(LABEL_PRE_UPDATE_TIMEOUT),
            HookPoint::PostUpdate => Some(LABEL_POST_UPDATE_TIMEOUT),
            _ => None,
        }
    }

    /// Only `pre-update` aborts the update for its container; the rest log
    /// a failure and continue.
    pub fn aborts_on_failure(self) -> bool {
        matches!(self, HookPoint::PreUpdate)
    }
}

#[derive(Debug, Error)]
pub enum HookError {
    #[error("hook exited non-zero")]
    NonZeroExit,

    #[error("hook timed out")]
    Timeout,

    #[error("runtime error running hook: {0}")]
    Runtime(#[from] crate::runtime::RuntimeError),
}

/// Runs `point`'s hook command for `container`, if one is configured.
/// Returns `Ok(true)` if a hook ran and succeeded, `Ok(false)` if no hook
/// was configured, `Err` if it ran and failed.
pub async fn run(
    runtime: &dyn RuntimeClient,
    container: &ContainerRecord,
    point: HookPoint,
) -> Result<bool, HookError> {
    let Some(raw_command) = container.label(point.label()) else {
        return Ok(false);
    };

    let command = shell_words::split(raw_command)
        .unwrap_or_else(|_| vec!["/bin/sh".to_string(), "-c".to_string(), raw_command.to_string()]);

    let timeout = point
        .timeout_label()
        .and_then(|label| container.label(label))
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_TIMEOUT);

    info!(container = %container.name, point = ?point, command = raw_command, "running lifecycle hook");

    let success = runtime.exec(&container.id, &command, timeout).await?;

    if success {
        Ok(true)
    } else if point.aborts_on_failure() {
        Err(HookError::NonZeroExit)
    } else {
        warn!(container = %container.name, point = ?point, "lifecycle hook exited non-zero, continuing");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::FakeRuntimeClient;
    use crate::runtime::RestartPolicy;
    use std::collections::HashMap;

    fn record(labels: &[(&str, &str)]) -> ContainerRecord {
        ContainerRecord {
            id: "c1".into(),
            name: "web".into(),
            image_name: "nginx:latest".into(),
            image_id: "sha256:a".into(),
            created_at: chrono::Utc::now(),
            running: true,
            restarting: false,
            auto_remove: false,
            entrypoint: vec![],
            cmd: vec![],
            env: vec![],
            labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            exposed_ports: vec![],
            port_bindings: HashMap::new(),
            mounts: vec![],
            networks: vec![],
            network_mode: "bridge".into(),
            restart_policy: RestartPolicy::default(),
            limits: Default::default(),
            stop_signal: "SIGTERM".into(),
            stop_timeout: Duration::from_secs(10),
            links: vec![],
        }
    }

    #[tokio::test]
    async fn no_hook_configured_is_a_noop() {
        let runtime = FakeRuntimeClient::new();
        let container = record(&[]);
        let ran = run(&runtime, &container, HookPoint::PreUpdate).await.unwrap();
        assert!(!ran);
    }

    #[tokio::test]
    async fn failed_pre_update_hook_aborts() {
        let runtime = FakeRuntimeClient::new();
        runtime.seed_container(record(&[(LABEL_PRE_UPDATE, "exit 1")]));
        runtime.set_exec_result("c1", false);
        let container = record(&[(LABEL_PRE_UPDATE, "exit 1")]);

        let err = run(&runtime, &container, HookPoint::PreUpdate).await.unwrap_err();
        assert!(matches!(err, HookError::NonZeroExit));
    }

    #[tokio::test]
    async fn failed_post_check_hook_logs_and_continues() {
        let runtime = FakeRuntimeClient::new();
        runtime.set_exec_result("c1", false);
        let container = record(&[(LABEL_POST_CHECK, "exit 1")]);

        let ran = run(&runtime, &container, HookPoint::PostCheck).await.unwrap();
        assert!(ran);
    }
}
