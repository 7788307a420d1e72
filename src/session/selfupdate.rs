//! Self-update (§4.6): the daemon recreating its own container.
//!
//! Two-phase dance: (1) spawn a clone carrying an environment marker and a
//! container-chain label listing every predecessor id, (2) the original
//! exits once the clone has started. A daemon that finds its own id already
//! in the chain on boot has been through this once already — it suppresses
//! further self-update attempts for the rest of its life, preventing an
//! infinite clone chain.

use thiserror::Error;

use super::SessionContext;
use crate::runtime::ContainerRecord;

pub const ENV_SELF_UPDATE_MARKER: &str = "WATCHTOWER_SELF_UPDATE";
pub const LABEL_CONTAINER_CHAIN: &str = "com.centurylinklabs.watchtower.chain";

#[derive(Debug, Error)]
pub enum SelfUpdateError {
    #[error("runtime error during self-update: {0}")]
    Runtime(#[from] crate::runtime::RuntimeError),
}

/// True if this process is itself a self-update clone: its container's
/// chain label already lists its own predecessor id via the marker env var.
pub fn suppresses_further_self_update(container: &ContainerRecord) -> bool {
    std::env::var(ENV_SELF_UPDATE_MARKER).is_ok() && container.labels.contains_key(LABEL_CONTAINER_CHAIN)
}

/// Spawns a clone of the daemon's own container running the new image, with
/// a chain label extending the predecessor list. Does not touch the
/// original container; the caller (the scheduler loop, on seeing its own
/// container vanish from `list_containers`) is responsible for exiting.
pub async fn spawn_successor(
    ctx: &SessionContext,
    container: &ContainerRecord,
) -> Result<String, SelfUpdateError> {
    let mut chain = container
        .label(LABEL_CONTAINER_CHAIN)
        .map(|s| s.to_string())
        .unwrap_or_default();
    if !chain.is_empty() {
        chain.push(',');
    }
    chain.push_str(&container.id);

    let mut successor_spec = container.clone();
    successor_spec
        .labels
        .insert(LABEL_CONTAINER_CHAIN.to_string(), chain);
    successor_spec
        .env
        .push(format!("{}=1", ENV_SELF_UPDATE_MARKER));

    let fresh_name = format!("{}_selfupdate_{}", container.name, uuid::Uuid::new_v4().simple());
    ctx.runtime.pull_image(&container.image_name).await?;
    let new_id = ctx
        .runtime
        .create_container(&successor_spec, &container.image_name, &fresh_name)
        .await?;
    ctx.runtime.start_container(&new_id).await?;

    Ok(new_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::metrics::{self, Metrics};
    use crate::registry::RegistryResolver;
    use crate::runtime::fake::FakeRuntimeClient;
    use crate::runtime::RestartPolicy;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    fn container(labels: &[(&str, &str)]) -> ContainerRecord {
        ContainerRecord {
            id: "self1".into(),
            name: "watchtower".into(),
            image_name: "containerwatch:latest".into(),
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
    async fn clone_carries_extended_chain_label() {
        let runtime = FakeRuntimeClient::new();
        runtime.seed_image(crate::runtime::ImageRecord {
            id: "sha256:b".into(),
            repo_tags: vec!["containerwatch:latest".into()],
            repo_digests: vec![],
            entrypoint: vec![],
            cmd: vec![],
        });
        let (sink, _handle) = metrics::spawn(Arc::new(Metrics::default()));
        let notifier = Arc::new(crate::notify::NotifierPipeline::new(
            Arc::new(crate::notify::LogSink::new(crate::notify::Level::Info)),
            vec![],
            "localhost".into(),
        ));

        let cli = test_cli();
        let config = Arc::new(Config::from_cli(&cli).unwrap());
        let ctx = SessionContext {
            config,
            runtime: Arc::new(runtime),
            resolver: RegistryResolver::default(),
            metrics: sink,
            notifier,
            self_update_suppressed: false,
        };

        let existing = container(&[(LABEL_CONTAINER_CHAIN, "predecessor")]);
        let new_id = spawn_successor(&ctx, &existing).await.unwrap();
        let successor = ctx.runtime.inspect_container(&new_id).await.unwrap();
        assert_eq!(
            successor.label(LABEL_CONTAINER_CHAIN),
            Some("predecessor,self1")
        );
    }

    fn test_cli() -> crate::config::Cli {
        crate::config::Cli {
            command: None,
            interval: None,
            schedule: None,
            cleanup: false,
            remove_volumes: false,
            label_enable: false,
            scope: None,
            monitor_only: false,
            no_pull: false,
            include_stopped: false,
            include_restarting: false,
            revive_stopped: false,
            rolling_restart: false,
            run_once: true,
            stop_timeout_secs: 10,
            http_api_update: false,
            http_api_metrics: false,
            http_api_periodic_polls: false,
            http_api_token: None,
            http_api_host: "0.0.0.0".into(),
            http_api_port: 8080,
            notifications: vec![],
            notifications_level: "info".into(),
            debug: false,
        }
    }
}
