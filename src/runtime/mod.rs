//! Runtime Client (C1): a thin, capability-shaped adapter over the container
//! runtime. The rest of the daemon only ever talks to the `RuntimeClient`
//! trait, never to `bollard` directly, so the core can run its tests against
//! an in-memory fake instead of a real Docker daemon.

mod docker;
pub mod fake;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use docker::DockerRuntimeClient;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime error: {0}")]
    Backend(#[from] bollard::errors::Error),

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("container already exists: {0}")]
    ContainerExists(String),

    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Restart policy as recorded on a container, carried through recreation unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    pub name: String,
    pub max_retry_count: i64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            name: "no".to_string(),
            max_retry_count: 0,
        }
    }
}

/// A single network endpoint attached to a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkEndpoint {
    pub network_name: String,
    pub aliases: Vec<String>,
    pub mac_address: Option<String>,
    pub ip_address: Option<String>,
    pub dns_names: Vec<String>,
}

/// A bind or volume mount, carried through recreation unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    pub source: String,
    pub destination: String,
    pub read_only: bool,
}

/// Resource limits, carried through recreation unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory: i64,
    pub memory_swap: i64,
    pub cpu_shares: i64,
    pub nano_cpus: i64,
}

/// Immutable snapshot of one container's runtime configuration, captured at
/// the start of a session. Cross-container references (links, shared
/// network namespaces) are by name/id through a session-scoped lookup, never
/// by pointer, so a rename during recreation never needs pointer fixups.
#[derive(Debug, Clone)]
pub struct ContainerRecord {
    pub id: String,
    /// Name without the leading `/` Docker prepends.
    pub name: String,
    /// Image reference exactly as the user wrote it (e.g. `nginx:latest`).
    pub image_name: String,
    /// Resolved image id currently backing the container.
    pub image_id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub running: bool,
    pub restarting: bool,
    pub auto_remove: bool,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub exposed_ports: Vec<String>,
    pub port_bindings: HashMap<String, Vec<(String, String)>>,
    pub mounts: Vec<MountPoint>,
    pub networks: Vec<NetworkEndpoint>,
    pub network_mode: String,
    pub restart_policy: RestartPolicy,
    pub limits: ResourceLimits,
    pub stop_signal: String,
    pub stop_timeout: Duration,
    pub links: Vec<String>,
}

impl ContainerRecord {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    /// True if this container shares another container's network namespace
    /// (`--network container:<id>`).
    pub fn shares_network_namespace_with(&self, other_id: &str) -> bool {
        self.network_mode
            .strip_prefix("container:")
            .map(|ref_id| ref_id == other_id)
            .unwrap_or(false)
    }
}

/// Resolved identifier + tags for an image, used to compare/cache registry lookups.
#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub repo_digests: Vec<String>,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
}

/// Options narrowing a container listing.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub include_stopped: bool,
    pub include_restarting: bool,
}

/// Capability set the rest of the daemon depends on. Hides the concrete SDK
/// (`bollard`) so unit tests run against `fake::FakeRuntimeClient`.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    async fn list_containers(&self, options: &ListOptions) -> RuntimeResult<Vec<ContainerRecord>>;
    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerRecord>;
    async fn inspect_image(&self, id_or_ref: &str) -> RuntimeResult<ImageRecord>;

    /// Pulls `image_ref`, returning the resulting local image id.
    async fn pull_image(&self, image_ref: &str) -> RuntimeResult<String>;

    async fn stop_container(
        &self,
        record: &ContainerRecord,
        timeout: Duration,
    ) -> RuntimeResult<()>;

    /// Creates and starts a successor container from `record`'s configuration,
    /// but running `new_image`, bound to `new_name`. Does not touch the
    /// original container.
    async fn create_container(
        &self,
        record: &ContainerRecord,
        new_image: &str,
        new_name: &str,
    ) -> RuntimeResult<String>;

    async fn start_container(&self, id: &str) -> RuntimeResult<()>;

    async fn rename_container(&self, id: &str, new_name: &str) -> RuntimeResult<()>;

    /// Removes a container; force-removes if running. Idempotent: a missing
    /// container is success, not an error.
    async fn remove_container(&self, id: &str, remove_volumes: bool) -> RuntimeResult<()>;

    /// Removes an image only if it is unreferenced; idempotent.
    async fn remove_image(&self, id: &str) -> RuntimeResult<()>;

    /// Runs a command inside a running container, returning whether it
    /// exited zero. Used by the lifecycle hook runner (C5).
    async fn exec(&self, id: &str, cmd: &[String], timeout: Duration) -> RuntimeResult<bool>;

    /// Reports the daemon's own container id, if running inside one
    /// (self-update, C6).
    async fn self_container_id(&self) -> RuntimeResult<Option<String>>;
}
