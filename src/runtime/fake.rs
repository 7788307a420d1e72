//! In-memory [`RuntimeClient`] used by the rest of the daemon's test suites.
//! Lets every session/scheduler/filter invariant be written as a
//! `#[tokio::test]` without a real Docker daemon.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    ContainerRecord, ImageRecord, ListOptions, RuntimeClient, RuntimeError, RuntimeResult,
};

struct State {
    containers: HashMap<String, ContainerRecord>,
    images: HashMap<String, ImageRecord>,
    next_id: u64,
    exec_results: HashMap<String, bool>,
    self_id: Option<String>,
}

/// An in-memory Docker stand-in. Containers and images are keyed by id;
/// `create_container` mints a fresh incrementing id so tests can assert on
/// rename/remove ordering without caring about real Docker id formats.
pub struct FakeRuntimeClient {
    state: Mutex<State>,
}

impl Default for FakeRuntimeClient {
    fn default() -> Self {
        Self {
            state: Mutex::new(State {
                containers: HashMap::new(),
                images: HashMap::new(),
                next_id: 1,
                exec_results: HashMap::new(),
                self_id: None,
            }),
        }
    }
}

impl FakeRuntimeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_container(&self, record: ContainerRecord) {
        self.state.lock().containers.insert(record.id.clone(), record);
    }

    pub fn seed_image(&self, record: ImageRecord) {
        let mut state = self.state.lock();
        for tag in &record.repo_tags {
            state.images.insert(tag.clone(), record.clone());
        }
        state.images.insert(record.id.clone(), record);
    }

    /// Overrides the exit-zero outcome of the next `exec` matching `id`.
    pub fn set_exec_result(&self, id: &str, success: bool) {
        self.state.lock().exec_results.insert(id.to_string(), success);
    }

    pub fn set_self_container_id(&self, id: impl Into<String>) {
        self.state.lock().self_id = Some(id.into());
    }

    pub fn container(&self, id: &str) -> Option<ContainerRecord> {
        self.state.lock().containers.get(id).cloned()
    }

    fn fresh_id(state: &mut State) -> String {
        let id = format!("{:064x}", state.next_id);
        state.next_id += 1;
        id
    }
}

#[async_trait]
impl RuntimeClient for FakeRuntimeClient {
    async fn list_containers(&self, options: &ListOptions) -> RuntimeResult<Vec<ContainerRecord>> {
        let state = self.state.lock();
        Ok(state
            .containers
            .values()
            .filter(|c| {
                c.running
                    || (options.include_stopped && !c.restarting)
                    || (options.include_restarting && c.restarting)
            })
            .cloned()
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerRecord> {
        self.state
            .lock()
            .containers
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::ContainerNotFound(id.to_string()))
    }

    async fn inspect_image(&self, id_or_ref: &str) -> RuntimeResult<ImageRecord> {
        self.state
            .lock()
            .images
            .get(id_or_ref)
            .cloned()
            .ok_or_else(|| RuntimeError::ImageNotFound(id_or_ref.to_string()))
    }

    async fn pull_image(&self, image_ref: &str) -> RuntimeResult<String> {
        self.state
            .lock()
            .images
            .get(image_ref)
            .map(|i| i.id.clone())
            .ok_or_else(|| RuntimeError::ImageNotFound(image_ref.to_string()))
    }

    async fn stop_container(
        &self,
        record: &ContainerRecord,
        _timeout: Duration,
    ) -> RuntimeResult<()> {
        let mut state = self.state.lock();
        if let Some(c) = state.containers.get_mut(&record.id) {
            c.running = false;
        }
        Ok(())
    }

    async fn create_container(
        &self,
        record: &ContainerRecord,
        new_image: &str,
        new_name: &str,
    ) -> RuntimeResult<String> {
        let mut state = self.state.lock();
        if state.containers.values().any(|c| c.name == new_name) {
            return Err(RuntimeError::ContainerExists(new_name.to_string()));
        }
        let image_id = state
            .images
            .get(new_image)
            .map(|i| i.id.clone())
            .unwrap_or_else(|| new_image.to_string());

        let id = Self::fresh_id(&mut state);
        let mut successor = record.clone();
        successor.id = id.clone();
        successor.name = new_name.to_string();
        successor.image_name = new_image.to_string();
        successor.image_id = image_id;
        successor.running = false;
        state.containers.insert(id.clone(), successor);
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> RuntimeResult<()> {
        let mut state = self.state.lock();
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::ContainerNotFound(id.to_string()))?;
        container.running = true;
        Ok(())
    }

    async fn rename_container(&self, id: &str, new_name: &str) -> RuntimeResult<()> {
        let mut state = self.state.lock();
        if state.containers.values().any(|c| c.name == new_name && c.id != id) {
            return Err(RuntimeError::ContainerExists(new_name.to_string()));
        }
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::ContainerNotFound(id.to_string()))?;
        container.name = new_name.to_string();
        Ok(())
    }

    async fn remove_container(&self, id: &str, _remove_volumes: bool) -> RuntimeResult<()> {
        self.state.lock().containers.remove(id);
        Ok(())
    }

    async fn remove_image(&self, id: &str) -> RuntimeResult<()> {
        self.state.lock().images.remove(id);
        Ok(())
    }

    async fn exec(&self, id: &str, _cmd: &[String], _timeout: Duration) -> RuntimeResult<bool> {
        Ok(self.state.lock().exec_results.get(id).copied().unwrap_or(true))
    }

    async fn self_container_id(&self) -> RuntimeResult<Option<String>> {
        Ok(self.state.lock().self_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RestartPolicy;

    fn base_record(id: &str, name: &str) -> ContainerRecord {
        ContainerRecord {
            id: id.to_string(),
            name: name.to_string(),
            image_name: "nginx:latest".to_string(),
            image_id: "sha256:old".to_string(),
            created_at: chrono::Utc::now(),
            running: true,
            restarting: false,
            auto_remove: false,
            entrypoint: vec![],
            cmd: vec![],
            env: vec![],
            labels: HashMap::new(),
            exposed_ports: vec![],
            port_bindings: HashMap::new(),
            mounts: vec![],
            networks: vec![],
            network_mode: "bridge".to_string(),
            restart_policy: RestartPolicy::default(),
            limits: Default::default(),
            stop_signal: "SIGTERM".to_string(),
            stop_timeout: Duration::from_secs(10),
            links: vec![],
        }
    }

    #[tokio::test]
    async fn recreate_in_place_round_trip() {
        let client = FakeRuntimeClient::new();
        client.seed_container(base_record("c1", "web"));
        client.seed_image(ImageRecord {
            id: "sha256:new".to_string(),
            repo_tags: vec!["nginx:latest".to_string()],
            repo_digests: vec![],
            entrypoint: vec![],
            cmd: vec![],
        });

        let old = client.inspect_container("c1").await.unwrap();
        let new_id = client
            .create_container(&old, "nginx:latest", "web_new")
            .await
            .unwrap();

        client.stop_container(&old, Duration::from_secs(1)).await.unwrap();
        client.remove_container("c1", false).await.unwrap();
        client.rename_container(&new_id, "web").await.unwrap();
        client.start_container(&new_id).await.unwrap();

        assert!(client.inspect_container("c1").await.is_err());
        let recreated = client.inspect_container(&new_id).await.unwrap();
        assert_eq!(recreated.name, "web");
        assert_eq!(recreated.image_id, "sha256:new");
        assert!(recreated.running);
    }

    #[tokio::test]
    async fn create_container_rejects_name_collision() {
        let client = FakeRuntimeClient::new();
        client.seed_container(base_record("c1", "web"));
        client.seed_container(base_record("c2", "web_new"));
        let old = client.inspect_container("c1").await.unwrap();

        let err = client
            .create_container(&old, "nginx:latest", "web_new")
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ContainerExists(_)));
    }
}
