//! Dependency Sorter (C4): orders containers into a safe stop/start sequence.
//!
//! Edges `A -> B` mean "A depends on B". Sources: legacy `--link`, compose
//! `depends_on` labels (`service[:condition[:required]]`, comma-separated or
//! compact JSON), and an explicit `depends-on` label. Topological order is
//! Kahn's algorithm, stable within a level by container name; a cycle is
//! logged and the graph falls back to original list order rather than
//! aborting the session.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::warn;

use crate::filter::LABEL_DEPENDS_ON;
use crate::runtime::ContainerRecord;

const COMPOSE_DEPENDS_ON_LABEL: &str = "com.docker.compose.depends_on";
const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";
const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";

pub struct DependencyGraph {
    /// id -> ids it depends on
    edges: HashMap<String, Vec<String>>,
    order_index: HashMap<String, usize>,
}

impl DependencyGraph {
    pub fn build(containers: &[ContainerRecord]) -> Self {
        let mut by_name: HashMap<String, String> = HashMap::new();
        let mut by_compose_key: HashMap<(String, String), String> = HashMap::new();
        for c in containers {
            by_name.insert(c.name.clone(), c.id.clone());
            if let Some(service) = c.label(COMPOSE_SERVICE_LABEL) {
                let project = c.label(COMPOSE_PROJECT_LABEL).unwrap_or_default().to_string();
                by_compose_key.insert((project, service.to_string()), c.id.clone());
            }
        }

        let mut edges = HashMap::new();
        for c in containers {
            let mut deps = HashSet::new();

            for link in &c.links {
                // "/other:/this/alias" -> "other"
                let target_name = link.split(':').next().unwrap_or(link).trim_start_matches('/');
                if let Some(id) = by_name.get(target_name) {
                    deps.insert(id.clone());
                }
            }

            let project = c.label(COMPOSE_PROJECT_LABEL).unwrap_or_default().to_string();
            if let Some(raw) = c.label(COMPOSE_DEPENDS_ON_LABEL) {
                for service in parse_compose_depends_on(raw) {
                    if let Some(id) = by_compose_key.get(&(project.clone(), service)) {
                        deps.insert(id.clone());
                    }
                }
            }

            if let Some(raw) = c.label(LABEL_DEPENDS_ON) {
                for name in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                    if let Some(id) = by_name.get(name) {
                        deps.insert(id.clone());
                    } else {
                        deps.insert(name.to_string());
                    }
                }
            }

            edges.insert(c.id.clone(), deps.into_iter().collect());
        }

        let order_index = containers
            .iter()
            .enumerate()
            .map(|(i, c)| (c.id.clone(), i))
            .collect();

        Self { edges, order_index }
    }

    /// Forward topological order (dependencies first). Falls back to
    /// original list order on a cycle.
    pub fn start_order(&self, scope: &[String]) -> Vec<String> {
        self.topo_sort(scope)
    }

    /// Reverse topological order (dependents first).
    pub fn stop_order(&self, scope: &[String]) -> Vec<String> {
        let mut order = self.topo_sort(scope);
        order.reverse();
        order
    }

    fn topo_sort(&self, scope: &[String]) -> Vec<String> {
        let scope_set: HashSet<&String> = scope.iter().collect();

        let mut in_degree: HashMap<&str, usize> = scope.iter().map(|id| (id.as_str(), 0)).collect();
        let mut dependents: HashMap<&str, Vec<&str>> = scope.iter().map(|id| (id.as_str(), vec![])).collect();

        for id in scope {
            for dep in self.edges.get(id).map(Vec::as_slice).unwrap_or(&[]) {
                if scope_set.contains(dep) {
                    *in_degree.get_mut(id.as_str()).unwrap() += 1;
                    dependents.get_mut(dep.as_str()).unwrap().push(id.as_str());
                }
            }
        }

        let mut ready: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| *id)
            .collect();
        sort_by_original_index(&mut ready, &self.order_index);

        let mut result = Vec::with_capacity(scope.len());
        let mut remaining = in_degree.clone();

        while let Some(id) = ready.pop_front() {
            result.push(id.to_string());
            let mut newly_ready = Vec::new();
            for dependent in dependents.get(id).cloned().unwrap_or_default() {
                let deg = remaining.get_mut(dependent).unwrap();
                *deg -= 1;
                if *deg == 0 {
                    newly_ready.push(dependent);
                }
            }
            newly_ready.sort_by_key(|id| self.order_index.get(*id).copied().unwrap_or(usize::MAX));
            for id in newly_ready {
                ready.push_back(id);
            }
        }

        if result.len() != scope.len() {
            warn!(
                "dependency cycle detected among {} containers; falling back to scan order",
                scope.len() - result.len()
            );
            let mut fallback: Vec<String> = scope.to_vec();
            fallback.sort_by_key(|id| self.order_index.get(id).copied().unwrap_or(usize::MAX));
            return fallback;
        }

        result
    }
}

fn sort_by_original_index(queue: &mut VecDeque<&str>, order_index: &HashMap<String, usize>) {
    let mut items: Vec<&str> = queue.drain(..).collect();
    items.sort_by_key(|id| order_index.get(*id).copied().unwrap_or(usize::MAX));
    queue.extend(items);
}

/// Parses `service[:condition[:required]]` comma-separated form, or a
/// compact JSON array/object, into a list of bare service names.
fn parse_compose_depends_on(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
            return match value {
                serde_json::Value::Array(items) => items
                    .into_iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
                serde_json::Value::Object(map) => map.into_keys().collect(),
                _ => vec![],
            };
        }
    }

    trimmed
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|part| part.split(':').next().unwrap_or(part).to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;
    use std::time::Duration;
    use crate::runtime::RestartPolicy;

    fn record(id: &str, name: &str, labels: &[(&str, &str)]) -> ContainerRecord {
        ContainerRecord {
            id: id.to_string(),
            name: name.to_string(),
            image_name: "img:latest".into(),
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
            port_bindings: Map::new(),
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

    #[test]
    fn orders_dependency_chain_forward_and_reverse() {
        let containers = vec![
            record("app", "app", &[(LABEL_DEPENDS_ON, "db")]),
            record("db", "db", &[]),
        ];
        let graph = DependencyGraph::build(&containers);
        let scope = vec!["app".to_string(), "db".to_string()];

        assert_eq!(graph.start_order(&scope), vec!["db", "app"]);
        assert_eq!(graph.stop_order(&scope), vec!["app", "db"]);
    }

    #[test]
    fn cycle_falls_back_to_scan_order_without_panicking() {
        let containers = vec![
            record("a", "a", &[(LABEL_DEPENDS_ON, "b")]),
            record("b", "b", &[(LABEL_DEPENDS_ON, "c")]),
            record("c", "c", &[(LABEL_DEPENDS_ON, "a")]),
        ];
        let graph = DependencyGraph::build(&containers);
        let scope = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(graph.start_order(&scope), vec!["a", "b", "c"]);
    }

    #[test]
    fn compose_depends_on_resolves_within_project() {
        let containers = vec![
            record(
                "app",
                "app",
                &[
                    (COMPOSE_PROJECT_LABEL, "proj"),
                    (COMPOSE_SERVICE_LABEL, "app"),
                    (COMPOSE_DEPENDS_ON_LABEL, "db"),
                ],
            ),
            record("db", "db", &[(COMPOSE_PROJECT_LABEL, "proj"), (COMPOSE_SERVICE_LABEL, "db")]),
        ];
        let graph = DependencyGraph::build(&containers);
        let scope = vec!["app".to_string(), "db".to_string()];
        assert_eq!(graph.start_order(&scope), vec!["db", "app"]);
    }
}
