//! Filter & Selection (C3): decides which containers are in scope for a session.

use regex::Regex;

use crate::runtime::ContainerRecord;

pub const LABEL_ENABLE: &str = "com.centurylinklabs.watchtower.enable";
pub const LABEL_SCOPE: &str = "com.centurylinklabs.watchtower.scope";
pub const LABEL_MONITOR_ONLY: &str = "com.centurylinklabs.watchtower.monitor-only";
pub const LABEL_NO_PULL: &str = "com.centurylinklabs.watchtower.no-pull";
pub const LABEL_DEPENDS_ON: &str = "com.centurylinklabs.watchtower.depends-on";
pub const LABEL_STOP_SIGNAL: &str = "com.centurylinklabs.watchtower.stop-signal";
pub const LABEL_SELF_MARKER: &str = "com.centurylinklabs.watchtower";

#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub scope: Option<String>,
    pub label_enable: bool,
    pub name_includes: Vec<Regex>,
    pub name_excludes: Vec<Regex>,
    /// When set (API-triggered update), only containers running one of
    /// these image references are in scope.
    pub image_set: Option<Vec<String>>,
}

/// Evaluates the predicate chain from §4.3: scope match, name include/exclude,
/// image-set match, then label enable/disable.
pub fn is_in_scope(container: &ContainerRecord, selection: &Selection) -> bool {
    if let Some(scope) = &selection.scope {
        if container.label(LABEL_SCOPE) != Some(scope.as_str()) {
            return false;
        }
    }

    if !selection.name_includes.is_empty()
        && !selection.name_includes.iter().any(|re| re.is_match(&container.name))
    {
        return false;
    }

    if selection.name_excludes.iter().any(|re| re.is_match(&container.name)) {
        return false;
    }

    if let Some(images) = &selection.image_set {
        if !images.iter().any(|wanted| wanted == &container.image_name) {
            return false;
        }
    }

    if selection.label_enable {
        match container.label(LABEL_ENABLE) {
            Some("true") => {}
            _ => return false,
        }
    } else if container.label(LABEL_ENABLE) == Some("false") {
        return false;
    }

    true
}

pub fn is_monitor_only(container: &ContainerRecord) -> bool {
    container.label(LABEL_MONITOR_ONLY) == Some("true")
}

pub fn is_no_pull(container: &ContainerRecord) -> bool {
    container.label(LABEL_NO_PULL) == Some("true")
}

pub fn is_self(container: &ContainerRecord) -> bool {
    container.labels.contains_key(LABEL_SELF_MARKER)
}

pub fn stop_signal(container: &ContainerRecord) -> String {
    container
        .label(LABEL_STOP_SIGNAL)
        .map(str::to_string)
        .unwrap_or_else(|| container.stop_signal.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;
    use crate::runtime::RestartPolicy;

    fn record(name: &str, labels: &[(&str, &str)]) -> ContainerRecord {
        ContainerRecord {
            id: format!("id-{name}"),
            name: name.to_string(),
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

    #[test]
    fn label_enable_excludes_unlabeled_when_active() {
        let selection = Selection {
            label_enable: true,
            ..Default::default()
        };
        assert!(!is_in_scope(&record("a", &[]), &selection));
        assert!(is_in_scope(&record("a", &[(LABEL_ENABLE, "true")]), &selection));
    }

    #[test]
    fn explicit_disable_wins_without_label_enable() {
        let selection = Selection::default();
        assert!(!is_in_scope(&record("a", &[(LABEL_ENABLE, "false")]), &selection));
    }

    #[test]
    fn scope_mismatch_excludes() {
        let selection = Selection {
            scope: Some("prod".into()),
            ..Default::default()
        };
        assert!(!is_in_scope(&record("a", &[]), &selection));
        assert!(is_in_scope(&record("a", &[(LABEL_SCOPE, "prod")]), &selection));
    }

    #[test]
    fn image_set_restricts_to_matching_images() {
        let selection = Selection {
            image_set: Some(vec!["redis:7".into()]),
            ..Default::default()
        };
        assert!(!is_in_scope(&record("a", &[]), &selection));
    }
}
