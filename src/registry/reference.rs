//! Image reference parsing and normalization.
//!
//! `nginx` normalizes to `docker.io/library/nginx:latest`; `myhost:5000/app`
//! keeps its explicit registry; a reference already carrying `@sha256:...`
//! keeps the digest and drops no information.

const DEFAULT_REGISTRY: &str = "registry-1.docker.io";
const LEGACY_DOCKER_HOST: &str = "docker.io";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub registry: String,
    pub repository: String,
    pub tag: String,
    pub digest: Option<String>,
}

impl Reference {
    /// `registry/repository:tag` form, suitable for manifest URLs.
    pub fn manifest_path(&self) -> String {
        let selector = self.digest.as_deref().unwrap_or(&self.tag);
        format!("/v2/{}/manifests/{}", self.repository, selector)
    }

    pub fn registry_base_url(&self) -> String {
        format!("https://{}", self.registry)
    }
}

pub fn parse(raw: &str) -> Reference {
    let (name_and_tag, digest) = match raw.split_once('@') {
        Some((left, d)) => (left, Some(d.to_string())),
        None => (raw, None),
    };

    let (name, tag) = split_tag(name_and_tag);

    let mut parts: Vec<&str> = name.splitn(2, '/').collect();
    let (registry, repository) = if parts.len() == 2 && looks_like_registry(parts[0]) {
        let registry = parts.remove(0).to_string();
        (normalize_registry_host(&registry), parts[0].to_string())
    } else {
        (DEFAULT_REGISTRY.to_string(), name.to_string())
    };

    let repository = if registry == DEFAULT_REGISTRY && !repository.contains('/') {
        format!("library/{}", repository)
    } else {
        repository
    };

    Reference {
        registry,
        repository,
        tag: tag.unwrap_or_else(|| "latest".to_string()),
        digest,
    }
}

fn split_tag(name_and_tag: &str) -> (&str, Option<String>) {
    // A ':' after the last '/' is a tag; one before it is a registry port.
    let last_slash = name_and_tag.rfind('/').map(|i| i + 1).unwrap_or(0);
    match name_and_tag[last_slash..].rfind(':') {
        Some(i) => (
            &name_and_tag[..last_slash + i],
            Some(name_and_tag[last_slash + i + 1..].to_string()),
        ),
        None => (name_and_tag, None),
    }
}

fn looks_like_registry(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}

fn normalize_registry_host(host: &str) -> String {
    if host == LEGACY_DOCKER_HOST {
        DEFAULT_REGISTRY.to_string()
    } else {
        host.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_unqualified_name() {
        let r = parse("nginx");
        assert_eq!(r.registry, "registry-1.docker.io");
        assert_eq!(r.repository, "library/nginx");
        assert_eq!(r.tag, "latest");
    }

    #[test]
    fn keeps_custom_registry_and_tag() {
        let r = parse("myhost:5000/team/app:1.2.3");
        assert_eq!(r.registry, "myhost:5000");
        assert_eq!(r.repository, "team/app");
        assert_eq!(r.tag, "1.2.3");
    }

    #[test]
    fn preserves_explicit_digest() {
        let r = parse("nginx@sha256:aaaa");
        assert_eq!(r.digest.as_deref(), Some("sha256:aaaa"));
        assert_eq!(r.tag, "latest");
    }

    #[test]
    fn docker_io_normalizes_to_registry_host() {
        let r = parse("docker.io/library/redis:7");
        assert_eq!(r.registry, "registry-1.docker.io");
        assert_eq!(r.repository, "library/redis");
    }
}
