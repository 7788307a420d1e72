//! Registry Resolver (C2): decides whether a container's image is stale.

use std::time::Duration;

use reqwest::{header, Client, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::runtime::{ContainerRecord, RuntimeClient};

use super::auth::{fetch_token, Credentials};
use super::errors::ResolverError;
use super::reference::{self, Reference};

const MANIFEST_ACCEPT: &str = concat!(
    "application/vnd.docker.distribution.manifest.v2+json, ",
    "application/vnd.docker.distribution.manifest.list.v2+json, ",
    "application/vnd.oci.image.manifest.v1+json, ",
    "application/vnd.oci.image.index.v1+json",
);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Staleness {
    Fresh,
    Stale { remote_digest: String },
}

pub struct RegistryResolver {
    client: Client,
    /// e.g. ("amd64", "linux"); used to pick an entry out of a multi-arch index.
    platform: (String, String),
}

impl Default for RegistryResolver {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl RegistryResolver {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client builds with static config");
        Self {
            client,
            platform: (normalize_arch(std::env::consts::ARCH), std::env::consts::OS.to_string()),
        }
    }

    /// Checks whether `record`'s image has a newer digest upstream. When
    /// `no_pull` is set, no registry request is made at all (I-8); staleness
    /// is judged purely by comparing the container's image id against the
    /// runtime's locally cached image for the same reference.
    pub async fn check(
        &self,
        record: &ContainerRecord,
        runtime: &dyn RuntimeClient,
        no_pull: bool,
    ) -> Result<Staleness, ResolverError> {
        let reference = reference::parse(&record.image_name);

        if no_pull {
            return self.check_local_only(record, runtime, &reference).await;
        }

        let remote_digest = self.remote_digest(&reference).await?;
        let local_digest = local_digest(record);

        if local_digest.as_deref() == Some(remote_digest.as_str()) {
            if self.entrypoint_drifted(record, runtime).await? {
                return Ok(Staleness::Stale { remote_digest });
            }
            return Ok(Staleness::Fresh);
        }

        Ok(Staleness::Stale { remote_digest })
    }

    async fn check_local_only(
        &self,
        record: &ContainerRecord,
        runtime: &dyn RuntimeClient,
        reference: &Reference,
    ) -> Result<Staleness, ResolverError> {
        let full_ref = format!("{}/{}:{}", reference.registry, reference.repository, reference.tag);
        match runtime.inspect_image(&record.image_name).await {
            Ok(image) if image.id == record.image_id => Ok(Staleness::Fresh),
            Ok(image) => Ok(Staleness::Stale {
                remote_digest: image.id,
            }),
            Err(_) => {
                debug!("no local image cached for {}, treating as fresh", full_ref);
                Ok(Staleness::Fresh)
            }
        }
    }

    async fn entrypoint_drifted(
        &self,
        record: &ContainerRecord,
        runtime: &dyn RuntimeClient,
    ) -> Result<bool, ResolverError> {
        match runtime.inspect_image(&record.image_id).await {
            Ok(image) => Ok(image.entrypoint != record.entrypoint || image.cmd != record.cmd),
            Err(_) => Ok(false),
        }
    }

    async fn remote_digest(&self, reference: &Reference) -> Result<String, ResolverError> {
        let url = format!("{}{}", reference.registry_base_url(), reference.manifest_path());

        let response = self.request_manifest(&url, None).await?;
        let response = if response.status() == StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get(header::WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| ResolverError::AuthFailed("missing Www-Authenticate header".into()))?
                .to_string();
            let credentials = Credentials::from_env(&reference.registry);
            let token = fetch_token(&self.client, &challenge, credentials.as_ref()).await?;
            self.request_manifest(&url, Some(&token)).await?
        } else {
            response
        };

        if !response.status().is_success() {
            return Err(ResolverError::ManifestUnavailable(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let header_digest = response
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = response.bytes().await?;

        if content_type.contains("manifest.list") || content_type.contains("image.index") {
            return self.pick_index_entry(&body);
        }

        Ok(header_digest.unwrap_or_else(|| format!("sha256:{:x}", Sha256::digest(&body))))
    }

    async fn request_manifest(
        &self,
        url: &str,
        token: Option<&str>,
    ) -> Result<reqwest::Response, ResolverError> {
        let mut request = self.client.get(url).header(header::ACCEPT, MANIFEST_ACCEPT);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        Ok(request.send().await?)
    }

    fn pick_index_entry(&self, body: &[u8]) -> Result<String, ResolverError> {
        #[derive(Deserialize)]
        struct Platform {
            architecture: String,
            os: String,
        }
        #[derive(Deserialize)]
        struct ManifestEntry {
            digest: String,
            platform: Platform,
        }
        #[derive(Deserialize)]
        struct Index {
            manifests: Vec<ManifestEntry>,
        }

        let index: Index = serde_json::from_slice(body)
            .map_err(|e| ResolverError::ManifestUnavailable(e.to_string()))?;

        index
            .manifests
            .into_iter()
            .find(|m| m.platform.architecture == self.platform.0 && m.platform.os == self.platform.1)
            .map(|m| m.digest)
            .ok_or_else(|| {
                warn!(
                    "no manifest entry for {}/{} in index",
                    self.platform.0, self.platform.1
                );
                ResolverError::ArchNotFound(self.platform.0.clone(), self.platform.1.clone())
            })
    }
}

fn local_digest(record: &ContainerRecord) -> Option<String> {
    record.image_id.starts_with("sha256:").then(|| record.image_id.clone())
}

fn normalize_arch(arch: &str) -> String {
    match arch {
        "x86_64" => "amd64".to_string(),
        "aarch64" => "arm64".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_known_architectures() {
        assert_eq!(normalize_arch("x86_64"), "amd64");
        assert_eq!(normalize_arch("aarch64"), "arm64");
        assert_eq!(normalize_arch("riscv64"), "riscv64");
    }

    #[test]
    fn local_digest_requires_sha256_prefix() {
        assert!(local_digest(&sample_record("plain-id")).is_none());
        assert!(local_digest(&sample_record("sha256:abc")).is_some());
    }

    fn sample_record(image_id: &str) -> ContainerRecord {
        ContainerRecord {
            id: "c1".into(),
            name: "web".into(),
            image_name: "nginx:latest".into(),
            image_id: image_id.into(),
            created_at: chrono::Utc::now(),
            running: true,
            restarting: false,
            auto_remove: false,
            entrypoint: vec![],
            cmd: vec![],
            env: vec![],
            labels: Default::default(),
            exposed_ports: vec![],
            port_bindings: Default::default(),
            mounts: vec![],
            networks: vec![],
            network_mode: "bridge".into(),
            restart_policy: Default::default(),
            limits: Default::default(),
            stop_signal: "SIGTERM".into(),
            stop_timeout: Duration::from_secs(10),
            links: vec![],
        }
    }
}
