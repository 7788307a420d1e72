//! `bollard`-backed implementation of [`RuntimeClient`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, KillContainerOptions,
    ListContainersOptions, RemoveContainerOptions, RenameContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{CreateImageOptions, RemoveImageOptions};
use bollard::models::{EndpointSettings, HostConfig, Mount, MountTypeEnum, NetworkingConfig, PortBinding};
use bollard::Docker;
use futures_util::StreamExt;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::{
    ContainerRecord, ImageRecord, ListOptions, MountPoint, NetworkEndpoint, ResourceLimits,
    RestartPolicy, RuntimeClient, RuntimeError, RuntimeResult,
};

/// Minimum daemon API version (major, minor) that supports explicit MAC/IP/DNS
/// assignment on a network endpoint at create-time (§4.1).
const MIN_API_VERSION_FOR_EXPLICIT_ENDPOINT: (u64, u64) = (1, 44);

pub struct DockerRuntimeClient {
    docker: Docker,
    api_version: OnceCell<(u64, u64)>,
}

impl DockerRuntimeClient {
    pub fn connect() -> RuntimeResult<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(RuntimeError::Backend)?;
        Ok(Self {
            docker,
            api_version: OnceCell::new(),
        })
    }

    /// Negotiated daemon API version, fetched once and cached. Falls back to
    /// the oldest version this client supports if the query itself fails,
    /// so network reconstruction degrades to the conservative (MAC/IP/DNS
    /// cleared) path rather than erroring out.
    async fn api_version(&self) -> (u64, u64) {
        *self
            .api_version
            .get_or_init(|| async {
                match self.docker.version().await {
                    Ok(v) => v
                        .api_version
                        .as_deref()
                        .and_then(parse_api_version)
                        .unwrap_or((1, 24)),
                    Err(_) => (1, 24),
                }
            })
            .await
    }

    fn to_record(id: &str, details: bollard::models::ContainerInspectResponse) -> RuntimeResult<ContainerRecord> {
        let config = details.config.unwrap_or_default();
        let host_config = details.host_config.unwrap_or_default();
        let state = details.state.unwrap_or_default();
        let network_settings = details.network_settings.unwrap_or_default();

        let name = details
            .name
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string();

        let labels = config.labels.unwrap_or_default();

        let networks = network_settings
            .networks
            .unwrap_or_default()
            .into_iter()
            .map(|(name, endpoint)| NetworkEndpoint {
                network_name: name,
                aliases: endpoint.aliases.unwrap_or_default(),
                mac_address: endpoint.mac_address.filter(|s| !s.is_empty()),
                ip_address: endpoint.ip_address.filter(|s| !s.is_empty()),
                dns_names: endpoint.dns_names.unwrap_or_default(),
            })
            .collect();

        let mounts = details
            .mounts
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| {
                Some(MountPoint {
                    source: m.source?,
                    destination: m.destination?,
                    read_only: !m.rw.unwrap_or(true),
                })
            })
            .collect();

        let mut port_bindings: HashMap<String, Vec<(String, String)>> = HashMap::new();
        for (container_port, bindings) in host_config.port_bindings.unwrap_or_default() {
            let entries = bindings
                .unwrap_or_default()
                .into_iter()
                .map(|b| {
                    (
                        b.host_ip.unwrap_or_default(),
                        b.host_port.unwrap_or_default(),
                    )
                })
                .collect();
            port_bindings.insert(container_port, entries);
        }

        let created_at = details
            .created
            .as_deref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(chrono::Utc::now);

        let restart_policy = host_config
            .restart_policy
            .map(|rp| RestartPolicy {
                name: rp
                    .name
                    .map(|n| format!("{n:?}").to_lowercase())
                    .unwrap_or_else(|| "no".to_string()),
                max_retry_count: rp.maximum_retry_count.unwrap_or(0) as i64,
            })
            .unwrap_or_default();

        Ok(ContainerRecord {
            id: id.to_string(),
            name,
            image_name: config.image.clone().unwrap_or_default(),
            image_id: details.image.unwrap_or_default(),
            created_at,
            running: state.running.unwrap_or(false),
            restarting: state.restarting.unwrap_or(false),
            auto_remove: host_config.auto_remove.unwrap_or(false),
            entrypoint: config.entrypoint.unwrap_or_default(),
            cmd: config.cmd.unwrap_or_default(),
            env: config.env.unwrap_or_default(),
            labels,
            exposed_ports: config
                .exposed_ports
                .unwrap_or_default()
                .into_keys()
                .collect(),
            port_bindings,
            mounts,
            networks,
            network_mode: host_config.network_mode.unwrap_or_default(),
            restart_policy,
            limits: ResourceLimits {
                memory: host_config.memory.unwrap_or(0),
                memory_swap: host_config.memory_swap.unwrap_or(0),
                cpu_shares: host_config.cpu_shares.unwrap_or(0),
                nano_cpus: host_config.nano_cpus.unwrap_or(0),
            },
            stop_signal: config.stop_signal.unwrap_or_else(|| "SIGTERM".to_string()),
            stop_timeout: Duration::from_secs(config.stop_timeout.unwrap_or(10).max(0) as u64),
            links: host_config.links.unwrap_or_default(),
        })
    }
}

#[async_trait]
impl RuntimeClient for DockerRuntimeClient {
    async fn list_containers(&self, options: &ListOptions) -> RuntimeResult<Vec<ContainerRecord>> {
        let mut filters = HashMap::new();
        let mut statuses = vec!["running".to_string()];
        if options.include_stopped {
            statuses.push("exited".to_string());
            statuses.push("created".to_string());
        }
        if options.include_restarting {
            statuses.push("restarting".to_string());
        }
        filters.insert("status".to_string(), statuses);

        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(RuntimeError::Backend)?;

        let mut records = Vec::with_capacity(summaries.len());
        for summary in summaries {
            if let Some(id) = summary.id {
                records.push(self.inspect_container(&id).await?);
            }
        }
        Ok(records)
    }

    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerRecord> {
        let details = self
            .docker
            .inspect_container(id, None)
            .await
            .map_err(|e| map_404(e, || RuntimeError::ContainerNotFound(id.to_string())))?;
        Self::to_record(id, details)
    }

    async fn inspect_image(&self, id_or_ref: &str) -> RuntimeResult<ImageRecord> {
        let details = self
            .docker
            .inspect_image(id_or_ref)
            .await
            .map_err(|e| map_404(e, || RuntimeError::ImageNotFound(id_or_ref.to_string())))?;

        let config = details.config.unwrap_or_default();
        Ok(ImageRecord {
            id: details.id.unwrap_or_default(),
            repo_tags: details.repo_tags.unwrap_or_default(),
            repo_digests: details.repo_digests.unwrap_or_default(),
            entrypoint: config.entrypoint.unwrap_or_default(),
            cmd: config.cmd.unwrap_or_default(),
        })
    }

    async fn pull_image(&self, image_ref: &str) -> RuntimeResult<String> {
        let options = CreateImageOptions {
            from_image: image_ref,
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!("pull {}: {}", image_ref, status);
                    }
                }
                Err(e) => return Err(RuntimeError::Backend(e)),
            }
        }

        let image = self.inspect_image(image_ref).await?;
        info!("pulled {} -> {}", image_ref, image.id);
        Ok(image.id)
    }

    async fn stop_container(
        &self,
        record: &ContainerRecord,
        timeout: Duration,
    ) -> RuntimeResult<()> {
        if !record.running {
            return Ok(());
        }

        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };

        match self.docker.stop_container(&record.id, Some(options)).await {
            Ok(_) => Ok(()),
            Err(e) => match e {
                BollardError::DockerResponseServerError { status_code: 404, .. } => Ok(()),
                BollardError::DockerResponseServerError { status_code: 304, .. } => Ok(()),
                other => {
                    warn!(
                        "native stop failed for {}, sending {}: {}",
                        record.name, record.stop_signal, other
                    );
                    self.docker
                        .kill_container(
                            &record.id,
                            Some(KillContainerOptions {
                                signal: record.stop_signal.clone(),
                            }),
                        )
                        .await
                        .map_err(RuntimeError::Backend)?;
                    Ok(())
                }
            },
        }
    }

    async fn create_container(
        &self,
        record: &ContainerRecord,
        new_image: &str,
        new_name: &str,
    ) -> RuntimeResult<String> {
        let mut exposed_ports = HashMap::new();
        for port in &record.exposed_ports {
            exposed_ports.insert(port.clone(), HashMap::new());
        }

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        for (port, bindings) in &record.port_bindings {
            let entries = bindings
                .iter()
                .map(|(host_ip, host_port)| PortBinding {
                    host_ip: Some(host_ip.clone()),
                    host_port: Some(host_port.clone()),
                })
                .collect();
            port_bindings.insert(port.clone(), Some(entries));
        }

        let mounts = record
            .mounts
            .iter()
            .map(|m| Mount {
                source: Some(m.source.clone()),
                target: Some(m.destination.clone()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(m.read_only),
                ..Default::default()
            })
            .collect();

        let host_mode = is_host_network(record);
        let api_ge_144 = self.api_version().await >= MIN_API_VERSION_FOR_EXPLICIT_ENDPOINT;
        let self_short_id = &record.id[..12.min(record.id.len())];

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            mounts: Some(mounts),
            memory: (record.limits.memory > 0).then_some(record.limits.memory),
            memory_swap: (record.limits.memory_swap != 0).then_some(record.limits.memory_swap),
            cpu_shares: (record.limits.cpu_shares > 0).then_some(record.limits.cpu_shares),
            nano_cpus: (record.limits.nano_cpus > 0).then_some(record.limits.nano_cpus),
            network_mode: Some(first_network_mode(record)),
            links: (!record.links.is_empty()).then(|| record.links.clone()),
            restart_policy: Some(bollard::models::RestartPolicy {
                name: parse_restart_policy_name(&record.restart_policy.name),
                maximum_retry_count: Some(record.restart_policy.max_retry_count as i64),
            }),
            auto_remove: Some(record.auto_remove),
            ..Default::default()
        };

        // The first network is attached at create-time through the config's
        // own networking_config, stripped per §4.1; remaining networks are
        // connected after creation but before start.
        let networking_config = (!host_mode)
            .then(|| record.networks.first())
            .flatten()
            .map(|endpoint| {
                let mut endpoints_config = HashMap::new();
                endpoints_config.insert(
                    endpoint.network_name.clone(),
                    strip_endpoint(endpoint, host_mode, api_ge_144, self_short_id),
                );
                NetworkingConfig { endpoints_config }
            });

        let container_config = ContainerConfig {
            image: Some(new_image.to_string()),
            entrypoint: (!record.entrypoint.is_empty()).then(|| record.entrypoint.clone()),
            cmd: (!record.cmd.is_empty()).then(|| record.cmd.clone()),
            env: (!record.env.is_empty()).then(|| record.env.clone()),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            labels: Some(record.labels.clone()),
            stop_signal: Some(record.stop_signal.clone()),
            stop_timeout: Some(record.stop_timeout.as_secs() as i64),
            host_config: Some(host_config),
            networking_config,
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: new_name,
            platform: None,
        };

        let created = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| {
                if let BollardError::DockerResponseServerError { status_code: 409, .. } = e {
                    RuntimeError::ContainerExists(new_name.to_string())
                } else {
                    RuntimeError::Backend(e)
                }
            })?;

        // Attach any further networks beyond the first, which create_container
        // already bound via networking_config.
        for endpoint in record.networks.iter().skip(1) {
            let config = strip_endpoint(endpoint, host_mode, api_ge_144, self_short_id);
            self.docker
                .connect_network(
                    &endpoint.network_name,
                    bollard::network::ConnectNetworkOptions {
                        container: created.id.clone(),
                        endpoint_config: config,
                    },
                )
                .await
                .map_err(RuntimeError::Backend)?;
        }

        if api_ge_144 {
            let has_mac = record.networks.iter().any(|e| e.mac_address.is_some());
            if host_mode && has_mac {
                warn!("host-networked successor {new_name} carries an endpoint MAC, which the runtime will ignore");
            } else if !host_mode && !record.networks.is_empty() && !has_mac {
                debug!("successor {new_name} has no endpoint MAC on a MAC-capable daemon, letting the runtime assign one");
            }
        }

        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> RuntimeResult<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(RuntimeError::Backend)
    }

    async fn rename_container(&self, id: &str, new_name: &str) -> RuntimeResult<()> {
        self.docker
            .rename_container(id, RenameContainerOptions { name: new_name })
            .await
            .map_err(RuntimeError::Backend)
    }

    async fn remove_container(&self, id: &str, remove_volumes: bool) -> RuntimeResult<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: remove_volumes,
            ..Default::default()
        };

        match self.docker.remove_container(id, Some(options)).await {
            Ok(_) => Ok(()),
            Err(BollardError::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => Err(RuntimeError::Backend(e)),
        }
    }

    async fn remove_image(&self, id: &str) -> RuntimeResult<()> {
        match self
            .docker
            .remove_image(id, Some(RemoveImageOptions::default()), None)
            .await
        {
            Ok(_) => Ok(()),
            Err(BollardError::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(BollardError::DockerResponseServerError { status_code: 409, .. }) => {
                debug!("image {} still referenced, leaving in place", id);
                Ok(())
            }
            Err(e) => Err(RuntimeError::Backend(e)),
        }
    }

    async fn exec(&self, id: &str, cmd: &[String], timeout: Duration) -> RuntimeResult<bool> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(cmd.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(RuntimeError::Backend)?;

        let run = async {
            if let StartExecResults::Attached { mut output, .. } =
                self.docker.start_exec(&exec.id, None).await.map_err(RuntimeError::Backend)?
            {
                while output.next().await.is_some() {}
            }
            self.docker
                .inspect_exec(&exec.id)
                .await
                .map_err(RuntimeError::Backend)
        };

        let inspected = tokio::time::timeout(timeout, run)
            .await
            .map_err(|_| RuntimeError::Timeout)??;

        Ok(inspected.exit_code.unwrap_or(1) == 0)
    }

    async fn self_container_id(&self) -> RuntimeResult<Option<String>> {
        match std::fs::read_to_string("/proc/self/cgroup") {
            Ok(content) => Ok(content
                .lines()
                .find_map(|line| line.rsplit('/').next())
                .filter(|s| s.len() >= 12)
                .map(|s| s.to_string())),
            Err(_) => Ok(None),
        }
    }
}

fn first_network_mode(record: &ContainerRecord) -> String {
    if !record.network_mode.is_empty() && record.network_mode != "default" {
        return record.network_mode.clone();
    }
    record
        .networks
        .first()
        .map(|n| n.network_name.clone())
        .unwrap_or_else(|| "bridge".to_string())
}

fn parse_restart_policy_name(name: &str) -> Option<bollard::models::RestartPolicyNameEnum> {
    use bollard::models::RestartPolicyNameEnum::*;
    Some(match name {
        "always" => ALWAYS,
        "unless-stopped" => UNLESS_STOPPED,
        "on-failure" => ON_FAILURE,
        _ => NO,
    })
}

fn parse_api_version(raw: &str) -> Option<(u64, u64)> {
    let mut parts = raw.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

fn is_host_network(record: &ContainerRecord) -> bool {
    record.network_mode == "host"
}

/// Strips one endpoint's settings per §4.1's network reconstruction rules:
/// host mode clears everything, a pre-1.44 daemon can't accept explicit
/// MAC/IP/DNS, and on any non-host endpoint the runtime-assigned short-id
/// alias is filtered out since the daemon re-adds it itself.
fn strip_endpoint(
    endpoint: &NetworkEndpoint,
    host_mode: bool,
    api_ge_144: bool,
    self_short_id: &str,
) -> EndpointSettings {
    if host_mode {
        return EndpointSettings::default();
    }

    let aliases: Vec<String> = endpoint
        .aliases
        .iter()
        .filter(|a| a.as_str() != self_short_id)
        .cloned()
        .collect();
    let aliases = (!aliases.is_empty()).then_some(aliases);

    if api_ge_144 {
        EndpointSettings {
            aliases,
            mac_address: endpoint.mac_address.clone(),
            ip_address: endpoint.ip_address.clone(),
            dns_names: (!endpoint.dns_names.is_empty()).then(|| endpoint.dns_names.clone()),
            ..Default::default()
        }
    } else {
        EndpointSettings {
            aliases,
            mac_address: None,
            ip_address: None,
            dns_names: None,
            ..Default::default()
        }
    }
}

fn map_404(e: BollardError, not_found: impl FnOnce() -> RuntimeError) -> RuntimeError {
    if let BollardError::DockerResponseServerError { status_code: 404, .. } = e {
        not_found()
    } else {
        RuntimeError::Backend(e)
    }
}
