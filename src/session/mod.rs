//! Update Session (C6): one full pass over in-scope containers.
//!
//! Per-container state machine: Scan -> Check -> {Fresh | Stale} -> PreUpdate
//! -> Stop -> Create -> Start -> PostUpdate -> Updated. `monitor-only`
//! short-circuits at the stale edge. Failure at any step after Stop records
//! the container Failed without leaving an orphaned successor under the
//! original name.

pub mod selfupdate;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::depgraph::DependencyGraph;
use crate::filter::{self, Selection};
use crate::hooks::{self, HookPoint};
use crate::metrics::{ContainerReport, MetricEvent, MetricsSink, Outcome, Report};
use crate::notify::NotifierPipeline;
use crate::registry::{RegistryResolver, Staleness};
use crate::runtime::{ContainerRecord, ListOptions, RuntimeClient, RuntimeError};

pub struct SessionContext {
    pub config: Arc<Config>,
    pub runtime: Arc<dyn RuntimeClient>,
    pub resolver: RegistryResolver,
    pub metrics: MetricsSink,
    pub notifier: Arc<NotifierPipeline>,
    /// Set when this process is itself a self-update clone (carries the
    /// chain label and the env marker); suppresses a further self-update
    /// so a clone chain can't grow unboundedly in one session.
    pub self_update_suppressed: bool,
}

/// Runs one session, optionally restricted to `image_filter` (HTTP-API
/// triggered updates). Never returns an `Err`: a failure that would abort
/// the whole session instead becomes a zero-progress `Report` so the caller
/// can still release the lock and schedule the next tick.
pub async fn run(ctx: &SessionContext, image_filter: Option<Vec<String>>) -> Report {
    let list_options = ListOptions {
        include_stopped: ctx.config.include_stopped || ctx.config.revive_stopped,
        include_restarting: ctx.config.include_restarting,
    };

    let containers = match ctx.runtime.list_containers(&list_options).await {
        Ok(containers) => containers,
        Err(e) => {
            error!("runtime unavailable at session start: {e}");
            ctx.metrics.send(MetricEvent::SessionCompleted {
                scanned: 0,
                updated: 0,
                failed: 0,
                restarted: 0,
            });
            return Report::default();
        }
    };

    let selection = Selection {
        scope: ctx.config.scope.clone(),
        label_enable: ctx.config.label_enable,
        image_set: image_filter,
        ..Default::default()
    };

    let in_scope: Vec<ContainerRecord> = containers
        .into_iter()
        .filter(|c| filter::is_in_scope(c, &selection))
        .collect();

    let mut report = Report::default();
    let mut outcomes: HashMap<String, (Outcome, Option<String>)> = HashMap::new();
    let mut staleness: HashMap<String, Staleness> = HashMap::new();

    // Registry resolution is read-only and safe to fan out; state-mutating
    // steps later in the session stay strictly sequential. Bounded the same
    // way the daemon bounds any other concurrent runtime-API fan-out.
    let fan_out = Arc::new(Semaphore::new(num_cpus::get().max(1)));
    let checks: Vec<(String, Result<Staleness, crate::registry::ResolverError>)> = stream::iter(&in_scope)
        .map(|container| {
            let fan_out = fan_out.clone();
            async move {
                let _permit = fan_out.acquire().await.expect("semaphore never closed");
                let _ = hooks::run(&*ctx.runtime, container, HookPoint::PreCheck).await;
                let no_pull = ctx.config.no_pull || filter::is_no_pull(container);
                let result = ctx.resolver.check(container, &*ctx.runtime, no_pull).await;
                (container.id.clone(), result)
            }
        })
        .buffer_unordered(num_cpus::get().max(1))
        .collect()
        .await;

    for (id, result) in checks {
        match result {
            Ok(Staleness::Fresh) => {
                outcomes.insert(id, (Outcome::Fresh, None));
            }
            Ok(stale @ Staleness::Stale { .. }) => {
                staleness.insert(id, stale);
            }
            Err(e) => {
                warn!("staleness check failed for {id}: {e}");
                outcomes.insert(id, (Outcome::Failed, Some(e.to_string())));
            }
        }
    }

    let self_id = ctx
        .runtime
        .self_container_id()
        .await
        .ok()
        .flatten()
        .or_else(|| in_scope.iter().find(|c| filter::is_self(c)).map(|c| c.id.clone()));
    if let Some(self_id) = &self_id {
        if staleness.contains_key(self_id) && ctx.self_update_suppressed {
            // Recreating this process's own container the normal way would
            // stop it mid-session. A suppressed clone just reports itself
            // stale and leaves the next non-suppressed session to update it.
            info!("self-update is suppressed for this process, reporting stale instead of recreating");
            outcomes.insert(self_id.clone(), (Outcome::Stale, None));
            staleness.remove(self_id);
        } else if staleness.contains_key(self_id) && !ctx.config.monitor_only {
            if let Some(container) = in_scope.iter().find(|c| &c.id == self_id) {
                match selfupdate::spawn_successor(ctx, container).await {
                    Ok(_new_id) => {
                        info!("self-update clone spawned, exiting original process");
                        outcomes.insert(self_id.clone(), (Outcome::Updated, None));
                        staleness.remove(self_id);
                    }
                    Err(e) => {
                        error!("self-update failed: {e}");
                        outcomes.insert(self_id.clone(), (Outcome::Failed, Some(e.to_string())));
                        staleness.remove(self_id);
                    }
                }
            }
        }
    }

    let mut stale_ids: Vec<String> = staleness.keys().cloned().collect();
    stale_ids.sort();

    let graph = DependencyGraph::build(&in_scope);
    let by_id: HashMap<String, &ContainerRecord> = in_scope.iter().map(|c| (c.id.clone(), c)).collect();

    let mut to_recreate: HashSet<String> = HashSet::new();
    let mut dependents_only: HashSet<String> = HashSet::new();

    for id in &stale_ids {
        let container = by_id[id];
        if ctx.config.monitor_only || filter::is_monitor_only(container) {
            outcomes.insert(id.clone(), (Outcome::Stale, None));
            continue;
        }
        to_recreate.insert(id.clone());
    }

    // Dependents that must be bounced purely to let a parent recreate:
    // containers sharing the parent's network namespace, or (with
    // --rolling-restart) anything depending on it.
    for container in &in_scope {
        for parent_id in &stale_ids {
            if !to_recreate.contains(parent_id) {
                continue;
            }
            if container.shares_network_namespace_with(parent_id)
                || (ctx.config.rolling_restart && depends_on(&graph, container, parent_id))
            {
                if to_recreate.insert(container.id.clone()) {
                    dependents_only.insert(container.id.clone());
                }
            }
        }
    }

    let mut affected: Vec<String> = to_recreate.iter().cloned().collect();
    affected.sort();

    let stop_order = graph.stop_order(&affected);
    let start_order = graph.start_order(&affected);

    for id in &stop_order {
        let container = by_id[id];
        if let Err(e) = hooks::run(&*ctx.runtime, container, HookPoint::PreUpdate).await {
            warn!(container = %container.name, "pre-update hook failed: {e}");
            outcomes.insert(id.clone(), (Outcome::Failed, Some(e.to_string())));
            to_recreate.remove(id);
            continue;
        }
        let effective = ContainerRecord {
            stop_signal: filter::stop_signal(container),
            ..container.clone()
        };
        if let Err(e) = ctx
            .runtime
            .stop_container(&effective, ctx.config.stop_timeout)
            .await
        {
            error!(container = %container.name, "stop failed: {e}");
            outcomes.insert(id.clone(), (Outcome::Failed, Some(e.to_string())));
            to_recreate.remove(id);
        }
    }

    let mut successor_ids: HashMap<String, String> = HashMap::new();

    for id in &start_order {
        if !to_recreate.contains(id) || outcomes.contains_key(id) {
            continue;
        }
        let container = by_id[id];

        match recreate_in_place(ctx, container, &container.image_name).await {
            Ok(new_id) => {
                if let Some(successor) = fetch_successor(ctx, &new_id).await {
                    let _ = hooks::run(&*ctx.runtime, &successor, HookPoint::PostUpdate).await;
                }
                let outcome = if dependents_only.contains(id) {
                    Outcome::Restarted
                } else {
                    Outcome::Updated
                };
                outcomes.insert(id.clone(), (outcome, None));
                successor_ids.insert(id.clone(), new_id);
            }
            Err(e) => {
                error!(container = %container.name, "recreate failed: {e}");
                outcomes.insert(id.clone(), (Outcome::Failed, Some(e.to_string())));
            }
        }
    }

    for container in &in_scope {
        let _ = hooks::run(&*ctx.runtime, container, HookPoint::PostCheck).await;
    }

    if ctx.config.cleanup {
        cleanup_images(ctx, &in_scope, &successor_ids).await;
    }

    for container in &in_scope {
        let (outcome, error) = outcomes
            .remove(&container.id)
            .unwrap_or((Outcome::Fresh, None));
        report.push(ContainerReport {
            id: container.id.clone(),
            name: container.name.clone(),
            image_name: container.image_name.clone(),
            old_image_id: container.image_id.clone(),
            new_image_id: successor_ids.get(&container.id).cloned(),
            outcome,
            error,
            monitor_only: ctx.config.monitor_only || filter::is_monitor_only(container),
        });
    }

    ctx.metrics.send(MetricEvent::SessionCompleted {
        scanned: report.containers.len() as u64,
        updated: report.updated_count() as u64,
        failed: report.failed_count() as u64,
        restarted: report.by_outcome(Outcome::Restarted).count() as u64,
    });

    report
}

fn depends_on(graph: &DependencyGraph, container: &ContainerRecord, parent_id: &str) -> bool {
    let scope = vec![container.id.clone(), parent_id.to_string()];
    graph.start_order(&scope).first().map(String::as_str) == Some(parent_id)
}

/// Recreate-in-place: the successor is created under a fresh name first, the
/// old container is then renamed aside and removed, and only then is the
/// successor renamed to the original name. This ordering means a name
/// collision never occurs mid-flight and a crash leaves a runnable
/// container under an obvious stray name rather than nothing at all.
async fn recreate_in_place(
    ctx: &SessionContext,
    container: &ContainerRecord,
    new_image: &str,
) -> Result<String, RuntimeError> {
    if !ctx.config.no_pull {
        ctx.runtime.pull_image(new_image).await?;
    }

    let fresh_name = format!("{}_{}", container.name, short_id());
    let new_id = ctx
        .runtime
        .create_container(container, new_image, &fresh_name)
        .await?;

    let stale_name = format!("{}_old_{}", container.name, short_id());
    ctx.runtime.rename_container(&container.id, &stale_name).await?;
    ctx.runtime.remove_container(&container.id, ctx.config.remove_volumes).await?;
    ctx.runtime.rename_container(&new_id, &container.name).await?;
    ctx.runtime.start_container(&new_id).await?;

    Ok(new_id)
}

async fn fetch_successor(ctx: &SessionContext, id: &str) -> Option<ContainerRecord> {
    ctx.runtime.inspect_container(id).await.ok()
}

async fn cleanup_images(
    ctx: &SessionContext,
    in_scope: &[ContainerRecord],
    successors: &HashMap<String, String>,
) {
    let surviving_images: HashSet<String> = {
        let mut set: HashSet<String> = in_scope
            .iter()
            .filter(|c| !successors.contains_key(&c.id))
            .map(|c| c.image_id.clone())
            .collect();
        for new_id in successors.values() {
            if let Some(record) = fetch_successor(ctx, new_id).await {
                set.insert(record.image_id);
            }
        }
        set
    };

    for container in in_scope {
        if successors.contains_key(&container.id) && !surviving_images.contains(&container.image_id) {
            if let Ok(image) = ctx.runtime.inspect_image(&container.image_id).await {
                if !image.repo_tags.is_empty() {
                    if let Err(e) = ctx.runtime.remove_image(&container.image_id).await {
                        warn!("failed to remove superseded image {}: {e}", container.image_id);
                    }
                }
            }
        }
    }
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}
