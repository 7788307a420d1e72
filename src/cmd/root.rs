//! Main daemon command: wires config, runtime client, scheduler, notifier
//! pipeline and (optionally) the HTTP API together, then waits for shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use containerwatch::api::{self, AppState};
use containerwatch::config::{Config, Trigger};
use containerwatch::metrics::{self, Metrics};
use containerwatch::notify::{self, LogSink, NotifierPipeline};
use containerwatch::registry::RegistryResolver;
use containerwatch::runtime::{DockerRuntimeClient, RuntimeClient};
use containerwatch::scheduler::{self, Scheduler};
use containerwatch::session::selfupdate;
use containerwatch::session::SessionContext;

/// Runs the daemon. Returns the process exit code: `0` on a clean run,
/// `2` if `--run-once` reported any container Failed.
pub async fn run(config: Arc<Config>, log_sink: Arc<LogSink>) -> Result<i32> {
    info!("starting containerwatch v{}", env!("CARGO_PKG_VERSION"));

    let runtime: Arc<dyn RuntimeClient> = Arc::new(
        DockerRuntimeClient::connect().context("connecting to container runtime")?,
    );

    let mut self_update_suppressed = false;
    if let Ok(Some(self_id)) = runtime.self_container_id().await {
        if let Ok(container) = runtime.inspect_container(&self_id).await {
            if selfupdate::suppresses_further_self_update(&container) {
                info!("running as a self-update clone, self-update is suppressed for this process");
                self_update_suppressed = true;
            }
        }
    }

    let metrics = Arc::new(Metrics::default());
    let (metrics_sink, _metrics_task) = metrics::spawn(metrics.clone());

    log_sink.set_min_level(parse_level(&config.notifications_level));
    let transports = notify::build_transports(&config.notifications);
    let notifier = Arc::new(NotifierPipeline::new(log_sink, transports, hostname()));

    let session_ctx = Arc::new(SessionContext {
        config: config.clone(),
        runtime,
        resolver: RegistryResolver::default(),
        metrics: metrics_sink,
        notifier: notifier.clone(),
        self_update_suppressed,
    });

    if config.run_once {
        let report = scheduler::run_once(&session_ctx).await;
        notifier.flush(&report).await;
        return Ok(if report.any_failed() { 2 } else { 0 });
    }

    let shutdown = CancellationToken::new();
    let (scheduler, scheduler_task) = Scheduler::spawn(session_ctx.clone(), config.trigger.clone(), shutdown.clone());
    let scheduler = Arc::new(scheduler);

    let http_task = if config.http.update_enabled || config.http.metrics_enabled {
        let state = AppState {
            scheduler: scheduler.clone(),
            metrics: metrics.clone(),
            token: Arc::new(config.http.token.clone()),
            update_enabled: config.http.update_enabled,
            metrics_enabled: config.http.metrics_enabled,
        };
        let host = config.http.host.clone();
        let port = config.http.port;
        let shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = api::serve(&host, port, state, shutdown).await {
                warn!("http api server error: {e}");
            }
        }))
    } else {
        None
    };

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            warn!("received shutdown signal, draining in-flight session");
            shutdown.cancel();
        }
    });

    shutdown.cancelled().await;

    let drain = tokio::time::timeout(scheduler::shutdown_drain_ceiling(), async {
        let _ = scheduler_task.await;
        if let Some(task) = http_task {
            let _ = task.await;
        }
    })
    .await;

    if drain.is_err() {
        warn!("shutdown drain ceiling exceeded, exiting regardless");
    }

    info!("containerwatch stopped");
    Ok(0)
}

fn parse_level(raw: &str) -> notify::Level {
    match raw.to_ascii_lowercase().as_str() {
        "debug" | "trace" => notify::Level::Debug,
        "warn" | "warning" => notify::Level::Warn,
        "error" => notify::Level::Error,
        _ => notify::Level::Info,
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}
