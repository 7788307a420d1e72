//! Scheduler & Lock (C7): drives periodic sessions and guarantees they
//! never overlap.

pub mod lock;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Trigger;
use crate::metrics::{MetricEvent, Report};
use crate::session::{self, SessionContext};

use lock::Locker;

/// Ceiling on how long shutdown waits for an in-flight session to drain
/// before proceeding regardless (§5 Cancellation).
const SHUTDOWN_DRAIN_CEILING: Duration = Duration::from_secs(60);

/// A request to run one immediate session (HTTP-API triggered), sharing the
/// scheduler's lock. The response channel carries back `None` if the lock
/// was already held (maps to a `409` at the API layer) or `Some(Report)`.
pub struct AdHocRequest {
    pub image_filter: Option<Vec<String>>,
    pub reply: tokio::sync::oneshot::Sender<Option<Report>>,
}

pub struct Scheduler {
    locker: Locker,
    ad_hoc_tx: mpsc::Sender<AdHocRequest>,
}

impl Scheduler {
    /// Spawns the background tick loop (cron or interval, per `trigger`)
    /// and the ad-hoc request listener. Returns a handle for submitting
    /// HTTP-API-triggered sessions and a join handle to await on shutdown.
    pub fn spawn(
        ctx: Arc<SessionContext>,
        trigger: Trigger,
        cancel: CancellationToken,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let locker = Locker::new();
        let (ad_hoc_tx, ad_hoc_rx) = mpsc::channel(8);
        let (tick_tx, tick_rx) = mpsc::channel(1);

        let cron_handle = match &trigger {
            Trigger::Schedule(expr) => Some(spawn_cron_ticker(expr.clone(), tick_tx.clone())),
            _ => None,
        };

        let handle = tokio::spawn(run_loop(
            ctx,
            trigger,
            locker.clone(),
            ad_hoc_rx,
            tick_rx,
            cron_handle,
            cancel,
        ));

        (
            Self {
                locker: locker.clone(),
                ad_hoc_tx,
            },
            handle,
        )
    }

    pub fn locker(&self) -> &Locker {
        &self.locker
    }

    /// Submits a one-shot session request (from the HTTP API).
    pub async fn trigger_ad_hoc(&self, image_filter: Option<Vec<String>>) -> Option<Report> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        if self
            .ad_hoc_tx
            .send(AdHocRequest { image_filter, reply })
            .await
            .is_err()
        {
            return None;
        }
        rx.await.unwrap_or(None)
    }
}

/// A tick source that fires `()` into `tick_tx` on every cron match. Runs on
/// its own task because `tokio_cron_scheduler`'s `start()` only returns once
/// the scheduler itself is shutting down.
fn spawn_cron_ticker(expr: String, tick_tx: mpsc::Sender<()>) -> tokio::task::JoinHandle<Option<JobScheduler>> {
    tokio::spawn(async move {
        let scheduler = match JobScheduler::new().await {
            Ok(s) => s,
            Err(e) => {
                warn!("failed to start cron scheduler: {e}");
                return None;
            }
        };

        let job = match Job::new_async(expr.as_str(), move |_uuid, _l| {
            let tick_tx = tick_tx.clone();
            Box::pin(async move {
                let _ = tick_tx.send(()).await;
            })
        }) {
            Ok(job) => job,
            Err(e) => {
                warn!("invalid cron expression {expr:?}: {e}");
                return None;
            }
        };

        if let Err(e) = scheduler.add(job).await {
            warn!("failed to register cron job: {e}");
            return None;
        }
        if let Err(e) = scheduler.start().await {
            warn!("failed to start cron scheduler: {e}");
            return None;
        }

        Some(scheduler)
    })
}

async fn run_loop(
    ctx: Arc<SessionContext>,
    trigger: Trigger,
    locker: Locker,
    mut ad_hoc_rx: mpsc::Receiver<AdHocRequest>,
    mut tick_rx: mpsc::Receiver<()>,
    cron_handle: Option<tokio::task::JoinHandle<Option<JobScheduler>>>,
    cancel: CancellationToken,
) {
    let mut interval_ticker = match &trigger {
        Trigger::Interval(period) => Some(tokio::time::interval(*period)),
        _ => None,
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("scheduler shutting down");
                break;
            }
            _ = async {
                match interval_ticker.as_mut() {
                    Some(ticker) => { ticker.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {
                run_one_tick(&ctx, &locker).await;
            }
            Some(()) = tick_rx.recv() => {
                run_one_tick(&ctx, &locker).await;
            }
            Some(request) = ad_hoc_rx.recv() => {
                let report = run_guarded(&ctx, &locker, request.image_filter).await;
                let _ = request.reply.send(report);
            }
        }
    }

    if let Some(cron_handle) = cron_handle {
        if let Ok(Some(scheduler)) = cron_handle.await {
            let _ = scheduler.shutdown().await;
        }
    }
}

async fn run_one_tick(ctx: &Arc<SessionContext>, locker: &Locker) {
    let _ = run_guarded(ctx, locker, None).await;
}

async fn run_guarded(
    ctx: &Arc<SessionContext>,
    locker: &Locker,
    image_filter: Option<Vec<String>>,
) -> Option<Report> {
    let guard = match locker.try_acquire() {
        Some(guard) => guard,
        None => {
            ctx.metrics.send(MetricEvent::ScanSkipped);
            return None;
        }
    };

    let report = session::run(ctx, image_filter).await;
    ctx.notifier.flush(&report).await;
    drop(guard);
    Some(report)
}

/// Runs exactly one session and returns it, for `--run-once`. Notification
/// flushing for this path is the caller's responsibility (`cmd::root::run`
/// flushes once after the process decides its exit code).
pub async fn run_once(ctx: &SessionContext) -> Report {
    session::run(ctx, None).await
}

pub fn shutdown_drain_ceiling() -> Duration {
    SHUTDOWN_DRAIN_CEILING
}
