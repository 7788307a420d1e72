//! Metrics & Report (C8): process-wide counters plus the per-session Report
//! consumed by the notifier pipeline.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::warn;

const QUEUE_CAPACITY: usize = 1024;

/// One outcome bucket a container can land in at session end. A container
/// appears in exactly one terminal bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Updated,
    Failed,
    Skipped,
    Stale,
    Fresh,
    Restarted,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ContainerReport {
    pub id: String,
    pub name: String,
    pub image_name: String,
    pub old_image_id: String,
    pub new_image_id: Option<String>,
    pub outcome: Outcome,
    pub error: Option<String>,
    pub monitor_only: bool,
}

/// Immutable once a session ends; the sole input (with captured log
/// entries) to notifier templates.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Report {
    pub containers: Vec<ContainerReport>,
}

impl Report {
    pub fn push(&mut self, entry: ContainerReport) {
        self.containers.push(entry);
    }

    pub fn by_outcome(&self, outcome: Outcome) -> impl Iterator<Item = &ContainerReport> {
        self.containers.iter().filter(move |c| c.outcome == outcome)
    }

    pub fn updated_count(&self) -> usize {
        self.by_outcome(Outcome::Updated).count()
    }

    pub fn failed_count(&self) -> usize {
        self.by_outcome(Outcome::Failed).count()
    }

    pub fn any_failed(&self) -> bool {
        self.failed_count() > 0
    }
}

/// One metrics event produced by the session, consumed by the single
/// background aggregator task.
#[derive(Debug, Clone)]
pub enum MetricEvent {
    SessionCompleted {
        scanned: u64,
        updated: u64,
        failed: u64,
        restarted: u64,
    },
    ScanSkipped,
}

/// Process-wide counters. Gauges reset every session; counters are
/// monotonic. Owned by a single consumer task; producers send over a
/// bounded channel so a stalled consumer can't block a session.
#[derive(Debug, Default)]
pub struct Metrics {
    pub containers_scanned: AtomicU64,
    pub containers_updated: AtomicU64,
    pub containers_failed: AtomicU64,
    pub containers_restarted: AtomicU64,
    pub scans_total: AtomicU64,
    pub scans_skipped_total: AtomicU64,
    pub containers_restarted_total: AtomicU64,
    pub metrics_dropped_total: AtomicU64,
}

impl Metrics {
    fn apply(&self, event: MetricEvent) {
        match event {
            MetricEvent::SessionCompleted {
                scanned,
                updated,
                failed,
                restarted,
            } => {
                self.containers_scanned.store(scanned, Ordering::Relaxed);
                self.containers_updated.store(updated, Ordering::Relaxed);
                self.containers_failed.store(failed, Ordering::Relaxed);
                self.containers_restarted.store(restarted, Ordering::Relaxed);
                self.scans_total.fetch_add(1, Ordering::Relaxed);
                self.containers_restarted_total.fetch_add(restarted, Ordering::Relaxed);
            }
            MetricEvent::ScanSkipped => {
                self.scans_skipped_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Prometheus text exposition.
    pub fn render(&self) -> String {
        let g = |name: &str, value: u64| format!("# TYPE {name} gauge\n{name} {value}\n");
        let c = |name: &str, value: u64| format!("# TYPE {name} counter\n{name} {value}\n");

        let mut out = String::new();
        out.push_str(&g("watchtower_containers_scanned", self.containers_scanned.load(Ordering::Relaxed)));
        out.push_str(&g("watchtower_containers_updated", self.containers_updated.load(Ordering::Relaxed)));
        out.push_str(&g("watchtower_containers_failed", self.containers_failed.load(Ordering::Relaxed)));
        out.push_str(&g("watchtower_containers_restarted", self.containers_restarted.load(Ordering::Relaxed)));
        out.push_str(&c("watchtower_scans_total", self.scans_total.load(Ordering::Relaxed)));
        out.push_str(&c("watchtower_scans_skipped_total", self.scans_skipped_total.load(Ordering::Relaxed)));
        out.push_str(&c(
            "watchtower_containers_restarted_total",
            self.containers_restarted_total.load(Ordering::Relaxed),
        ));
        out.push_str(&c("watchtower_metrics_dropped_total", self.metrics_dropped_total.load(Ordering::Relaxed)));
        out
    }
}

/// Handle producers hold; sending never blocks, a full queue just drops the
/// event and counts it.
#[derive(Clone)]
pub struct MetricsSink {
    tx: mpsc::Sender<MetricEvent>,
    dropped: std::sync::Arc<AtomicU64>,
}

impl MetricsSink {
    pub fn send(&self, event: MetricEvent) {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("metrics queue full, dropping event");
        }
    }
}

/// Spawns the single metrics aggregator task and returns the shared
/// `Metrics` (read by the HTTP API) plus a cloneable sink (written by
/// sessions).
pub fn spawn(
    metrics: std::sync::Arc<Metrics>,
) -> (MetricsSink, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(QUEUE_CAPACITY);
    let dropped = std::sync::Arc::new(AtomicU64::new(0));
    let dropped_for_sink = dropped.clone();

    let handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            metrics.apply(event);
            metrics
                .metrics_dropped_total
                .store(dropped.load(Ordering::Relaxed), Ordering::Relaxed);
        }
    });

    (
        MetricsSink {
            tx,
            dropped: dropped_for_sink,
        },
        handle,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_buckets_count_independently() {
        let mut report = Report::default();
        report.push(ContainerReport {
            id: "a".into(),
            name: "a".into(),
            image_name: "x".into(),
            old_image_id: "1".into(),
            new_image_id: Some("2".into()),
            outcome: Outcome::Updated,
            error: None,
            monitor_only: false,
        });
        report.push(ContainerReport {
            id: "b".into(),
            name: "b".into(),
            image_name: "y".into(),
            old_image_id: "1".into(),
            new_image_id: None,
            outcome: Outcome::Failed,
            error: Some("boom".into()),
            monitor_only: false,
        });

        assert_eq!(report.updated_count(), 1);
        assert_eq!(report.failed_count(), 1);
        assert!(report.any_failed());
    }

    #[tokio::test]
    async fn aggregator_applies_session_events() {
        let metrics = std::sync::Arc::new(Metrics::default());
        let (sink, handle) = spawn(metrics.clone());
        sink.send(MetricEvent::SessionCompleted {
            scanned: 3,
            updated: 1,
            failed: 0,
            restarted: 1,
        });
        drop(sink);
        handle.await.unwrap();

        assert_eq!(metrics.containers_scanned.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.scans_total.load(Ordering::Relaxed), 1);
        assert!(metrics.render().contains("watchtower_containers_scanned 3"));
    }
}
