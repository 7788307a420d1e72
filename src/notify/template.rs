//! Renders a session {Report, Entries, StaticData{Title,Host}} once into a
//! plain-text message shared by every transport.

use crate::metrics::{Outcome, Report};
use crate::notify::LogEntry;

pub fn render(report: &Report, entries: &[LogEntry], title: &str, host: &str) -> String {
    let mut out = format!("{title} ({host}): {} container(s) scanned\n", report.containers.len());

    for outcome in [Outcome::Updated, Outcome::Restarted, Outcome::Failed, Outcome::Stale] {
        let matching: Vec<_> = report.by_outcome(outcome).collect();
        if matching.is_empty() {
            continue;
        }
        out.push_str(&format!("\n{outcome:?}:\n"));
        for c in matching {
            match (&c.error, &c.new_image_id) {
                (Some(err), _) => out.push_str(&format!("  - {} ({}): {err}\n", c.name, c.image_name)),
                (None, Some(new_id)) => {
                    out.push_str(&format!("  - {} ({}): {} -> {new_id}\n", c.name, c.image_name, c.old_image_id))
                }
                (None, None) => out.push_str(&format!("  - {} ({})\n", c.name, c.image_name)),
            }
        }
    }

    if !entries.is_empty() {
        out.push_str("\nLog:\n");
        for entry in entries {
            out.push_str(&format!("  [{:?}] {}\n", entry.level, entry.message));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ContainerReport;

    #[test]
    fn renders_updated_bucket() {
        let mut report = Report::default();
        report.push(ContainerReport {
            id: "1".into(),
            name: "web".into(),
            image_name: "nginx:latest".into(),
            old_image_id: "sha256:aaa".into(),
            new_image_id: Some("sha256:bbb".into()),
            outcome: Outcome::Updated,
            error: None,
            monitor_only: false,
        });

        let rendered = render(&report, &[], "containerwatch", "host1");
        assert!(rendered.contains("web (nginx:latest): sha256:aaa -> sha256:bbb"));
    }
}
