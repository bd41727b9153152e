use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use jobradar_core::{CrawlRun, FailedSource, NormalizedPosting};
use serde::Serialize;
use tokio::fs;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub attempted: Vec<String>,
    pub succeeded: Vec<String>,
    pub failed: Vec<FailedSource>,
    pub skipped: Vec<String>,
    pub inserted_count: u64,
    pub updated_count: u64,
    pub alerts: Vec<String>,
}

impl RunSummary {
    pub fn from_run(run: &CrawlRun) -> Self {
        let mut alerts: Vec<String> = run
            .sources_failed
            .iter()
            .map(|f| format!("source {} failed: {}", f.source, f.error))
            .collect();
        if run.inserted_count == 0 && !run.sources_attempted.is_empty() {
            alerts.push("run inserted no new postings".to_string());
        }
        Self {
            run_id: run.run_id,
            attempted: run.sources_attempted.clone(),
            succeeded: run.sources_succeeded.clone(),
            failed: run.sources_failed.clone(),
            skipped: run.sources_skipped.clone(),
            inserted_count: run.inserted_count,
            updated_count: run.updated_count,
            alerts,
        }
    }
}

/// Delivery of new postings after a run. Failures are logged by the caller and
/// never fail the run.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, postings: &[NormalizedPosting], summary: &RunSummary) -> Result<()>;
}

/// Postings at or above `min_score`, best first.
pub fn select_for_notification(postings: &[NormalizedPosting], min_score: f64) -> Vec<NormalizedPosting> {
    let mut selected: Vec<NormalizedPosting> = postings
        .iter()
        .filter(|p| p.relevance_score >= min_score)
        .cloned()
        .collect();
    selected.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));
    selected
}

pub fn dispatch(
    notifier: Arc<dyn Notifier>,
    postings: Vec<NormalizedPosting>,
    summary: RunSummary,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = notifier.notify(&postings, &summary).await {
            warn!(run_id = %summary.run_id, error = %format!("{err:#}"), "notifier failed");
        }
    })
}

/// Writes a markdown brief and the new postings under `reports/<run_id>/`.
#[derive(Debug, Clone)]
pub struct ReportNotifier {
    workspace_root: PathBuf,
}

impl ReportNotifier {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
        }
    }

    pub fn reports_dir(&self, run_id: Uuid) -> PathBuf {
        self.workspace_root.join("reports").join(run_id.to_string())
    }
}

#[async_trait]
impl Notifier for ReportNotifier {
    async fn notify(&self, postings: &[NormalizedPosting], summary: &RunSummary) -> Result<()> {
        let reports_dir = self.reports_dir(summary.run_id);
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let mut source_counts: BTreeMap<&str, usize> = BTreeMap::new();
        for posting in postings {
            *source_counts.entry(posting.source.as_str()).or_default() += 1;
        }

        let bullet = |lines: Vec<String>| {
            if lines.is_empty() {
                "- none".to_string()
            } else {
                lines.join("\n")
            }
        };

        let brief = format!(
            "# jobradar run brief\n\n- Run ID: `{}`\n- Attempted: {}\n- Succeeded: {}\n- Skipped: {}\n- Inserted: {}\n- Updated: {}\n\n## Alerts\n{}\n\n## New postings by source\n{}\n\n## Top postings\n{}\n",
            summary.run_id,
            summary.attempted.len(),
            summary.succeeded.len(),
            summary.skipped.len(),
            summary.inserted_count,
            summary.updated_count,
            bullet(summary.alerts.iter().map(|a| format!("- {a}")).collect()),
            bullet(
                source_counts
                    .iter()
                    .map(|(k, v)| format!("- {k}: {v}"))
                    .collect()
            ),
            bullet(
                postings
                    .iter()
                    .take(20)
                    .map(|p| format!(
                        "- [{:.1}] {} at {} ({})",
                        p.relevance_score,
                        p.title,
                        p.company,
                        p.url.as_deref().unwrap_or("no url")
                    ))
                    .collect()
            ),
        );
        fs::write(reports_dir.join("run_brief.md"), brief)
            .await
            .context("writing run_brief.md")?;

        let json = serde_json::to_vec_pretty(&serde_json::json!({
            "summary": summary,
            "postings": postings,
        }))
        .context("serializing new postings")?;
        fs::write(reports_dir.join("new_postings.json"), json)
            .await
            .context("writing new_postings.json")?;

        info!(run_id = %summary.run_id, dir = %reports_dir.display(), count = postings.len(), "wrote run report");
        Ok(())
    }
}
