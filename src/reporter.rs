//! The single hook the Result Collector fires on task completion (spec
//! §4.7). Fire-and-forget: a reporter failure never reverts task state.

use crate::models::TaskSummary;
use async_trait::async_trait;

#[async_trait]
pub trait Reporter: Send + Sync {
    async fn on_task_completed(&self, summary: &TaskSummary);
}

/// Default, in-tree reporter: logs the summary at info level. Good enough
/// for a standalone controller with no external notification sink wired up;
/// a richer reporter (email, webhook) plugs in behind the same trait.
pub struct LoggingReporter;

#[async_trait]
impl Reporter for LoggingReporter {
    async fn on_task_completed(&self, summary: &TaskSummary) {
        tracing::info!(
            task_id = summary.task_id,
            name = %summary.name,
            verdict = %summary.verdict,
            elapsed = summary.elapsed,
            "task completed"
        );
        for agent in &summary.per_agent {
            tracing::info!(
                task_id = summary.task_id,
                agent = %agent.agent,
                successful = agent.successful,
                total = agent.total,
                "per-agent rollup"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn logging_reporter_does_not_panic_on_an_empty_summary() {
        let reporter = LoggingReporter;
        let summary = TaskSummary {
            task_id: 1,
            name: "smoke".into(),
            verdict: crate::models::TaskStatus::Completed,
            started_at: Some(Utc::now()),
            completed_at: Utc::now(),
            elapsed: Some(1.5),
            per_agent: vec![],
        };
        reporter.on_task_completed(&summary).await;
    }
}
