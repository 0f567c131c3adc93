//! Per-build progress and stage tracking.
//!
//! Purely observational: consumers (UIs, log shippers) read it, but nothing
//! in the lifecycle gates on it, and dropping a report never affects job
//! correctness. Reports that would violate the tracker's invariants
//! (percent regressions, stages after a terminal stage) are dropped rather
//! than rejected.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

/// Stages a build moves through, in the order a full pure build reports
/// them. `completed` and `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStage {
    Cloning,
    Detecting,
    Generating,
    CalculatingHash,
    Building,
    Pushing,
    Completed,
    Failed,
}

impl BuildStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cloning => "cloning",
            Self::Detecting => "detecting",
            Self::Generating => "generating",
            Self::CalculatingHash => "calculating_hash",
            Self::Building => "building",
            Self::Pushing => "pushing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for BuildStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded percent report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub percent: u8,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// One recorded stage report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: BuildStage,
    pub timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct History {
    progress: Vec<ProgressReport>,
    stages: Vec<StageReport>,
}

impl History {
    fn terminal(&self) -> bool {
        self.stages.last().map(|s| s.stage.is_terminal()).unwrap_or(false)
    }
}

/// Per-build histories are capped so a chatty driver cannot grow memory
/// without bound; the oldest entries are dropped first.
const HISTORY_CAP: usize = 1000;

/// Shared tracker of per-build progress, keyed by job id. Histories across
/// builds are isolated.
#[derive(Default)]
pub struct ProgressTracker {
    histories: RwLock<HashMap<String, History>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a percent report. Values above 100 are clamped; a report
    /// below the build's current maximum is dropped so the recorded
    /// sequence stays non-decreasing.
    pub async fn report_progress(&self, build_id: &str, percent: u8, message: impl Into<String>) {
        if build_id.is_empty() {
            return;
        }
        let percent = percent.min(100);
        let mut histories = self.histories.write().await;
        let history = histories.entry(build_id.to_string()).or_default();

        if let Some(last) = history.progress.last() {
            if percent < last.percent {
                debug!(
                    build_id = %build_id,
                    percent,
                    last = last.percent,
                    "dropping regressive progress report"
                );
                return;
            }
        }

        history.progress.push(ProgressReport {
            percent,
            message: message.into(),
            timestamp: Utc::now(),
        });
        if history.progress.len() > HISTORY_CAP {
            history.progress.remove(0);
        }
    }

    /// Record a stage report. Reports after a terminal stage are dropped.
    pub async fn report_stage(&self, build_id: &str, stage: BuildStage) {
        if build_id.is_empty() {
            return;
        }
        let mut histories = self.histories.write().await;
        let history = histories.entry(build_id.to_string()).or_default();

        if history.terminal() {
            debug!(build_id = %build_id, stage = %stage, "dropping stage report after terminal stage");
            return;
        }

        history.stages.push(StageReport {
            stage,
            timestamp: Utc::now(),
        });
        if history.stages.len() > HISTORY_CAP {
            history.stages.remove(0);
        }
    }

    pub async fn history_progress(&self, build_id: &str) -> Vec<ProgressReport> {
        self.histories
            .read()
            .await
            .get(build_id)
            .map(|h| h.progress.clone())
            .unwrap_or_default()
    }

    pub async fn history_stage(&self, build_id: &str) -> Vec<StageReport> {
        self.histories
            .read()
            .await
            .get(build_id)
            .map(|h| h.stages.clone())
            .unwrap_or_default()
    }

    /// The most recent stage for a build, when any was reported.
    pub async fn last_stage(&self, build_id: &str) -> Option<BuildStage> {
        self.histories
            .read()
            .await
            .get(build_id)
            .and_then(|h| h.stages.last())
            .map(|s| s.stage)
    }

    /// Whether the recorded percent sequence is non-decreasing. An empty
    /// history is vacuously monotonic.
    pub async fn is_monotonic(&self, build_id: &str) -> bool {
        let histories = self.histories.read().await;
        let Some(history) = histories.get(build_id) else {
            return true;
        };
        history
            .progress
            .windows(2)
            .all(|pair| pair[0].percent <= pair[1].percent)
    }

    /// True iff the last reported stage is `completed` or `failed`.
    pub async fn has_terminal_stage(&self, build_id: &str) -> bool {
        self.histories
            .read()
            .await
            .get(build_id)
            .map(|h| h.terminal())
            .unwrap_or(false)
    }

    /// Drop a build's history (retention is external; this is for tests
    /// and explicit cleanup).
    pub async fn forget(&self, build_id: &str) {
        self.histories.write().await.remove(build_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_progress_history_in_order() {
        let tracker = ProgressTracker::new();
        tracker.report_progress("b1", 10, "cloning").await;
        tracker.report_progress("b1", 40, "building").await;
        tracker.report_progress("b1", 100, "done").await;

        let history = tracker.history_progress("b1").await;
        let percents: Vec<u8> = history.iter().map(|p| p.percent).collect();
        assert_eq!(percents, vec![10, 40, 100]);
        assert!(tracker.is_monotonic("b1").await);
    }

    #[tokio::test]
    async fn test_regressive_reports_dropped() {
        let tracker = ProgressTracker::new();
        tracker.report_progress("b1", 50, "halfway").await;
        tracker.report_progress("b1", 30, "regression").await;
        tracker.report_progress("b1", 50, "equal is fine").await;

        let history = tracker.history_progress("b1").await;
        let percents: Vec<u8> = history.iter().map(|p| p.percent).collect();
        assert_eq!(percents, vec![50, 50]);
        assert!(tracker.is_monotonic("b1").await);
    }

    #[tokio::test]
    async fn test_percent_clamped_to_100() {
        let tracker = ProgressTracker::new();
        tracker.report_progress("b1", 250, "overshoot").await;
        assert_eq!(tracker.history_progress("b1").await[0].percent, 100);
    }

    #[tokio::test]
    async fn test_histories_are_isolated() {
        let tracker = ProgressTracker::new();
        tracker.report_progress("b1", 10, "one").await;
        tracker.report_stage("b1", BuildStage::Building).await;
        tracker.report_progress("b2", 90, "two").await;

        assert_eq!(tracker.history_progress("b1").await.len(), 1);
        assert_eq!(tracker.history_progress("b2").await.len(), 1);
        assert!(tracker.history_stage("b2").await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_history_is_vacuously_monotonic() {
        let tracker = ProgressTracker::new();
        assert!(tracker.is_monotonic("never-seen").await);
        assert!(!tracker.has_terminal_stage("never-seen").await);
    }

    #[tokio::test]
    async fn test_terminal_stage_semantics() {
        let tracker = ProgressTracker::new();
        tracker.report_stage("b1", BuildStage::Building).await;
        assert!(!tracker.has_terminal_stage("b1").await);

        tracker.report_stage("b1", BuildStage::Completed).await;
        assert!(tracker.has_terminal_stage("b1").await);
        assert_eq!(tracker.last_stage("b1").await, Some(BuildStage::Completed));
    }

    #[tokio::test]
    async fn test_stages_after_terminal_are_dropped() {
        let tracker = ProgressTracker::new();
        tracker.report_stage("b1", BuildStage::Failed).await;
        tracker.report_stage("b1", BuildStage::Building).await;

        let stages: Vec<BuildStage> =
            tracker.history_stage("b1").await.iter().map(|s| s.stage).collect();
        assert_eq!(stages, vec![BuildStage::Failed]);
    }

    #[tokio::test]
    async fn test_pure_build_stage_ordering() {
        let tracker = ProgressTracker::new();
        for stage in [
            BuildStage::Cloning,
            BuildStage::Detecting,
            BuildStage::CalculatingHash,
            BuildStage::Building,
            BuildStage::Pushing,
            BuildStage::Completed,
        ] {
            tracker.report_stage("b1", stage).await;
        }

        let stages: Vec<BuildStage> =
            tracker.history_stage("b1").await.iter().map(|s| s.stage).collect();
        let building = stages.iter().position(|s| *s == BuildStage::Building).unwrap();
        let pushing = stages.iter().position(|s| *s == BuildStage::Pushing).unwrap();
        let completed = stages.iter().position(|s| *s == BuildStage::Completed).unwrap();
        assert!(building < pushing && pushing < completed);
    }

    #[tokio::test]
    async fn test_history_cap() {
        let tracker = ProgressTracker::new();
        for _ in 0..(HISTORY_CAP + 10) {
            tracker.report_progress("b1", 50, "tick").await;
        }
        assert_eq!(tracker.history_progress("b1").await.len(), HISTORY_CAP);
    }

    #[tokio::test]
    async fn test_stage_serde_wire_form() {
        let json = serde_json::to_string(&BuildStage::CalculatingHash).unwrap();
        assert_eq!(json, "\"calculating_hash\"");
    }
}
