use crate::monitor::RunMetrics;
use arbor_core::{ArborError, ArborResult, JsonMap, NodeId, NodeStatus, RunId, RunStatus};
use arbor_graph::NodeError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::watch;

/// Outcome of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    /// Id of the run.
    pub run_id: RunId,
    /// Root node of the run.
    pub root_node_id: NodeId,
    /// Final status.
    pub status: RunStatus,
    /// When the run was submitted.
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration.
    pub duration_seconds: f64,
    /// Outputs of the root node, for a completed run.
    pub result: Option<JsonMap>,
    /// Why the run failed.
    pub error: Option<NodeError>,
    /// Node count per final status.
    pub node_statistics: BTreeMap<NodeStatus, usize>,
    /// Model and action counters.
    pub metrics: RunMetrics,
}

impl RunReport {
    /// Whether the run completed.
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Number of nodes the run created.
    pub fn total_nodes(&self) -> usize {
        self.node_statistics.values().sum()
    }
}

/// Handle to a submitted run.
pub struct RunHandle {
    run_id: RunId,
    root_node_id: NodeId,
    report: watch::Receiver<Option<RunReport>>,
}

impl RunHandle {
    pub(crate) fn new(
        run_id: RunId,
        root_node_id: NodeId,
        report: watch::Receiver<Option<RunReport>>,
    ) -> Self {
        Self {
            run_id,
            root_node_id,
            report,
        }
    }

    /// Id of the run being waited on.
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Root node of the run.
    pub fn root_node_id(&self) -> NodeId {
        self.root_node_id
    }

    /// The report, if the run has finished.
    pub fn try_report(&self) -> Option<RunReport> {
        self.report.borrow().clone()
    }

    /// Wait for the run to finish.
    ///
    /// Fails if the orchestrator is dropped before the run finishes.
    pub async fn wait(mut self) -> ArborResult<RunReport> {
        loop {
            let current = self.report.borrow_and_update().clone();
            if let Some(report) = current {
                return Ok(report);
            }
            self.report.changed().await.map_err(|_| {
                ArborError::Bus(format!("run {} was abandoned before finishing", self.run_id))
            })?;
        }
    }
}
