use arbor_core::RunId;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Counters for one run, reported in `RunFinished`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RunMetrics {
    /// Model calls made.
    pub llm_calls: u64,
    /// Model calls that failed.
    pub llm_errors: u64,
    /// Tokens reported by the model.
    pub total_tokens: u64,
    /// Time spent in model calls.
    pub llm_duration_ms: u64,
    /// Action invocations.
    pub tool_calls: u64,
    /// Action invocations that did not succeed.
    pub tool_errors: u64,
    /// Time spent in actions.
    pub tool_duration_ms: u64,
}

/// Tracks model and action usage per run.
#[derive(Clone)]
pub struct RunMonitor {
    runs: Arc<RwLock<HashMap<RunId, RunMetrics>>>,
}

impl RunMonitor {
    /// An empty monitor.
    pub fn new() -> Self {
        Self {
            runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start tracking `run_id`. Calls for runs that were never begun, or
    /// were already removed, are not recorded.
    pub async fn begin(&self, run_id: RunId) {
        self.runs.write().await.entry(run_id).or_default();
    }

    /// Whether `run_id` is being tracked.
    pub async fn is_tracked(&self, run_id: RunId) -> bool {
        self.runs.read().await.contains_key(&run_id)
    }

    /// Record one model call.
    pub async fn record_llm_call(
        &self,
        run_id: RunId,
        duration: Duration,
        tokens: Option<u64>,
        failed: bool,
    ) {
        let mut runs = self.runs.write().await;
        let Some(metrics) = runs.get_mut(&run_id) else {
            return;
        };
        metrics.llm_calls += 1;
        metrics.total_tokens += tokens.unwrap_or(0);
        metrics.llm_duration_ms += duration.as_millis() as u64;
        if failed {
            metrics.llm_errors += 1;
        }
    }

    /// Record one action invocation.
    pub async fn record_tool_call(&self, run_id: RunId, duration: Duration, failed: bool) {
        let mut runs = self.runs.write().await;
        let Some(metrics) = runs.get_mut(&run_id) else {
            return;
        };
        metrics.tool_calls += 1;
        metrics.tool_duration_ms += duration.as_millis() as u64;
        if failed {
            metrics.tool_errors += 1;
        }
    }

    /// Metrics of one run; zeroes for an unknown run.
    pub async fn get(&self, run_id: RunId) -> RunMetrics {
        self.runs
            .read()
            .await
            .get(&run_id)
            .copied()
            .unwrap_or_default()
    }

    /// Drop the metrics of a finished run.
    pub async fn remove(&self, run_id: RunId) -> RunMetrics {
        self.runs
            .write()
            .await
            .remove(&run_id)
            .unwrap_or_default()
    }

    /// Sum over all tracked runs.
    pub async fn aggregate(&self) -> RunMetrics {
        let runs = self.runs.read().await;
        let mut total = RunMetrics::default();
        for m in runs.values() {
            total.llm_calls += m.llm_calls;
            total.llm_errors += m.llm_errors;
            total.total_tokens += m.total_tokens;
            total.llm_duration_ms += m.llm_duration_ms;
            total.tool_calls += m.tool_calls;
            total.tool_errors += m.tool_errors;
            total.tool_duration_ms += m.tool_duration_ms;
        }
        total
    }

    /// Serialize the tracked runs (for a dashboard).
    pub async fn to_json(&self) -> serde_json::Value {
        let runs: HashMap<String, RunMetrics> = self
            .runs
            .read()
            .await
            .iter()
            .map(|(id, m)| (id.to_string(), *m))
            .collect();
        let aggregate = self.aggregate().await;
        serde_json::json!({
            "runs": runs,
            "aggregate": aggregate,
        })
    }
}

impl Default for RunMonitor {
    fn default() -> Self {
        Self::new()
    }
}
