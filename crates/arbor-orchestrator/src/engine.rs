use crate::config::OrchestratorConfig;
use crate::monitor::RunMonitor;
use crate::planner::{ActionCall, Decision, PlanContext, Planner, Step};
use crate::run::{RunHandle, RunReport};
use arbor_actions::builtins::FINISH;
use arbor_actions::{truncate, ActionContext, ActionExecutor, ActionResult};
use arbor_core::{
    ArborError, ArborResult, JsonMap, NodeId, NodeStatus, NodeType, RunId, RunStatus,
};
use arbor_events::payload::{
    EdgeAdded, InnerGraphBuilt, NodeAdded, NodeStatusChanged, RunError, RunFinished, RunStarted,
    SubtasksPlanned, TaskAssigned, TaskCompleted, TaskFailed, TaskReady, TaskResultAvailable,
    TaskStarted, TaskSubmitted, ToolInvoked, ToolReturned,
};
use arbor_events::{
    correlation, Delivery, Event, EventBus, EventFilter, EventHandler, EventPayload, EventType,
    SubscriptionId,
};
use arbor_graph::{ChildPlan, NewNode, Node, NodeError, TaskGraph, Transition};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const SUMMARY_CHARS: usize = 256;

/// Lifecycle events the loop reacts to.
const HANDLED: [EventType; 6] = [
    EventType::TaskSubmitted,
    EventType::TaskReady,
    EventType::TaskAssigned,
    EventType::SubtasksPlanned,
    EventType::TaskCompleted,
    EventType::TaskFailed,
];

/// The event-driven orchestration loop.
///
/// Subscribes to the lifecycle events on the task topic and drives every
/// node of a run through `NOT_READY -> READY -> ASSIGNED -> RUNNING ->
/// COMPLETED | FAILED`, asking the [`Planner`] what READY nodes should do and
/// running actions through the [`ActionExecutor`]. All state changes are
/// published back onto the bus, so observers see exactly what the loop did.
///
/// Handlers are idempotent: each event id is handled once per run, and
/// transitions that were already applied are skipped.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    bus: EventBus,
    graph: Arc<TaskGraph>,
    executor: ActionExecutor,
    planner: Arc<dyn Planner>,
    config: OrchestratorConfig,
    monitor: RunMonitor,
    runs: Mutex<HashMap<NodeId, RunState>>,
    decisions: Mutex<HashMap<NodeId, Decision>>,
    processed: Mutex<HashMap<RunId, HashSet<Uuid>>>,
    slots: Arc<Semaphore>,
    workers: TaskTracker,
    shutdown: CancellationToken,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    next_worker: AtomicU64,
}

struct RunState {
    run_id: RunId,
    started_at: DateTime<Utc>,
    started: Instant,
    cancel: CancellationToken,
    report: watch::Sender<Option<RunReport>>,
}

impl Orchestrator {
    /// Create an orchestrator with its own [`RunMonitor`].
    pub fn new(
        bus: EventBus,
        executor: ActionExecutor,
        planner: Arc<dyn Planner>,
        config: OrchestratorConfig,
    ) -> ArborResult<Self> {
        Self::with_monitor(bus, executor, planner, config, RunMonitor::new())
    }

    /// Create with a shared monitor, e.g. one also fed by an
    /// [`InstrumentedModel`](crate::InstrumentedModel).
    pub fn with_monitor(
        bus: EventBus,
        executor: ActionExecutor,
        planner: Arc<dyn Planner>,
        config: OrchestratorConfig,
        monitor: RunMonitor,
    ) -> ArborResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                slots: Arc::new(Semaphore::new(config.max_concurrency)),
                bus,
                graph: Arc::new(TaskGraph::new()),
                executor,
                planner,
                config,
                monitor,
                runs: Mutex::new(HashMap::new()),
                decisions: Mutex::new(HashMap::new()),
                processed: Mutex::new(HashMap::new()),
                workers: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                subscriptions: Mutex::new(Vec::new()),
                next_worker: AtomicU64::new(1),
            }),
        })
    }

    /// The authoritative task graph.
    pub fn graph(&self) -> &Arc<TaskGraph> {
        &self.inner.graph
    }

    /// Per-run call counters.
    pub fn monitor(&self) -> &RunMonitor {
        &self.inner.monitor
    }

    /// Settings the orchestrator was built with.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// The bus the orchestrator publishes on.
    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Root node ids of runs still in progress.
    pub fn active_runs(&self) -> Vec<NodeId> {
        self.inner.runs.lock().keys().copied().collect()
    }

    /// Subscribe the lifecycle handlers. Calling again is a no-op.
    pub fn start(&self) -> ArborResult<()> {
        let mut subscriptions = self.inner.subscriptions.lock();
        if !subscriptions.is_empty() {
            return Ok(());
        }
        let handler: Arc<dyn EventHandler> = Arc::new(Lifecycle {
            inner: self.inner.clone(),
        });
        for event_type in HANDLED {
            let id = self.inner.bus.subscribe_with(
                &self.inner.config.topic,
                EventFilter::Only(event_type),
                handler.clone(),
            )?;
            subscriptions.push(id);
        }
        info!(topic = %self.inner.config.topic, "Orchestrator started");
        Ok(())
    }

    /// Start a run for `goal`.
    pub async fn submit(
        &self,
        goal: impl Into<String>,
        task_type: impl Into<String>,
    ) -> ArborResult<RunHandle> {
        self.submit_node(NewNode::new(goal, task_type, NodeType::Plan))
            .await
    }

    /// Start a run whose root is `root`.
    pub async fn submit_node(&self, root: NewNode) -> ArborResult<RunHandle> {
        self.start()?;
        let run_id = Uuid::new_v4();
        let root_id = root.node_id;
        let (tx, rx) = watch::channel(None);
        self.inner.runs.lock().insert(
            root_id,
            RunState {
                run_id,
                started_at: Utc::now(),
                started: Instant::now(),
                cancel: self.inner.shutdown.child_token(),
                report: tx,
            },
        );
        self.inner.monitor.begin(run_id).await;
        info!(run_id = %run_id, root_node_id = %root_id, goal = %root.goal, "Submitting run");

        let published = self.inner.publish_submission(run_id, root).await;
        if let Err(e) = published {
            self.inner.runs.lock().remove(&root_id);
            self.inner.monitor.remove(run_id).await;
            return Err(e);
        }
        Ok(RunHandle::new(run_id, root_id, rx))
    }

    /// Submit a run and wait for its report.
    pub async fn run(
        &self,
        goal: impl Into<String>,
        task_type: impl Into<String>,
    ) -> ArborResult<RunReport> {
        self.submit(goal, task_type).await?.wait().await
    }

    /// Fail a run in progress. Running actions are cancelled.
    pub async fn abort(&self, root_node_id: NodeId, reason: &str) -> ArborResult<()> {
        self.inner
            .finish_run(
                root_node_id,
                RunStatus::Failed,
                None,
                Some((
                    None,
                    NodeError {
                        error_type: "cancelled".into(),
                        message: reason.to_string(),
                    },
                )),
            )
            .await
    }

    /// Abort active runs, unsubscribe and wait for in-flight work.
    pub async fn shutdown(&self) {
        for root in self.active_runs() {
            if let Err(e) = self.abort(root, "orchestrator shutting down").await {
                warn!(root_node_id = %root, error = %e, "Failed to report aborted run");
            }
        }
        for id in self.inner.subscriptions.lock().drain(..) {
            self.inner.bus.unsubscribe(id);
        }
        self.inner.shutdown.cancel();
        self.inner.workers.close();
        self.inner.workers.wait().await;
        info!("Orchestrator stopped");
    }
}

struct Lifecycle {
    inner: Arc<Inner>,
}

#[async_trait]
impl EventHandler for Lifecycle {
    async fn handle(&self, delivery: Delivery) -> ArborResult<()> {
        let Event {
            event_id,
            run_id,
            payload,
            ..
        } = delivery.event;
        if self.inner.seen(run_id, event_id) {
            debug!(event_id = %event_id, "Event already handled, skipping");
            return Ok(());
        }
        match payload {
            EventPayload::TaskSubmitted(p) => self.inner.on_submitted(run_id, p).await?,
            EventPayload::TaskReady(p) => self.inner.on_ready(p).await?,
            EventPayload::TaskAssigned(p) => self.inner.on_assigned(p),
            EventPayload::SubtasksPlanned(p) => self.inner.on_subtasks_planned(p).await?,
            EventPayload::TaskCompleted(p) => self.inner.on_completed(p).await?,
            EventPayload::TaskFailed(p) => self.inner.on_failed(p).await?,
            other => debug!(event_type = %other.event_type(), "Ignoring event"),
        }
        self.inner.mark_seen(run_id, event_id);
        Ok(())
    }
}

impl Inner {
    // --- Bookkeeping ---

    fn seen(&self, run_id: RunId, event_id: Uuid) -> bool {
        self.processed
            .lock()
            .get(&run_id)
            .is_some_and(|ids| ids.contains(&event_id))
    }

    fn mark_seen(&self, run_id: RunId, event_id: Uuid) {
        self.processed
            .lock()
            .entry(run_id)
            .or_default()
            .insert(event_id);
    }

    /// Context of an active run, `None` once it finished.
    fn plan_context(&self, root: NodeId) -> Option<PlanContext> {
        self.runs.lock().get(&root).map(|state| PlanContext {
            run_id: state.run_id,
            root_node_id: root,
            cancel: state.cancel.clone(),
        })
    }

    fn node(&self, id: NodeId) -> Option<Node> {
        let node = self.graph.get(id);
        if node.is_none() {
            warn!(node_id = %id, "Event refers to an unknown node, ignoring");
        }
        node
    }

    /// Apply a transition; a node that moved on concurrently is not an error.
    fn apply(&self, id: NodeId, to: NodeStatus) -> ArborResult<Option<Transition>> {
        match self.graph.transition(id, to) {
            Err(ArborError::IllegalTransition { from, .. }) => {
                debug!(node_id = %id, from = %from, to = %to, "Node moved on, skipping transition");
                Ok(None)
            }
            other => other,
        }
    }

    // --- Publishing ---

    async fn emit(&self, run_id: RunId, payload: impl Into<EventPayload>) -> ArborResult<Event> {
        self.bus
            .emit(&self.config.topic, &self.config.source_service, run_id, payload)
            .await
    }

    async fn emit_transition(&self, run_id: RunId, t: &Transition) -> ArborResult<()> {
        self.emit(
            run_id,
            NodeStatusChanged {
                node_id: t.node_id,
                node_nid: t.node_nid.clone(),
                node_goal: t.goal.clone(),
                old_status: t.from,
                new_status: t.to,
                task_type: t.task_type.clone(),
            },
        )
        .await?;
        Ok(())
    }

    async fn publish_submission(&self, run_id: RunId, root: NewNode) -> ArborResult<()> {
        let config = match serde_json::to_value(&self.config)? {
            serde_json::Value::Object(map) => map,
            _ => JsonMap::new(),
        };
        self.emit(
            run_id,
            RunStarted {
                root_node_id: root.node_id,
                goal: root.goal.clone(),
                task_type: root.task_type.clone(),
                config,
            },
        )
        .await?;
        self.emit(
            run_id,
            TaskSubmitted {
                node_id: root.node_id,
                node_nid: "0".to_string(),
                node_type: root.node_type,
                task_type: root.task_type,
                goal: root.goal,
                layer: 0,
                outer_node_id: None,
                root_node_id: root.node_id,
                metadata: root.metadata,
            },
        )
        .await?;
        Ok(())
    }

    // --- Node outcomes ---

    /// NOT_READY -> READY when dependencies allow, announcing `TaskReady`.
    async fn promote(&self, run_id: RunId, root: NodeId, id: NodeId) -> ArborResult<()> {
        if let Some(t) = self.graph.promote_if_ready(id)? {
            self.emit_transition(run_id, &t).await?;
            self.emit(
                run_id,
                TaskReady {
                    node_id: id,
                    root_node_id: root,
                },
            )
            .await?;
        }
        Ok(())
    }

    async fn complete_node(
        &self,
        run_id: RunId,
        node: &Node,
        action_name: Option<String>,
        result: JsonMap,
    ) -> ArborResult<()> {
        let applied = match self.graph.complete(node.node_id, result.clone()) {
            Err(ArborError::IllegalTransition { from, .. }) => {
                debug!(node_id = %node.node_id, from = %from, "Node no longer running, dropping result");
                None
            }
            other => other?,
        };
        let Some(t) = applied else {
            return Ok(());
        };
        info!(node_id = %node.node_id, nid = %node.node_nid, "Node completed");
        self.emit_transition(run_id, &t).await?;
        let summary = truncate(
            &serde_json::Value::Object(result.clone()).to_string(),
            SUMMARY_CHARS,
        );
        self.emit(
            run_id,
            TaskCompleted {
                node_id: node.node_id,
                root_node_id: node.root_node_id,
                result,
            },
        )
        .await?;
        self.emit(
            run_id,
            TaskResultAvailable {
                node_id: node.node_id,
                root_node_id: node.root_node_id,
                action_name,
                result_summary: summary,
            },
        )
        .await?;
        Ok(())
    }

    async fn fail_node(
        &self,
        run_id: RunId,
        root: NodeId,
        id: NodeId,
        error_type: &str,
        message: String,
        context: Option<JsonMap>,
    ) -> ArborResult<()> {
        let error = NodeError {
            error_type: error_type.to_string(),
            message: message.clone(),
        };
        let applied = match self.graph.fail(id, error) {
            Err(ArborError::IllegalTransition { from, .. }) => {
                debug!(node_id = %id, from = %from, "Node already finished, not failing it");
                None
            }
            other => other?,
        };
        let Some(t) = applied else {
            return Ok(());
        };
        warn!(node_id = %id, nid = %t.node_nid, error_type, error = %message, "Node failed");
        self.emit_transition(run_id, &t).await?;
        self.emit(
            run_id,
            TaskFailed {
                node_id: id,
                root_node_id: root,
                error_type: error_type.to_string(),
                error_info: message,
                context,
            },
        )
        .await?;
        Ok(())
    }

    // --- Handlers ---

    async fn on_submitted(&self, run_id: RunId, p: TaskSubmitted) -> ArborResult<()> {
        if p.outer_node_id.is_none() && !self.graph.contains(p.node_id) {
            let root = NewNode::new(p.goal.clone(), p.task_type.clone(), p.node_type)
                .with_id(p.node_id)
                .with_metadata(p.metadata.clone());
            self.graph.add_root(root)?;
            info!(node_id = %p.node_id, goal = %p.goal, "Root node created");
            self.adopt_run(run_id, p.node_id);
            self.monitor.begin(run_id).await;
        } else if !self.graph.contains(p.node_id) {
            warn!(node_id = %p.node_id, "TaskSubmitted for a child outside any decomposition, ignoring");
            return Ok(());
        }
        let Some(ctx) = self.plan_context(p.root_node_id) else {
            return Ok(());
        };
        self.promote(ctx.run_id, p.root_node_id, p.node_id).await
    }

    /// Track a run that was submitted directly on the bus.
    fn adopt_run(&self, run_id: RunId, root: NodeId) {
        let mut runs = self.runs.lock();
        if !runs.contains_key(&root) {
            let (report, _) = watch::channel(None);
            runs.insert(
                root,
                RunState {
                    run_id,
                    started_at: Utc::now(),
                    started: Instant::now(),
                    cancel: self.shutdown.child_token(),
                    report,
                },
            );
            debug!(run_id = %run_id, root_node_id = %root, "Adopted externally submitted run");
        }
    }

    async fn on_ready(&self, p: TaskReady) -> ArborResult<()> {
        let Some(ctx) = self.plan_context(p.root_node_id) else {
            return Ok(());
        };
        let Some(node) = self.node(p.node_id) else {
            return Ok(());
        };
        if node.status != NodeStatus::Ready {
            return Ok(());
        }

        let decision = match self.planner.decide(&node, &ctx).await {
            Ok(decision) => decision,
            Err(e) => {
                return self
                    .fail_node(ctx.run_id, ctx.root_node_id, node.node_id, e.error_type(), e.to_string(), None)
                    .await;
            }
        };
        let worker_type = decision.worker_type().to_string();
        let action_name = decision.action_name().map(str::to_string);
        self.decisions.lock().insert(node.node_id, decision);

        if let Some(t) = self.apply(node.node_id, NodeStatus::Assigned)? {
            debug!(node_id = %node.node_id, worker_type = %worker_type, action = ?action_name, "Node assigned");
            self.emit_transition(ctx.run_id, &t).await?;
            self.emit(
                ctx.run_id,
                TaskAssigned {
                    node_id: node.node_id,
                    root_node_id: ctx.root_node_id,
                    worker_type,
                    action_name,
                },
            )
            .await?;
        }
        Ok(())
    }

    /// Hand the node to a tracked task that waits for a concurrency slot.
    fn on_assigned(self: &Arc<Self>, p: TaskAssigned) {
        let Some(ctx) = self.plan_context(p.root_node_id) else {
            return;
        };
        let this = Arc::clone(self);
        let correlation_id = correlation::current_or_new();
        self.workers.spawn(correlation::scope(correlation_id, async move {
            match this.execute_node(&ctx, p.node_id).await {
                Ok(()) => {}
                Err(ArborError::Cancelled(reason)) => {
                    debug!(node_id = %p.node_id, reason = %reason, "Node execution cancelled");
                }
                Err(e) => error!(node_id = %p.node_id, error = %e, "Node execution aborted"),
            }
        }));
    }

    async fn execute_node(&self, ctx: &PlanContext, id: NodeId) -> ArborResult<()> {
        let permit = tokio::select! {
            _ = ctx.cancel.cancelled() => return Ok(()),
            permit = self.slots.clone().acquire_owned() => permit
                .map_err(|_| ArborError::Bus("concurrency limiter closed".into()))?,
        };
        let Some(t) = self.apply(id, NodeStatus::Running)? else {
            return Ok(());
        };
        self.emit_transition(ctx.run_id, &t).await?;
        let worker = self.next_worker.fetch_add(1, Ordering::Relaxed);
        self.emit(
            ctx.run_id,
            TaskStarted {
                node_id: id,
                root_node_id: ctx.root_node_id,
                worker_id: Some(format!("worker-{worker}")),
            },
        )
        .await?;
        let Some(node) = self.node(id) else {
            return Ok(());
        };

        let decision = self.decisions.lock().remove(&id);
        match decision {
            Some(Decision::Act(call)) => self.act(ctx, &node, call).await?,
            Some(Decision::Decompose(subtasks)) if subtasks.is_empty() => {
                info!(node_id = %id, "Empty decomposition, completing node");
                self.complete_node(ctx.run_id, &node, None, JsonMap::new())
                    .await?;
            }
            Some(Decision::Decompose(subtasks)) => {
                // The composite stays RUNNING while its children execute; it
                // does not hold a slot meanwhile.
                drop(permit);
                self.emit(
                    ctx.run_id,
                    SubtasksPlanned {
                        parent_node_id: id,
                        root_node_id: ctx.root_node_id,
                        subtasks,
                    },
                )
                .await?;
            }
            None => {
                self.fail_node(
                    ctx.run_id,
                    ctx.root_node_id,
                    id,
                    "planner",
                    "no decision recorded for node".into(),
                    None,
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Run actions for a node until it finishes, the planner stops, or the
    /// turn budget runs out.
    async fn act(&self, ctx: &PlanContext, node: &Node, first: ActionCall) -> ArborResult<()> {
        let max_turns = self.config.max_turns as usize;
        let mut history: Vec<Step> = Vec::new();
        let mut last_error_type = None;
        let mut call = first;
        loop {
            if ctx.cancel.is_cancelled() {
                return Ok(());
            }
            let (result, error_type) = self.invoke(ctx, node, &call).await?;
            last_error_type = error_type;
            let finished = call.name == FINISH && result.is_success();
            history.push(Step { call, result });
            if finished {
                break;
            }
            match self.planner.next_action(node, &history, ctx).await {
                Ok(Some(_)) if history.len() >= max_turns => {
                    return self
                        .fail_node(
                            ctx.run_id,
                            ctx.root_node_id,
                            node.node_id,
                            "max_turns",
                            format!("node did not finish within {max_turns} actions"),
                            None,
                        )
                        .await;
                }
                Ok(Some(next)) => call = next,
                Ok(None) => break,
                Err(e) => {
                    return self
                        .fail_node(ctx.run_id, ctx.root_node_id, node.node_id, e.error_type(), e.to_string(), None)
                        .await;
                }
            }
        }

        let Some(Step { call, result }) = history.pop() else {
            return Ok(());
        };
        if result.is_success() {
            self.complete_node(ctx.run_id, node, Some(call.name), result.result.unwrap_or_default())
                .await
        } else {
            let mut context = JsonMap::new();
            context.insert("action".into(), call.name.clone().into());
            context.insert("status".into(), result.status.to_string().into());
            let message = result
                .error
                .unwrap_or_else(|| format!("action '{}' did not succeed", call.name));
            self.fail_node(
                ctx.run_id,
                ctx.root_node_id,
                node.node_id,
                last_error_type.unwrap_or("action_failed"),
                message,
                Some(context),
            )
            .await
        }
    }

    /// Execute one action, bracketed by `ToolInvoked` / `ToolReturned`.
    async fn invoke(
        &self,
        ctx: &PlanContext,
        node: &Node,
        call: &ActionCall,
    ) -> ArborResult<(ActionResult, Option<&'static str>)> {
        self.emit(
            ctx.run_id,
            ToolInvoked {
                node_id: node.node_id,
                tool_name: call.name.clone(),
                args_summary: truncate(
                    &serde_json::Value::Object(call.args.clone()).to_string(),
                    SUMMARY_CHARS,
                ),
            },
        )
        .await?;

        let mut action_ctx = ActionContext::new(ctx.run_id)
            .for_node(node.node_id)
            .with_cancel(ctx.cancel.child_token());
        if let Some(timeout) = self.config.action_timeout() {
            action_ctx = action_ctx.with_timeout(timeout);
        }
        let start = Instant::now();
        let (result, error_type) = match self
            .executor
            .execute(&action_ctx, &call.name, call.args.clone())
            .await
        {
            Ok(result) => (result, None),
            Err(e) => (e.result, Some(e.source.error_type())),
        };
        let elapsed = start.elapsed();
        self.monitor
            .record_tool_call(ctx.run_id, elapsed, !result.is_success())
            .await;
        if ctx.cancel.is_cancelled() {
            return Err(ArborError::Cancelled(format!(
                "run ended while '{}' was executing",
                call.name
            )));
        }

        self.emit(
            ctx.run_id,
            ToolReturned {
                node_id: node.node_id,
                tool_name: call.name.clone(),
                state: result.status,
                duration_seconds: elapsed.as_secs_f64(),
                output_summary: result.result.as_ref().map(|_| result.summary(SUMMARY_CHARS)),
                error: result.error.clone(),
            },
        )
        .await?;
        Ok((result, error_type))
    }

    async fn on_subtasks_planned(&self, p: SubtasksPlanned) -> ArborResult<()> {
        let Some(ctx) = self.plan_context(p.root_node_id) else {
            return Ok(());
        };
        let Some(owner) = self.node(p.parent_node_id) else {
            return Ok(());
        };
        if !self.graph.inner_nodes(owner.node_id).is_empty() {
            debug!(node_id = %owner.node_id, "Inner graph already built");
            return Ok(());
        }
        if p.subtasks.is_empty() {
            return self
                .complete_node(ctx.run_id, &owner, None, JsonMap::new())
                .await;
        }

        let children = p
            .subtasks
            .iter()
            .map(|s| ChildPlan {
                node: NewNode::new(s.goal.clone(), s.task_type.clone(), s.node_type).with_id(s.node_id),
                dependencies: s.dependencies.clone(),
            })
            .collect();
        let expansion = match self.graph.expand(owner.node_id, children) {
            Ok(expansion) => expansion,
            Err(e) => {
                return self
                    .fail_node(ctx.run_id, ctx.root_node_id, owner.node_id, e.error_type(), e.to_string(), None)
                    .await;
            }
        };

        for node in &expansion.nodes {
            self.emit(
                ctx.run_id,
                NodeAdded {
                    graph_owner_node_id: owner.node_id,
                    added_node_id: node.node_id,
                    added_node_nid: node.node_nid.clone(),
                    task_type: node.task_type.clone(),
                    goal: node.goal.clone(),
                },
            )
            .await?;
        }
        let nids: HashMap<NodeId, String> = expansion
            .nodes
            .iter()
            .map(|n| (n.node_id, n.node_nid.clone()))
            .collect();
        for edge in &expansion.edges {
            self.emit(
                ctx.run_id,
                EdgeAdded {
                    graph_owner_node_id: edge.graph_owner_node_id,
                    parent_node_id: edge.parent_node_id,
                    child_node_id: edge.child_node_id,
                    parent_node_nid: nids.get(&edge.parent_node_id).cloned().unwrap_or_default(),
                    child_node_nid: nids.get(&edge.child_node_id).cloned().unwrap_or_default(),
                },
            )
            .await?;
        }
        let (node_count, edge_count) = self.graph.inner_counts(owner.node_id);
        self.emit(
            ctx.run_id,
            InnerGraphBuilt {
                node_id: owner.node_id,
                node_count,
                edge_count,
                node_ids: expansion.nodes.iter().map(|n| n.node_id).collect(),
            },
        )
        .await?;
        info!(node_id = %owner.node_id, node_count, edge_count, "Inner graph built");

        for node in &expansion.nodes {
            self.emit(
                ctx.run_id,
                TaskSubmitted {
                    node_id: node.node_id,
                    node_nid: node.node_nid.clone(),
                    node_type: node.node_type,
                    task_type: node.task_type.clone(),
                    goal: node.goal.clone(),
                    layer: node.layer,
                    outer_node_id: node.outer_node_id,
                    root_node_id: node.root_node_id,
                    metadata: node.metadata.clone(),
                },
            )
            .await?;
        }
        for node in &expansion.nodes {
            self.promote(ctx.run_id, ctx.root_node_id, node.node_id)
                .await?;
        }
        Ok(())
    }

    async fn on_completed(&self, p: TaskCompleted) -> ArborResult<()> {
        let Some(ctx) = self.plan_context(p.root_node_id) else {
            return Ok(());
        };
        let Some(node) = self.node(p.node_id) else {
            return Ok(());
        };
        for dependent in self.graph.ready_dependents(node.node_id) {
            self.promote(ctx.run_id, ctx.root_node_id, dependent)
                .await?;
        }

        let Some(owner_id) = node.outer_node_id else {
            return self
                .finish_run(ctx.root_node_id, RunStatus::Completed, node.result, None)
                .await;
        };
        if !self.graph.inner_complete(owner_id) {
            // A failed sibling ends the run through its own TaskFailed.
            if self.config.cascade_failures {
                return Ok(());
            }
            return self.finish_if_stalled(&ctx, &node, "completed").await;
        }
        let Some(owner) = self.node(owner_id) else {
            return Ok(());
        };
        if owner.status != NodeStatus::Running {
            return Ok(());
        }
        let mut subtasks = JsonMap::new();
        for child in self.graph.inner_nodes(owner_id) {
            if let Some(child) = self.graph.get(child) {
                subtasks.insert(
                    child.node_nid,
                    serde_json::Value::Object(child.result.unwrap_or_default()),
                );
            }
        }
        let mut result = JsonMap::new();
        result.insert("subtasks".into(), serde_json::Value::Object(subtasks));
        self.complete_node(ctx.run_id, &owner, None, result).await
    }

    async fn on_failed(&self, p: TaskFailed) -> ArborResult<()> {
        let Some(ctx) = self.plan_context(p.root_node_id) else {
            return Ok(());
        };
        let Some(node) = self.node(p.node_id) else {
            return Ok(());
        };
        if node.is_root() {
            let error = NodeError {
                error_type: p.error_type,
                message: p.error_info,
            };
            return self
                .finish_run(ctx.root_node_id, RunStatus::Failed, None, Some((Some(node.node_id), error)))
                .await;
        }

        let mut escalated = false;
        if self.config.cascade_failures {
            let reason = format!("{} ({}) failed: {}", node.node_nid, node.goal, p.error_info);
            for dependent in self.graph.dependents(node.node_id) {
                self.fail_node(
                    ctx.run_id,
                    ctx.root_node_id,
                    dependent,
                    "dependency_failed",
                    format!("dependency {reason}"),
                    None,
                )
                .await?;
            }
            if let Some(owner) = node.outer_node_id {
                let mut context = JsonMap::new();
                context.insert("failed_subtask".into(), node.node_id.to_string().into());
                context.insert("error_type".into(), p.error_type.clone().into());
                self.fail_node(
                    ctx.run_id,
                    ctx.root_node_id,
                    owner,
                    "subtask_failed",
                    format!("subtask {reason}"),
                    Some(context),
                )
                .await?;
                escalated = true;
            }
        }

        if escalated {
            return Ok(());
        }
        self.finish_if_stalled(&ctx, &node, &format!("failed: {}", p.error_info))
            .await
    }

    /// Fail the run when nothing left in it can make progress, e.g. after a
    /// failure that was not cascaded.
    async fn finish_if_stalled(&self, ctx: &PlanContext, last: &Node, what: &str) -> ArborResult<()> {
        if !self.graph.is_stalled(ctx.root_node_id) {
            return Ok(());
        }
        let error = NodeError {
            error_type: "stalled".into(),
            message: format!(
                "run cannot make progress after {} ({}) {what}",
                last.node_nid, last.goal
            ),
        };
        self.finish_run(ctx.root_node_id, RunStatus::Failed, None, Some((Some(last.node_id), error)))
            .await
    }

    // --- Run termination ---

    /// End a run once: cancel its work, publish `RunError` (for failures) and
    /// `RunFinished`, and hand the report to the waiting [`RunHandle`].
    async fn finish_run(
        &self,
        root: NodeId,
        status: RunStatus,
        result: Option<JsonMap>,
        failure: Option<(Option<NodeId>, NodeError)>,
    ) -> ArborResult<()> {
        let Some(state) = self.runs.lock().remove(&root) else {
            return Ok(());
        };
        state.cancel.cancel();
        let run_nodes = self.graph.run_nodes(root);
        {
            let mut decisions = self.decisions.lock();
            for node in &run_nodes {
                decisions.remove(&node.node_id);
            }
        }
        if status == RunStatus::Failed {
            for node in run_nodes.iter().filter(|n| !n.status.is_terminal()) {
                self.fail_node(
                    state.run_id,
                    root,
                    node.node_id,
                    "cancelled",
                    "run ended before the node finished".into(),
                    None,
                )
                .await?;
            }
        }

        let metrics = self.monitor.remove(state.run_id).await;
        let statistics = self.graph.statistics(root);
        let duration = state.started.elapsed().as_secs_f64();
        if let Some((node_id, error)) = &failure {
            self.emit(
                state.run_id,
                RunError {
                    root_node_id: Some(root),
                    node_id: *node_id,
                    error_type: error.error_type.clone(),
                    error_message: error.message.clone(),
                    stack_trace: None,
                    context: None,
                },
            )
            .await?;
        }
        self.emit(
            state.run_id,
            RunFinished {
                root_node_id: root,
                status,
                total_duration_seconds: duration,
                total_nodes: statistics.values().sum(),
                node_statistics: statistics
                    .iter()
                    .map(|(s, n)| (s.as_str().to_string(), *n))
                    .collect(),
                llm_calls: metrics.llm_calls,
                tool_calls: metrics.tool_calls,
                total_tokens: metrics.total_tokens,
                result: result.clone(),
            },
        )
        .await?;
        self.processed.lock().remove(&state.run_id);

        info!(
            run_id = %state.run_id,
            root_node_id = %root,
            status = ?status,
            duration_seconds = duration,
            "Run finished"
        );
        state.report.send_replace(Some(RunReport {
            run_id: state.run_id,
            root_node_id: root,
            status,
            started_at: state.started_at,
            duration_seconds: duration,
            result,
            error: failure.map(|(_, error)| error),
            node_statistics: statistics,
            metrics,
        }));
        Ok(())
    }
}
