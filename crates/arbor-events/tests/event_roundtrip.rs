#![allow(clippy::unwrap_used, clippy::expect_used)]

use arbor_core::{ActionStatus, JsonMap, NodeStatus, NodeType, RunStatus};
use arbor_events::payload::*;
use arbor_events::{Event, EventType};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

fn map(value: serde_json::Value) -> JsonMap {
    value.as_object().cloned().unwrap()
}

/// One representative payload per event type.
fn samples() -> Vec<EventPayload> {
    let root = Uuid::new_v4();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    vec![
        TaskSubmitted {
            node_id: root,
            node_nid: "0".into(),
            node_type: NodeType::Plan,
            task_type: "GENERAL".into(),
            goal: "G".into(),
            layer: 0,
            outer_node_id: None,
            root_node_id: root,
            metadata: map(json!({"origin": "cli"})),
        }
        .into(),
        TaskReady {
            node_id: a,
            root_node_id: root,
        }
        .into(),
        TaskAssigned {
            node_id: a,
            root_node_id: root,
            worker_type: "executor".into(),
            action_name: Some("echo".into()),
        }
        .into(),
        TaskStarted {
            node_id: a,
            root_node_id: root,
            worker_id: Some("executor-1".into()),
        }
        .into(),
        TaskCompleted {
            node_id: a,
            root_node_id: root,
            result: map(json!({"final_answer": "42", "nested": {"k": [1, 2]}})),
        }
        .into(),
        TaskFailed {
            node_id: b,
            root_node_id: root,
            error_type: "action_failed".into(),
            error_info: "tool exploded".into(),
            context: Some(map(json!({"action": "echo"}))),
        }
        .into(),
        TaskResultAvailable {
            node_id: a,
            root_node_id: root,
            action_name: Some("finish".into()),
            result_summary: "42".into(),
        }
        .into(),
        SubtasksPlanned {
            parent_node_id: root,
            root_node_id: root,
            subtasks: vec![
                SubtaskSpec {
                    node_id: a,
                    goal: "A".into(),
                    task_type: "EXECUTION".into(),
                    node_type: NodeType::Execute,
                    dependencies: vec![],
                },
                SubtaskSpec {
                    node_id: b,
                    goal: "B".into(),
                    task_type: "EXECUTION".into(),
                    node_type: NodeType::Execute,
                    dependencies: vec![a],
                },
            ],
        }
        .into(),
        NodeAdded {
            graph_owner_node_id: root,
            added_node_id: a,
            added_node_nid: "0.1".into(),
            task_type: "EXECUTION".into(),
            goal: "A".into(),
        }
        .into(),
        EdgeAdded {
            graph_owner_node_id: Some(root),
            parent_node_id: a,
            child_node_id: b,
            parent_node_nid: "0.1".into(),
            child_node_nid: "0.2".into(),
        }
        .into(),
        InnerGraphBuilt {
            node_id: root,
            node_count: 2,
            edge_count: 1,
            node_ids: vec![a, b],
        }
        .into(),
        NodeStatusChanged {
            node_id: a,
            node_nid: "0.1".into(),
            node_goal: "A".into(),
            old_status: NodeStatus::Running,
            new_status: NodeStatus::Completed,
            task_type: "EXECUTION".into(),
        }
        .into(),
        LlmCallStarted {
            node_id: Some(a),
            agent_class: "planner".into(),
            model: "mock".into(),
            prompt_preview: "Decompose: G".into(),
        }
        .into(),
        LlmCallCompleted {
            node_id: Some(a),
            agent_class: "planner".into(),
            model: "mock".into(),
            duration_seconds: 0.25,
            token_usage: Some(TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
            response_preview: Some("{}".into()),
            error: None,
        }
        .into(),
        ToolInvoked {
            node_id: a,
            tool_name: "echo".into(),
            args_summary: r#"{"message":"hi"}"#.into(),
        }
        .into(),
        ToolReturned {
            node_id: a,
            tool_name: "echo".into(),
            state: ActionStatus::Success,
            duration_seconds: 0.5,
            output_summary: Some("hi".into()),
            error: None,
        }
        .into(),
        RunStarted {
            root_node_id: root,
            goal: "G".into(),
            task_type: "GENERAL".into(),
            config: map(json!({"max_concurrency": 4})),
        }
        .into(),
        RunFinished {
            root_node_id: root,
            status: RunStatus::Completed,
            total_duration_seconds: 1.5,
            total_nodes: 3,
            node_statistics: BTreeMap::from([("COMPLETED".to_string(), 3)]),
            llm_calls: 2,
            tool_calls: 2,
            total_tokens: 15,
            result: Some(map(json!({"final_answer": "42"}))),
        }
        .into(),
        RunError {
            root_node_id: Some(root),
            node_id: Some(b),
            error_type: "action_failed".into(),
            error_message: "tool exploded".into(),
            stack_trace: Some("Action error: tool exploded".into()),
            context: None,
        }
        .into(),
    ]
}

#[test]
fn samples_cover_every_event_type() {
    let covered: BTreeSet<EventType> = samples().iter().map(EventPayload::event_type).collect();
    let all: BTreeSet<EventType> = EventType::ALL.into_iter().collect();
    assert_eq!(covered, all);
}

#[test]
fn every_event_type_roundtrips_through_wire_format() {
    let run_id = Uuid::new_v4();
    for payload in samples() {
        let event = Event::new("roundtrip", run_id, payload);
        let json = event.to_json().unwrap();
        let decoded = Event::from_json(&json).unwrap();
        assert_eq!(decoded, event, "event type {}", event.event_type());
    }
}

#[test]
fn measured_durations_roundtrip_exactly() {
    let run_id = Uuid::new_v4();
    let start = std::time::Instant::now();
    let mut durations = vec![
        start.elapsed().as_secs_f64(),
        0.1 + 0.2,
        std::f64::consts::PI * 1e-4,
    ];
    let mut d = 1.0e-6;
    while d < 1.0e4 {
        durations.push(d);
        d *= 1.000_731;
    }
    for seconds in durations {
        let event = Event::new(
            "roundtrip",
            run_id,
            LlmCallCompleted {
                node_id: None,
                agent_class: "planner".into(),
                model: "mock".into(),
                duration_seconds: seconds,
                token_usage: None,
                response_preview: None,
                error: None,
            },
        );
        let decoded = Event::from_json(&event.to_json().unwrap()).unwrap();
        assert_eq!(decoded, event, "duration {seconds:e}");
    }
}

#[test]
fn payload_declared_as_other_type_is_rejected_whole() {
    let run_id = Uuid::new_v4();
    let event = Event::new(
        "test",
        run_id,
        TaskReady {
            node_id: Uuid::new_v4(),
            root_node_id: Uuid::new_v4(),
        },
    );
    let mut value = serde_json::to_value(&event).unwrap();
    for declared in ["TaskFailed", "NodeAdded", "RunFinished", "InnerGraphBuilt"] {
        value["event_type"] = json!(declared);
        assert!(
            Event::from_json(&value.to_string()).is_err(),
            "TaskReady payload accepted as {declared}"
        );
    }
}

#[test]
fn null_payload_is_rejected() {
    let value = json!({
        "event_id": Uuid::new_v4(),
        "event_type": "TaskReady",
        "timestamp": "2024-05-01T12:00:00Z",
        "source_service": "test",
        "run_id": Uuid::new_v4(),
        "payload": null
    });
    assert!(Event::from_json(&value.to_string()).is_err());
}
