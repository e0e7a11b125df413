//! End-to-end tests over the full method catalog: context wiring, the
//! dispatch pipeline, and the HTTP transport.
//!
//! The sampling provider points at a closed port, so every coordination
//! phase exercises its deterministic fallback — which is exactly what the
//! scenarios need: reproducible decompositions with no network.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use swarmd_bus::EventBus;
use swarmd_coord::{
    InstanceConfig, InstanceManager, SamplingClient, SamplingConfig, SwarmCoordinator, TaskQueue,
};
use swarmd_hooks::HookValidator;
use swarmd_registry::{Registry, RequestContext};
use swarmd_rpc::{RpcServer, SwarmContext};
use swarmd_store::{DecompositionPlan, PlannedSubtask, Sink, SpecialistKind, Store};

fn build_server() -> (RpcServer, Arc<SwarmContext>) {
    let store = Store::default();
    let sink = Sink::open_in_memory().unwrap();
    let bus = EventBus::new(store.clone());

    let mut sampling_config =
        SamplingConfig::new(url::Url::parse("http://127.0.0.1:1/").unwrap());
    sampling_config.max_attempts = 1;
    sampling_config.backoff_base = Duration::from_millis(1);
    let sampling = SamplingClient::new(sampling_config).unwrap();

    let coordinator = SwarmCoordinator::new(store.clone(), sink.clone(), sampling).unwrap();
    let queue = TaskQueue::new(store.clone());
    let instances = InstanceManager::new(
        store.clone(),
        InstanceConfig {
            offline_after: Duration::from_secs(5),
            sweep_interval: Duration::from_millis(100),
            evict_after: Duration::from_secs(600),
            default_max_load: 3,
        },
    );
    let hooks = HookValidator::new(store.clone()).unwrap();

    let ctx = SwarmContext::new(
        store,
        sink,
        bus,
        queue,
        instances,
        coordinator,
        hooks,
        Some("LET-ME-FLUSH".to_string()),
    );
    (RpcServer::new(Arc::clone(&ctx)), ctx)
}

async fn call(registry: &Registry, method: &str, params: Value) -> Result<Value, Value> {
    registry
        .dispatch(method, params, RequestContext::new("test-client"))
        .await
        .map_err(|e| serde_json::to_value(swarmd_rpc::RpcErrorObject::from(e)).unwrap())
}

/// Install a specific decomposition directly (the provider fallback only
/// produces single-subtask plans).
fn install_plan(ctx: &SwarmContext, task_id: &str, subtasks: Vec<(&str, Vec<&str>)>) {
    ctx.store.run(|ks| {
        ks.insert_task(swarmd_store::TaskRecord::new(
            task_id,
            "project",
            50,
            chrono::Utc::now(),
        ));
        ks.decompose_and_store(
            task_id,
            &DecompositionPlan {
                subtasks: subtasks
                    .into_iter()
                    .map(|(id, deps)| PlannedSubtask {
                        id: Some(id.to_string()),
                        description: format!("do {id}"),
                        specialist: SpecialistKind::General,
                        complexity: 1,
                        estimated_minutes: 5,
                        dependencies: deps.into_iter().map(str::to_string).collect(),
                    })
                    .collect(),
                strategy: None,
            },
            chrono::Utc::now(),
        )
        .unwrap();
    });
}

fn ready_ids(ctx: &SwarmContext, task_id: &str) -> Vec<String> {
    ctx.store.run(|ks| {
        ks.ready_snapshot()
            .into_iter()
            .filter(|e| e.parent_id == task_id)
            .map(|e| e.subtask_id)
            .collect()
    })
}

// ---------------------------------------------------------------------------
// Scenario: diamond unblocking
// ---------------------------------------------------------------------------

#[tokio::test]
async fn diamond_unblocking_through_rpc() {
    let (server, ctx) = build_server();
    let registry = server.registry();
    install_plan(
        &ctx,
        "t1",
        vec![
            ("A", vec![]),
            ("B", vec!["A"]),
            ("C", vec!["A"]),
            ("D", vec!["B", "C"]),
        ],
    );

    assert_eq!(ready_ids(&ctx, "t1"), vec!["A"]);

    let complete = |id: &'static str| {
        let ctx = Arc::clone(&ctx);
        async move {
            ctx.store.run(|ks| {
                ks.synthesize_progress(
                    "t1",
                    id,
                    &swarmd_store::SubtaskResult {
                        status: swarmd_store::WorkStatus::Completed,
                        output: Some(format!("{id} output")),
                    },
                    chrono::Utc::now(),
                )
                .unwrap()
            })
        }
    };

    let progress = complete("A").await;
    assert_eq!(progress.unblocked_count, 2);
    let mut ready = ready_ids(&ctx, "t1");
    ready.sort();
    assert_eq!(ready, vec!["B", "C"]);

    complete("B").await;
    assert_eq!(ready_ids(&ctx, "t1"), vec!["C"]);

    let progress = complete("C").await;
    assert_eq!(progress.unblocked_count, 1);
    assert_eq!(ready_ids(&ctx, "t1"), vec!["D"]);

    let progress = complete("D").await;
    assert!(progress.ready_for_synthesis);

    // Synthesis through the catalog completes the parent.
    let report = call(registry, "swarm.synthesize", json!({"task_id": "t1"}))
        .await
        .unwrap();
    assert_eq!(report["status"], "ready_for_integration");

    let project = call(registry, "task.get_project", json!({"id": "t1"}))
        .await
        .unwrap();
    assert_eq!(project["task"]["status"], "completed");
    assert_eq!(project["subtasks"].as_array().unwrap().len(), 4);
}

// ---------------------------------------------------------------------------
// Scenario: capacity under contention
// ---------------------------------------------------------------------------

#[tokio::test]
async fn capacity_under_contention_via_swarm_assign() {
    let (server, ctx) = build_server();
    let registry = server.registry();

    call(
        registry,
        "system.register",
        json!({"id": "s1", "roles": ["general"], "max_load": 3}),
    )
    .await
    .unwrap();

    install_plan(
        &ctx,
        "t1",
        (1..=5).map(|i| {
            // Leak the formatted id; the test set is tiny.
            let id: &'static str = Box::leak(format!("st-{i}").into_boxed_str());
            (id, vec![])
        }).collect(),
    );

    let mut handles = Vec::new();
    for i in 1..=5 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            registry
                .dispatch(
                    "swarm.assign",
                    json!({"task_id": "t1", "subtask_id": format!("st-{i}")}),
                    RequestContext::new("contender"),
                )
                .await
        }));
    }

    let mut ok = 0;
    let mut exhausted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(err) => {
                let wire = swarmd_rpc::RpcErrorObject::from(err);
                assert_eq!(wire.code, -32005);
                assert_eq!(wire.data.unwrap()["kind"], "NONE_AVAILABLE");
                exhausted += 1;
            }
        }
    }
    assert_eq!(ok, 3);
    assert_eq!(exhausted, 2);

    ctx.store.run(|ks| {
        assert_eq!(ks.instance("s1").unwrap().current_load, 3);
    });
}

// ---------------------------------------------------------------------------
// Scenario: failure reassignment
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failure_reassignment_within_one_sweep() {
    let (server, ctx) = build_server();
    let registry = server.registry();

    call(
        registry,
        "system.register",
        json!({"id": "w1", "roles": ["general"], "max_load": 3}),
    )
    .await
    .unwrap();

    install_plan(&ctx, "t1", vec![("A", vec![])]);
    call(
        registry,
        "swarm.assign",
        json!({"task_id": "t1", "subtask_id": "A"}),
    )
    .await
    .unwrap();
    assert!(ready_ids(&ctx, "t1").is_empty());

    // Force the heartbeat far into the past, then run one sweep.
    ctx.store.run(|ks| {
        ks.instance_mut("w1").unwrap().last_heartbeat =
            chrono::DateTime::from_timestamp(1, 0).unwrap();
    });
    let report = ctx.instances.sweep(chrono::Utc::now());
    assert_eq!(report.marked_offline, vec!["w1".to_string()]);

    ctx.store.run(|ks| {
        assert_eq!(
            ks.instance("w1").unwrap().status,
            swarmd_store::InstanceStatus::Offline
        );
    });
    // The subtask is back in queue:subtasks; nothing lost.
    assert_eq!(ready_ids(&ctx, "t1"), vec!["A"]);
}

// ---------------------------------------------------------------------------
// Scenario: priority pull
// ---------------------------------------------------------------------------

#[tokio::test]
async fn priority_pull_returns_highest_first() {
    let (server, _ctx) = build_server();
    let registry = server.registry();

    for priority in [10, 90, 50] {
        call(
            registry,
            "task.create",
            json!({"text": format!("job p{priority}"), "priority": priority}),
        )
        .await
        .unwrap();
    }

    call(
        registry,
        "system.register",
        json!({"id": "w1", "roles": ["general"]}),
    )
    .await
    .unwrap();

    let claimed = call(registry, "task.claim", json!({"instance_id": "w1"}))
        .await
        .unwrap();
    assert_eq!(claimed["task"]["priority"], 90);
}

// ---------------------------------------------------------------------------
// Scenario: dangerous hook
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dangerous_hook_denied_and_audited() {
    let (server, ctx) = build_server();
    let registry = server.registry();

    let decision = call(
        registry,
        "hook.pre_tool",
        json!({"tool": "bash", "params": {"command": "rm -rf /"}, "session_id": "sess-1"}),
    )
    .await
    .unwrap();
    assert_eq!(decision["allow"], false);
    assert!(decision["reason"].as_str().unwrap().contains("dangerous"));

    let audit = ctx
        .store
        .run(|ks| ks.read_stream(swarmd_store::AUDIT_STREAM, 0, 10));
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].payload["allow"], false);
    assert_eq!(audit[0].payload["session_id"], "sess-1");
}

// ---------------------------------------------------------------------------
// Scenario: attachment round-trip
// ---------------------------------------------------------------------------

#[tokio::test]
async fn attachment_roundtrip_with_sink_rehydration() {
    let (server, ctx) = build_server();
    let registry = server.registry();

    call(
        registry,
        "task.create",
        json!({"id": "t2", "text": "attachment host"}),
    )
    .await
    .unwrap();

    call(
        registry,
        "task.create_attachment",
        json!({"task_id": "t2", "key": "k1", "type": "json", "value": {"foo": "bar"}}),
    )
    .await
    .unwrap();

    let fetched = call(
        registry,
        "task.get_attachment",
        json!({"task_id": "t2", "key": "k1"}),
    )
    .await
    .unwrap();
    assert_eq!(fetched["value"]["foo"], "bar");

    // Evict the in-store copy; the next get re-hydrates from the sink.
    ctx.store.run(|ks| {
        ks.remove_attachment("t2", "k1");
    });
    let rehydrated = call(
        registry,
        "task.get_attachment",
        json!({"task_id": "t2", "key": "k1"}),
    )
    .await
    .unwrap();
    assert_eq!(rehydrated["value"]["foo"], "bar");

    let listed = call(registry, "task.list_attachments", json!({"task_id": "t2"}))
        .await
        .unwrap();
    assert_eq!(listed["keys"], json!(["k1"]));
}

// ---------------------------------------------------------------------------
// Conflict detection and resolution through the catalog
// ---------------------------------------------------------------------------

#[tokio::test]
async fn second_proposal_flags_conflict() {
    let (server, ctx) = build_server();
    let registry = server.registry();
    install_plan(&ctx, "t1", vec![("A", vec![])]);

    let propose = |who: &str| {
        json!({
            "task_id": "t1", "subtask_id": "A",
            "instance_id": who, "approach": format!("{who} way"), "reasoning": "because",
        })
    };

    let first = call(registry, "swarm.propose", propose("w1")).await.unwrap();
    assert_eq!(first["conflict_detected"], false);
    assert_eq!(first["solution_count"], 1);

    let second = call(registry, "swarm.propose", propose("w2")).await.unwrap();
    assert_eq!(second["conflict_detected"], true);
    assert_eq!(second["solution_count"], 2);

    let resolution = call(
        registry,
        "swarm.resolve",
        json!({"task_id": "t1", "subtask_id": "A"}),
    )
    .await
    .unwrap();
    assert_eq!(resolution["chosen_instance_id"], "w1");
}

// ---------------------------------------------------------------------------
// System surface
// ---------------------------------------------------------------------------

#[tokio::test]
async fn flush_requires_the_guard_token() {
    let (server, _ctx) = build_server();
    let registry = server.registry();

    call(registry, "task.create", json!({"text": "x"})).await.unwrap();

    let denied = call(registry, "system.flush", json!({"confirm": "wrong"}))
        .await
        .unwrap_err();
    assert_eq!(denied["code"], -32003);

    let flushed = call(registry, "system.flush", json!({"confirm": "LET-ME-FLUSH"}))
        .await
        .unwrap();
    assert_eq!(flushed["flushed"], true);

    let listed = call(registry, "task.list", json!({})).await.unwrap();
    assert_eq!(listed["count"], 0);
}

#[tokio::test]
async fn sink_query_surface_is_read_only() {
    let (server, _ctx) = build_server();
    let registry = server.registry();

    let tables = call(registry, "system.sink.tables", json!({})).await.unwrap();
    assert!(tables["tables"].as_array().unwrap().iter().any(|t| t == "tasks"));

    let err = call(
        registry,
        "system.sink.query",
        json!({"sql": "DROP TABLE tasks"}),
    )
    .await
    .unwrap_err();
    assert_eq!(err["code"], -32005);
}

#[tokio::test]
async fn metrics_and_health_report() {
    let (server, _ctx) = build_server();
    let registry = server.registry();

    call(registry, "task.create", json!({"text": "x"})).await.unwrap();

    let health = call(registry, "system.health", json!({})).await.unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["sink_ok"], true);

    let metrics = call(registry, "system.metrics", json!({})).await.unwrap();
    assert_eq!(metrics["methods"]["task.create"]["invocations"], 1);
    assert_eq!(metrics["counters"]["tasks_created"], 1);
}

#[tokio::test]
async fn docs_are_served_and_cached() {
    let (server, _ctx) = build_server();
    let registry = server.registry();

    let listed = call(registry, "docs.list", json!({})).await.unwrap();
    assert!(listed["docs"].as_array().unwrap().len() >= 3);

    let doc = call(registry, "docs.get", json!({"name": "protocol"}))
        .await
        .unwrap();
    assert!(doc["content"].as_str().unwrap().contains("PARSE_ERROR"));

    let missing = call(registry, "docs.get", json!({"name": "nope"}))
        .await
        .unwrap_err();
    assert_eq!(missing["code"], -32004);
}

// ---------------------------------------------------------------------------
// HTTP transport
// ---------------------------------------------------------------------------

#[tokio::test]
async fn http_single_batch_and_parse_error() {
    let (server, _ctx) = build_server();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.serve(listener));

    let client = reqwest::Client::new();
    let url = format!("http://{addr}/rpc");

    // Single request.
    let resp: Value = client
        .post(&url)
        .json(&json!({
            "protocol": "2.0", "method": "task.create",
            "params": {"text": "over http"}, "id": 1
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["protocol"], "2.0");
    assert_eq!(resp["id"], 1);
    assert_eq!(resp["result"]["text"], "over http");

    // Batch: one success, one method-not-found, one notification.
    let resp: Value = client
        .post(&url)
        .json(&json!([
            {"protocol": "2.0", "method": "system.health", "id": "a"},
            {"protocol": "2.0", "method": "no.such_method", "id": "b"},
            {"protocol": "2.0", "method": "system.metrics"}
        ]))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let responses = resp.as_array().unwrap();
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0]["id"], "a");
    assert!(responses[0]["result"].is_object());
    assert_eq!(responses[1]["error"]["code"], -32601);

    // Parse error.
    let resp: Value = client
        .post(&url)
        .header("content-type", "application/json")
        .body("{oops")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["error"]["code"], -32700);
}
