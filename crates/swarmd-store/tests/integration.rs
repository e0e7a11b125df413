//! End-to-end store tests: concurrency and durability properties that unit
//! tests cannot cover from inside a single critical section.

use std::collections::BTreeSet;

use chrono::Utc;
use swarmd_store::{
    AttachmentPayload, AttachmentRecord, DecompositionPlan, InstanceRecord, InstanceStatus,
    PlannedSubtask, Sink, SpecialistKind, Store, StoreError, SubtaskResult, TaskRecord, WorkStatus,
};

fn planned(id: &str, deps: &[&str]) -> PlannedSubtask {
    PlannedSubtask {
        id: Some(id.to_string()),
        description: format!("do {id}"),
        specialist: SpecialistKind::General,
        complexity: 1,
        estimated_minutes: 5,
        dependencies: deps.iter().map(|d| d.to_string()).collect(),
    }
}

fn register(store: &Store, id: &str, max_load: u32) {
    let now = Utc::now();
    store.run(|ks| {
        let instance = InstanceRecord {
            id: id.to_string(),
            roles: BTreeSet::from([SpecialistKind::General]),
            capabilities: BTreeSet::new(),
            current_load: 0,
            max_load,
            last_heartbeat: now,
            status: InstanceStatus::Idle,
            metadata: serde_json::Map::new(),
            started_at: now,
        };
        ks.pool_add(&instance);
        ks.instances.insert(id.to_string(), instance);
    });
}

#[tokio::test]
async fn capacity_safety_under_contention() {
    let store = Store::default();
    store.run(|ks| ks.insert_task(TaskRecord::new("t1", "project", 50, Utc::now())));
    store.run(|ks| {
        ks.decompose_and_store(
            "t1",
            &DecompositionPlan {
                subtasks: (1..=5).map(|i| planned(&format!("st-{i}"), &[])).collect(),
                strategy: None,
            },
            Utc::now(),
        )
        .unwrap()
    });
    register(&store, "s1", 3);

    // Five concurrent assignment attempts against max_load = 3.
    let mut handles = Vec::new();
    for i in 1..=5 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.run(move |ks| {
                ks.assign_to_specialist(
                    "t1",
                    &format!("st-{i}"),
                    SpecialistKind::General,
                    &BTreeSet::new(),
                    Utc::now(),
                )
            })
        }));
    }

    let mut succeeded = 0;
    let mut exhausted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(StoreError::NoneAvailable { .. }) => exhausted += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(succeeded, 3);
    assert_eq!(exhausted, 2);
    store.run(|ks| {
        let instance = ks.instance("s1").unwrap();
        assert_eq!(instance.current_load, 3);
        assert_eq!(instance.status, InstanceStatus::Busy);
    });
}

#[tokio::test]
async fn ready_queue_and_instance_queues_stay_disjoint() {
    let store = Store::default();
    store.run(|ks| ks.insert_task(TaskRecord::new("t1", "project", 50, Utc::now())));
    store.run(|ks| {
        ks.decompose_and_store(
            "t1",
            &DecompositionPlan {
                subtasks: vec![planned("A", &[]), planned("B", &["A"])],
                strategy: None,
            },
            Utc::now(),
        )
        .unwrap()
    });
    register(&store, "w1", 2);

    store.run(|ks| {
        ks.assign_to_specialist("t1", "A", SpecialistKind::General, &BTreeSet::new(), Utc::now())
            .unwrap();
        assert!(!ks.ready_contains("t1", "A"));
        assert!(ks.dispatched_anywhere("t1", "A"));
    });

    // Completing A unblocks B into the ready queue only.
    store.run(|ks| {
        ks.synthesize_progress(
            "t1",
            "A",
            &SubtaskResult {
                status: WorkStatus::Completed,
                output: None,
            },
            Utc::now(),
        )
        .unwrap();
        assert!(ks.ready_contains("t1", "B"));
        assert!(!ks.dispatched_anywhere("t1", "B"));
    });
}

#[tokio::test]
async fn event_feed_sees_script_events_in_order() {
    let store = Store::default();
    let mut rx = store.subscribe_events();

    store.run(|ks| ks.insert_task(TaskRecord::new("t1", "project", 50, Utc::now())));
    store.run(|ks| {
        ks.decompose_and_store(
            "t1",
            &DecompositionPlan {
                subtasks: vec![planned("A", &[])],
                strategy: None,
            },
            Utc::now(),
        )
        .unwrap()
    });

    let first = rx.recv().await.unwrap();
    let second = rx.recv().await.unwrap();
    assert_eq!(first.event_type, "subtask.ready");
    assert_eq!(second.event_type, "task.decomposed");
    assert!(first.id < second.id);
}

#[tokio::test]
async fn attachment_rehydrates_from_sink_after_eviction() {
    let store = Store::default();
    let sink = Sink::open_in_memory().unwrap();

    store.run(|ks| ks.insert_task(TaskRecord::new("t2", "project", 10, Utc::now())));

    let attachment = AttachmentRecord {
        id: uuid::Uuid::now_v7().to_string(),
        task_id: "t2".into(),
        key: "k1".into(),
        payload: AttachmentPayload::Json {
            value: serde_json::json!({"foo": "bar"}),
        },
        created_at: Utc::now(),
        created_by: None,
    };

    // Write-through: keyspace first, then the sink; a sink failure would
    // fail the whole create.
    store.run(|ks| ks.put_attachment(attachment.clone()));
    sink.put_attachment(&attachment).await.unwrap();

    // Evict the in-store copy, then read through the sink.
    store.run(|ks| ks.remove_attachment("t2", "k1"));
    assert!(store.run(|ks| ks.attachment("t2", "k1").cloned()).is_none());

    let rehydrated = sink.get_attachment("t2", "k1").await.unwrap().unwrap();
    match rehydrated.payload {
        AttachmentPayload::Json { value } => assert_eq!(value, serde_json::json!({"foo": "bar"})),
        other => panic!("unexpected payload: {other:?}"),
    }
}

#[tokio::test]
async fn reassignment_preserves_work_under_concurrent_completion() {
    let store = Store::default();
    store.run(|ks| ks.insert_task(TaskRecord::new("t1", "project", 50, Utc::now())));
    store.run(|ks| {
        ks.decompose_and_store(
            "t1",
            &DecompositionPlan {
                subtasks: (1..=4).map(|i| planned(&format!("st-{i}"), &[])).collect(),
                strategy: None,
            },
            Utc::now(),
        )
        .unwrap()
    });
    register(&store, "w1", 4);

    store.run(|ks| {
        for i in 1..=4 {
            ks.assign_to_specialist(
                "t1",
                &format!("st-{i}"),
                SpecialistKind::General,
                &BTreeSet::new(),
                Utc::now(),
            )
            .unwrap();
        }
    });

    // One subtask completes before the instance dies.
    store.run(|ks| {
        ks.synthesize_progress(
            "t1",
            "st-1",
            &SubtaskResult {
                status: WorkStatus::Completed,
                output: None,
            },
            Utc::now(),
        )
        .unwrap()
    });

    let outcome = store.run(|ks| ks.reassign_from_instance("w1", Utc::now()).unwrap());
    assert_eq!(outcome.reassigned_count, 3);

    // Nothing lost: the completed subtask stays completed, the rest are
    // ready again.
    store.run(|ks| {
        assert_eq!(
            ks.subtask("t1", "st-1").unwrap().status,
            WorkStatus::Completed
        );
        for i in 2..=4 {
            let id = format!("st-{i}");
            assert!(ks.ready_contains("t1", &id), "{id} should be ready");
        }
        assert_eq!(ks.instance("w1").unwrap().current_load, 0);
    });
}
