use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use musical_conductor_core::{
    Beat, BeatContext, BeatKind, BeatTiming, Collaborators, Conductor, ConductorConfig,
    ConductorError, ConductorEvent, ExecutionState, HandlerError, HandlerRegistry, KeyValueStore,
    MemoryStore, MemorySurface, MountStatus, Movement, MovementStatus, PlayOptions, PluginBundle,
    PluginManifest, Route, SequenceDef, UiSurface,
};
use serde_json::{json, Value};

type Log = Arc<Mutex<Vec<String>>>;

fn push(log: &Log, entry: impl Into<String>) {
    log.lock().unwrap().push(entry.into());
}

fn theme_sequence() -> SequenceDef {
    SequenceDef::from_json(
        r#"{
            "id": "theme-switch",
            "name": "Theme Switch",
            "movements": [{
                "name": "apply",
                "beats": [
                    { "beat": 1, "event": "theme:validate", "handler": "validateTheme" },
                    { "beat": 2, "event": "theme:apply", "handler": "applyTheme", "kind": "stage-crew" },
                    { "beat": 3, "event": "theme:persist", "handler": "persistTheme", "kind": "io" },
                    { "beat": 4, "event": "theme:notify", "handler": "notifyThemeChange" }
                ]
            }]
        }"#,
    )
    .unwrap()
}

fn theme_handlers(log: &Log) -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    {
        let log = log.clone();
        handlers.register_sync("validateTheme", move |baton, _| {
            push(&log, "validateTheme");
            let theme = baton.get_str("targetTheme").unwrap_or("dark").to_string();
            if theme == "neon" {
                return Err(format!("unsupported theme `{theme}`").into());
            }
            baton.set("theme", theme);
            Ok(())
        });
    }
    {
        let log = log.clone();
        handlers.register_sync("applyTheme", move |baton, context| {
            push(&log, "applyTheme");
            let theme = baton.get_str("theme").unwrap_or_default().to_string();
            if let Some(ui) = context.ui() {
                ui.set_property("body", "data-theme", &theme)?;
            }
            Ok(())
        });
    }
    {
        let log = log.clone();
        handlers.register_async("persistTheme", move |baton, context: BeatContext| {
            let log = log.clone();
            async move {
                push(&log, "persistTheme");
                let theme = baton.get("theme")?.unwrap_or(Value::Null);
                let store = context.store().ok_or("no store for io beat")?;
                store.put("theme", theme).await?;
                Ok::<(), HandlerError>(())
            }
        });
    }
    {
        let log = log.clone();
        handlers.register_sync("notifyThemeChange", move |baton, _| {
            push(&log, "notifyThemeChange");
            baton.set("notified", true);
            Ok(())
        });
    }
    handlers
}

#[tokio::test]
async fn rejected_theme_stops_the_movement_at_the_first_beat() {
    let log: Log = Arc::default();
    let conductor = Conductor::default();
    conductor
        .mount(theme_sequence(), &theme_handlers(&log), "theme")
        .unwrap();

    let outcome = conductor
        .play("theme", "theme-switch", json!({ "targetTheme": "neon" }), PlayOptions::default())
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(outcome.state, ExecutionState::Failed);
    match outcome.error {
        Some(ConductorError::HandlerExecution { beat, ref handler, .. }) => {
            assert_eq!(beat, 1);
            assert_eq!(handler, "validateTheme");
        }
        other => panic!("unexpected outcome error: {other:?}"),
    }
    assert_eq!(*log.lock().unwrap(), vec!["validateTheme"]);
    assert_eq!(outcome.movements[0].beats_skipped, 3);
}

#[tokio::test]
async fn theme_switch_reaches_ui_and_store() {
    let log: Log = Arc::default();
    let surface = Arc::new(MemorySurface::new());
    let store = Arc::new(MemoryStore::new());
    let conductor = Conductor::builder(ConductorConfig::default())
        .collaborators(
            Collaborators::new()
                .with_ui(surface.clone())
                .with_store(store.clone()),
        )
        .build();
    conductor
        .mount(theme_sequence(), &theme_handlers(&log), "theme")
        .unwrap();

    let result = conductor
        .play("theme", "theme-switch", json!({ "targetTheme": "light" }), PlayOptions::default())
        .unwrap()
        .wait()
        .await
        .unwrap()
        .into_result()
        .unwrap();

    assert_eq!(result["theme"], "light");
    assert_eq!(result["notified"], true);
    assert_eq!(surface.property("body", "data-theme").as_deref(), Some("light"));
    assert_eq!(store.get("theme").await.unwrap(), Some(json!("light")));
    assert_eq!(
        *log.lock().unwrap(),
        vec!["validateTheme", "applyTheme", "persistTheme", "notifyThemeChange"]
    );
}

#[tokio::test]
async fn pure_beats_get_no_collaborators() {
    let conductor = Conductor::builder(ConductorConfig::default())
        .collaborators(
            Collaborators::new()
                .with_ui(Arc::new(MemorySurface::new()))
                .with_store(Arc::new(MemoryStore::new())),
        )
        .build();
    let handlers = HandlerRegistry::new().with_sync("inspect", |baton, context| {
        baton.set("ui", context.ui().is_some());
        baton.set("store", context.store().is_some());
        baton.set("conductor", context.conductor().is_some());
        Ok(())
    });
    conductor
        .mount(
            SequenceDef::new("pure", "Pure", vec![Movement::new("m", vec![Beat::new(1, "e", "inspect")])]),
            &handlers,
            "p",
        )
        .unwrap();

    let baton = conductor
        .play("p", "pure", json!({}), PlayOptions::default())
        .unwrap()
        .wait()
        .await
        .unwrap()
        .baton;
    assert_eq!(baton, json!({ "ui": false, "store": false, "conductor": false }));
}

async fn assert_serial_plays(runs: usize) {
    let log: Log = Arc::default();
    let conductor = Conductor::default();
    let handlers = {
        let log = log.clone();
        HandlerRegistry::new().with_async("step", move |baton, _| {
            let log = log.clone();
            async move {
                let run = baton.get("run")?.unwrap_or(Value::Null);
                push(&log, format!("start {run}"));
                tokio::time::sleep(Duration::from_millis(5)).await;
                tokio::task::yield_now().await;
                push(&log, format!("end {run}"));
                Ok::<(), HandlerError>(())
            }
        })
    };
    conductor
        .mount(
            SequenceDef::new(
                "serial",
                "Serial",
                vec![Movement::new(
                    "m",
                    vec![Beat::new(1, "a", "step"), Beat::new(2, "b", "step")],
                )],
            ),
            &handlers,
            "p",
        )
        .unwrap();

    let handles: Vec<_> = (0..runs)
        .map(|run| {
            conductor
                .play("p", "serial", json!({ "run": run }), PlayOptions::correlated("shared"))
                .unwrap()
        })
        .collect();
    for handle in handles {
        assert!(handle.wait().await.unwrap().is_success());
    }

    let expected: Vec<String> = (0..runs)
        .flat_map(|run| {
            ["start", "end", "start", "end"]
                .into_iter()
                .map(move |phase| format!("{phase} {run}"))
        })
        .collect();
    assert_eq!(*log.lock().unwrap(), expected);
}

#[tokio::test]
async fn same_correlation_id_never_interleaves() {
    assert_serial_plays(2).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_correlation_id_never_interleaves_across_worker_threads() {
    assert_serial_plays(8).await;
}
#[tokio::test]
async fn distinct_correlation_ids_run_concurrently() {
    let conductor = Conductor::default();
    let gate = Arc::new(tokio::sync::Barrier::new(2));
    let handlers = {
        let gate = gate.clone();
        HandlerRegistry::new().with_async("meet", move |_, _| {
            let gate = gate.clone();
            async move {
                gate.wait().await;
                Ok::<(), HandlerError>(())
            }
        })
    };
    conductor
        .mount(
            SequenceDef::new("meet", "Meet", vec![Movement::new("m", vec![Beat::new(1, "e", "meet")])]),
            &handlers,
            "p",
        )
        .unwrap();

    let a = conductor.play("p", "meet", json!({}), PlayOptions::correlated("a")).unwrap();
    let b = conductor.play("p", "meet", json!({}), PlayOptions::correlated("b")).unwrap();

    let both = async { (a.wait().await.unwrap(), b.wait().await.unwrap()) };
    let (a, b) = tokio::time::timeout(Duration::from_secs(5), both)
        .await
        .expect("executions with different correlation ids must not block each other");
    assert!(a.is_success() && b.is_success());
}

#[tokio::test]
async fn remounting_identical_definition_is_idempotent() {
    let conductor = Conductor::default();
    let log: Log = Arc::default();
    let handlers = theme_handlers(&log);

    assert_eq!(
        conductor.mount(theme_sequence(), &handlers, "theme").unwrap(),
        MountStatus::Mounted
    );
    assert_eq!(
        conductor.mount(theme_sequence(), &handlers, "theme").unwrap(),
        MountStatus::Unchanged
    );
    assert_eq!(conductor.catalog().len(), 1);

    let mut changed = theme_sequence();
    changed.name = "Theme Switch v2".to_string();
    assert!(matches!(
        conductor.mount(changed, &handlers, "theme"),
        Err(ConductorError::DuplicateSequence { .. })
    ));
    assert_eq!(conductor.catalog().get("theme", "theme-switch").unwrap().name(), "Theme Switch");
}

#[tokio::test]
async fn missing_handler_prevents_partial_plugin_mount() {
    let conductor = Conductor::default();
    let manifest = PluginManifest {
        id: "broken".to_string(),
        sequences: vec![
            SequenceDef::new("ok", "Ok", vec![Movement::new("m", vec![Beat::new(1, "e", "known")])]),
            SequenceDef::new("bad", "Bad", vec![Movement::new("m", vec![Beat::new(1, "e", "unknown")])]),
        ],
        topics: Default::default(),
    };
    let bundle = PluginBundle::new(
        manifest,
        HandlerRegistry::new().with_sync("known", |_, _| Ok(())),
    );

    assert!(matches!(
        conductor.mount_plugin(&bundle),
        Err(ConductorError::MissingHandler { ref handler, .. }) if handler == "unknown"
    ));
    assert!(conductor.catalog().is_empty());
}

#[tokio::test]
async fn publish_to_two_routes_gives_each_its_own_baton() {
    let conductor = Conductor::default();
    let writer = HandlerRegistry::new().with_sync("mutate", |baton, _| {
        baton.set("x", 99);
        baton.set("touched", true);
        Ok(())
    });
    let reader = HandlerRegistry::new().with_async("observe", |baton, _| async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let x = baton.get("x")?.unwrap_or(Value::Null);
        baton.set("seen", x)?;
        Ok::<(), HandlerError>(())
    });
    let single = |id: &str, handler: &str| {
        SequenceDef::new(id, id, vec![Movement::new("m", vec![Beat::new(1, "e", handler)])])
    };
    conductor.mount(single("write", "mutate"), &writer, "writer").unwrap();
    conductor.mount(single("read", "observe"), &reader, "reader").unwrap();
    conductor.router().add_route("topic.a", Route::new("writer", "write")).unwrap();
    conductor.router().add_route("topic.a", Route::new("reader", "read")).unwrap();

    let summary = conductor.publish("topic.a", json!({ "x": 1 }));
    assert_eq!(summary.routes_matched, 2);
    assert_eq!(summary.executions.len(), 2);
    let ids: Vec<_> = summary.executions.iter().map(|handle| handle.execution_id()).collect();
    assert_ne!(ids[0], ids[1]);

    let outcomes: Vec<_> = summary
        .wait_all()
        .await
        .into_iter()
        .map(|outcome| outcome.unwrap())
        .collect();
    assert_eq!(outcomes[0].baton, json!({ "x": 99, "touched": true }));
    assert_eq!(outcomes[1].baton, json!({ "x": 1, "seen": 1 }));
}

#[tokio::test]
async fn unmount_lets_in_flight_play_finish() {
    let conductor = Conductor::default();
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));
    let handlers = HandlerRegistry::new()
        .with_async("wait", move |_, _| {
            let release_rx = release_rx.clone();
            async move {
                if let Some(rx) = release_rx.lock().await.take() {
                    let _ = rx.await;
                }
                Ok::<(), HandlerError>(())
            }
        })
        .with_sync("finish", |baton, _| {
            baton.set("finished", true);
            Ok(())
        });
    conductor
        .mount(
            SequenceDef::new(
                "long",
                "Long",
                vec![Movement::new(
                    "m",
                    vec![Beat::new(1, "wait", "wait"), Beat::new(2, "finish", "finish")],
                )],
            ),
            &handlers,
            "P1",
        )
        .unwrap();

    let running = conductor.play("P1", "long", json!({}), PlayOptions::default()).unwrap();
    tokio::task::yield_now().await;
    assert_eq!(conductor.unmount("P1"), 1);

    let err = conductor
        .play("P1", "long", json!({}), PlayOptions::default())
        .unwrap_err();
    assert!(matches!(err, ConductorError::SequenceNotFound { .. }));

    release_tx.send(()).unwrap();
    let outcome = running.wait().await.unwrap();
    assert!(outcome.is_success());
    assert_eq!(outcome.baton["finished"], true);
}

#[tokio::test]
async fn cancellation_releases_the_correlation_lock() {
    let log: Log = Arc::default();
    let conductor = Conductor::default();
    let handlers = {
        let log = log.clone();
        HandlerRegistry::new()
            .with_async("slow", |_, _| async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<(), HandlerError>(())
            })
            .with_sync("after", move |_, _| {
                push(&log, "after");
                Ok(())
            })
    };
    conductor
        .mount(
            SequenceDef::new(
                "cancel",
                "Cancel",
                vec![Movement::new(
                    "m",
                    vec![Beat::new(1, "slow", "slow"), Beat::new(2, "after", "after")],
                )],
            ),
            &handlers,
            "p",
        )
        .unwrap();

    let first = conductor
        .play("p", "cancel", json!({}), PlayOptions::correlated("c"))
        .unwrap();
    let second = conductor
        .play("p", "cancel", json!({}), PlayOptions::correlated("c"))
        .unwrap();
    first.cancel();

    let first = first.wait().await.unwrap();
    assert!(first.is_cancelled());
    assert_eq!(first.state, ExecutionState::Failed);

    let second = second.wait().await.unwrap();
    assert!(second.is_success());
    assert_eq!(*log.lock().unwrap(), vec!["after"]);
    assert!(conductor.active_executions().is_empty());
    assert_eq!(conductor.statistics().sequences_cancelled, 1);
}

#[tokio::test]
async fn movements_are_independent_unless_flagged() {
    let log: Log = Arc::default();
    let conductor = Conductor::default();
    let mut handlers = HandlerRegistry::new().with_sync("fail", |_, _| Err("boom".into()));
    for name in ["cleanup", "guarded"] {
        let log = log.clone();
        handlers.register_sync(name, move |_, _| {
            push(&log, name);
            Ok(())
        });
    }
    let mut guarded = Movement::new("guarded", vec![Beat::new(1, "g", "guarded")]);
    guarded.abort_on_prior_failure = true;
    let sequence = SequenceDef::new(
        "three",
        "Three",
        vec![
            Movement::new("failing", vec![Beat::new(1, "f", "fail")]),
            Movement::new("cleanup", vec![Beat::new(1, "c", "cleanup")]),
            guarded,
        ],
    );
    conductor.mount(sequence, &handlers, "p").unwrap();

    let outcome = conductor
        .play("p", "three", json!({}), PlayOptions::default())
        .unwrap()
        .wait()
        .await
        .unwrap();

    let statuses: Vec<_> = outcome.movements.iter().map(|report| report.status).collect();
    assert_eq!(
        statuses,
        vec![MovementStatus::Failed, MovementStatus::Completed, MovementStatus::Skipped]
    );
    assert_eq!(*log.lock().unwrap(), vec!["cleanup"]);
}

async fn assert_delayed_beats_joined() {
    let conductor = Conductor::default();
    let handlers = HandlerRegistry::new()
        .with_async("late", |baton, _| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            tokio::task::yield_now().await;
            baton.set("late", true)?;
            Ok::<(), HandlerError>(())
        })
        .with_sync("check", |baton, _| {
            baton.set("sawLate", baton.contains_key("late"));
            Ok(())
        });
    conductor
        .mount(
            SequenceDef::new(
                "delayed",
                "Delayed",
                vec![
                    Movement::new(
                        "first",
                        vec![Beat::new(1, "late", "late").timing(BeatTiming::Delayed)],
                    ),
                    Movement::new("second", vec![Beat::new(1, "check", "check")]),
                ],
            ),
            &handlers,
            "p",
        )
        .unwrap();

    let baton = conductor
        .play("p", "delayed", json!({}), PlayOptions::default())
        .unwrap()
        .wait()
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(baton, json!({ "late": true, "sawLate": true }));
}

#[tokio::test]
async fn delayed_beats_finish_before_the_sequence_completes() {
    assert_delayed_beats_joined().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn delayed_beats_are_joined_across_worker_threads() {
    assert_delayed_beats_joined().await;
}

#[tokio::test]
async fn sync_handler_reads_the_baton_through_its_context() {
    let conductor = Conductor::default();
    let handlers = HandlerRegistry::new().with_sync("peek", |baton, context| {
        let seen = context.payload().get("x")?.unwrap_or_default();
        baton.set("seen", seen);
        Ok(())
    });
    conductor
        .mount(
            SequenceDef::new("peek", "Peek", vec![Movement::new("m", vec![Beat::new(1, "p", "peek")])]),
            &handlers,
            "p",
        )
        .unwrap();

    let handle = conductor
        .play("p", "peek", json!({ "x": 1 }), PlayOptions::default())
        .unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(2), handle.wait())
        .await
        .expect("a one-beat play must not block on its own baton")
        .unwrap();

    assert_eq!(outcome.baton, json!({ "x": 1, "seen": 1 }));
}
#[tokio::test]
async fn io_beat_can_publish_a_nested_topic() {
    let conductor = Conductor::default();
    let received: Log = Arc::default();
    let handlers = HandlerRegistry::new()
        .with_async("forward", |baton, context: BeatContext| async move {
            let conductor = context.conductor().ok_or("no conductor")?.clone();
            let payload = baton.to_value()?;
            let outcomes = conductor.publish("child.topic", payload).wait_all().await;
            for outcome in outcomes {
                outcome?.into_result()?;
            }
            Ok::<(), HandlerError>(())
        })
        .with_sync("record", |baton, _| {
            baton.set("child", true);
            Ok(())
        });
    let single = |id: &str, beat: Beat| SequenceDef::new(id, id, vec![Movement::new("m", vec![beat])]);
    conductor
        .mount(single("parent", Beat::new(1, "fwd", "forward").kind(BeatKind::Io)), &handlers, "p")
        .unwrap();
    conductor
        .mount(single("child", Beat::new(1, "rec", "record")), &handlers, "p")
        .unwrap();
    conductor.router().add_route("child.topic", Route::new("p", "child")).unwrap();
    let _subscription = {
        let received = received.clone();
        conductor
            .subscribe("child.topic", move |payload| push(&received, payload["from"].to_string()))
            .unwrap()
    };

    let outcome = conductor
        .play("p", "parent", json!({ "from": "parent" }), PlayOptions::default())
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert!(outcome.is_success(), "{:?}", outcome.error);
    assert_eq!(*received.lock().unwrap(), vec!["\"parent\""]);
}

#[tokio::test]
async fn lifecycle_events_follow_the_execution() {
    let conductor = Conductor::default();
    let mut events = conductor.events();
    let handlers = HandlerRegistry::new().with_sync("touch", |baton, _| {
        baton.set("touched", true);
        Ok(())
    });
    conductor
        .mount(
            SequenceDef::new("evented", "Evented", vec![Movement::new("m", vec![Beat::new(1, "t", "touch")])]),
            &handlers,
            "p",
        )
        .unwrap();

    conductor
        .play("p", "evented", json!({}), PlayOptions::correlated("evt"))
        .unwrap()
        .wait()
        .await
        .unwrap();
    conductor.publish("nobody.listens", json!({}));

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(matches!(seen[0], ConductorEvent::SequenceStarted { ref correlation_id, .. } if correlation_id == "evt"));
    assert!(matches!(seen[1], ConductorEvent::BeatStarted { beat: 1, .. }));
    assert!(matches!(
        seen[2],
        ConductorEvent::BeatCompleted { ref changed_keys, .. } if changed_keys == &vec!["touched".to_string()]
    ));
    assert!(matches!(seen[3], ConductorEvent::SequenceCompleted { .. }));
    assert!(matches!(seen[4], ConductorEvent::TopicUnrouted { ref topic } if topic == "nobody.listens"));
    assert_eq!(conductor.statistics().unrouted_topics, 1);
}

#[tokio::test]
async fn callback_receives_final_baton() {
    let conductor = Conductor::default();
    let handlers = HandlerRegistry::new().with_sync("stamp", |baton, _| {
        baton.set("stamped", true);
        Ok(())
    });
    conductor
        .mount(
            SequenceDef::new("cb", "Callback", vec![Movement::new("m", vec![Beat::new(1, "s", "stamp")])]),
            &handlers,
            "p",
        )
        .unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel();
    conductor
        .play(
            "p",
            "cb",
            json!({ "seed": 1 }),
            PlayOptions::default().with_callback(move |result| {
                let _ = tx.send(result);
            }),
        )
        .unwrap();

    let baton = rx.await.unwrap().unwrap();
    assert_eq!(baton, json!({ "seed": 1, "stamped": true }));
}
