//! End-to-end runtime behavior with scripted in-process units.
//!
//! Each test unit sends `ready` (plus any startup messages) and then hands its
//! channel ends to the test, which plays the extension side by hand.

use anyhow::Result;
use async_trait::async_trait;
use extension_runtime::config::RuntimeConfig;
use extension_runtime::extensions::{
    Collaborators, DatabaseExecutor, ExtensionManifest, ExtensionRuntime, ExtensionStatus, HostMessage,
    InProcessLauncher, JobFireResult, RuntimeError, RuntimeEvent, ScheduledJob, Scheduler,
    SecretsStore, StreamEvent, TaskStatus, UnitContext, UnitMessage,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc};

struct Harness {
    runtime: ExtensionRuntime,
    launcher: InProcessLauncher,
    units: mpsc::UnboundedReceiver<UnitContext>,
    units_tx: mpsc::UnboundedSender<UnitContext>,
    _tmp: TempDir,
}

impl Harness {
    fn new() -> Self {
        Self::with(|collaborators| collaborators, None)
    }

    fn with(
        collaborators: impl FnOnce(Collaborators) -> Collaborators,
        secrets: Option<Arc<SecretsStore>>,
    ) -> Self {
        let tmp = TempDir::new().unwrap();
        let launcher = InProcessLauncher::new();
        let mut config = RuntimeConfig::default();
        config.runtime.deactivate_grace_ms = 200;

        let mut builder = ExtensionRuntime::builder()
            .config(config)
            .launcher(Arc::new(launcher.clone()))
            .storage_root(tmp.path().join("storage"))
            .collaborators(collaborators(Collaborators::default()));
        if let Some(secrets) = secrets {
            builder = builder.secrets(secrets);
        }

        let (units_tx, units) = mpsc::unbounded_channel();
        Self {
            runtime: builder.build().unwrap(),
            launcher,
            units,
            units_tx,
            _tmp: tmp,
        }
    }

    /// Register a unit that sends `startup` after `ready`
    fn unit(&self, id: &str, startup: Vec<UnitMessage>) {
        let units_tx = self.units_tx.clone();
        self.launcher.register(id, move |ctx: UnitContext| {
            let units_tx = units_tx.clone();
            let startup = startup.clone();
            async move {
                ctx.send(UnitMessage::Ready);
                for message in startup {
                    ctx.send(message);
                }
                let _ = units_tx.send(ctx);
            }
        });
    }

    /// Load and return the unit side, already past `activate`
    async fn load(&mut self, manifest: ExtensionManifest) -> (UnitContext, HostMessage) {
        let snapshot = self.runtime.load(manifest, ".").await.unwrap();
        assert_eq!(snapshot.status, ExtensionStatus::Active, "{:?}", snapshot.error);
        let mut unit = self.units.recv().await.unwrap();
        let activate = unit.recv().await.unwrap();
        (unit, activate)
    }
}

fn manifest(id: &str, permissions: &[&str], contributes: Value) -> ExtensionManifest {
    serde_json::from_value(json!({
        "id": id,
        "version": "1.2.0",
        "main": "index.js",
        "permissions": permissions,
        "contributes": contributes,
    }))
    .unwrap()
}

fn provider(id: &str) -> UnitMessage {
    UnitMessage::ProviderRegistered {
        id: id.to_string(),
        name: String::new(),
    }
}

/// Send a request from the unit and wait for the host's response
async fn request(unit: &mut UnitContext, id: &str, method: &str, payload: Value) -> Result<Value, String> {
    unit.send(UnitMessage::Request {
        id: id.to_string(),
        method: method.to_string(),
        payload,
    });
    loop {
        match unit.recv().await.expect("host closed the unit channel") {
            HostMessage::Response {
                request_id,
                success,
                data,
                error,
            } if request_id == id => {
                return if success {
                    Ok(data.unwrap_or(Value::Null))
                } else {
                    Err(error.unwrap_or_default())
                };
            }
            _ => continue,
        }
    }
}

/// Let the unit answer `deactivate` by exiting
fn exit_on_deactivate(mut unit: UnitContext) {
    tokio::spawn(async move {
        while let Some(message) = unit.recv().await {
            if message == HostMessage::Deactivate {
                break;
            }
        }
    });
}

async fn wait_for(
    events: &mut broadcast::Receiver<RuntimeEvent>,
    matches: impl Fn(&RuntimeEvent) -> bool,
) -> RuntimeEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not emitted")
}

#[tokio::test]
async fn test_load_activates_with_settings_and_registers_contributions() {
    let mut h = Harness::new();
    h.unit("weather", vec![provider("weather-llm"), UnitMessage::ToolRegistered {
        id: "forecast".into(),
        name: "Forecast".into(),
        description: "Weather forecast".into(),
        parameters: json!({"type": "object"}),
    }]);
    let mut events = h.runtime.subscribe();

    let (mut unit, activate) = h
        .load(manifest(
            "weather",
            &["providers.register", "tools.register"],
            json!({"settings": [{"key": "units", "default": "metric"}]}),
        ))
        .await;

    match activate {
        HostMessage::Activate {
            extension_id,
            version,
            permissions,
            settings,
            storage_path,
        } => {
            assert_eq!(extension_id, "weather");
            assert_eq!(version, "1.2.0");
            assert_eq!(permissions, vec!["providers.register", "tools.register"]);
            assert_eq!(settings.get("units"), Some(&json!("metric")));
            assert!(storage_path.ends_with("weather"));
        }
        other => panic!("expected activate, got {:?}", other),
    }

    wait_for(&mut events, |e| matches!(e, RuntimeEvent::ToolRegistered { .. })).await;
    let providers: Vec<String> = h.runtime.providers().into_iter().map(|p| p.id).collect();
    assert_eq!(providers, vec!["weather-llm"]);
    assert_eq!(h.runtime.tools()[0].description, "Weather forecast");

    let status = h.runtime.status("weather").unwrap();
    assert_eq!(status.providers, vec!["weather-llm"]);
    assert_eq!(status.tools, vec!["forecast"]);

    let all = request(&mut unit, "r1", "settings.getAll", Value::Null).await;
    assert_eq!(all, Ok(json!({"units": "metric"})));
}

#[tokio::test]
async fn test_registration_without_permission_is_ignored() {
    let mut h = Harness::new();
    h.unit("sneaky", vec![provider("sneaky-llm")]);
    let (mut unit, _) = h.load(manifest("sneaky", &[], json!({}))).await;

    // messages are handled in order, so the registration was seen by now
    request(&mut unit, "r1", "settings.getAll", Value::Null)
        .await
        .unwrap();
    assert!(h.runtime.providers().is_empty());
}

#[tokio::test]
async fn test_load_twice_and_invalid_manifest() {
    let mut h = Harness::new();
    h.unit("dup", vec![]);
    let (unit, _) = h.load(manifest("dup", &[], json!({}))).await;
    assert!(matches!(
        h.runtime.load(manifest("dup", &[], json!({})), ".").await,
        Err(RuntimeError::AlreadyLoaded(_))
    ));

    let mut bad = manifest("broken", &[], json!({}));
    bad.version = "not-a-version".into();
    let snapshot = h.runtime.load(bad, ".").await.unwrap();
    assert_eq!(snapshot.status, ExtensionStatus::Error);
    assert!(snapshot.error.unwrap().contains("semver"));

    // no unit registered for this id
    let snapshot = h
        .runtime
        .load(manifest("ghost", &[], json!({})), ".")
        .await
        .unwrap();
    assert_eq!(snapshot.status, ExtensionStatus::Error);

    drop(unit);
}

#[tokio::test]
async fn test_unload_removes_providers_and_rejects_pending_calls() {
    let mut h = Harness::new();
    h.unit("llm", vec![provider("alpha"), provider("beta")]);
    let mut events = h.runtime.subscribe();
    let (mut unit, _) = h.load(manifest("llm", &["providers.register"], json!({}))).await;
    wait_for(&mut events, |e| {
        matches!(e, RuntimeEvent::ProviderRegistered { provider_id, .. } if provider_id == "beta")
    })
    .await;
    assert_eq!(h.runtime.providers().len(), 2);

    let runtime = h.runtime.clone();
    let call = tokio::spawn(async move { runtime.list_models("alpha").await });
    match unit.recv().await.unwrap() {
        HostMessage::ProviderModelsRequest { provider_id, .. } => assert_eq!(provider_id, "alpha"),
        other => panic!("expected models request, got {:?}", other),
    }
    assert_eq!(h.runtime.pending_requests(), 1);

    exit_on_deactivate(unit);
    h.runtime.unload("llm").await.unwrap();

    assert!(matches!(call.await.unwrap(), Err(RuntimeError::Unloaded(_))));
    assert!(h.runtime.providers().is_empty());
    assert_eq!(h.runtime.pending_requests(), 0);
    assert!(h.runtime.status("llm").is_none());

    let mut unregistered = 0;
    loop {
        match wait_for(&mut events, |e| {
            matches!(
                e,
                RuntimeEvent::ProviderUnregistered { .. } | RuntimeEvent::ExtensionUnloaded { .. }
            )
        })
        .await
        {
            RuntimeEvent::ProviderUnregistered { .. } => unregistered += 1,
            _ => break,
        }
    }
    assert_eq!(unregistered, 2);

    assert!(matches!(
        h.runtime.unload("llm").await,
        Err(RuntimeError::NotLoaded(_))
    ));
}

#[tokio::test]
async fn test_unknown_method_and_denied_requests() {
    let mut h = Harness::new();
    h.unit("plain", vec![]);
    let (mut unit, _) = h.load(manifest("plain", &[], json!({}))).await;

    let err = request(&mut unit, "r1", "fs.readFile", json!({"path": "/etc/passwd"}))
        .await
        .unwrap_err();
    assert!(err.contains("Unknown method"), "{}", err);

    let err = request(&mut unit, "r2", "secrets.get", json!({"key": "token"}))
        .await
        .unwrap_err();
    assert!(err.contains("secrets.manage"), "{}", err);

    let err = request(
        &mut unit,
        "r3",
        "network.fetch",
        json!({"url": "https://api.example.com/data"}),
    )
    .await
    .unwrap_err();
    assert!(err.contains("network:api.example.com:443"), "{}", err);

    let err = request(&mut unit, "r4", "settings.set", json!({"key": "a", "value": 1}))
        .await
        .unwrap_err();
    assert!(err.contains("settings.register"), "{}", err);

    let err = request(&mut unit, "r5", "storage.get", json!({"nope": true}))
        .await
        .unwrap_err();
    assert!(err.contains("Malformed payload"), "{}", err);
}

#[tokio::test]
async fn test_storage_and_collection_checks() {
    let mut h = Harness::new();
    h.unit("flat", vec![]);
    h.unit("bare", vec![]);
    h.unit("todo", vec![]);

    let (mut flat, _) = h.load(manifest("flat", &["storage.local"], json!({}))).await;
    request(&mut flat, "s1", "storage.set", json!({"key": "k", "value": {"n": 1}}))
        .await
        .unwrap();
    assert_eq!(
        request(&mut flat, "s2", "storage.get", json!({"key": "k"})).await,
        Ok(json!({"n": 1}))
    );
    // storage.local does not cover undeclared collections
    let err = request(
        &mut flat,
        "s3",
        "storage.set",
        json!({"key": "k", "value": 1, "collection": "todos"}),
    )
    .await
    .unwrap_err();
    assert!(err.contains("storage:todos"), "{}", err);

    let todos = json!({"collections": [{"name": "todos", "indexes": ["status"]}]});

    // declared, but no storage permission
    let (mut bare, _) = h.load(manifest("bare", &[], todos.clone())).await;
    let err = request(
        &mut bare,
        "b1",
        "storage.get",
        json!({"key": "k", "collection": "todos"}),
    )
    .await
    .unwrap_err();
    assert!(err.contains("Permission denied"), "{}", err);

    let (mut todo, _) = h.load(manifest("todo", &["storage:todos"], todos)).await;
    for (key, status) in [("a", "open"), ("b", "done"), ("c", "open")] {
        request(
            &mut todo,
            key,
            "storage.set",
            json!({"key": key, "value": {"status": status}, "collection": "todos"}),
        )
        .await
        .unwrap();
    }
    let open = request(
        &mut todo,
        "q1",
        "storage.query",
        json!({"collection": "todos", "filter": {"status": "open"}}),
    )
    .await
    .unwrap();
    let keys: Vec<&str> = open
        .as_array()
        .unwrap()
        .iter()
        .map(|row| row["key"].as_str().unwrap())
        .collect();
    assert_eq!(keys, vec!["a", "c"]);

    // only indexed fields can be filtered on
    assert!(request(
        &mut todo,
        "q2",
        "storage.query",
        json!({"collection": "todos", "filter": {"title": "x"}}),
    )
    .await
    .is_err());

    let err = request(&mut todo, "q3", "storage.keys", json!({"userId": "../etc"}))
        .await
        .unwrap_err();
    assert!(err.contains("storage.local") || err.contains("userId"), "{}", err);
}

#[derive(Default)]
struct CountingScheduler {
    calls: AtomicUsize,
}

#[async_trait]
impl Scheduler for CountingScheduler {
    async fn schedule(&self, _extension_id: &str, job: ScheduledJob) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("job-{}", job.name))
    }

    async fn cancel(&self, _extension_id: &str, _user_id: &str, _job_id: &str) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn update_job_result(&self, _extension_id: &str, _result: JobFireResult) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_scheduler_rejects_bad_user_ids_before_delegating() {
    let scheduler = Arc::new(CountingScheduler::default());
    let collaborator = scheduler.clone();
    let mut h = Harness::with(move |c| c.with_scheduler(collaborator), None);
    h.unit("cron", vec![]);
    let (mut unit, _) = h
        .load(manifest("cron", &["scheduler.register"], json!({})))
        .await;

    for (id, user) in [("r1", ""), ("r2", "a/b"), ("r3", "..")] {
        let err = request(
            &mut unit,
            id,
            "scheduler.schedule",
            json!({"userId": user, "name": "digest", "schedule": "0 9 * * *"}),
        )
        .await
        .unwrap_err();
        assert!(err.contains("Invalid userId"), "{}", err);
    }
    let err = request(
        &mut unit,
        "r4",
        "scheduler.cancel",
        json!({"userId": "x\\y", "jobId": "j"}),
    )
    .await
    .unwrap_err();
    assert!(err.contains("Invalid userId"), "{}", err);
    assert_eq!(scheduler.calls.load(Ordering::SeqCst), 0);

    let ok = request(
        &mut unit,
        "r5",
        "scheduler.schedule",
        json!({"userId": "alice", "name": "digest", "schedule": "0 9 * * *"}),
    )
    .await
    .unwrap();
    assert_eq!(ok, json!({"jobId": "job-digest"}));
    assert_eq!(scheduler.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_missing_collaborator_is_reported() {
    let mut h = Harness::new();
    h.unit("chatty", vec![]);
    let (mut unit, _) = h
        .load(manifest("chatty", &["chat.message.write"], json!({})))
        .await;
    let err = request(
        &mut unit,
        "r1",
        "chat.appendInstruction",
        json!({"userId": "alice", "instruction": "be brief"}),
    )
    .await
    .unwrap_err();
    assert!(err.contains("chat is not available"), "{}", err);
}

#[tokio::test]
async fn test_chat_stream_preserves_event_order() {
    let mut h = Harness::new();
    h.unit("streamer", vec![provider("stream-llm")]);
    let mut events = h.runtime.subscribe();
    let (mut unit, _) = h
        .load(manifest("streamer", &["providers.register"], json!({})))
        .await;
    wait_for(&mut events, |e| matches!(e, RuntimeEvent::ProviderRegistered { .. })).await;

    let stream = h
        .runtime
        .chat("stream-llm", json!({"messages": [{"role": "user", "content": "hi"}]}))
        .unwrap();
    let request_id = match unit.recv().await.unwrap() {
        HostMessage::ProviderChatRequest {
            request_id,
            provider_id,
            ..
        } => {
            assert_eq!(provider_id, "stream-llm");
            request_id
        }
        other => panic!("expected chat request, got {:?}", other),
    };
    assert_eq!(stream.request_id(), request_id);

    let sent = vec![
        StreamEvent::Text { text: "Hel".into() },
        StreamEvent::Text { text: "lo".into() },
        StreamEvent::Usage {
            input_tokens: 3,
            output_tokens: 2,
        },
        StreamEvent::Done,
        // after the terminal event; never delivered
        StreamEvent::Text { text: "late".into() },
    ];
    for event in sent.iter().cloned() {
        unit.send(UnitMessage::StreamEvent {
            request_id: request_id.clone(),
            event,
        });
    }

    let received = stream.collect().await;
    assert_eq!(received, sent[..4].to_vec());
    assert_eq!(h.runtime.pending_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_tool_call_times_out_after_sixty_seconds() {
    let mut h = Harness::new();
    h.unit("slow", vec![UnitMessage::ToolRegistered {
        id: "slow-tool".into(),
        name: String::new(),
        description: String::new(),
        parameters: Value::Null,
    }]);
    let mut events = h.runtime.subscribe();
    let (mut unit, _) = h.load(manifest("slow", &["tools.register"], json!({}))).await;
    wait_for(&mut events, |e| matches!(e, RuntimeEvent::ToolRegistered { .. })).await;

    let started = tokio::time::Instant::now();
    let runtime = h.runtime.clone();
    let call = tokio::spawn(async move {
        runtime
            .execute_tool("slow-tool", json!({"q": 1}), Some("alice".into()))
            .await
    });

    let request_id = match unit.recv().await.unwrap() {
        HostMessage::ToolExecuteRequest {
            request_id,
            arguments,
            user_id,
            ..
        } => {
            assert_eq!(arguments, json!({"q": 1}));
            assert_eq!(user_id.as_deref(), Some("alice"));
            request_id
        }
        other => panic!("expected tool request, got {:?}", other),
    };

    match call.await.unwrap() {
        Err(RuntimeError::Timeout { timeout_ms, .. }) => assert_eq!(timeout_ms, 60_000),
        other => panic!("expected timeout, got {:?}", other),
    }
    assert!(started.elapsed() >= Duration::from_secs(60));
    assert_eq!(h.runtime.pending_requests(), 0);

    // a late reply is dropped
    unit.send(UnitMessage::ToolExecuteResponse(
        extension_runtime::extensions::protocol::UnitReply {
            request_id,
            success: true,
            data: Some(json!("too late")),
            error: None,
        },
    ));
    request(&mut unit, "after", "settings.getAll", Value::Null)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_tool_and_action_results() {
    let mut h = Harness::new();
    h.unit(
        "doer",
        // actions emit no event, so register the tool last and wait for it
        vec![
            UnitMessage::ActionRegistered {
                id: "refresh".into(),
                name: "Refresh".into(),
            },
            UnitMessage::ToolRegistered {
                id: "add".into(),
                name: String::new(),
                description: String::new(),
                parameters: Value::Null,
            },
        ],
    );
    let mut events = h.runtime.subscribe();
    let (mut unit, _) = h
        .load(manifest("doer", &["tools.register", "actions.register"], json!({})))
        .await;
    wait_for(&mut events, |e| matches!(e, RuntimeEvent::ToolRegistered { .. })).await;

    assert!(matches!(
        h.runtime.execute_action("doer", "missing", Value::Null).await,
        Err(RuntimeError::UnknownContribution { kind: "action", .. })
    ));
    assert!(matches!(
        h.runtime.execute_tool("nope", Value::Null, None).await,
        Err(RuntimeError::UnknownContribution { kind: "tool", .. })
    ));

    tokio::spawn(async move {
        while let Some(message) = unit.recv().await {
            match message {
                HostMessage::ToolExecuteRequest {
                    request_id,
                    arguments,
                    ..
                } => {
                    let sum = arguments["a"].as_i64().unwrap() + arguments["b"].as_i64().unwrap();
                    unit.send(UnitMessage::ToolExecuteResponse(
                        extension_runtime::extensions::protocol::UnitReply {
                            request_id,
                            success: true,
                            data: Some(json!(sum)),
                            error: None,
                        },
                    ));
                }
                HostMessage::ActionExecuteRequest { request_id, .. } => {
                    unit.send(UnitMessage::ActionExecuteResponse(
                        extension_runtime::extensions::protocol::UnitReply {
                            request_id,
                            success: false,
                            data: None,
                            error: Some("upstream unavailable".into()),
                        },
                    ));
                }
                HostMessage::Deactivate => break,
                _ => {}
            }
        }
    });

    let sum = h
        .runtime
        .execute_tool("add", json!({"a": 2, "b": 3}), None)
        .await
        .unwrap();
    assert_eq!(sum, json!(5));

    match h.runtime.execute_action("doer", "refresh", Value::Null).await {
        Err(RuntimeError::Remote(message)) => assert_eq!(message, "upstream unavailable"),
        other => panic!("expected remote error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unit_crash_marks_error_and_cleans_up() {
    let mut h = Harness::new();
    h.unit("fragile", vec![provider("fragile-llm")]);
    let mut events = h.runtime.subscribe();
    let (mut unit, _) = h
        .load(manifest("fragile", &["providers.register"], json!({})))
        .await;
    wait_for(&mut events, |e| matches!(e, RuntimeEvent::ProviderRegistered { .. })).await;

    let runtime = h.runtime.clone();
    let call = tokio::spawn(async move { runtime.list_models("fragile-llm").await });
    assert!(matches!(
        unit.recv().await.unwrap(),
        HostMessage::ProviderModelsRequest { .. }
    ));

    drop(unit);

    let event = wait_for(&mut events, |e| matches!(e, RuntimeEvent::ExtensionError { .. })).await;
    match event {
        RuntimeEvent::ExtensionError { extension_id, error } => {
            assert_eq!(extension_id, "fragile");
            assert!(error.contains("exited unexpectedly"), "{}", error);
        }
        _ => unreachable!(),
    }
    assert!(matches!(call.await.unwrap(), Err(RuntimeError::UnitCrashed(_))));

    let status = h.runtime.status("fragile").unwrap();
    assert_eq!(status.status, ExtensionStatus::Error);
    assert!(status.providers.is_empty());
    assert!(h.runtime.providers().is_empty());

    // a crashed extension can be loaded again
    let (_unit, _) = h
        .load(manifest("fragile", &["providers.register"], json!({})))
        .await;
}

#[tokio::test]
async fn test_set_setting_notifies_unit() {
    let mut h = Harness::new();
    h.unit("themed", vec![]);
    let (mut unit, _) = h
        .load(manifest(
            "themed",
            &["settings.register"],
            json!({"settings": [{"key": "theme", "default": "dark"}]}),
        ))
        .await;

    h.runtime
        .set_setting("themed", "theme", json!("light"))
        .unwrap();
    assert_eq!(
        unit.recv().await.unwrap(),
        HostMessage::SettingsChanged {
            key: "theme".into(),
            value: json!("light"),
        }
    );
    assert_eq!(
        request(&mut unit, "g1", "settings.get", json!({"key": "theme"})).await,
        Ok(json!("light"))
    );

    assert!(matches!(
        h.runtime.set_setting("themed", "font", json!("mono")),
        Err(RuntimeError::UnknownSetting { .. })
    ));
    let err = request(&mut unit, "s1", "settings.set", json!({"key": "font", "value": 1}))
        .await
        .unwrap_err();
    assert!(err.contains("does not declare setting"), "{}", err);
    request(&mut unit, "s2", "settings.set", json!({"key": "theme", "value": "solarized"}))
        .await
        .unwrap();
    assert_eq!(
        h.runtime.status("themed").unwrap().settings.get("theme"),
        Some(&json!("solarized"))
    );
}

#[tokio::test]
async fn test_background_tasks_start_in_unit_and_go_with_unload() {
    let mut h = Harness::new();
    h.unit("worker", vec![]);
    let (mut unit, _) = h
        .load(manifest("worker", &["background.workers"], json!({})))
        .await;

    unit.send(UnitMessage::Request {
        id: "t1".into(),
        method: "tasks.register".into(),
        payload: json!({"taskId": "sync", "restartPolicy": {"mode": "never"}}),
    });
    // the start command reaches the unit before the response
    assert_eq!(
        unit.recv().await.unwrap(),
        HostMessage::TaskStart {
            task_id: "sync".into()
        }
    );
    assert!(matches!(
        unit.recv().await.unwrap(),
        HostMessage::Response { success: true, .. }
    ));

    let reported = request(
        &mut unit,
        "t2",
        "tasks.reportStatus",
        json!({"taskId": "sync", "status": "failed", "error": "disk full"}),
    )
    .await
    .unwrap();
    assert_eq!(reported, json!({"status": "failed"}));
    assert_eq!(h.runtime.tasks()[0].status, TaskStatus::Failed);

    assert!(h.runtime.stop_task("worker", "missing").is_err());

    exit_on_deactivate(unit);
    h.runtime.unload("worker").await.unwrap();
    assert!(h.runtime.tasks().is_empty());
}

#[tokio::test]
async fn test_secrets_round_trip_and_purge() {
    let secrets = Arc::new(SecretsStore::in_memory("test-master").unwrap());
    let mut h = Harness::with(|c| c, Some(secrets.clone()));
    h.unit("vault", vec![]);
    let (mut unit, _) = h
        .load(manifest("vault", &["secrets.manage", "storage.local"], json!({})))
        .await;

    request(&mut unit, "s1", "secrets.set", json!({"key": "token", "value": "abc"}))
        .await
        .unwrap();
    request(
        &mut unit,
        "s2",
        "secrets.set",
        json!({"key": "token", "value": "alice-abc", "userId": "alice"}),
    )
    .await
    .unwrap();
    assert_eq!(
        request(&mut unit, "s3", "secrets.get", json!({"key": "token"})).await,
        Ok(json!("abc"))
    );
    assert_eq!(
        request(&mut unit, "s4", "secrets.list", json!({"userId": "alice"})).await,
        Ok(json!(["token"]))
    );
    let err = request(&mut unit, "s5", "secrets.get", json!({"key": "token", "userId": ""}))
        .await
        .unwrap_err();
    assert!(err.contains("Invalid userId"), "{}", err);

    request(&mut unit, "s6", "storage.set", json!({"key": "k", "value": 1}))
        .await
        .unwrap();

    exit_on_deactivate(unit);
    let report = h.runtime.purge("vault").await.unwrap();
    assert!(report.was_loaded);
    assert_eq!(report.secrets_removed, 2);
    assert_eq!(secrets.count_for_extension("vault").unwrap(), 0);
    assert!(h.runtime.status("vault").is_none());
}

#[tokio::test]
async fn test_shutdown_unloads_everything() {
    let mut h = Harness::new();
    h.unit("one", vec![]);
    h.unit("two", vec![]);
    let (first, _) = h.load(manifest("one", &[], json!({}))).await;
    let (second, _) = h.load(manifest("two", &[], json!({}))).await;
    exit_on_deactivate(first);
    exit_on_deactivate(second);

    assert_eq!(h.runtime.list().len(), 2);
    h.runtime.shutdown().await;
    assert!(h.runtime.list().is_empty());
}

#[derive(Default)]
struct RecordingDatabase {
    statements: Mutex<Vec<String>>,
}

#[async_trait]
impl DatabaseExecutor for RecordingDatabase {
    async fn execute(&self, _extension_id: &str, sql: &str, _params: &[Value]) -> Result<Value> {
        self.statements.lock().unwrap().push(sql.to_string());
        Ok(json!({"changes": 1}))
    }
}

#[tokio::test]
async fn test_database_execute_skips_foreign_statements() {
    let database = Arc::new(RecordingDatabase::default());
    let collaborator = database.clone();
    let mut h = Harness::with(move |c| c.with_database(collaborator), None);
    h.unit("ledger", vec![]);
    let (mut unit, _) = h.load(manifest("ledger", &["database.own"], json!({}))).await;

    let result = request(
        &mut unit,
        "d1",
        "database.execute",
        json!({
            "sql": "INSERT INTO ext_ledger_entries (id) VALUES (?1); SELECT * FROM users",
            "params": ["e1"],
        }),
    )
    .await
    .unwrap();

    assert_eq!(
        *database.statements.lock().unwrap(),
        vec!["INSERT INTO ext_ledger_entries (id) VALUES (?1)".to_string()]
    );
    assert_eq!(result["results"], json!([{"changes": 1}]));
    let skipped = result["skipped"].as_array().unwrap();
    assert_eq!(skipped.len(), 1);
    assert!(skipped[0].as_str().unwrap().contains("users"), "{:?}", skipped);

    // without the permission nothing reaches the executor
    h.unit("nosy", vec![]);
    let (mut nosy, _) = h.load(manifest("nosy", &[], json!({}))).await;
    let err = request(
        &mut nosy,
        "d2",
        "database.execute",
        json!({"sql": "SELECT * FROM ext_nosy_a"}),
    )
    .await
    .unwrap_err();
    assert!(err.contains("database.own"), "{}", err);
    assert_eq!(database.statements.lock().unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_registrations_racing_unload_leave_nothing_behind() {
    let mut h = Harness::new();
    h.unit("flood", vec![]);
    let (unit, _) = h
        .load(manifest(
            "flood",
            &["providers.register", "tools.register", "background.workers"],
            json!({}),
        ))
        .await;

    // keep registering from another task while the host unloads
    let outbox = unit.outbox.clone();
    let flood = tokio::spawn(async move {
        for n in 0..5_000 {
            let sent = outbox.send(provider(&format!("p{}", n))).is_ok()
                && outbox
                    .send(UnitMessage::ToolRegistered {
                        id: format!("t{}", n),
                        name: String::new(),
                        description: String::new(),
                        parameters: Value::Null,
                    })
                    .is_ok()
                && outbox
                    .send(UnitMessage::Request {
                        id: format!("r{}", n),
                        method: "tasks.register".into(),
                        payload: json!({"taskId": format!("task{}", n)}),
                    })
                    .is_ok();
            if !sent {
                break;
            }
            tokio::task::yield_now().await;
        }
    });

    // the event channel would lag under this load, so poll instead
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.runtime.tools().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("no registration arrived");
    exit_on_deactivate(unit);
    h.runtime.unload("flood").await.unwrap();

    flood.abort();
    // let in-flight dispatches finish
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(h.runtime.status("flood").is_none());
    assert!(h.runtime.providers().is_empty());
    assert!(h.runtime.tools().is_empty());
    assert!(h.runtime.tasks().is_empty());
}
