//! Integration tests for the runtime, service and plugin subsystem.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use courier_model::{
    Api, ApiResult, BotSession, ContactId, Event, Group, GroupMessageEvent, GroupPermission,
    HandlerError, MessageChain, MessageSendResult, Sender,
};
use courier_router::{message, WaitOptions};
use courier_service::{
    PluginError, PluginInfo, PluginModule, Privilege, Runtime, RuntimeConfig, Schedule,
};

type Log = Arc<Mutex<Vec<String>>>;

fn new_log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

fn push(log: &Log, entry: impl Into<String>) {
    log.lock().unwrap().push(entry.into());
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

fn group_message(group: ContactId, qq: ContactId, text: &str) -> Event {
    group_message_as(group, qq, text, GroupPermission::Member)
}

fn group_message_as(
    group: ContactId,
    qq: ContactId,
    text: &str,
    permission: GroupPermission,
) -> Event {
    Event::GroupMessage(GroupMessageEvent {
        group,
        message: MessageChain::from(text),
        message_id: 1,
        sender: Sender::new(qq, "tester").with_permission(permission),
    })
}

fn runtime_at(dir: &std::path::Path, superusers: impl IntoIterator<Item = ContactId>) -> Runtime {
    Runtime::new(RuntimeConfig {
        superusers: superusers.into_iter().collect::<HashSet<_>>(),
        service_config_dir: dir.to_path_buf(),
        plugin_manifest: "plugin.json".to_string(),
    })
}

/// Test plugin: one "echo" service logging every "/echo" group message,
/// plus lifecycle hooks that log into the shared recorder.
struct EchoPlugin {
    log: Log,
}

#[async_trait]
impl PluginModule for EchoPlugin {
    fn info(&self) -> PluginInfo {
        PluginInfo {
            name: "echo".into(),
            author: "tests".into(),
            version: "0.1.0".into(),
            usage: "/echo".into(),
        }
    }

    async fn init(&self, plugin: &Arc<courier_service::Plugin>) -> Result<(), PluginError> {
        let sv = plugin.service("main").register()?;

        let log = self.log.clone();
        sv.on_loaded().handle(move |_ctx| {
            let log = log.clone();
            async move {
                push(&log, "loaded");
                Ok(serde_json::Value::Null)
            }
        });
        let log = self.log.clone();
        sv.on_unload().handle(move |_ctx| {
            let log = log.clone();
            async move {
                push(&log, "unloaded");
                Ok(serde_json::Value::Null)
            }
        });
        let log = self.log.clone();
        sv.on_message(message::text_equals(["/echo".to_string()], true)).handle(move |_ctx| {
            let log = log.clone();
            async move {
                push(&log, "echo");
                Ok(serde_json::Value::Null)
            }
        });
        Ok(())
    }
}

#[tokio::test]
async fn plugin_lifecycle_dispatches_meta_events_and_routes() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = runtime_at(dir.path(), []);
    let log = new_log();

    runtime.load_plugin(Arc::new(EchoPlugin { log: log.clone() })).await.unwrap();
    assert_eq!(entries(&log), vec!["loaded"]);
    assert!(runtime.get_plugin("echo").is_some());
    assert!(runtime.get_service("echo.main").is_some());

    runtime.handle_event(None, group_message(1, 10, "/echo")).await;
    assert_eq!(entries(&log), vec!["loaded", "echo"]);

    runtime.unload_plugin("echo").await.unwrap();
    assert_eq!(entries(&log), vec!["loaded", "echo", "unloaded"]);
    assert!(runtime.get_plugin("echo").is_none());
    assert!(runtime.get_service("echo.main").is_none());

    // Handlers are unsubscribed: further events deliver nothing.
    runtime.handle_event(None, group_message(1, 10, "/echo")).await;
    assert_eq!(entries(&log), vec!["loaded", "echo", "unloaded"]);

    // Only the engine-internal sweeper terminal remains.
    assert_eq!(runtime.engine().terminals().len(), 1);
}

#[tokio::test]
async fn loading_twice_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = runtime_at(dir.path(), []);
    let log = new_log();

    runtime.load_plugin(Arc::new(EchoPlugin { log: log.clone() })).await.unwrap();
    let err = runtime.load_plugin(Arc::new(EchoPlugin { log: log.clone() })).await;
    assert!(matches!(err, Err(PluginError::AlreadyLoaded(name)) if name == "echo"));

    // Reload works and re-runs the lifecycle.
    runtime.reload_plugin(Arc::new(EchoPlugin { log: log.clone() })).await.unwrap();
    assert_eq!(entries(&log), vec!["loaded", "unloaded", "loaded"]);
}

#[tokio::test]
async fn group_enablement_gates_messages_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let log = new_log();
    {
        let runtime = runtime_at(dir.path(), []);
        runtime.load_plugin(Arc::new(EchoPlugin { log: log.clone() })).await.unwrap();
        let sv = runtime.get_service("echo.main").unwrap();

        assert!(sv.check_enabled(5), "enabled by default");
        sv.set_disable(5);
        assert!(!sv.check_enabled(5));

        runtime.handle_event(None, group_message(5, 10, "/echo")).await;
        runtime.handle_event(None, group_message(6, 10, "/echo")).await;
        let seen = entries(&log);
        assert_eq!(seen.iter().filter(|e| *e == "echo").count(), 1, "group 5 gated");
    }

    // A fresh runtime over the same config dir sees the persisted state.
    let runtime = runtime_at(dir.path(), []);
    let log2 = new_log();
    runtime.load_plugin(Arc::new(EchoPlugin { log: log2.clone() })).await.unwrap();
    let sv = runtime.get_service("echo.main").unwrap();
    assert!(!sv.check_enabled(5));
    assert!(sv.check_enabled(6));
}

#[tokio::test]
async fn privilege_ladder_gates_handlers() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = runtime_at(dir.path(), [999]);
    let log = new_log();

    let plugin = runtime
        .load_plugin(Arc::new(EchoPlugin { log: new_log() }))
        .await
        .unwrap();
    let sv = plugin.service("admin-tools").register().unwrap();
    let l = log.clone();
    sv.on_message(message::text_equals(["/admin".to_string()], true))
        .with_priv(Privilege::ADMIN)
        .handle(move |ctx| {
            let l = l.clone();
            async move {
                push(&l, format!("admin:{}", ctx.event.qq().unwrap_or_default()));
                Ok(serde_json::Value::Null)
            }
        });

    // A plain member is below ADMIN.
    runtime
        .handle_event(None, group_message_as(1, 10, "/admin", GroupPermission::Member))
        .await;
    assert!(entries(&log).is_empty());

    // A group admin passes.
    runtime
        .handle_event(None, group_message_as(1, 11, "/admin", GroupPermission::Admin))
        .await;
    assert_eq!(entries(&log), vec!["admin:11"]);

    // A superuser passes regardless of role.
    runtime
        .handle_event(None, group_message_as(1, 999, "/admin", GroupPermission::Member))
        .await;
    assert_eq!(entries(&log), vec!["admin:11", "admin:999"]);

    // A blacklisted admin is BLACK and gated.
    runtime.set_block_user(11, chrono::Utc::now() + chrono::Duration::hours(1));
    runtime
        .handle_event(None, group_message_as(1, 11, "/admin", GroupPermission::Admin))
        .await;
    assert_eq!(entries(&log), vec!["admin:11", "admin:999"]);

    // Per-user configured privilege lifts a plain member over the bar.
    sv.set_user_priv(10, Privilege::WHITE);
    runtime
        .handle_event(None, group_message_as(1, 10, "/admin", GroupPermission::Member))
        .await;
    assert_eq!(entries(&log), vec!["admin:11", "admin:999", "admin:10"]);
}

#[tokio::test]
async fn switched_dispatch_restarts_with_rewritten_message() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = runtime_at(dir.path(), []);
    let log = new_log();

    let l = log.clone();
    runtime
        .engine()
        .on(message::text_equals(["/alias".to_string()], true))
        .handle_with_priority(10, move |_ctx| {
            let l = l.clone();
            async move {
                push(&l, "alias");
                Err(HandlerError::switched("/real"))
            }
        });
    let l = log.clone();
    runtime
        .engine()
        .on(message::text_equals(["/real".to_string()], true))
        .handle(move |_ctx| {
            let l = l.clone();
            async move {
                push(&l, "real");
                Ok(serde_json::Value::Null)
            }
        });

    runtime.handle_event(None, group_message(1, 10, "/alias")).await;
    assert_eq!(entries(&log), vec!["alias", "real"]);
}

#[tokio::test]
async fn canceled_aborts_the_event_silently() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = runtime_at(dir.path(), []);
    let log = new_log();

    let l = log.clone();
    runtime.engine().on(message::is_group()).handle_with_priority(100, move |_ctx| {
        let l = l.clone();
        async move {
            push(&l, "preprocessor");
            Err(HandlerError::canceled("ignore this message"))
        }
    });
    let l = log.clone();
    runtime.engine().on(message::is_group()).handle(move |_ctx| {
        let l = l.clone();
        async move {
            push(&l, "handler");
            Ok(serde_json::Value::Null)
        }
    });

    runtime.handle_event(None, group_message(1, 10, "hi")).await;
    assert_eq!(entries(&log), vec!["preprocessor"], "lower-priority handler never ran");
}

#[tokio::test(start_paused = true)]
async fn unload_during_active_pause_leaves_no_way_back_in() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = runtime_at(dir.path(), []);
    let log = new_log();

    struct Waiter {
        log: Log,
    }

    #[async_trait]
    impl PluginModule for Waiter {
        fn info(&self) -> PluginInfo {
            PluginInfo {
                name: "waiter".into(),
                author: "tests".into(),
                version: "0.1.0".into(),
                usage: "/wait".into(),
            }
        }

        async fn init(&self, plugin: &Arc<courier_service::Plugin>) -> Result<(), PluginError> {
            let sv = plugin.service("main").register()?;
            let log = self.log.clone();
            sv.on_message(message::text_equals(["/wait".to_string()], true)).handle(
                move |ctx| {
                    let log = log.clone();
                    async move {
                        push(&log, "paused");
                        match ctx
                            .wait_until(
                                message::text_equals(["go".to_string()], true),
                                WaitOptions::default().timeout(Duration::from_secs(1)),
                            )
                            .await
                        {
                            Ok(_) => push(&log, "woken"),
                            Err(e) => push(&log, format!("wait-error:{e}")),
                        }
                        Ok(serde_json::Value::Null)
                    }
                },
            );
            Ok(())
        }
    }

    runtime.load_plugin(Arc::new(Waiter { log: log.clone() })).await.unwrap();
    runtime.handle_event(None, group_message(1, 10, "/wait")).await;
    assert_eq!(entries(&log), vec!["paused"]);

    runtime.unload_plugin("waiter").await.unwrap();

    // The timeout fires; the ephemeral wakeup terminal disappears with it.
    tokio::time::sleep(Duration::from_secs(2)).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(entries(&log), vec!["paused", "wait-error:wait timed out"]);
    assert_eq!(runtime.engine().terminals().len(), 1, "only the sweeper remains");

    // No further event can deliver to the dead handler.
    runtime.handle_event(None, group_message(1, 10, "go")).await;
    assert_eq!(entries(&log), vec!["paused", "wait-error:wait timed out"]);
}

#[tokio::test(start_paused = true)]
async fn scheduled_jobs_run_only_while_the_service_is_loaded() {
    struct Ticker {
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PluginModule for Ticker {
        fn info(&self) -> PluginInfo {
            PluginInfo {
                name: "ticker".into(),
                author: "tests".into(),
                version: "0.1.0".into(),
                usage: "background tick".into(),
            }
        }

        async fn init(&self, plugin: &Arc<courier_service::Plugin>) -> Result<(), PluginError> {
            let sv = plugin.service("main").register()?;
            let runs = self.runs.clone();
            sv.scheduled_job("tick", Schedule::Every(Duration::from_secs(60)), move || {
                let runs = runs.clone();
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
            Ok(())
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let runtime = runtime_at(dir.path(), []);
    let runs = Arc::new(AtomicUsize::new(0));

    runtime.load_plugin(Arc::new(Ticker { runs: runs.clone() })).await.unwrap();
    let sv = runtime.get_service("ticker.main").unwrap();
    assert!(sv.scheduler().is_running(), "scheduler started on ServiceLoaded");

    tokio::time::sleep(Duration::from_secs(70)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    runtime.unload_plugin("ticker").await.unwrap();
    assert!(!sv.scheduler().is_running(), "scheduler stopped on ServiceUnload");

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1, "no runs after unload");
}

#[derive(Default)]
struct RecordingApi {
    groups: Vec<Group>,
    sent: Mutex<Vec<(ContactId, String)>>,
}

#[async_trait]
impl Api for RecordingApi {
    async fn send_group_message(
        &self,
        group: ContactId,
        message: MessageChain,
    ) -> ApiResult<MessageSendResult> {
        self.sent.lock().unwrap().push((group, message.content_string()));
        ApiResult::ok(MessageSendResult { message_id: 1 })
    }

    async fn get_group_list(&self) -> ApiResult<Vec<Group>> {
        ApiResult::ok(self.groups.clone())
    }
}

struct RecordingSession {
    qq: ContactId,
    api: RecordingApi,
}

#[async_trait]
impl BotSession for RecordingSession {
    fn qq(&self) -> ContactId {
        self.qq
    }

    fn api(&self) -> &dyn Api {
        &self.api
    }
}

#[tokio::test]
async fn broadcast_reaches_only_enabled_groups() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = runtime_at(dir.path(), []);
    let session = Arc::new(RecordingSession {
        qq: 555,
        api: RecordingApi {
            groups: vec![
                Group { id: 1, name: "a".into(), permission: GroupPermission::Member },
                Group { id: 2, name: "b".into(), permission: GroupPermission::Member },
            ],
            ..Default::default()
        },
    });
    runtime.register_session(session.clone());

    let plugin = runtime
        .load_plugin(Arc::new(EchoPlugin { log: new_log() }))
        .await
        .unwrap();
    let sv = plugin.service("news").register().unwrap();
    sv.set_disable(2);

    sv.broadcast(&[MessageChain::from("daily news")], Duration::from_millis(0)).await;

    let sent = session.api.sent.lock().unwrap().clone();
    assert_eq!(sent, vec![(1, "daily news".to_string())]);
}
