//! Integration tests for routing, execution and suspension
//!
//! These drive complete dispatch passes through an [`Engine`] the way a
//! protocol adapter would, covering equality routing, prefix merging,
//! shared-key memoization, priority gating, quote wakeups and timeouts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{pin_mut, StreamExt};

use courier_model::{
    Event, EventKind, FriendMessageEvent, GroupMessageEvent, MessageChain, MessageElement,
    Sender, WaitError,
};
use courier_router::combinators::{equals_by, kind_is, store_value};
use courier_router::error::{RouteError, TerminalFilter};
use courier_router::{message, Engine, ForwardItem, Key, KeyFn, TaskResult, WaitOptions};

fn group_message(group: i64, qq: i64, text: &str) -> Event {
    Event::GroupMessage(GroupMessageEvent {
        group,
        message: MessageChain::from(text),
        message_id: 1,
        sender: Sender::new(qq, "tester"),
    })
}

fn friend_message(qq: i64, message: MessageChain) -> Event {
    Event::FriendMessage(FriendMessageEvent { message, message_id: 2, sender: Sender::new(qq, "tester") })
}

async fn dispatch(engine: &Engine, event: Event) -> (Vec<RouteError>, Vec<TaskResult>) {
    let stream = engine.forward(event, None);
    pin_mut!(stream);
    let mut errors = Vec::new();
    let mut results = Vec::new();
    while let Some(item) = stream.next().await {
        match item {
            ForwardItem::Route(e) => errors.push(e),
            ForwardItem::Task(r) => results.push(r),
        }
    }
    (errors, results)
}

type Sink = Arc<dyn Fn(&str) + Send + Sync>;

fn recorder() -> (Arc<Mutex<Vec<String>>>, Sink) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink: Sink = {
        let log = log.clone();
        Arc::new(move |entry: &str| log.lock().unwrap().push(entry.to_string()))
    };
    (log, sink)
}

#[tokio::test]
async fn equality_routing_matches_exactly() {
    let engine = Engine::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    engine
        .on(kind_is(EventKind::GroupMessage)
            & message::group_from(100)
            & message::text_equals(["/ping".to_string()], true))
        .handle(move |_ctx| {
            let h = h.clone();
            async move {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(serde_json::Value::Null)
            }
        });

    dispatch(&engine, group_message(100, 1, "/ping")).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    dispatch(&engine, group_message(101, 1, "/ping")).await;
    dispatch(&engine, group_message(100, 1, "/pong")).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn every_prefix_fires_not_just_longest() {
    let engine = Engine::new();
    let (log, sink) = recorder();

    let s1 = sink.clone();
    engine
        .on(message::is_group() & message::starts_with(["/".to_string()], true))
        .handle(move |_ctx| {
            let s1 = s1.clone();
            async move {
                s1("h1");
                Ok(serde_json::Value::Null)
            }
        });
    let s2 = sink.clone();
    engine
        .on(message::is_group() & message::starts_with(["/he".to_string()], true))
        .handle(move |_ctx| {
            let s2 = s2.clone();
            async move {
                s2("h2");
                Ok(serde_json::Value::Null)
            }
        });

    dispatch(&engine, group_message(1, 1, "/hello")).await;
    let mut seen = log.lock().unwrap().clone();
    seen.sort();
    assert_eq!(seen, vec!["h1", "h2"]);

    log.lock().unwrap().clear();
    dispatch(&engine, group_message(1, 1, "/world")).await;
    assert_eq!(log.lock().unwrap().clone(), vec!["h1"]);
}

#[tokio::test]
async fn unicode_prefixes_match_on_codepoints() {
    let engine = Engine::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    engine
        .on(message::starts_with(["/你".to_string()], true))
        .handle(move |_ctx| {
            let h = h.clone();
            async move {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(serde_json::Value::Null)
            }
        });

    dispatch(&engine, group_message(1, 1, "/你好")).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    dispatch(&engine, group_message(1, 1, "/好你")).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn shared_key_computes_once_per_event() {
    let engine = Engine::new();
    let evaluations = Arc::new(AtomicUsize::new(0));

    // Two subscriptions built independently around the same named key.
    let expensive = |counter: Arc<AtomicUsize>| {
        KeyFn::named("test.expensive-length", move |args: courier_router::RouteArgs| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let len = args.event.message().map(|m| m.content_string().len()).unwrap_or(0);
                Ok(Key::Int(len as i64))
            }
        })
    };

    let fired = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let f = fired.clone();
        engine
            .on(equals_by(expensive(evaluations.clone()), [Key::Int(5)]))
            .handle(move |_ctx| {
                let f = f.clone();
                async move {
                    f.fetch_add(1, Ordering::SeqCst);
                    Ok(serde_json::Value::Null)
                }
            });
    }

    dispatch(&engine, group_message(1, 1, "/ping")).await;
    assert_eq!(fired.load(Ordering::SeqCst), 2, "both handlers fire");
    assert_eq!(evaluations.load(Ordering::SeqCst), 1, "key computed once");
}

#[tokio::test]
async fn tasks_start_in_priority_order() {
    let engine = Engine::new();
    let (log, sink) = recorder();
    for (name, priority) in [("low", -5), ("high", 100), ("mid", 20)] {
        let sink = sink.clone();
        let name = name.to_string();
        engine.on(message::is_group()).handle_with_priority(priority, move |_ctx| {
            let sink = sink.clone();
            let name = name.clone();
            async move {
                sink(&name);
                Ok(serde_json::Value::Null)
            }
        });
    }

    dispatch(&engine, group_message(1, 1, "hi")).await;
    assert_eq!(log.lock().unwrap().clone(), vec!["high", "mid", "low"]);
}

#[tokio::test]
async fn route_filter_drops_terminals_before_execution() {
    let engine = Engine::new();
    let hits = Arc::new(AtomicUsize::new(0));

    let h = hits.clone();
    engine.on(message::is_group()).handle(move |_ctx| {
        let h = h.clone();
        async move {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::Value::Null)
        }
    });

    // A processor that asks for every default-priority terminal to be
    // dropped. Its own successors still route.
    let filtering = courier_router::combinators::process(KeyFn::new(
        move |_args: courier_router::RouteArgs| async move {
            Err(RouteError::Filtered(TerminalFilter::new(|t| t.priority() != 0)))
        },
    ));
    let kept = Arc::new(AtomicUsize::new(0));
    let k = kept.clone();
    engine.on(message::is_group() & filtering).handle_with_priority(5, move |_ctx| {
        let k = k.clone();
        async move {
            k.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::Value::Null)
        }
    });

    let (errors, _) = dispatch(&engine, group_message(1, 1, "hi")).await;
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], RouteError::Filtered(_)));
    assert_eq!(hits.load(Ordering::SeqCst), 0, "default-priority handler filtered out");
    assert_eq!(kept.load(Ordering::SeqCst), 1, "non-default handler kept");
}

#[tokio::test]
async fn store_values_are_published_for_handlers() {
    let engine = Engine::new();
    let seen = Arc::new(Mutex::new(None));

    let s = seen.clone();
    engine
        .on(store_value(
            "shouting",
            KeyFn::from_event(|e| {
                Key::from(e.message().map(|m| m.content_string().to_uppercase()))
            }),
        ))
        .handle(move |ctx| {
            let s = s.clone();
            async move {
                *s.lock().unwrap() = ctx.store.get("shouting");
                Ok(serde_json::Value::Null)
            }
        });

    dispatch(&engine, group_message(1, 1, "loud")).await;
    assert_eq!(seen.lock().unwrap().clone(), Some(Key::Str("LOUD".into())));
}

#[tokio::test]
async fn regex_match_is_published_under_match_alias() {
    let engine = Engine::new();
    let seen = Arc::new(Mutex::new(None));

    let s = seen.clone();
    engine
        .on(message::matches(regex::Regex::new(r"^/echo (\w+)$").unwrap()))
        .handle(move |ctx| {
            let s = s.clone();
            async move {
                *s.lock().unwrap() = ctx.store.get("match");
                Ok(serde_json::Value::Null)
            }
        });

    dispatch(&engine, group_message(1, 1, "/echo hello")).await;
    let value = seen.lock().unwrap().clone();
    match value {
        Some(Key::List(items)) => {
            assert_eq!(items[1], Key::Str("hello".into()));
        }
        other => panic!("unexpected match value: {other:?}"),
    }
}

#[tokio::test]
async fn wakeup_resumes_paused_task_and_gates_lower_priorities() {
    let engine = Engine::new();
    let (log, sink) = recorder();

    // A waits for "go" with suspend_next_priority; B and C run at a
    // lower priority on the same trigger.
    let s = sink.clone();
    engine
        .on(message::text_equals(["/start".to_string()], true))
        .handle_with_priority(100, move |ctx| {
            let s = s.clone();
            async move {
                s("a:paused");
                let woken = ctx
                    .wait_until(
                        message::text_equals(["go".to_string()], true),
                        WaitOptions::default().suspend_next_priority(true),
                    )
                    .await;
                match woken {
                    Ok(wake) => s(&format!(
                        "a:woken:{}",
                        wake.event.message().map(|m| m.content_string()).unwrap_or_default()
                    )),
                    Err(e) => s(&format!("a:error:{e}")),
                }
                Ok(serde_json::Value::Null)
            }
        });
    for name in ["b", "c"] {
        let s = sink.clone();
        let name = name.to_string();
        engine
            .on(message::text_equals(["go".to_string()], true))
            .handle_with_priority(50, move |_ctx| {
                let s = s.clone();
                let name = name.clone();
                async move {
                    s(&name);
                    Ok(serde_json::Value::Null)
                }
            });
    }

    dispatch(&engine, group_message(1, 1, "/start")).await;
    assert_eq!(log.lock().unwrap().clone(), vec!["a:paused"]);

    // The wakeup event resumes A; B and C are gated out.
    dispatch(&engine, group_message(1, 1, "go")).await;
    assert_eq!(log.lock().unwrap().clone(), vec!["a:paused", "a:woken:go"]);

    // With A done, the next trigger reaches B and C.
    dispatch(&engine, group_message(1, 1, "go")).await;
    let seen = log.lock().unwrap().clone();
    let mut tail = seen[2..].to_vec();
    tail.sort();
    assert_eq!(tail, vec!["b", "c"]);
}

#[tokio::test]
async fn suspend_other_stops_wakeups_after_the_newest_candidate() {
    let engine = Engine::new();
    let (log, sink) = recorder();

    for (trigger, suspend_other, name) in
        [("/w1", false, "a1"), ("/w2", true, "a2")]
    {
        let s = sink.clone();
        let name = name.to_string();
        engine
            .on(message::text_equals([trigger.to_string()], true))
            .handle(move |ctx| {
                let s = s.clone();
                let name = name.clone();
                async move {
                    let woken = ctx
                        .wait_until(
                            message::text_equals(["go".to_string()], true),
                            WaitOptions::default().suspend_other(suspend_other),
                        )
                        .await;
                    match woken {
                        Ok(_) => s(&format!("{name}:woken")),
                        Err(e) => s(&format!("{name}:error:{e}")),
                    }
                    Ok(serde_json::Value::Null)
                }
            });
    }

    dispatch(&engine, group_message(1, 1, "/w1")).await;
    // Keep the two pause timestamps clearly apart.
    tokio::time::sleep(Duration::from_millis(5)).await;
    dispatch(&engine, group_message(1, 1, "/w2")).await;
    assert!(log.lock().unwrap().is_empty());

    // Candidates resume newest-first; a2 (newer) carries suspend_other,
    // so a1 stays suspended.
    dispatch(&engine, group_message(1, 1, "go")).await;
    assert_eq!(log.lock().unwrap().clone(), vec!["a2:woken"]);

    // a1's subgraph is still subscribed and fires on the next trigger.
    dispatch(&engine, group_message(1, 1, "go")).await;
    assert_eq!(log.lock().unwrap().clone(), vec!["a2:woken", "a1:woken"]);
}

#[tokio::test]
async fn wait_quote_resumes_on_quoting_message() {
    let engine = Engine::new();
    let (log, sink) = recorder();

    let s = sink.clone();
    engine
        .on(message::is_friend() & message::text_equals(["/ask".to_string()], true))
        .handle(move |ctx| {
            let s = s.clone();
            async move {
                let woken = ctx.wait_quote(777, WaitOptions::default()).await;
                match woken {
                    Ok(wake) => s(&format!(
                        "quoted:{}",
                        wake.event.message().map(|m| m.content_string()).unwrap_or_default()
                    )),
                    Err(e) => s(&format!("error:{e}")),
                }
                Ok(serde_json::Value::Null)
            }
        });

    dispatch(&engine, friend_message(7, MessageChain::from("/ask"))).await;
    assert!(log.lock().unwrap().is_empty());

    // A quote of a different message from the same user does not wake.
    dispatch(
        &engine,
        friend_message(
            7,
            MessageChain::from(vec![MessageElement::quote(778), MessageElement::plain("no")]),
        ),
    )
    .await;
    assert!(log.lock().unwrap().is_empty());

    // A quote from another user does not wake either.
    dispatch(
        &engine,
        friend_message(
            8,
            MessageChain::from(vec![MessageElement::quote(777), MessageElement::plain("nope")]),
        ),
    )
    .await;
    assert!(log.lock().unwrap().is_empty());

    dispatch(
        &engine,
        friend_message(
            7,
            MessageChain::from(vec![MessageElement::quote(777), MessageElement::plain("answer")]),
        ),
    )
    .await;
    assert_eq!(log.lock().unwrap().clone(), vec!["quoted:answer"]);
}

#[tokio::test(start_paused = true)]
async fn wait_timeout_raises_into_the_task_and_removes_the_terminal() {
    let engine = Engine::new();
    let baseline = engine.terminals().len();
    let outcome = Arc::new(Mutex::new(None));

    let o = outcome.clone();
    engine
        .on(message::text_equals(["/wait".to_string()], true))
        .handle(move |ctx| {
            let o = o.clone();
            async move {
                let woken = ctx
                    .wait_until(
                        message::text_equals(["never".to_string()], true),
                        WaitOptions::default().timeout(Duration::from_secs(1)),
                    )
                    .await;
                *o.lock().unwrap() = Some(woken.map(|_| ()));
                Ok(serde_json::Value::Null)
            }
        });
    // One user terminal beyond the built-in sweeper.
    assert_eq!(engine.terminals().len(), baseline + 1);

    dispatch(&engine, group_message(1, 1, "/wait")).await;
    // Paused: the ephemeral wakeup terminal is subscribed.
    assert_eq!(engine.terminals().len(), baseline + 2);

    // Let the armed timer fire and the raised task run out.
    tokio::time::sleep(Duration::from_secs(2)).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    assert_eq!(*outcome.lock().unwrap(), Some(Err(WaitError::Timeout)));
    assert_eq!(engine.terminals().len(), baseline + 1, "ephemeral terminal removed");

    // The stale wait delivers nothing anymore.
    dispatch(&engine, group_message(1, 1, "never")).await;
    assert_eq!(*outcome.lock().unwrap(), Some(Err(WaitError::Timeout)));
}

#[tokio::test]
async fn unsubscribing_a_terminal_stops_future_dispatch() {
    let engine = Engine::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let terminal = engine
        .on(message::text_equals(["/once".to_string()], true))
        .handle(move |_ctx| {
            let h = h.clone();
            async move {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(serde_json::Value::Null)
            }
        });

    dispatch(&engine, group_message(1, 1, "/once")).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    engine.unsubscribe_terminals(&[terminal.id()]);
    dispatch(&engine, group_message(1, 1, "/once")).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

struct StubSession(i64);

#[async_trait::async_trait]
impl courier_model::Api for StubSession {}

#[async_trait::async_trait]
impl courier_model::BotSession for StubSession {
    fn qq(&self) -> i64 {
        self.0
    }

    fn api(&self) -> &dyn courier_model::Api {
        self
    }
}

async fn dispatch_from(
    engine: &Engine,
    session: Arc<StubSession>,
    event: Event,
) -> (Vec<RouteError>, Vec<TaskResult>) {
    let stream = engine.forward(event, Some(session));
    pin_mut!(stream);
    let mut errors = Vec::new();
    let mut results = Vec::new();
    while let Some(item) = stream.next().await {
        match item {
            ForwardItem::Route(e) => errors.push(e),
            ForwardItem::Task(r) => results.push(r),
        }
    }
    (errors, results)
}

#[tokio::test]
async fn to_me_matches_mentions_and_private_messages() {
    let engine = Engine::new();
    let session = Arc::new(StubSession(999));
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    engine.on(courier_router::contrib::to_me()).handle(move |_ctx| {
        let h = h.clone();
        async move {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::Value::Null)
        }
    });

    // Plain group chatter does not address the bot.
    dispatch_from(&engine, session.clone(), group_message(1, 10, "hello")).await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    // A mention does.
    let mention = Event::GroupMessage(GroupMessageEvent {
        group: 1,
        message: MessageChain::from(vec![
            MessageElement::at(999),
            MessageElement::plain(" hello"),
        ]),
        message_id: 3,
        sender: Sender::new(10, "tester"),
    });
    dispatch_from(&engine, session.clone(), mention).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // Private messages always do.
    dispatch_from(&engine, session.clone(), friend_message(10, MessageChain::from("hi"))).await;
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn command_publishes_the_rest_of_the_line() {
    let engine = Engine::new();
    let seen = Arc::new(Mutex::new(None));
    let args_seen = Arc::new(Mutex::new(None));

    let s = seen.clone();
    let a = args_seen.clone();
    engine
        .on(courier_router::contrib::command(["/roll".to_string()])
            & courier_router::contrib::split_args())
        .handle(move |ctx| {
            let s = s.clone();
            let a = a.clone();
            async move {
                *s.lock().unwrap() = ctx.store.get(courier_router::contrib::KEY_REST);
                *a.lock().unwrap() = ctx.store.get(courier_router::contrib::KEY_ARGS);
                Ok(serde_json::Value::Null)
            }
        });

    dispatch(&engine, group_message(1, 1, "/roll 2d6 advantage")).await;
    assert_eq!(seen.lock().unwrap().clone(), Some(Key::Str("2d6 advantage".into())));
    assert_eq!(
        args_seen.lock().unwrap().clone(),
        Some(Key::List(vec![
            Key::Str("/roll".into()),
            Key::Str("2d6".into()),
            Key::Str("advantage".into()),
        ]))
    );

    dispatch(&engine, group_message(1, 1, "/flip")).await;
    assert_eq!(seen.lock().unwrap().clone(), Some(Key::Str("2d6 advantage".into())));
}

#[tokio::test]
async fn empty_message_chain_matches_no_element_kinds() {
    let engine = Engine::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    engine
        .on(message::has(courier_model::MessageKind::Plain))
        .handle(move |_ctx| {
            let h = h.clone();
            async move {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(serde_json::Value::Null)
            }
        });

    dispatch(&engine, friend_message(1, MessageChain::new())).await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    dispatch(&engine, friend_message(1, MessageChain::from("text"))).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}
