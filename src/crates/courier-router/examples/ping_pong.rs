//! Minimal dispatch loop: subscribe one handler and feed it an event.
//!
//! Run with: cargo run --example ping_pong

use futures::{pin_mut, StreamExt};

use courier_model::{Event, GroupMessageEvent, MessageChain, Sender};
use courier_router::{message, Engine, ForwardItem};

#[tokio::main]
async fn main() {
    let engine = Engine::new();

    engine
        .on(message::is_group() & message::text_equals(["/ping".to_string()], true))
        .handle(|ctx| async move {
            println!("pong! (asked by {:?})", ctx.event.qq());
            Ok(serde_json::json!({ "replied": true }))
        });

    let event = Event::GroupMessage(GroupMessageEvent {
        group: 100,
        message: MessageChain::from("/ping"),
        message_id: 1,
        sender: Sender::new(42, "alice"),
    });

    let results = engine.forward(event, None);
    pin_mut!(results);
    while let Some(item) = results.next().await {
        match item {
            ForwardItem::Task(result) => println!("handler result: {:?}", result.result),
            ForwardItem::Route(error) => println!("route error: {error}"),
        }
    }
}
