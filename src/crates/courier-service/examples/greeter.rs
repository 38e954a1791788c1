//! A runtime hosting one plugin with a greeting service.
//!
//! Run with: cargo run --example greeter

use std::sync::Arc;

use async_trait::async_trait;

use courier_model::{Event, GroupMessageEvent, MessageChain, Sender};
use courier_router::message;
use courier_service::{Plugin, PluginError, PluginInfo, PluginModule, Runtime, RuntimeConfig};

struct Greeter;

#[async_trait]
impl PluginModule for Greeter {
    fn info(&self) -> PluginInfo {
        PluginInfo {
            name: "greeter".into(),
            author: "courier".into(),
            version: "0.1.0".into(),
            usage: "/hello - get greeted".into(),
        }
    }

    async fn init(&self, plugin: &Arc<Plugin>) -> Result<(), PluginError> {
        let sv = plugin.service("hello").register()?;
        sv.on_message(message::text_equals(["/hello".to_string()], true)).handle(
            |ctx| async move {
                if let Some(session) = &ctx.session {
                    let _ = session.send(&ctx.event, MessageChain::from("hi there!"), true).await;
                }
                println!("greeted {:?}", ctx.event.qq());
                Ok(serde_json::Value::Null)
            },
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    let runtime = Runtime::new(RuntimeConfig::default());
    runtime.load_plugin(Arc::new(Greeter)).await.expect("load greeter");

    let event = Event::GroupMessage(GroupMessageEvent {
        group: 100,
        message: MessageChain::from("/hello"),
        message_id: 1,
        sender: Sender::new(42, "alice"),
    });
    runtime.handle_event(None, event).await;

    runtime.unload_plugin("greeter").await.expect("unload greeter");
}
