//! # courier-service - Runtime, services and plugins
//!
//! The managed layer above the routing core: a [`Runtime`] owns the
//! engine, the bot sessions and the registries; a [`Plugin`] is a
//! loadable unit of [`Service`]s; services gate their handlers behind the
//! privilege ladder and per-group enablement, persist their configuration
//! as JSON, run scheduled jobs and broadcast to enabled groups.
//!
//! ```rust,ignore
//! use courier_service::{Runtime, RuntimeConfig, PluginModule, PluginInfo, Privilege};
//!
//! struct Greeter;
//!
//! #[async_trait::async_trait]
//! impl PluginModule for Greeter {
//!     fn info(&self) -> PluginInfo {
//!         PluginInfo {
//!             name: "greeter".into(),
//!             author: "you".into(),
//!             version: "0.1.0".into(),
//!             usage: "/hello".into(),
//!         }
//!     }
//!
//!     async fn init(&self, plugin: &std::sync::Arc<courier_service::Plugin>)
//!         -> Result<(), courier_service::PluginError>
//!     {
//!         let sv = plugin.service("hello").register()?;
//!         sv.on_message(courier_router::message::text_equals(["/hello".into()], true))
//!             .handle(|ctx| async move {
//!                 // reply via ctx.session ...
//!                 Ok(serde_json::Value::Null)
//!             });
//!         Ok(())
//!     }
//! }
//! ```

pub mod error;
pub mod plugin;
pub mod runtime;
pub mod schedule;
pub mod service;

pub use error::{PluginError, ServiceError};
pub use plugin::{Plugin, PluginInfo, PluginModule, ServiceBuilder};
pub use runtime::{Runtime, RuntimeConfig};
pub use schedule::{Schedule, Scheduler};
pub use service::{PrivRequirement, Privilege, Service, ServiceConfig, ServiceSubscription};
