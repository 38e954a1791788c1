//! # courier-router - Routing graph and priority executor
//!
//! The dispatch core of courier: a DAG of predicate, equality, prefix and
//! processor nodes routes each event to its matching handler terminals; a
//! per-event key store memoizes shared subexpressions; a priority
//! executor runs the matched handlers with cooperative suspension, so a
//! handler can pause until a later event matches a subgraph it registers.
//!
//! ## Building blocks
//!
//! - [`Graph`] / [`ClosedGraph`] - open graphs compose with `&`
//!   (sequence) and `|` (union); applying a terminal closes them.
//! - [`KeyFn`] / [`KeyStore`] - identified async computations over the
//!   event, evaluated at most once per event.
//! - [`Engine`] - owns the live graph, routes each event on an immutable
//!   snapshot and streams handler results.
//! - [`PriorityExecutor`] / [`Task`] - priority-ordered execution with
//!   pause/resume; see [`HandlerContext::wait_until`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use courier_router::{Engine, combinators::kind_is, message};
//! use courier_model::EventKind;
//!
//! let engine = Engine::new();
//! let terminal = engine
//!     .on(kind_is(EventKind::GroupMessage)
//!         & message::group_from(100)
//!         & message::text_equals(["/ping".to_string()], true))
//!     .handle(|ctx| async move {
//!         // reply through ctx.session ...
//!         Ok(serde_json::Value::Null)
//!     });
//! // later: engine.unsubscribe_terminals(&[terminal.id()]);
//! ```

pub mod combinators;
pub mod context;
pub mod contrib;
pub mod engine;
pub mod error;
pub mod executor;
pub mod graph;
pub mod key;
pub mod message;
pub mod node;
pub mod store;

pub use context::{HandlerContext, LaunchContext, WaitOptions};
pub use engine::{Engine, ForwardItem, Subscription};
pub use error::{RouteError, TerminalFilter};
pub use executor::{Priority, PriorityExecutor, Task, TaskResult, TaskStatus, WaitFlags};
pub use graph::{ClosedGraph, Graph};
pub use key::{Key, KeyFn, KeyFnId, RouteArgs};
pub use node::{Terminal, TerminalId};
pub use store::{KeyStore, WakeupCandidate};
