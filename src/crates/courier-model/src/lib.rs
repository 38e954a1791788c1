//! # courier-model - Event, message and protocol types
//!
//! Shared data model for the courier dispatch engine: typed [`Event`]
//! variants with immutable [`MessageChain`]s, contact and permission
//! types, the outbound [`Api`] trait a protocol adapter implements, and
//! the control-flow errors handlers use to steer dispatch.
//!
//! This crate holds no behavior beyond the data model itself - routing,
//! execution and services live in `courier-router` and `courier-service`.

pub mod api;
pub mod contact;
pub mod error;
pub mod event;
pub mod message;

pub use api::{Api, ApiCode, ApiResult, BotSession, MessageSendResult};
pub use contact::{ContactId, Friend, Group, GroupConfig, GroupMember, GroupPermission};
pub use error::{HandlerError, HandlerResult, WaitError};
pub use event::{
    Event, EventKind, FriendMessageEvent, FriendRecallEvent, GroupJoinEvent, GroupLeaveEvent,
    GroupMessageEvent, GroupMuteEvent, GroupRecallEvent, GroupUnmuteEvent, InvitedJoinRequestEvent,
    JoinRequestEvent, MetaEvent, MetaEventKind, SchedulerEvent, Sender, TempMessageEvent,
    MESSAGE_EVENT_KINDS,
};
pub use message::{Image, MessageChain, MessageElement, MessageId, MessageKind, Voice};
