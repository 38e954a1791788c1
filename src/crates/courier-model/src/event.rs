//! Typed events delivered to the dispatch engine
//!
//! A protocol adapter turns wire frames into [`Event`] values and pushes
//! them through the runtime. Events are immutable during a dispatch pass;
//! the only sanctioned mutation is the message replacement performed by the
//! runtime when a handler requests a switched dispatch.

use crate::contact::{ContactId, GroupPermission};
use crate::message::{MessageChain, MessageId};

/// Discriminant for [`Event`], usable as a routing key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    GroupMessage,
    FriendMessage,
    TempMessage,
    GroupRecall,
    FriendRecall,
    GroupMute,
    GroupUnmute,
    GroupJoin,
    GroupLeave,
    JoinRequest,
    InvitedJoinRequest,
    Meta,
    Scheduler,
    Unknown,
}

/// Kinds of message events, i.e. events that carry a [`MessageChain`].
pub const MESSAGE_EVENT_KINDS: [EventKind; 3] = [
    EventKind::GroupMessage,
    EventKind::FriendMessage,
    EventKind::TempMessage,
];

/// Sender of a message event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sender {
    pub qq: ContactId,
    pub name: String,
    pub permission: GroupPermission,
}

impl Sender {
    pub fn new(qq: ContactId, name: impl Into<String>) -> Self {
        Sender { qq, name: name.into(), permission: GroupPermission::None }
    }

    pub fn with_permission(mut self, permission: GroupPermission) -> Self {
        self.permission = permission;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupMessageEvent {
    pub group: ContactId,
    pub message: MessageChain,
    pub message_id: MessageId,
    pub sender: Sender,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FriendMessageEvent {
    pub message: MessageChain,
    pub message_id: MessageId,
    pub sender: Sender,
}

/// Message from a group member the bot has no friendship with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TempMessageEvent {
    pub group: ContactId,
    pub message: MessageChain,
    pub message_id: MessageId,
    pub sender: Sender,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupRecallEvent {
    pub group: ContactId,
    pub qq: ContactId,
    pub message_id: MessageId,
    pub operator: ContactId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FriendRecallEvent {
    pub qq: ContactId,
    pub message_id: MessageId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupMuteEvent {
    pub group: ContactId,
    pub qq: ContactId,
    pub operator: ContactId,
    /// Mute duration in seconds.
    pub duration: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupUnmuteEvent {
    pub group: ContactId,
    pub qq: ContactId,
    pub operator: ContactId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupJoinEvent {
    pub group: ContactId,
    pub qq: ContactId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupLeaveEvent {
    pub group: ContactId,
    pub qq: ContactId,
    /// Operator when the member was removed rather than leaving.
    pub operator: Option<ContactId>,
}

/// A member asked to join a group the bot administers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinRequestEvent {
    pub group: ContactId,
    pub qq: ContactId,
    pub comment: String,
    pub request_id: i64,
}

/// The bot was invited into a group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvitedJoinRequestEvent {
    pub group: ContactId,
    pub operator: ContactId,
    pub request_id: i64,
}

/// Lifecycle notifications dispatched through the engine itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetaEventKind {
    ServiceLoaded,
    ServiceUnload,
    PluginLoaded,
    PluginUnload,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetaEvent {
    pub kind: MetaEventKind,
    /// Key of the service concerned, when any.
    pub service: Option<String>,
    /// Name of the plugin concerned, when any.
    pub plugin: Option<String>,
}

impl MetaEvent {
    pub fn service(kind: MetaEventKind, key: impl Into<String>) -> Self {
        MetaEvent { kind, service: Some(key.into()), plugin: None }
    }

    pub fn plugin(kind: MetaEventKind, name: impl Into<String>) -> Self {
        MetaEvent { kind, service: None, plugin: Some(name.into()) }
    }
}

/// Fired by a scheduled job that opts into engine dispatch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchedulerEvent {
    pub job: String,
}

/// A typed, immutable notification delivered to the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    GroupMessage(GroupMessageEvent),
    FriendMessage(FriendMessageEvent),
    TempMessage(TempMessageEvent),
    GroupRecall(GroupRecallEvent),
    FriendRecall(FriendRecallEvent),
    GroupMute(GroupMuteEvent),
    GroupUnmute(GroupUnmuteEvent),
    GroupJoin(GroupJoinEvent),
    GroupLeave(GroupLeaveEvent),
    JoinRequest(JoinRequestEvent),
    InvitedJoinRequest(InvitedJoinRequestEvent),
    Meta(MetaEvent),
    Scheduler(SchedulerEvent),
    Unknown,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::GroupMessage(_) => EventKind::GroupMessage,
            Event::FriendMessage(_) => EventKind::FriendMessage,
            Event::TempMessage(_) => EventKind::TempMessage,
            Event::GroupRecall(_) => EventKind::GroupRecall,
            Event::FriendRecall(_) => EventKind::FriendRecall,
            Event::GroupMute(_) => EventKind::GroupMute,
            Event::GroupUnmute(_) => EventKind::GroupUnmute,
            Event::GroupJoin(_) => EventKind::GroupJoin,
            Event::GroupLeave(_) => EventKind::GroupLeave,
            Event::JoinRequest(_) => EventKind::JoinRequest,
            Event::InvitedJoinRequest(_) => EventKind::InvitedJoinRequest,
            Event::Meta(_) => EventKind::Meta,
            Event::Scheduler(_) => EventKind::Scheduler,
            Event::Unknown => EventKind::Unknown,
        }
    }

    pub fn is_message(&self) -> bool {
        MESSAGE_EVENT_KINDS.contains(&self.kind())
    }

    /// The message chain, for message events.
    pub fn message(&self) -> Option<&MessageChain> {
        match self {
            Event::GroupMessage(e) => Some(&e.message),
            Event::FriendMessage(e) => Some(&e.message),
            Event::TempMessage(e) => Some(&e.message),
            _ => None,
        }
    }

    /// Replace the message chain of a message event. Used by the runtime
    /// when a handler switches the dispatch to a rewritten message.
    pub fn with_message(&self, message: MessageChain) -> Option<Event> {
        match self {
            Event::GroupMessage(e) => {
                Some(Event::GroupMessage(GroupMessageEvent { message, ..e.clone() }))
            }
            Event::FriendMessage(e) => {
                Some(Event::FriendMessage(FriendMessageEvent { message, ..e.clone() }))
            }
            Event::TempMessage(e) => {
                Some(Event::TempMessage(TempMessageEvent { message, ..e.clone() }))
            }
            _ => None,
        }
    }

    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Event::GroupMessage(e) => Some(e.message_id),
            Event::FriendMessage(e) => Some(e.message_id),
            Event::TempMessage(e) => Some(e.message_id),
            Event::GroupRecall(e) => Some(e.message_id),
            Event::FriendRecall(e) => Some(e.message_id),
            _ => None,
        }
    }

    pub fn sender(&self) -> Option<&Sender> {
        match self {
            Event::GroupMessage(e) => Some(&e.sender),
            Event::FriendMessage(e) => Some(&e.sender),
            Event::TempMessage(e) => Some(&e.sender),
            _ => None,
        }
    }

    /// The group the event is scoped to, when any.
    pub fn group(&self) -> Option<ContactId> {
        match self {
            Event::GroupMessage(e) => Some(e.group),
            Event::TempMessage(e) => Some(e.group),
            Event::GroupRecall(e) => Some(e.group),
            Event::GroupMute(e) => Some(e.group),
            Event::GroupUnmute(e) => Some(e.group),
            Event::GroupJoin(e) => Some(e.group),
            Event::GroupLeave(e) => Some(e.group),
            Event::JoinRequest(e) => Some(e.group),
            Event::InvitedJoinRequest(e) => Some(e.group),
            _ => None,
        }
    }

    /// The primary subject account of the event, when any.
    pub fn qq(&self) -> Option<ContactId> {
        match self {
            Event::GroupMessage(e) => Some(e.sender.qq),
            Event::FriendMessage(e) => Some(e.sender.qq),
            Event::TempMessage(e) => Some(e.sender.qq),
            Event::GroupRecall(e) => Some(e.qq),
            Event::FriendRecall(e) => Some(e.qq),
            Event::GroupMute(e) => Some(e.qq),
            Event::GroupUnmute(e) => Some(e.qq),
            Event::GroupJoin(e) => Some(e.qq),
            Event::GroupLeave(e) => Some(e.qq),
            Event::JoinRequest(e) => Some(e.qq),
            _ => None,
        }
    }

    pub fn meta(&self) -> Option<&MetaEvent> {
        match self {
            Event::Meta(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageElement;

    fn group_message(group: ContactId, text: &str) -> Event {
        Event::GroupMessage(GroupMessageEvent {
            group,
            message: MessageChain::from(text),
            message_id: 1,
            sender: Sender::new(10, "alice"),
        })
    }

    #[test]
    fn kinds_and_accessors() {
        let ev = group_message(100, "/ping");
        assert_eq!(ev.kind(), EventKind::GroupMessage);
        assert!(ev.is_message());
        assert_eq!(ev.group(), Some(100));
        assert_eq!(ev.qq(), Some(10));
        assert_eq!(ev.message().unwrap().content_string(), "/ping");
    }

    #[test]
    fn with_message_rewrites_only_the_chain() {
        let ev = group_message(100, "/alias");
        let rewritten = ev
            .with_message(MessageChain::from(MessageElement::plain("/real")))
            .unwrap();
        assert_eq!(rewritten.group(), Some(100));
        assert_eq!(rewritten.message().unwrap().content_string(), "/real");
        assert!(Event::Unknown.with_message(MessageChain::new()).is_none());
    }
}
