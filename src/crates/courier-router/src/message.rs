//! Message-level route combinators
//!
//! Builders over message events: sender/group equality, text equality and
//! prefix matching, regex matching (publishing the match under the
//! `"match"` store alias), message-element kinds, and conversation
//! matching for suspension wakeups.

use regex::Regex;

use courier_model::{
    ContactId, Event, EventKind, GroupPermission, MessageElement, MessageId, MessageKind,
    MetaEventKind, MESSAGE_EVENT_KINDS,
};

use crate::combinators::{equals_by, has_kinds, kind_is, kind_is_any, prefix_by, when};
use crate::graph::Graph;
use crate::key::{Key, KeyFn};

/// Concatenated plain text of the event's message.
pub fn key_content() -> KeyFn {
    KeyFn::named_from_event("message.content", |e| {
        Key::from(e.message().map(|m| m.content_string()))
    })
}

/// Message text with surrounding whitespace trimmed.
pub fn key_content_stripped() -> KeyFn {
    KeyFn::named_from_event("message.content-stripped", |e| {
        Key::from(e.message().map(|m| m.content_string().trim().to_string()))
    })
}

/// Message text reversed codepoint-wise, for suffix matching through the
/// prefix node.
pub fn key_content_reversed() -> KeyFn {
    KeyFn::named_from_event("message.content-reversed", |e| {
        Key::from(e.message().map(|m| m.content_string().chars().rev().collect::<String>()))
    })
}

/// Trimmed message text reversed codepoint-wise.
pub fn key_content_reversed_stripped() -> KeyFn {
    KeyFn::named_from_event("message.content-reversed-stripped", |e| {
        Key::from(
            e.message()
                .map(|m| m.content_string().trim().chars().rev().collect::<String>()),
        )
    })
}

pub fn key_sender_qq() -> KeyFn {
    KeyFn::named_from_event("message.sender", |e| Key::from(e.qq()))
}

pub fn key_group() -> KeyFn {
    KeyFn::named_from_event("message.group", |e| Key::from(e.group()))
}

pub fn key_permission() -> KeyFn {
    KeyFn::named_from_event("message.permission", |e| {
        Key::from(e.sender().map(|s| s.permission))
    })
}

pub fn key_meta_kind() -> KeyFn {
    KeyFn::named_from_event("event.meta-kind", |e| {
        Key::from(e.meta().map(|m| m.kind))
    })
}

/// Key of the service a lifecycle meta event concerns.
pub fn key_meta_service() -> KeyFn {
    KeyFn::named_from_event("event.meta-service", |e| {
        Key::from(e.meta().and_then(|m| m.service.clone()))
    })
}

/// Any message event.
pub fn is_message() -> Graph {
    kind_is_any(MESSAGE_EVENT_KINDS)
}

pub fn is_group() -> Graph {
    kind_is(EventKind::GroupMessage)
}

pub fn is_friend() -> Graph {
    kind_is(EventKind::FriendMessage)
}

pub fn is_temp() -> Graph {
    kind_is(EventKind::TempMessage)
}

/// Friend or temp message.
pub fn is_private() -> Graph {
    kind_is_any([EventKind::FriendMessage, EventKind::TempMessage])
}

pub fn qq_from(qq: ContactId) -> Graph {
    equals_by(key_sender_qq(), [Key::Int(qq)])
}

pub fn group_from(group: ContactId) -> Graph {
    equals_by(key_group(), [Key::Int(group)])
}

pub fn permission_is(permission: GroupPermission) -> Graph {
    equals_by(key_permission(), [Key::Permission(permission)])
}

pub fn meta_kind_is(kind: MetaEventKind) -> Graph {
    kind_is(EventKind::Meta) & equals_by(key_meta_kind(), [Key::MetaKind(kind)])
}

/// Lifecycle meta events for one service.
pub fn service_is(key: impl Into<String>) -> Graph {
    equals_by(key_meta_service(), [Key::Str(key.into())])
}

/// Exact message text match. `strip` trims surrounding whitespace first.
pub fn text_equals(texts: impl IntoIterator<Item = String>, strip: bool) -> Graph {
    let key = if strip { key_content_stripped() } else { key_content() };
    equals_by(key, texts.into_iter().map(Key::Str))
}

/// Message text prefix match; every registered prefix of the text fires.
pub fn starts_with(prefixes: impl IntoIterator<Item = String>, strip: bool) -> Graph {
    let key = if strip { key_content_stripped() } else { key_content() };
    prefix_by(key, prefixes)
}

/// Message text suffix match, implemented as a prefix match over the
/// reversed text.
pub fn ends_with(suffixes: impl IntoIterator<Item = String>, strip: bool) -> Graph {
    let key = if strip { key_content_reversed_stripped() } else { key_content_reversed() };
    prefix_by(key, suffixes.into_iter().map(|s| s.chars().rev().collect()))
}

/// Regex match over the message text. On a match, the full match and its
/// capture groups are published under the `"match"` store alias.
pub fn matches(pattern: Regex) -> Graph {
    when(
        KeyFn::from_event(move |event| {
            let Some(text) = event.message().map(|m| m.content_string()) else {
                return Key::Bool(false);
            };
            match pattern.captures(&text) {
                Some(captures) => Key::List(
                    captures
                        .iter()
                        .map(|c| Key::from(c.map(|m| m.as_str().to_string())))
                        .collect(),
                ),
                None => Key::Bool(false),
            }
        })
        .with_alias("match"),
    )
}

/// Messages containing an element of the given kind.
pub fn has(kind: MessageKind) -> Graph {
    has_kinds([kind])
}

/// Messages quoting the given message id.
pub fn quotes(message_id: MessageId) -> Graph {
    is_message()
        & has(MessageKind::Quote)
        & when(KeyFn::predicate(move |event| {
            event
                .message()
                .map(|m| {
                    m.iter().any(|e| matches!(e, MessageElement::Quote { id, .. } if *id == message_id))
                })
                .unwrap_or(false)
        }))
}

/// Match events from the same conversation as `event`: same group and
/// sender for group messages, same sender for private ones. `None` for
/// non-message events.
pub fn same_event_as(event: &Event) -> Option<Graph> {
    match event {
        Event::GroupMessage(e) => {
            Some(is_group() & group_from(e.group) & qq_from(e.sender.qq))
        }
        Event::FriendMessage(e) => Some(is_friend() & qq_from(e.sender.qq)),
        Event::TempMessage(e) => Some(is_temp() & qq_from(e.sender.qq)),
        _ => None,
    }
}
