//! Immutable message chains and their elements
//!
//! A [`MessageChain`] is an ordered sequence of [`MessageElement`]s as
//! delivered by a protocol adapter. Chains compare element-wise while
//! ignoring [`MessageElement::Meta`] markers, so adapter-injected metadata
//! never affects matching. Media elements ([`Image`], [`Voice`]) compare
//! equal when *any* of their hash, url or raw content match, because an
//! adapter may only know a subset of the three.

use serde_json::Value;

use crate::contact::ContactId;

/// Message id assigned by the protocol backend.
pub type MessageId = i64;

/// Discriminant for [`MessageElement`], usable as a routing key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Meta,
    Plain,
    At,
    AtAll,
    Face,
    Image,
    Voice,
    Quote,
    App,
    Xml,
    Unknown,
}

/// Image payload. `hash` and `url` are adapter-provided identifiers;
/// `content` is the raw bytes when the adapter downloaded them.
#[derive(Clone, Debug, Default)]
pub struct Image {
    pub hash: Option<String>,
    pub url: Option<String>,
    pub content: Option<Vec<u8>>,
}

impl PartialEq for Image {
    fn eq(&self, other: &Self) -> bool {
        matches_any(&self.hash, &other.hash)
            || matches_any(&self.url, &other.url)
            || matches_any(&self.content, &other.content)
    }
}

impl Eq for Image {}

/// Voice payload, same identity rules as [`Image`].
#[derive(Clone, Debug, Default)]
pub struct Voice {
    pub hash: Option<String>,
    pub url: Option<String>,
    pub content: Option<Vec<u8>>,
}

impl PartialEq for Voice {
    fn eq(&self, other: &Self) -> bool {
        matches_any(&self.hash, &other.hash)
            || matches_any(&self.url, &other.url)
            || matches_any(&self.content, &other.content)
    }
}

impl Eq for Voice {}

fn matches_any<T: PartialEq>(a: &Option<T>, b: &Option<T>) -> bool {
    matches!((a, b), (Some(x), Some(y)) if x == y)
}

/// A single element of a message chain.
#[derive(Clone, Debug)]
pub enum MessageElement {
    /// Adapter-private marker, ignored by chain equality.
    Meta,
    Plain { text: String },
    At { target: ContactId },
    AtAll,
    Face { id: i32 },
    Image(Image),
    Voice(Voice),
    /// Reply reference. Two quotes are equal when they reference the same
    /// message id, regardless of the attached origin chain.
    Quote {
        id: MessageId,
        origin: Option<MessageChain>,
    },
    App { content: Value },
    Xml { content: String },
    Unknown,
}

impl MessageElement {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageElement::Meta => MessageKind::Meta,
            MessageElement::Plain { .. } => MessageKind::Plain,
            MessageElement::At { .. } => MessageKind::At,
            MessageElement::AtAll => MessageKind::AtAll,
            MessageElement::Face { .. } => MessageKind::Face,
            MessageElement::Image(_) => MessageKind::Image,
            MessageElement::Voice(_) => MessageKind::Voice,
            MessageElement::Quote { .. } => MessageKind::Quote,
            MessageElement::App { .. } => MessageKind::App,
            MessageElement::Xml { .. } => MessageKind::Xml,
            MessageElement::Unknown => MessageKind::Unknown,
        }
    }

    /// The element's contribution to [`MessageChain::content_string`].
    pub fn content_string(&self) -> &str {
        match self {
            MessageElement::Plain { text } => text,
            _ => "",
        }
    }

    pub fn plain(text: impl Into<String>) -> Self {
        MessageElement::Plain { text: text.into() }
    }

    pub fn at(target: ContactId) -> Self {
        MessageElement::At { target }
    }

    pub fn quote(id: MessageId) -> Self {
        MessageElement::Quote { id, origin: None }
    }
}

impl PartialEq for MessageElement {
    fn eq(&self, other: &Self) -> bool {
        use MessageElement::*;
        match (self, other) {
            (Meta, Meta) => true,
            (Plain { text: a }, Plain { text: b }) => a == b,
            (At { target: a }, At { target: b }) => a == b,
            (AtAll, AtAll) => true,
            (Face { id: a }, Face { id: b }) => a == b,
            (Image(a), Image(b)) => a == b,
            (Voice(a), Voice(b)) => a == b,
            (Quote { id: a, .. }, Quote { id: b, .. }) => a == b,
            (App { content: a }, App { content: b }) => a == b,
            (Xml { content: a }, Xml { content: b }) => a == b,
            (Unknown, Unknown) => true,
            _ => false,
        }
    }
}

impl Eq for MessageElement {}

/// Ordered, immutable sequence of message elements.
#[derive(Clone, Debug, Default)]
pub struct MessageChain(Vec<MessageElement>);

impl MessageChain {
    pub fn new() -> Self {
        MessageChain(Vec::new())
    }

    /// Concatenated plain text, with leading whitespace stripped.
    pub fn content_string(&self) -> String {
        let joined: String = self.0.iter().map(|e| e.content_string()).collect();
        joined.trim_start().to_string()
    }

    pub fn elements(&self) -> &[MessageElement] {
        &self.0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MessageElement> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, element: MessageElement) {
        self.0.push(element);
    }

    pub fn insert(&mut self, index: usize, element: MessageElement) {
        self.0.insert(index, element);
    }

    /// Whether the chain contains an element of the given kind.
    pub fn has(&self, kind: MessageKind) -> bool {
        self.0.iter().any(|e| e.kind() == kind)
    }

    /// The `index`-th element of the given kind, counting only that kind.
    pub fn get(&self, index: usize, kind: MessageKind) -> Option<&MessageElement> {
        self.0.iter().filter(|e| e.kind() == kind).nth(index)
    }

    /// First element of the given kind.
    pub fn first(&self, kind: MessageKind) -> Option<&MessageElement> {
        self.get(0, kind)
    }
}

impl PartialEq for MessageChain {
    /// Element-wise equality ignoring `Meta` elements: a position is
    /// accepted when either side carries a `Meta` marker or the two
    /// elements compare equal.
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self.0.iter().zip(other.0.iter()).all(|(a, b)| {
                matches!(a, MessageElement::Meta) || matches!(b, MessageElement::Meta) || a == b
            })
    }
}

impl Eq for MessageChain {}

impl From<&str> for MessageChain {
    fn from(text: &str) -> Self {
        MessageChain(vec![MessageElement::plain(text)])
    }
}

impl From<String> for MessageChain {
    fn from(text: String) -> Self {
        MessageChain(vec![MessageElement::Plain { text }])
    }
}

impl From<MessageElement> for MessageChain {
    fn from(element: MessageElement) -> Self {
        MessageChain(vec![element])
    }
}

impl From<Vec<MessageElement>> for MessageChain {
    fn from(elements: Vec<MessageElement>) -> Self {
        MessageChain(elements)
    }
}

impl FromIterator<MessageElement> for MessageChain {
    fn from_iter<I: IntoIterator<Item = MessageElement>>(iter: I) -> Self {
        MessageChain(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a MessageChain {
    type Item = &'a MessageElement;
    type IntoIter = std::slice::Iter<'a, MessageElement>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl IntoIterator for MessageChain {
    type Item = MessageElement;
    type IntoIter = std::vec::IntoIter<MessageElement>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
