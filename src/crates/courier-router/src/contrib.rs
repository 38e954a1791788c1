//! Command-style helpers built on the core combinators
//!
//! Small builders most command handlers end up wanting: detecting that a
//! message addresses the bot, tokenizing command arguments, and matching
//! a command name while publishing the rest of the line.

use courier_model::{Event, MessageElement};

use crate::combinators::{process, store_value, when};
use crate::graph::Graph;
use crate::key::{Key, KeyFn, RouteArgs};
use crate::message::starts_with;

/// Store alias carrying the tokenized command arguments of
/// [`split_args`].
pub const KEY_ARGS: &str = "args";

/// Store alias carrying the remaining command line of [`command`].
pub const KEY_REST: &str = "rest";

fn addressed_to(event: &Event, me: i64, names: &[String]) -> bool {
    match event {
        // Private conversations always address the bot.
        Event::FriendMessage(_) | Event::TempMessage(_) => true,
        Event::GroupMessage(e) => {
            if e.message.iter().any(
                |el| matches!(el, MessageElement::At { target } if *target == me),
            ) {
                return true;
            }
            let text = e.message.content_string();
            names.iter().any(|name| {
                text.strip_prefix(name.as_str())
                    .map(|rest| rest.is_empty() || rest.starts_with([' ', ',', '，']))
                    .unwrap_or(false)
            })
        }
        _ => false,
    }
}

/// Match messages addressed to the bot: any private message, or a group
/// message mentioning the session account.
pub fn to_me() -> Graph {
    to_me_named([])
}

/// Like [`to_me`], also accepting group messages that open with one of
/// the bot's names.
pub fn to_me_named(names: impl IntoIterator<Item = String>) -> Graph {
    let names: Vec<String> = names.into_iter().collect();
    when(KeyFn::new(move |args: RouteArgs| {
        let me = args.session.as_ref().map(|s| s.qq());
        let names = names.clone();
        let event = args.event.clone();
        async move {
            let Some(me) = me else {
                return Ok(Key::Bool(false));
            };
            Ok(Key::Bool(addressed_to(&event, me, &names)))
        }
    }))
}

/// Split a command line into whitespace-separated tokens, honoring
/// double quotes. Mirrors how command shells group quoted arguments.
pub fn split_tokens(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut pending = false;
    for ch in text.chars() {
        match ch {
            '"' => {
                quoted = !quoted;
                pending = true;
            }
            c if c.is_whitespace() && !quoted => {
                if pending {
                    tokens.push(std::mem::take(&mut current));
                    pending = false;
                }
            }
            c => {
                current.push(c);
                pending = true;
            }
        }
    }
    if pending {
        tokens.push(current);
    }
    tokens
}

/// Tokenize the message text and publish the tokens under
/// [`KEY_ARGS`]. Messages with no text publish an empty list.
pub fn split_args() -> Graph {
    store_value(
        KEY_ARGS,
        KeyFn::named_from_event("contrib.split-args", |event| {
            let text = match event.message() {
                Some(m) => m.content_string(),
                None => return Key::List(Vec::new()),
            };
            Key::List(split_tokens(text.trim()).into_iter().map(Key::Str).collect())
        }),
    )
}

/// Match a command by name: the trimmed text must start with one of the
/// given names, and the rest of the line (trimmed) is published under
/// [`KEY_REST`].
pub fn command(names: impl IntoIterator<Item = String>) -> Graph {
    let names: Vec<String> = names.into_iter().collect();
    let rest = {
        let names = names.clone();
        KeyFn::new(move |args: RouteArgs| {
            let names = names.clone();
            let event = args.event.clone();
            async move {
                let Some(text) = event.message().map(|m| m.content_string()) else {
                    return Ok(Key::None);
                };
                let text = text.trim();
                let matched = names
                    .iter()
                    .find_map(|name| text.strip_prefix(name.as_str()));
                Ok(Key::from(matched.map(|rest| rest.trim().to_string())))
            }
        })
        .with_alias(KEY_REST)
    };
    starts_with(names, true) & process(rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizer_honors_quotes() {
        assert_eq!(split_tokens("a b  c"), vec!["a", "b", "c"]);
        assert_eq!(split_tokens(r#"add "two words" three"#), vec!["add", "two words", "three"]);
        assert_eq!(split_tokens(""), Vec::<String>::new());
        assert_eq!(split_tokens(r#""""#), vec![""]);
        assert_eq!(split_tokens("你 好"), vec!["你", "好"]);
    }
}
