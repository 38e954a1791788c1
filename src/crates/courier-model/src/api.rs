//! Outbound protocol surface
//!
//! [`Api`] is the call interface a protocol adapter implements; the engine
//! and services only consume it. Failures surface through
//! [`ApiResult::code`] - no error type crosses the boundary.

use async_trait::async_trait;

use crate::contact::{ContactId, Friend, Group, GroupConfig, GroupMember};
use crate::event::Event;
use crate::message::{MessageChain, MessageId};

/// Well-known result codes. `0` is success, failures are negative.
pub struct ApiCode;

impl ApiCode {
    pub const SUCCESS: i32 = 0;
    pub const UNSPECIFIED: i32 = -1;
    pub const UNAVAILABLE: i32 = -2;
    pub const INCORRECT_ARGUMENT: i32 = -5;
    pub const REQUEST_ERROR: i32 = -10;
    pub const NETWORK_ERROR: i32 = -20;
}

/// Result envelope for every [`Api`] call.
#[derive(Clone, Debug)]
pub struct ApiResult<T> {
    code: i32,
    message: String,
    data: Option<T>,
}

impl<T> ApiResult<T> {
    pub fn ok(data: T) -> Self {
        ApiResult { code: ApiCode::SUCCESS, message: String::new(), data: Some(data) }
    }

    pub fn error(code: i32, message: impl Into<String>) -> Self {
        ApiResult { code, message: message.into(), data: None }
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_ok(&self) -> bool {
        self.code == ApiCode::SUCCESS
    }

    pub fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    pub fn into_data(self) -> Option<T> {
        self.data
    }
}

impl ApiResult<()> {
    pub fn done() -> Self {
        ApiResult { code: ApiCode::SUCCESS, message: String::new(), data: Some(()) }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageSendResult {
    pub message_id: MessageId,
}

/// Calls offered by the protocol backend. All default to `UNAVAILABLE` so
/// partial adapters stay usable.
#[async_trait]
pub trait Api: Send + Sync {
    async fn send_friend_message(
        &self,
        qq: ContactId,
        message: MessageChain,
    ) -> ApiResult<MessageSendResult> {
        let _ = (qq, message);
        ApiResult::error(ApiCode::UNAVAILABLE, "send_friend_message unsupported")
    }

    async fn send_temp_message(
        &self,
        qq: ContactId,
        group: ContactId,
        message: MessageChain,
    ) -> ApiResult<MessageSendResult> {
        let _ = (qq, group, message);
        ApiResult::error(ApiCode::UNAVAILABLE, "send_temp_message unsupported")
    }

    async fn send_group_message(
        &self,
        group: ContactId,
        message: MessageChain,
    ) -> ApiResult<MessageSendResult> {
        let _ = (group, message);
        ApiResult::error(ApiCode::UNAVAILABLE, "send_group_message unsupported")
    }

    async fn recall(&self, message_id: MessageId) -> ApiResult<()> {
        let _ = message_id;
        ApiResult::error(ApiCode::UNAVAILABLE, "recall unsupported")
    }

    async fn get_message(&self, message_id: MessageId) -> ApiResult<MessageChain> {
        let _ = message_id;
        ApiResult::error(ApiCode::UNAVAILABLE, "get_message unsupported")
    }

    async fn get_friend_list(&self) -> ApiResult<Vec<Friend>> {
        ApiResult::error(ApiCode::UNAVAILABLE, "get_friend_list unsupported")
    }

    async fn get_group_list(&self) -> ApiResult<Vec<Group>> {
        ApiResult::error(ApiCode::UNAVAILABLE, "get_group_list unsupported")
    }

    async fn get_group_member_list(&self, group: ContactId) -> ApiResult<Vec<GroupMember>> {
        let _ = group;
        ApiResult::error(ApiCode::UNAVAILABLE, "get_group_member_list unsupported")
    }

    async fn set_group_mute(
        &self,
        group: ContactId,
        qq: Option<ContactId>,
        duration: Option<u64>,
    ) -> ApiResult<()> {
        let _ = (group, qq, duration);
        ApiResult::error(ApiCode::UNAVAILABLE, "set_group_mute unsupported")
    }

    async fn set_group_unmute(&self, group: ContactId, qq: Option<ContactId>) -> ApiResult<()> {
        let _ = (group, qq);
        ApiResult::error(ApiCode::UNAVAILABLE, "set_group_unmute unsupported")
    }

    async fn set_group_kick(&self, group: ContactId, qq: ContactId) -> ApiResult<()> {
        let _ = (group, qq);
        ApiResult::error(ApiCode::UNAVAILABLE, "set_group_kick unsupported")
    }

    async fn set_group_leave(&self, group: ContactId) -> ApiResult<()> {
        let _ = group;
        ApiResult::error(ApiCode::UNAVAILABLE, "set_group_leave unsupported")
    }

    async fn get_group_config(&self, group: ContactId) -> ApiResult<GroupConfig> {
        let _ = group;
        ApiResult::error(ApiCode::UNAVAILABLE, "get_group_config unsupported")
    }

    async fn set_group_config(&self, group: ContactId, config: GroupConfig) -> ApiResult<()> {
        let _ = (group, config);
        ApiResult::error(ApiCode::UNAVAILABLE, "set_group_config unsupported")
    }

    async fn get_group_member_info(
        &self,
        group: ContactId,
        qq: ContactId,
    ) -> ApiResult<GroupMember> {
        let _ = (group, qq);
        ApiResult::error(ApiCode::UNAVAILABLE, "get_group_member_info unsupported")
    }

    async fn set_group_member_info(
        &self,
        group: ContactId,
        qq: ContactId,
        name: Option<String>,
    ) -> ApiResult<()> {
        let _ = (group, qq, name);
        ApiResult::error(ApiCode::UNAVAILABLE, "set_group_member_info unsupported")
    }
}

/// A live connection to one bot account.
#[async_trait]
pub trait BotSession: Send + Sync {
    /// Account the session is logged in as.
    fn qq(&self) -> ContactId;

    fn api(&self) -> &dyn Api;

    /// Reply to a message event through the matching Api call, optionally
    /// mentioning the sender first for group messages.
    async fn send(
        &self,
        event: &Event,
        message: MessageChain,
        at_sender: bool,
    ) -> ApiResult<MessageSendResult> {
        match event {
            Event::GroupMessage(e) => {
                let mut message = message;
                if at_sender {
                    message.insert(0, crate::message::MessageElement::at(e.sender.qq));
                }
                self.api().send_group_message(e.group, message).await
            }
            Event::FriendMessage(e) => {
                self.api().send_friend_message(e.sender.qq, message).await
            }
            Event::TempMessage(e) => {
                self.api().send_temp_message(e.sender.qq, e.group, message).await
            }
            _ => ApiResult::error(ApiCode::INCORRECT_ARGUMENT, "not a message event"),
        }
    }
}
