//! Contacts, groups and group roles.

/// Account / group identifier used by the protocol backend.
pub type ContactId = i64;

/// Role of a member inside a group.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum GroupPermission {
    Owner,
    Admin,
    Member,
    #[default]
    None,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Friend {
    pub id: ContactId,
    pub name: String,
    pub remark: String,
}

impl Friend {
    pub fn new(id: ContactId, name: impl Into<String>) -> Self {
        let name = name.into();
        Friend { id, remark: name.clone(), name }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Group {
    pub id: ContactId,
    pub name: String,
    pub permission: GroupPermission,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupMember {
    pub id: ContactId,
    pub name: String,
    pub permission: GroupPermission,
}

/// Group-level settings exposed by the backend.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GroupConfig {
    pub name: Option<String>,
    pub announcement: Option<String>,
    pub allow_member_invite: Option<bool>,
}
