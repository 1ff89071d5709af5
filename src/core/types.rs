use super::Record;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Client-generated token naming a record the server has not confirmed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalToken(Uuid);

impl LocalToken {
    pub fn new() -> Self {
        LocalToken(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for LocalToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LocalToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local:{}", self.0)
    }
}

/// Identity of a record.
///
/// ```text
/// Pending(token) ──server create ok──> Confirmed(server_id)
/// ```
///
/// Only `Confirmed` ids may be sent to the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Identifier {
    Confirmed(String),
    Pending(LocalToken),
}

impl Identifier {
    pub fn confirmed(id: impl Into<String>) -> Self {
        Identifier::Confirmed(id.into())
    }

    pub fn pending() -> Self {
        Identifier::Pending(LocalToken::new())
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, Identifier::Confirmed(_))
    }

    /// Server id, if the record has one.
    pub fn server_id(&self) -> Option<&str> {
        match self {
            Identifier::Confirmed(id) => Some(id),
            Identifier::Pending(_) => None,
        }
    }

    pub fn local_token(&self) -> Option<LocalToken> {
        match self {
            Identifier::Pending(token) => Some(*token),
            Identifier::Confirmed(_) => None,
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Confirmed(id) => write!(f, "{}", id),
            Identifier::Pending(token) => write!(f, "{}", token),
        }
    }
}

impl From<&str> for Identifier {
    fn from(id: &str) -> Self {
        Identifier::Confirmed(id.to_string())
    }
}

impl From<String> for Identifier {
    fn from(id: String) -> Self {
        Identifier::Confirmed(id)
    }
}

/// Remote collections the engine keeps in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Families,
    Projects,
    Tasks,
    Members,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Families => "families",
            Collection::Projects => "projects",
            Collection::Tasks => "tasks",
            Collection::Members => "members",
        }
    }

    /// Text field that names a record of this collection and must never be blank.
    pub fn display_field(&self) -> &'static str {
        match self {
            Collection::Tasks => "title",
            Collection::Families | Collection::Projects | Collection::Members => "name",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which records of a collection a listener or refresh pass covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeFilter {
    All,
    /// Records whose `member_ids` contain the user.
    MemberOf(String),
    /// Records whose `parent_id` is the given id.
    ChildOf(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionScope {
    pub collection: Collection,
    pub filter: ScopeFilter,
}

impl CollectionScope {
    pub fn all(collection: Collection) -> Self {
        Self {
            collection,
            filter: ScopeFilter::All,
        }
    }

    pub fn member_of(collection: Collection, user_id: impl Into<String>) -> Self {
        Self {
            collection,
            filter: ScopeFilter::MemberOf(user_id.into()),
        }
    }

    pub fn child_of(collection: Collection, parent_id: impl Into<String>) -> Self {
        Self {
            collection,
            filter: ScopeFilter::ChildOf(parent_id.into()),
        }
    }

    pub fn contains(&self, record: &Record) -> bool {
        if record.collection != self.collection {
            return false;
        }
        match &self.filter {
            ScopeFilter::All => true,
            ScopeFilter::MemberOf(user) => record.member_ids.iter().any(|m| m == user),
            ScopeFilter::ChildOf(parent) => record.parent_id.as_deref() == Some(parent.as_str()),
        }
    }
}

impl fmt::Display for CollectionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.filter {
            ScopeFilter::All => write!(f, "{}", self.collection),
            ScopeFilter::MemberOf(user) => write!(f, "{}[member={}]", self.collection, user),
            ScopeFilter::ChildOf(parent) => write!(f, "{}[parent={}]", self.collection, parent),
        }
    }
}
