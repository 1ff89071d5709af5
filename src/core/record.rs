use super::{Collection, Identifier, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A family, project, task or member document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: Identifier,
    pub collection: Collection,
    pub fields: BTreeMap<String, Value>,
    pub member_ids: Vec<String>,
    pub parent_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Record {
    pub fn new(id: Identifier, collection: Collection) -> Self {
        Self {
            id,
            collection,
            fields: BTreeMap::new(),
            member_ids: Vec::new(),
            parent_id: None,
            created_at: None,
            updated_at: None,
        }
    }

    /// A record without identity yet, to be handed to `create`.
    pub fn draft(collection: Collection) -> Self {
        Self::new(Identifier::pending(), collection)
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with_members<I, S>(mut self, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.member_ids = members.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// Value of the collection's display field (`name` or `title`).
    pub fn display_name(&self) -> Option<&str> {
        self.text(self.collection.display_field())
    }

    pub fn is_confirmed(&self) -> bool {
        self.id.is_confirmed()
    }
}

/// Field-level change applied optimistically and sent to the remote store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordPatch {
    pub set: BTreeMap<String, Value>,
    pub unset: Vec<String>,
    pub add_members: Vec<String>,
    pub remove_members: Vec<String>,
}

impl RecordPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.insert(name.into(), value.into());
        self
    }

    pub fn unset(mut self, name: impl Into<String>) -> Self {
        self.unset.push(name.into());
        self
    }

    pub fn add_member(mut self, user_id: impl Into<String>) -> Self {
        self.add_members.push(user_id.into());
        self
    }

    pub fn remove_member(mut self, user_id: impl Into<String>) -> Self {
        self.remove_members.push(user_id.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
            && self.unset.is_empty()
            && self.add_members.is_empty()
            && self.remove_members.is_empty()
    }

    /// Returns the patched copy of `record`; `updated_at` is stamped with `now`.
    pub fn apply_to(&self, record: &Record, now: DateTime<Utc>) -> Record {
        let mut next = record.clone();
        for name in &self.unset {
            next.fields.remove(name);
        }
        for (name, value) in &self.set {
            next.fields.insert(name.clone(), value.clone().normalized());
        }
        for user in &self.add_members {
            if !next.member_ids.contains(user) {
                next.member_ids.push(user.clone());
            }
        }
        next.member_ids.retain(|user| !self.remove_members.contains(user));
        next.updated_at = Some(now);
        next
    }
}
