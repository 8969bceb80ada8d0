use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PayloadError;

/// Kind of change recorded by the producer.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Add,
    Update,
    Delete,
}

impl ChangeKind {
    /// Net effect of `self` followed by `later` on the same entity.
    ///
    /// An `Add` that was never indexed stays an `Add`; anything after a
    /// `Delete` replaces the document, so it becomes an `Update`. A trailing
    /// `Delete` always wins.
    pub fn then(self, later: ChangeKind) -> ChangeKind {
        match (self, later) {
            (_, ChangeKind::Delete) => ChangeKind::Delete,
            (ChangeKind::Add, _) => ChangeKind::Add,
            (ChangeKind::Update, _) => ChangeKind::Update,
            (ChangeKind::Delete, _) => ChangeKind::Update,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Add => "add",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded content of an outbox row's `payload` column.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct ChangePayload {
    pub kind: ChangeKind,
    /// Document to index; empty for deletes.
    pub document: Vec<u8>,
}

impl ChangePayload {
    pub fn new(kind: ChangeKind, document: Vec<u8>) -> Self {
        Self { kind, document }
    }

    pub fn add(document: impl Into<Vec<u8>>) -> Self {
        Self::new(ChangeKind::Add, document.into())
    }

    pub fn update(document: impl Into<Vec<u8>>) -> Self {
        Self::new(ChangeKind::Update, document.into())
    }

    pub fn delete() -> Self {
        Self::new(ChangeKind::Delete, Vec::new())
    }

    /// Build a payload whose document is `value` rendered as JSON.
    pub fn json<T: Serialize>(kind: ChangeKind, value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(kind, serde_json::to_vec(value)?))
    }

    /// Encode for storage in an outbox row.
    pub fn encode(&self) -> Result<Vec<u8>, PayloadError> {
        Ok(bitcode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PayloadError> {
        Ok(bitcode::deserialize(bytes)?)
    }

    pub fn document_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.document).ok()
    }
}

/// The business entity an outbox row refers to.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityReference {
    pub entity_name: String,
    pub entity_id: String,
}

impl EntityReference {
    pub fn new(entity_name: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_name: entity_name.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity_name, self.entity_id)
    }
}
