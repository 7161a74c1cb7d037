//! Awareness records: the ephemeral per-peer side channel.
//!
//! A record is a flat map of JSON fields owned by one connected client.
//! It is replaced wholesale on every local change and disappears when the
//! client disconnects. Well-known fields:
//!
//! | Field           | Shape                                          |
//! |-----------------|------------------------------------------------|
//! | `user`          | `{id, name, email}`                            |
//! | `userMutexLock` | `{user, nodeIds, operation, metadata?}`        |
//! | `pointer`       | `{x, y}`                                       |
//! | `selection`     | `[nodeId]`                                     |
//!
//! Typed accessors never fail: a field that does not decode reads as absent.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::protocol::ProtocolError;

pub const USER_FIELD: &str = "user";
pub const MUTEX_LOCK_FIELD: &str = "userMutexLock";
pub const POINTER_FIELD: &str = "pointer";
pub const SELECTION_FIELD: &str = "selection";

/// Identity a peer announces under the `user` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct UserIdentity {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: String,
}

impl UserIdentity {
    pub fn new(id: impl Into<String>, name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            email: email.into(),
        }
    }
}

/// Value published under [`MUTEX_LOCK_FIELD`] while a peer holds a lock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserMutexLock {
    pub user: UserIdentity,
    #[serde(rename = "nodeIds")]
    pub node_ids: Vec<String>,
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Pointer position in scene coordinates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Pointer {
    pub x: f64,
    pub y: f64,
}

/// Awareness state of one connected client.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AwarenessRecord {
    /// Transport-level id of the owning client
    pub client_id: Uuid,
    pub fields: Map<String, Value>,
}

impl AwarenessRecord {
    pub fn new(client_id: Uuid) -> Self {
        Self {
            client_id,
            fields: Map::new(),
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Set or clear (`None`) a field. Returns whether the record changed.
    pub fn set(&mut self, field: &str, value: Option<Value>) -> bool {
        match value {
            Some(value) => self.fields.insert(field.to_string(), value.clone()) != Some(value),
            None => self.fields.remove(field).is_some(),
        }
    }

    pub fn set_user(&mut self, user: &UserIdentity) {
        self.set(USER_FIELD, serde_json::to_value(user).ok());
    }

    pub fn user(&self) -> Option<UserIdentity> {
        self.typed(USER_FIELD)
    }

    pub fn mutex_lock(&self) -> Option<UserMutexLock> {
        self.typed(MUTEX_LOCK_FIELD)
    }

    pub fn pointer(&self) -> Option<Pointer> {
        self.typed(POINTER_FIELD)
    }

    pub fn selection(&self) -> Vec<String> {
        self.typed(SELECTION_FIELD).unwrap_or_default()
    }

    fn typed<T: for<'de> Deserialize<'de>>(&self, field: &str) -> Option<T> {
        let value = self.fields.get(field)?;
        match serde_json::from_value(value.clone()) {
            Ok(v) => Some(v),
            Err(e) => {
                log::trace!("Ignoring malformed '{}' field from {}: {}", field, self.client_id, e);
                None
            }
        }
    }

    /// JSON encoding of the fields.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(&self.fields).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Decode fields sent by `client_id`. Anything that is not a JSON
    /// object becomes an empty record.
    pub fn decode_or_empty(client_id: Uuid, bytes: &[u8]) -> Self {
        let fields = match serde_json::from_slice::<Value>(bytes) {
            Ok(Value::Object(fields)) => fields,
            Ok(_) | Err(_) => {
                log::warn!("Malformed awareness payload from {}, using empty record", client_id);
                Map::new()
            }
        };
        Self { client_id, fields }
    }
}
