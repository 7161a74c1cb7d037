//! Narrow interface over the replicated document.
//!
//! The scene engine never touches `yrs` directly. It only sees named maps
//! and arrays of JSON values plus update encoding, so the CRDT stays an
//! opaque dependency:
//!
//! ```text
//! SceneState ──► ReplicatedDocument ──► YrsDocument ──► yrs::Doc
//!                (maps, arrays,          (Any <-> JSON)
//!                 encode/apply)
//! ```
//!
//! Every call opens and commits its own transaction. Callers that need a
//! single downstream signal for several calls batch at a higher level.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Array, Doc, Map, Out, ReadTxn, StateVector, Transact, Update, WriteTxn};

/// Errors raised when exchanging updates with the replicated document.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Malformed state vector: {0}")]
    StateVector(String),
    #[error("Malformed update: {0}")]
    Decode(String),
    #[error("Failed to apply update: {0}")]
    Apply(String),
}

impl From<yrs::encoding::read::Error> for DocumentError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        DocumentError::Decode(e.to_string())
    }
}

/// The operations the scene engine needs from a CRDT document.
///
/// Values cross the boundary as owned JSON, so nothing handed out keeps a
/// live reference into the document.
pub trait ReplicatedDocument {
    /// Read `key` from the named map.
    fn get_map(&self, map: &str, key: &str) -> Option<Value>;

    /// All keys currently present in the named map.
    fn map_keys(&self, map: &str) -> Vec<String>;

    /// Write (replace) `key` in the named map.
    fn set_map(&self, map: &str, key: &str, value: Value);

    /// Delete `key` from the named map. Returns whether it existed.
    fn delete_map(&self, map: &str, key: &str) -> bool;

    /// Snapshot of the named array.
    fn get_array(&self, array: &str) -> Vec<Value>;

    /// Insert `values` at `index` (clamped to the array length).
    fn insert_array(&self, array: &str, index: u32, values: Vec<Value>);

    /// Delete `len` elements starting at `index`. Out-of-range requests are clamped.
    fn delete_array(&self, array: &str, index: u32, len: u32);

    /// Encoded state vector of the local replica.
    fn state_vector(&self) -> Vec<u8>;

    /// The whole document encoded as a single update.
    fn encode_update(&self) -> Vec<u8>;

    /// Everything the holder of `state_vector` has not seen yet.
    fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocumentError>;

    /// Merge a remote update.
    fn apply_update(&self, update: &[u8]) -> Result<(), DocumentError>;
}

/// [`ReplicatedDocument`] backed by a `yrs` document.
///
/// Root-level maps and arrays are created lazily by name. Reads also go
/// through a write transaction so that root types received from a peer
/// before this replica ever named them get their concrete type assigned.
pub struct YrsDocument {
    doc: Doc,
}

impl Default for YrsDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl YrsDocument {
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Create with an explicit client id (deterministic tests).
    pub fn with_client_id(client_id: u64) -> Self {
        Self {
            doc: Doc::with_client_id(client_id),
        }
    }

    /// Restore a replica from a full-state update (e.g. a room snapshot).
    pub fn from_update(update: &[u8]) -> Result<Self, DocumentError> {
        let doc = Self::new();
        doc.apply_update(update)?;
        Ok(doc)
    }

    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    /// The underlying `yrs` document.
    pub fn inner(&self) -> &Doc {
        &self.doc
    }
}

impl ReplicatedDocument for YrsDocument {
    fn get_map(&self, map: &str, key: &str) -> Option<Value> {
        let mut txn = self.doc.transact_mut();
        let map_ref = txn.get_or_insert_map(map);
        map_ref.get(&txn, key).map(|out| out_to_json(&out))
    }

    fn map_keys(&self, map: &str) -> Vec<String> {
        let mut txn = self.doc.transact_mut();
        let map_ref = txn.get_or_insert_map(map);
        map_ref.keys(&txn).map(|k| k.to_string()).collect()
    }

    fn set_map(&self, map: &str, key: &str, value: Value) {
        let mut txn = self.doc.transact_mut();
        let map_ref = txn.get_or_insert_map(map);
        map_ref.insert(&mut txn, key.to_string(), json_to_any(&value));
    }

    fn delete_map(&self, map: &str, key: &str) -> bool {
        let mut txn = self.doc.transact_mut();
        let map_ref = txn.get_or_insert_map(map);
        map_ref.remove(&mut txn, key).is_some()
    }

    fn get_array(&self, array: &str) -> Vec<Value> {
        let mut txn = self.doc.transact_mut();
        let array_ref = txn.get_or_insert_array(array);
        array_ref.iter(&txn).map(|out| out_to_json(&out)).collect()
    }

    fn insert_array(&self, array: &str, index: u32, values: Vec<Value>) {
        let mut txn = self.doc.transact_mut();
        let array_ref = txn.get_or_insert_array(array);
        let mut at = index.min(array_ref.len(&txn));
        for value in &values {
            array_ref.insert(&mut txn, at, json_to_any(value));
            at += 1;
        }
    }

    fn delete_array(&self, array: &str, index: u32, len: u32) {
        let mut txn = self.doc.transact_mut();
        let array_ref = txn.get_or_insert_array(array);
        let total = array_ref.len(&txn);
        if index >= total {
            return;
        }
        let len = len.min(total - index);
        if len > 0 {
            array_ref.remove_range(&mut txn, index, len);
        }
    }

    fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    fn encode_update(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let remote = StateVector::decode_v1(state_vector)
            .map_err(|e| DocumentError::StateVector(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&remote))
    }

    fn apply_update(&self, update: &[u8]) -> Result<(), DocumentError> {
        let update = Update::decode_v1(update)?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| DocumentError::Apply(e.to_string()))
    }
}

/// Convert a JSON value into a `yrs` primitive.
///
/// Integers stay integers (`BigInt`) so that counters such as `zIndex`
/// survive a round trip without turning into floats.
pub fn json_to_any(value: &Value) -> Any {
    match value {
        Value::Null => Any::Null,
        Value::Bool(b) => Any::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Any::BigInt(i),
            None => Any::Number(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => Any::String(Arc::from(s.as_str())),
        Value::Array(items) => Any::Array(items.iter().map(json_to_any).collect()),
        Value::Object(map) => Any::Map(Arc::new(
            map.iter()
                .map(|(k, v)| (k.clone(), json_to_any(v)))
                .collect::<HashMap<String, Any>>(),
        )),
    }
}

/// Convert a `yrs` primitive back into JSON.
pub fn any_to_json(any: &Any) -> Value {
    match any {
        Any::Null | Any::Undefined => Value::Null,
        Any::Bool(b) => Value::Bool(*b),
        Any::Number(n) => serde_json::Number::from_f64(*n)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Any::BigInt(i) => Value::from(*i),
        Any::String(s) => Value::String(s.to_string()),
        Any::Buffer(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
        Any::Array(items) => Value::Array(items.iter().map(any_to_json).collect()),
        Any::Map(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), any_to_json(v)))
                .collect(),
        ),
    }
}

fn out_to_json(out: &Out) -> Value {
    match out {
        Out::Any(any) => any_to_json(any),
        // Shared types are never written through this interface.
        other => {
            log::warn!("Unexpected shared type in document: {other:?}");
            Value::Null
        }
    }
}
