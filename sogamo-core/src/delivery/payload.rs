//! Wire encoding for claimed batches
//!
//! Each record becomes one JSON object; a batch is a JSON array of them.
//!
//! Events:
//!
//! ```json
//! {"event": "Signed Up", "properties": {"distinct_id": "...", "token": "...", "$insert_id": "..."}}
//! ```
//!
//! Profile ops:
//!
//! ```json
//! {"$token": "...", "$distinct_id": "...", "$time": 1700000000000, "$set": {"plan": "pro"}}
//! ```
//!
//! A record that cannot be encoded is reported back to the caller instead of
//! failing the whole batch; it will never encode on a later attempt either.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::queue::ClaimedBatch;
use crate::types::{EventRecord, ProfileOp, ProfileOpType, Properties, QueueKind, Record, RecordKind};

/// Encoded body of one delivery attempt
#[derive(Debug, Clone)]
pub struct Payload {
    /// Lane the records came from
    pub kind: QueueKind,
    /// JSON array of wire objects
    pub body: Value,
    /// Number of wire objects in `body`
    pub record_count: usize,
}

impl Payload {
    /// Serialized request body
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.body)?)
    }
}

/// Result of encoding a claimed batch
#[derive(Debug)]
pub struct EncodedBatch {
    /// Body to send, `None` when no record could be encoded
    pub payload: Option<Payload>,
    /// Records left out of the payload and why
    pub rejected: Vec<(Uuid, Error)>,
}

/// Encode every record of a batch, setting aside the malformed ones
pub fn encode_batch(batch: &ClaimedBatch, token: &str) -> EncodedBatch {
    let mut objects = Vec::with_capacity(batch.len());
    let mut rejected = Vec::new();

    for record in &batch.records {
        match encode_record(record, token) {
            Ok(object) => objects.push(object),
            Err(e) => rejected.push((record.id, e)),
        }
    }

    let payload = (!objects.is_empty()).then(|| Payload {
        kind: batch.kind(),
        record_count: objects.len(),
        body: Value::Array(objects),
    });

    EncodedBatch { payload, rejected }
}

/// Encode one record as its wire object
pub fn encode_record(record: &Record, token: &str) -> Result<Value> {
    match &record.kind {
        RecordKind::Event(event) => encode_event(event, &record.created_at),
        RecordKind::ProfileOp(op) => encode_profile_op(op, &record.created_at, token),
    }
}

fn encode_event(event: &EventRecord, created_at: &DateTime<Utc>) -> Result<Value> {
    if event.name.trim().is_empty() {
        return Err(Error::Encoding("event name is empty".to_string()));
    }
    check_keys(&event.properties)?;

    let mut properties = event.properties.clone();
    if !properties.contains_key("$insert_id") {
        let insert_id = compute_insert_id(&event.name, created_at, &event.properties);
        properties.insert("$insert_id".to_string(), Value::String(insert_id));
    }

    Ok(json!({
        "event": event.name,
        "properties": properties,
    }))
}

fn encode_profile_op(op: &ProfileOp, created_at: &DateTime<Utc>, token: &str) -> Result<Value> {
    let distinct_id = op
        .distinct_id
        .as_deref()
        .ok_or_else(|| Error::Encoding(format!("{} op has no distinct id", op.op.as_str())))?;
    check_keys(&op.properties)?;

    let (key, value) = match op.op {
        ProfileOpType::Set => ("$set", non_empty(op)?),
        ProfileOpType::SetOnce => ("$set_once", non_empty(op)?),
        ProfileOpType::Increment => {
            check_values(op, "a number", Value::is_number)?;
            ("$add", non_empty(op)?)
        }
        ProfileOpType::Append => ("$append", non_empty(op)?),
        ProfileOpType::Union => {
            check_values(op, "an array", Value::is_array)?;
            ("$union", non_empty(op)?)
        }
        ProfileOpType::TrackCharge => {
            if !op.properties.get("$amount").is_some_and(Value::is_number) {
                return Err(Error::Encoding(
                    "track_charge requires a numeric $amount".to_string(),
                ));
            }
            ("$append", json!({ "$transactions": op.properties }))
        }
        ProfileOpType::ClearCharges => ("$set", json!({ "$transactions": [] })),
        ProfileOpType::DeleteUser => ("$delete", Value::String(String::new())),
    };

    let mut object = serde_json::Map::new();
    object.insert("$token".to_string(), Value::from(token));
    object.insert("$distinct_id".to_string(), Value::from(distinct_id));
    object.insert("$time".to_string(), Value::from(created_at.timestamp_millis()));
    object.insert(key.to_string(), value);
    Ok(Value::Object(object))
}

fn non_empty(op: &ProfileOp) -> Result<Value> {
    if op.properties.is_empty() {
        return Err(Error::Encoding(format!(
            "{} op has no properties",
            op.op.as_str()
        )));
    }
    Ok(Value::Object(op.properties.clone()))
}

fn check_values(op: &ProfileOp, expected: &str, accept: fn(&Value) -> bool) -> Result<()> {
    match op.properties.iter().find(|(_, value)| !accept(value)) {
        Some((key, _)) => Err(Error::Encoding(format!(
            "{} value for '{}' must be {}",
            op.op.as_str(),
            key,
            expected
        ))),
        None => Ok(()),
    }
}

fn check_keys(properties: &Properties) -> Result<()> {
    if properties.keys().any(|key| key.is_empty()) {
        return Err(Error::Encoding("property key is empty".to_string()));
    }
    Ok(())
}

/// Compute a content-based id the service can use to drop duplicates
///
/// Returns a 32-character hex digest of SHA-256(event name + created_at + properties).
/// A batch that is retried after an ambiguous failure keeps the same ids.
fn compute_insert_id(name: &str, created_at: &DateTime<Utc>, properties: &Properties) -> String {
    let content = serde_json::to_string(properties).unwrap_or_default();
    let hash_input = format!("{}:{}:{}", name, created_at.to_rfc3339(), content);

    let mut hasher = Sha256::new();
    hasher.update(hash_input.as_bytes());
    let result = hasher.finalize();

    // Take first 16 bytes (32 hex chars)
    hex::encode(&result[..16])
}
