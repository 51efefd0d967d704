//! The cache handler: a persistent, content-addressed store.
//!
//! Keys are serialized to canonical JSON and addressed by their blake3 digest; values are
//! DEFLATE-compressed JSON with an optional expiry. Writes are atomic per key (sled), and
//! program-visible access is serialized through a single handler-owned semaphore.

use std::{
    io::{Read, Write},
    path::PathBuf,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use doeff_core::{
    effects, CacheOp, CachePolicy, DoExpr, Effect, Exception, ExceptionKind, InternalEffect, Value,
};
use flate2::{read::DeflateDecoder, write::DeflateEncoder, Compression};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    errors::ExecutionError,
    interpreter::{dispatch::EffectAction, Interpreter, StepFlow},
};

const CACHE_SEMAPHORE: &str = "__cache__";

// CACHE STORAGE
// ================================================================================================

/// The on-disk cache backend. Shared by every task of a run, including pooled workers.
#[derive(Debug)]
pub(crate) struct CacheStorage {
    db: sled::Db,
}

impl CacheStorage {
    pub fn open(path: Option<&PathBuf>) -> Result<Self, Exception> {
        let path = match path {
            Some(path) => path.clone(),
            None => std::env::temp_dir().join("doeff_cache.sled"),
        };
        let db = sled::open(&path).map_err(|error| {
            Exception::other("CacheError", format!("cannot open cache at {}: {error}", path.display()))
        })?;
        debug!(path = %path.display(), "opened persistent cache");
        Ok(Self { db })
    }

    pub fn get(&self, key: &Value) -> Result<Option<Value>, Exception> {
        let digest = content_address(key)?;
        let Some(raw) = self
            .db
            .get(digest.as_bytes())
            .map_err(|error| Exception::other("CacheError", error.to_string()))?
        else {
            return Ok(None);
        };
        let entry = decode_entry(&raw)?;
        if let Some(expires_at) = entry.expires_at {
            if now_millis() > expires_at {
                let _ = self.db.remove(digest.as_bytes());
                return Ok(None);
            }
        }
        json_to_value(&entry.value).map(Some)
    }

    pub fn put(&self, key: &Value, value: &Value, policy: CachePolicy) -> Result<(), Exception> {
        let digest = content_address(key)?;
        let expires_at = policy.ttl.map(|ttl| now_millis() + as_millis(ttl));
        let raw = encode_entry(value, expires_at)?;
        self.db
            .insert(digest.as_bytes(), raw)
            .map_err(|error| Exception::other("CacheError", error.to_string()))?;
        self.db
            .flush()
            .map_err(|error| Exception::other("CacheError", error.to_string()))?;
        Ok(())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

fn as_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

fn content_address(key: &Value) -> Result<blake3::Hash, Exception> {
    let json = value_to_json(key)?;
    let canonical = serde_json::to_vec(&json)
        .map_err(|error| Exception::other("CacheError", error.to_string()))?;
    Ok(blake3::hash(&canonical))
}

// ENTRY ENCODING
// ================================================================================================

/// The on-disk shape of one cache slot: the expiry timestamp plus the JSON-encoded value.
#[derive(Deserialize, Serialize)]
struct CacheEntry {
    expires_at: Option<u64>,
    value: serde_json::Value,
}

fn encode_entry(value: &Value, expires_at: Option<u64>) -> Result<Vec<u8>, Exception> {
    let entry = CacheEntry { expires_at, value: value_to_json(value)? };
    let plain = serde_json::to_vec(&entry)
        .map_err(|error| Exception::other("CacheError", error.to_string()))?;
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&plain)
        .and_then(|_| encoder.finish())
        .map_err(|error| Exception::other("CacheError", error.to_string()))
}

fn decode_entry(raw: &[u8]) -> Result<CacheEntry, Exception> {
    let mut plain = Vec::new();
    DeflateDecoder::new(raw)
        .read_to_end(&mut plain)
        .map_err(|error| Exception::other("CacheError", error.to_string()))?;
    serde_json::from_slice(&plain)
        .map_err(|error| Exception::other("CacheError", error.to_string()))
}

// VALUE ENCODING
// ================================================================================================

/// Converts a cacheable value to JSON. Programs, continuations, tasks, promises, frames and
/// opaque host objects are not cacheable.
pub(crate) fn value_to_json(value: &Value) -> Result<serde_json::Value, Exception> {
    Ok(match value {
        Value::Unit => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(n) => serde_json::Value::from(*n),
        Value::Float(x) => serde_json::Number::from_f64(*x)
            .map(serde_json::Value::Number)
            .ok_or_else(|| Exception::value_error("non-finite float is not cacheable"))?,
        Value::Str(s) => serde_json::Value::from(s.as_ref()),
        Value::List(items) => serde_json::Value::Array(
            items.iter().map(value_to_json).collect::<Result<_, _>>()?,
        ),
        Value::Map(entries) => serde_json::Value::Object(
            entries
                .iter()
                .map(|(key, value)| Ok((key.clone(), value_to_json(value)?)))
                .collect::<Result<_, Exception>>()?,
        ),
        Value::Ok(inner) => serde_json::json!({ "$ok": value_to_json(inner)? }),
        Value::Err(error) => serde_json::json!({
            "$err": { "kind": error.kind.to_string(), "message": error.message.as_ref() }
        }),
        other => {
            return Err(Exception::type_error(format!(
                "{} values are not cacheable",
                other.type_name(),
            )));
        },
    })
}

pub(crate) fn json_to_value(json: &serde_json::Value) -> Result<Value, Exception> {
    Ok(match json {
        serde_json::Value::Null => Value::Unit,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(s) => Value::str(s),
        serde_json::Value::Array(items) => {
            Value::list(items.iter().map(json_to_value).collect::<Result<Vec<_>, _>>()?)
        },
        serde_json::Value::Object(entries) => {
            if let Some(ok) = entries.get("$ok") {
                if entries.len() == 1 {
                    return Ok(Value::ok(json_to_value(ok)?));
                }
            }
            if let Some(err) = entries.get("$err") {
                if entries.len() == 1 {
                    let kind = err.get("kind").and_then(serde_json::Value::as_str).unwrap_or("Error");
                    let message =
                        err.get("message").and_then(serde_json::Value::as_str).unwrap_or("");
                    return Ok(Value::err(Exception::new(
                        ExceptionKind::Other(kind.into()),
                        message,
                    )));
                }
            }
            Value::map(
                entries
                    .iter()
                    .map(|(key, value)| Ok((key.clone(), json_to_value(value)?)))
                    .collect::<Result<Vec<_>, Exception>>()?,
            )
        },
    })
}

// HANDLER
// ================================================================================================

impl Interpreter {
    pub(crate) fn handle_cache_effect(
        &mut self,
        effect: &Effect,
    ) -> Result<EffectAction, ExecutionError> {
        let op = match effect {
            Effect::CacheGet { key } => CacheOp::Get { key: key.clone() },
            Effect::CachePut { key, value, policy } => CacheOp::Put {
                key: key.clone(),
                value: value.clone(),
                policy: *policy,
            },
            _ => return Ok(EffectAction::Pass),
        };
        self.semaphores.create(CACHE_SEMAPHORE, 1);
        Ok(EffectAction::Program(
            effects::acquire_semaphore(CACHE_SEMAPHORE).then(DoExpr::Perform(Effect::Internal(
                InternalEffect::CacheApply { op },
            ))),
        ))
    }

    /// Performs the storage operation while the cache semaphore is held, then releases it.
    pub(crate) fn handle_cache_apply(&mut self, op: CacheOp) -> Result<StepFlow, ExecutionError> {
        let outcome = self.ensure_cache().and_then(|storage| match &op {
            CacheOp::Get { key } => match storage.get(key)? {
                Some(value) => Ok(value),
                None => Err(Exception::new(ExceptionKind::Key, "cache miss")),
            },
            CacheOp::Put { key, value, policy } => {
                storage.put(key, value, *policy)?;
                Ok(Value::Unit)
            },
        });
        self.release_semaphore_and_wake(CACHE_SEMAPHORE).map_err(|error| {
            ExecutionError::invariant(format!("cache semaphore vanished during release: {error}"))
        })?;
        match outcome {
            Ok(value) => self.set_value(value),
            Err(exception) => self.set_error(exception),
        }
        Ok(StepFlow::Continue)
    }

    fn ensure_cache(&mut self) -> Result<Arc<CacheStorage>, Exception> {
        if let Some(storage) = &self.cache {
            return Ok(storage.clone());
        }
        let storage = Arc::new(CacheStorage::open(self.options().cache_db_path())?);
        self.cache = Some(storage.clone());
        Ok(storage)
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn json_round_trip_preserves_structure() {
        let value = Value::map([
            ("xs".to_string(), Value::list([Value::Int(1), Value::str("two")])),
            ("ok".to_string(), Value::ok(Value::Bool(true))),
        ]);
        let json = value_to_json(&value).unwrap();
        assert_eq!(json_to_value(&json).unwrap(), value);
    }

    #[test]
    fn opaque_values_are_not_cacheable() {
        let value = Value::opaque("handle", 3_u8);
        assert!(value_to_json(&value).is_err());
    }

    #[test]
    fn content_addresses_are_stable() {
        let key = Value::list([Value::str("model"), Value::Int(7)]);
        assert_eq!(content_address(&key).unwrap(), content_address(&key).unwrap());
        let other = Value::list([Value::str("model"), Value::Int(8)]);
        assert_ne!(content_address(&key).unwrap(), content_address(&other).unwrap());
    }
}
