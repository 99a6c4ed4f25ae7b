use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;
use ulid::Ulid;

use crate::model::{IdempotencyRecord, IdempotencyStamp, Ms};

use super::SchedulingError;

/// Canonical JSON: object keys sorted, no insignificant whitespace.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        Value::Object(map) => {
            let sorted: BTreeMap<&String, String> =
                map.iter().map(|(k, v)| (k, canonical_json(v))).collect();
            let items: Vec<String> = sorted
                .into_iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), v))
                .collect();
            format!("{{{}}}", items.join(","))
        }
        scalar => scalar.to_string(),
    }
}

/// SHA-256 (hex) of the canonical JSON form of a normalized request.
pub fn fingerprint<T: Serialize>(request: &T) -> Result<String, SchedulingError> {
    let value = serde_json::to_value(request)
        .map_err(|e| SchedulingError::Internal(format!("fingerprint: {e}")))?;
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(&value).as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

struct Slot {
    fingerprint: String,
    created_at: Ms,
    expires_at: Ms,
    result: OnceCell<Ulid>,
}

/// Result of a guarded execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Guarded {
    pub booking_id: Ulid,
    /// The stored result was returned; the operation did not run.
    pub replayed: bool,
}

/// Deduplicates create requests by `(tenant, key)`.
///
/// The slot (with its fingerprint) is reserved before the operation runs.
/// Concurrent callers with the same fingerprint wait on the same cell and
/// receive the first successful result. A failed operation leaves no
/// record behind, so the key can be retried.
pub struct IdempotencyGuard {
    slots: DashMap<(Ulid, String), Arc<Slot>>,
    ttl_ms: Ms,
    capacity: usize,
}

impl IdempotencyGuard {
    pub fn new(ttl_ms: Ms, capacity: usize) -> Self {
        Self {
            slots: DashMap::new(),
            ttl_ms,
            capacity,
        }
    }

    pub fn ttl_ms(&self) -> Ms {
        self.ttl_ms
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub async fn execute<F, Fut>(
        &self,
        tenant_id: Ulid,
        key: &str,
        fingerprint: &str,
        now: Ms,
        f: F,
    ) -> Result<Guarded, SchedulingError>
    where
        F: FnOnce(IdempotencyStamp) -> Fut,
        Fut: Future<Output = Result<Ulid, SchedulingError>>,
    {
        let map_key = (tenant_id, key.to_string());

        // Never call len()/retain() while holding an entry guard: both lock every shard.
        if !self.slots.contains_key(&map_key) && self.slots.len() >= self.capacity {
            self.purge_expired(now);
            if self.slots.len() >= self.capacity {
                return Err(SchedulingError::LimitExceeded("idempotency table full"));
            }
        }

        let fresh = || {
            Arc::new(Slot {
                fingerprint: fingerprint.to_string(),
                created_at: now,
                expires_at: now.saturating_add(self.ttl_ms),
                result: OnceCell::new(),
            })
        };
        let slot = match self.slots.entry(map_key.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at <= now {
                    occupied.insert(fresh());
                }
                occupied.get().clone()
            }
            Entry::Vacant(vacant) => vacant.insert(fresh()).clone(),
        };

        if slot.fingerprint != fingerprint {
            return Err(SchedulingError::IdempotencyKeyReuse(key.to_string()));
        }

        let stamp = IdempotencyStamp {
            key: key.to_string(),
            fingerprint: slot.fingerprint.clone(),
            expires_at: slot.expires_at,
        };
        let mut ran = false;
        let outcome = slot
            .result
            .get_or_try_init(|| {
                ran = true;
                f(stamp)
            })
            .await;

        match outcome {
            Ok(booking_id) => {
                // A failed earlier attempt may have dropped the slot from the map.
                self.slots.entry(map_key).or_insert_with(|| slot.clone());
                Ok(Guarded {
                    booking_id: *booking_id,
                    replayed: !ran,
                })
            }
            Err(e) => {
                self.slots.remove_if(&map_key, |_, current| {
                    Arc::ptr_eq(current, &slot) && current.result.get().is_none()
                });
                Err(e)
            }
        }
    }

    /// Re-install a completed record (WAL replay). Expired records are skipped.
    pub fn restore(&self, record: IdempotencyRecord, now: Ms) {
        if record.expires_at <= now {
            return;
        }
        self.slots.insert(
            (record.tenant_id, record.key),
            Arc::new(Slot {
                fingerprint: record.request_fingerprint,
                created_at: record.created_at,
                expires_at: record.expires_at,
                result: OnceCell::new_with(Some(record.result_booking_id)),
            }),
        );
    }

    /// The completed, unexpired record for a key.
    pub fn record(&self, tenant_id: Ulid, key: &str, now: Ms) -> Option<IdempotencyRecord> {
        let slot = self.slots.get(&(tenant_id, key.to_string()))?;
        let booking_id = *slot.result.get()?;
        (slot.expires_at > now).then(|| IdempotencyRecord {
            key: key.to_string(),
            tenant_id,
            request_fingerprint: slot.fingerprint.clone(),
            result_booking_id: booking_id,
            created_at: slot.created_at,
            expires_at: slot.expires_at,
        })
    }

    /// Drop expired records. In-flight slots are never expired by this.
    pub fn purge_expired(&self, now: Ms) -> usize {
        let before = self.slots.len();
        self.slots
            .retain(|_, slot| slot.expires_at > now || slot.result.get().is_none());
        before.saturating_sub(self.slots.len())
    }
}
