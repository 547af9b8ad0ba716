use std::collections::{BTreeSet, HashMap};
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::BoxFuture;
use redis::{ErrorKind, RedisError};
use tokio::time::Instant;

use crate::cluster::key_slot;
use crate::error::{TrackerError, TrackerResult};
use crate::store::{KeyRead, KvStore, StoredValue};

/// In-process store with TTL expiry on the tokio clock.
///
/// Used by the test suite and for local dry runs. Keys matching an injected
/// stall pattern never answer; keys matching a failure pattern, or hashing
/// into a failed slot range, error out.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    values: HashMap<String, (String, Option<Instant>)>,
    sets: HashMap<String, BTreeSet<String>>,
    stalls: Vec<String>,
    failures: Vec<String>,
    failed_slots: Vec<RangeInclusive<u16>>,
}

enum Fault {
    Stall,
    Fail,
}

impl MemoryState {
    fn is_stalled(&self, key: &str) -> bool {
        self.stalls.iter().any(|p| key.contains(p.as_str()))
    }

    fn is_failing(&self, key: &str) -> bool {
        self.failures.iter().any(|p| key.contains(p.as_str()))
            || self.failed_slots.iter().any(|r| r.contains(&key_slot(key)))
    }

    fn fault_for<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> Option<Fault> {
        for key in keys {
            if self.is_stalled(key) {
                return Some(Fault::Stall);
            }
            if self.is_failing(key) {
                return Some(Fault::Fail);
            }
        }
        None
    }

    fn live_value(&mut self, key: &str, now: Instant) -> Option<StoredValue> {
        let expires_at = self.values.get(key)?.1;
        let ttl_ms = match expires_at {
            None => -1,
            Some(at) => {
                let remaining = at.saturating_duration_since(now).as_millis() as i64;
                if remaining <= 0 {
                    self.values.remove(key);
                    return None;
                }
                remaining
            }
        };
        let value = self.values.get(key)?.0.clone();
        Some(StoredValue { value, ttl_ms })
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every operation touching a key that contains `pattern` hang.
    pub fn stall_keys_matching(&self, pattern: &str) {
        self.state().stalls.push(pattern.to_string());
    }

    /// Make every operation touching a key that contains `pattern` fail.
    pub fn fail_keys_matching(&self, pattern: &str) {
        self.state().failures.push(pattern.to_string());
    }

    /// Make every key whose cluster slot falls in `slots` fail, as if the
    /// node owning them were down.
    pub fn fail_slots(&self, slots: RangeInclusive<u16>) {
        self.state().failed_slots.push(slots);
    }

    pub fn clear_faults(&self) {
        let mut state = self.state();
        state.stalls.clear();
        state.failures.clear();
        state.failed_slots.clear();
    }

    /// Write a value directly; `None` stores it without expiry.
    pub fn insert_raw(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.state()
            .values
            .insert(key.to_string(), (value.to_string(), expires_at));
    }

    pub fn contains_key(&self, key: &str) -> bool {
        let now = Instant::now();
        self.state().live_value(key, now).is_some()
    }

    /// Run `op` against the state unless a fault pattern matches one of `keys`.
    fn guarded<T: Send + 'static>(
        &self,
        keys: Vec<String>,
        op: impl FnOnce(&mut MemoryState) -> T + Send + 'static,
    ) -> BoxFuture<'static, TrackerResult<T>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let fault = {
                let state = inner.lock().unwrap_or_else(|p| p.into_inner());
                state.fault_for(keys.iter().map(String::as_str))
            };
            match fault {
                Some(Fault::Stall) => std::future::pending().await,
                Some(Fault::Fail) => Err(injected_failure(&keys.join(" "))),
                None => {
                    let mut state = inner.lock().unwrap_or_else(|p| p.into_inner());
                    Ok(op(&mut state))
                }
            }
        })
    }
}

fn injected_failure(keys: &str) -> TrackerError {
    TrackerError::Redis(RedisError::from((
        ErrorKind::IoError,
        "injected failure",
        keys.to_string(),
    )))
}

impl KvStore for MemoryStore {
    fn put_with_ttl(
        &self,
        key: String,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'static, TrackerResult<()>> {
        self.guarded(vec![key.clone()], move |state| {
            state
                .values
                .insert(key, (value, Some(Instant::now() + ttl)));
        })
    }

    fn fetch_with_ttl(&self, keys: Vec<String>) -> BoxFuture<'static, TrackerResult<Vec<KeyRead>>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let stalled = {
                let state = inner.lock().unwrap_or_else(|p| p.into_inner());
                keys.iter().any(|k| state.is_stalled(k))
            };
            if stalled {
                std::future::pending::<()>().await;
            }
            let mut state = inner.lock().unwrap_or_else(|p| p.into_inner());
            let now = Instant::now();
            Ok(keys
                .iter()
                .map(|k| {
                    if state.is_failing(k) {
                        Err(injected_failure(k))
                    } else {
                        Ok(state.live_value(k, now))
                    }
                })
                .collect())
        })
    }

    fn delete(&self, key: String) -> BoxFuture<'static, TrackerResult<bool>> {
        self.guarded(vec![key.clone()], move |state| {
            let now = Instant::now();
            let live = state.live_value(&key, now).is_some();
            state.values.remove(&key);
            live
        })
    }

    fn set_add(&self, set: String, member: String) -> BoxFuture<'static, TrackerResult<bool>> {
        self.guarded(vec![set.clone()], move |state| {
            state.sets.entry(set).or_default().insert(member)
        })
    }

    fn set_members(&self, set: String) -> BoxFuture<'static, TrackerResult<Vec<String>>> {
        self.guarded(vec![set.clone()], move |state| {
            state
                .sets
                .get(&set)
                .map(|members| members.iter().cloned().collect())
                .unwrap_or_default()
        })
    }

    fn set_remove(
        &self,
        set: String,
        members: Vec<String>,
    ) -> BoxFuture<'static, TrackerResult<usize>> {
        self.guarded(vec![set.clone()], move |state| {
            let Some(existing) = state.sets.get_mut(&set) else {
                return 0;
            };
            let removed = members.iter().filter(|m| existing.remove(*m)).count();
            if existing.is_empty() {
                state.sets.remove(&set);
            }
            removed
        })
    }
}
