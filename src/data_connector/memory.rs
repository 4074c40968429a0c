//! In-memory coordination store.
//!
//! Implements the same contract as the Redis backend, including key
//! expiry, consumer-group pending lists, and idle reclamation. Used by
//! the test suite and for single-process experiments; not durable.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{CoordStore, StreamEntry};
use crate::core::error::{StoreError, StoreResult};

struct Expiring<T> {
    value: T,
    deadline: Option<Instant>,
}

impl<T> Expiring<T> {
    fn live(&self) -> bool {
        self.deadline.is_none_or(|d| Instant::now() < d)
    }
}

struct Pending {
    #[allow(dead_code)]
    consumer: String,
    delivered_at: Instant,
}

#[derive(Default)]
struct Group {
    /// Index into `MemStream::entries` of the next undelivered entry.
    cursor: usize,
    pending: HashMap<String, Pending>,
}

#[derive(Default)]
struct MemStream {
    entries: Vec<StreamEntry>,
    next_seq: u64,
    groups: HashMap<String, Group>,
}

#[derive(Default)]
struct Inner {
    strings: HashMap<String, Expiring<String>>,
    hashes: HashMap<String, Expiring<HashMap<String, String>>>,
    zsets: HashMap<String, HashMap<String, f64>>,
    sets: HashMap<String, Vec<String>>,
    streams: HashMap<String, MemStream>,
}

impl Inner {
    fn purge(&mut self) {
        self.strings.retain(|_, v| v.live());
        self.hashes.retain(|_, v| v.live());
    }
}

#[derive(Clone, Default)]
pub struct MemoryCoordStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryCoordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn deadline(ttl: Duration) -> Option<Instant> {
        Some(Instant::now() + ttl)
    }

    /// Test hook: force a key's TTL to have elapsed.
    pub fn expire_now(&self, key: &str) {
        let mut inner = self.inner.lock();
        inner.strings.remove(key);
        inner.hashes.remove(key);
    }
}

#[async_trait]
impl CoordStore for MemoryCoordStore {
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        inner.purge();
        if inner.strings.contains_key(key) {
            return Ok(false);
        }
        inner.strings.insert(
            key.to_string(),
            Expiring {
                value: value.to_string(),
                deadline: Self::deadline(ttl),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut inner = self.inner.lock();
        inner.purge();
        Ok(inner.strings.get(key).map(|v| v.value.clone()))
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        inner.purge();
        let existed = inner.strings.remove(key).is_some() | inner.hashes.remove(key).is_some();
        Ok(existed)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        inner.purge();
        Ok(inner.strings.contains_key(key) || inner.hashes.contains_key(key))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        inner.purge();
        let deadline = Self::deadline(ttl);
        if let Some(entry) = inner.strings.get_mut(key) {
            entry.deadline = deadline;
            return Ok(true);
        }
        if let Some(entry) = inner.hashes.get_mut(key) {
            entry.deadline = deadline;
            return Ok(true);
        }
        Ok(false)
    }

    async fn expire_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        inner.purge();
        match inner.strings.get_mut(key) {
            Some(entry) if entry.value == expected => {
                entry.deadline = Self::deadline(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn del_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        inner.purge();
        let matches = inner
            .strings
            .get(key)
            .is_some_and(|entry| entry.value == expected);
        if matches {
            inner.strings.remove(key);
        }
        Ok(matches)
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.purge();
        let hash = inner
            .hashes
            .entry(key.to_string())
            .or_insert_with(|| Expiring {
                value: HashMap::new(),
                deadline: None,
            });
        for (name, value) in fields {
            hash.value.insert(name.clone(), value.clone());
        }
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let mut inner = self.inner.lock();
        inner.purge();
        Ok(inner
            .hashes
            .get(key)
            .and_then(|h| h.value.get(field).cloned()))
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut inner = self.inner.lock();
        inner.purge();
        Ok(inner.hashes.get(key).map(|h| h.value.clone()).unwrap_or_default())
    }

    async fn hash_incr(&self, key: &str, field: &str, by: i64) -> StoreResult<i64> {
        let mut inner = self.inner.lock();
        inner.purge();
        let hash = inner
            .hashes
            .entry(key.to_string())
            .or_insert_with(|| Expiring {
                value: HashMap::new(),
                deadline: None,
            });
        let current = match hash.value.get(field) {
            Some(raw) => raw.parse::<i64>().map_err(|_| StoreError::Malformed {
                key: key.to_string(),
                message: format!("field '{field}' is not an integer"),
            })?,
            None => 0,
        };
        let updated = current + by;
        hash.value.insert(field.to_string(), updated.to_string());
        Ok(updated)
    }

    async fn stream_add(&self, key: &str, fields: &[(String, String)]) -> StoreResult<String> {
        let mut inner = self.inner.lock();
        let stream = inner.streams.entry(key.to_string()).or_default();
        stream.next_seq += 1;
        let id = format!("{}-0", stream.next_seq);
        stream.entries.push(StreamEntry {
            id: id.clone(),
            fields: fields.to_vec(),
        });
        Ok(id)
    }

    async fn group_create(&self, key: &str, group: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let stream = inner.streams.entry(key.to_string()).or_default();
        let tail = stream.entries.len();
        stream.groups.entry(group.to_string()).or_insert(Group {
            cursor: tail,
            pending: HashMap::new(),
        });
        Ok(())
    }

    async fn group_read(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> StoreResult<Vec<StreamEntry>> {
        let deadline = Instant::now() + block;
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(stream) = inner.streams.get_mut(key) {
                    let entries_len = stream.entries.len();
                    if let Some(grp) = stream.groups.get_mut(group) {
                        if grp.cursor < entries_len {
                            let take = (entries_len - grp.cursor).min(count.max(1));
                            let mut out = Vec::with_capacity(take);
                            for _ in 0..take {
                                let entry = stream.entries[grp.cursor].clone();
                                grp.pending.insert(
                                    entry.id.clone(),
                                    Pending {
                                        consumer: consumer.to_string(),
                                        delivered_at: Instant::now(),
                                    },
                                );
                                grp.cursor += 1;
                                out.push(entry);
                            }
                            return Ok(out);
                        }
                    } else {
                        return Err(StoreError::Command(format!(
                            "NOGROUP no such consumer group '{group}'"
                        )));
                    }
                }
            }
            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn ack(&self, key: &str, group: &str, id: &str) -> StoreResult<u64> {
        let mut inner = self.inner.lock();
        let removed = inner
            .streams
            .get_mut(key)
            .and_then(|s| s.groups.get_mut(group))
            .map(|g| g.pending.remove(id).is_some())
            .unwrap_or(false);
        Ok(u64::from(removed))
    }

    async fn autoclaim(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> StoreResult<Vec<StreamEntry>> {
        let mut inner = self.inner.lock();
        let Some(stream) = inner.streams.get_mut(key) else {
            return Ok(Vec::new());
        };
        let Some(grp) = stream.groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        let now = Instant::now();
        let mut stale: Vec<String> = grp
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.delivered_at) >= min_idle)
            .map(|(id, _)| id.clone())
            .collect();
        stale.sort();
        stale.truncate(count.max(1));

        let mut claimed = Vec::with_capacity(stale.len());
        for id in stale {
            if let Some(pending) = grp.pending.get_mut(&id) {
                pending.consumer = consumer.to_string();
                pending.delivered_at = now;
            }
            if let Some(entry) = stream.entries.iter().find(|e| e.id == id) {
                claimed.push(entry.clone());
            }
        }
        Ok(claimed)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrevrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
        let inner = self.inner.lock();
        let mut members: Vec<(String, f64)> = inner
            .zsets
            .get(key)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), *v)).collect())
            .unwrap_or_default();
        members.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
        Ok(slice_range(members, start, stop))
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
        let inner = self.inner.lock();
        let mut members: Vec<(String, f64)> = inner
            .zsets
            .get(key)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), *v)).collect())
            .unwrap_or_default();
        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(slice_range(members, start, stop))
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if let Some(zset) = inner.zsets.get_mut(key) {
            zset.remove(member);
        }
        Ok(())
    }

    async fn zcard(&self, key: &str) -> StoreResult<usize> {
        let inner = self.inner.lock();
        Ok(inner.zsets.get(key).map(|m| m.len()).unwrap_or(0))
    }

    async fn set_add(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let set = inner.sets.entry(key.to_string()).or_default();
        if !set.iter().any(|m| m == member) {
            set.push(member.to_string());
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        let inner = self.inner.lock();
        Ok(inner.sets.get(key).cloned().unwrap_or_default())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Redis-style inclusive index range with negative-from-end semantics.
fn slice_range(members: Vec<(String, f64)>, start: isize, stop: isize) -> Vec<String> {
    let len = members.len() as isize;
    let clamp = |idx: isize| -> isize {
        if idx < 0 {
            (len + idx).max(0)
        } else {
            idx.min(len)
        }
    };
    let from = clamp(start);
    let to = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || from > to {
        return Vec::new();
    }
    members[from as usize..=(to.max(0) as usize).min(members.len() - 1)]
        .iter()
        .map(|(m, _)| m.clone())
        .collect()
}
