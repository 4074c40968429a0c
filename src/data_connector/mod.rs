//! Coordination store access.
//!
//! The pipeline talks to its coordination store through the
//! [`CoordStore`] trait: a typed surface over the key-value, hash,
//! stream, and sorted-set primitives the key layout in
//! [`crate::core::keys`] relies on. Two backends exist: Redis for
//! production and an in-memory store for tests.

mod memory;
mod redis;

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;

use crate::core::error::StoreResult;

pub use memory::MemoryCoordStore;
pub use redis::RedisCoordStore;

/// One stream entry: id plus flat field pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: Vec<(String, String)>,
}

#[async_trait]
pub trait CoordStore: Send + Sync {
    /// `SET key value NX EX ttl`. Returns true when the key was set.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Returns true when the key existed.
    async fn del(&self, key: &str) -> StoreResult<bool>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Extend the TTL only while the stored value still equals
    /// `expected`. The comparison and the expire are one atomic step.
    async fn expire_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> StoreResult<bool>;

    /// Compare-and-delete: remove the key only while its value equals
    /// `expected`.
    async fn del_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool>;

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()>;

    async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>>;

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    async fn hash_incr(&self, key: &str, field: &str, by: i64) -> StoreResult<i64>;

    /// `XADD key * fields...`; returns the generated entry id.
    async fn stream_add(&self, key: &str, fields: &[(String, String)]) -> StoreResult<String>;

    /// Idempotently create `group` on `key` at the stream tail,
    /// creating the stream when absent.
    async fn group_create(&self, key: &str, group: &str) -> StoreResult<()>;

    /// Blocking consumer-group read of new entries.
    async fn group_read(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> StoreResult<Vec<StreamEntry>>;

    async fn ack(&self, key: &str, group: &str, id: &str) -> StoreResult<u64>;

    /// Claim pending entries idle longer than `min_idle` onto
    /// `consumer`.
    async fn autoclaim(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> StoreResult<Vec<StreamEntry>>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()>;

    /// Members ordered by descending score, inclusive index range.
    async fn zrevrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>>;

    /// Members ordered by ascending score, inclusive index range.
    async fn zrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>>;

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<()>;

    async fn zcard(&self, key: &str) -> StoreResult<usize>;

    /// Set membership helpers for the model-key index.
    async fn set_add(&self, key: &str, member: &str) -> StoreResult<()>;

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Liveness probe used at worker startup.
    async fn ping(&self) -> StoreResult<()>;
}
