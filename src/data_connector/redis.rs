//! Redis-backed coordination store.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use deadpool_redis::{Config, Connection, Pool, Runtime};
use redis::{
    streams::{StreamReadOptions, StreamReadReply},
    AsyncCommands, Script, Value,
};

use super::{CoordStore, StreamEntry};
use crate::core::error::{StoreError, StoreResult};

// Fencing scripts: the compare and the mutation must be one atomic step
// so a lock that expired and was re-acquired elsewhere is never touched.
const EXPIRE_IF_EQUALS: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

const DEL_IF_EQUALS: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

pub struct RedisCoordStore {
    pool: Pool,
    expire_if_equals: Script,
    del_if_equals: Script,
}

impl RedisCoordStore {
    pub fn new(url: &str, pool_max: usize) -> StoreResult<Self> {
        let mut cfg = Config::from_url(url);
        cfg.pool = Some(deadpool_redis::PoolConfig::new(pool_max));
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::Pool(e.to_string()))?;
        Ok(Self {
            pool,
            expire_if_equals: Script::new(EXPIRE_IF_EQUALS),
            del_if_equals: Script::new(DEL_IF_EQUALS),
        })
    }

    async fn conn(&self) -> StoreResult<Connection> {
        Ok(self.pool.get().await?)
    }
}

fn ttl_secs(ttl: Duration) -> i64 {
    ttl.as_secs().max(1) as i64
}

fn value_to_string(value: &Value) -> StoreResult<String> {
    redis::from_redis_value(value)
        .map_err(|e| StoreError::Command(format!("non-string stream field: {e}")))
}

/// XAUTOCLAIM replies are parsed by hand: `[next-id, [[id, [k, v, ...]],
/// ...], [deleted-ids]]`.
fn parse_autoclaim_reply(reply: Value) -> StoreResult<Vec<StreamEntry>> {
    let Value::Array(items) = reply else {
        return Err(StoreError::Command("unexpected XAUTOCLAIM reply".into()));
    };
    let Some(Value::Array(claimed)) = items.into_iter().nth(1) else {
        return Ok(Vec::new());
    };

    let mut entries = Vec::with_capacity(claimed.len());
    for item in claimed {
        let Value::Array(pair) = item else { continue };
        let mut pair = pair.into_iter();
        let (Some(id_value), Some(Value::Array(raw_fields))) = (pair.next(), pair.next()) else {
            continue;
        };
        let id = value_to_string(&id_value)?;
        let mut fields = Vec::with_capacity(raw_fields.len() / 2);
        let mut raw = raw_fields.into_iter();
        while let (Some(k), Some(v)) = (raw.next(), raw.next()) {
            fields.push((value_to_string(&k)?, value_to_string(&v)?));
        }
        entries.push(StreamEntry { id, fields });
    }
    Ok(entries)
}

#[async_trait]
impl CoordStore for RedisCoordStore {
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn().await?;
        Ok(conn.get(key).await?)
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let removed: u64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        Ok(conn.exists(key).await?)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        Ok(conn.expire(key, ttl_secs(ttl)).await?)
    }

    async fn expire_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let refreshed: i64 = self
            .expire_if_equals
            .key(key)
            .arg(expected)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(refreshed == 1)
    }

    async fn del_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = self
            .del_if_equals
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        conn.hset_multiple::<_, _, _, ()>(key, fields).await?;
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn().await?;
        Ok(conn.hget(key, field).await?)
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.conn().await?;
        Ok(conn.hgetall(key).await?)
    }

    async fn hash_incr(&self, key: &str, field: &str, by: i64) -> StoreResult<i64> {
        let mut conn = self.conn().await?;
        Ok(conn.hincr(key, field, by).await?)
    }

    async fn stream_add(&self, key: &str, fields: &[(String, String)]) -> StoreResult<String> {
        let mut conn = self.conn().await?;
        Ok(conn.xadd(key, "*", fields).await?)
    }

    async fn group_create(&self, key: &str, group: &str) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(key)
            .arg(group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn group_read(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> StoreResult<Vec<StreamEntry>> {
        let mut conn = self.conn().await?;
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block.as_millis() as usize);
        let reply: StreamReadReply = conn.xread_options(&[key], &[">"], &options).await?;

        let mut entries = Vec::new();
        for stream_key in reply.keys {
            for id in stream_key.ids {
                let mut fields = Vec::with_capacity(id.map.len());
                for (name, value) in &id.map {
                    fields.push((name.clone(), value_to_string(value)?));
                }
                entries.push(StreamEntry {
                    id: id.id.clone(),
                    fields,
                });
            }
        }
        Ok(entries)
    }

    async fn ack(&self, key: &str, group: &str, id: &str) -> StoreResult<u64> {
        let mut conn = self.conn().await?;
        Ok(conn.xack(key, group, &[id]).await?)
    }

    async fn autoclaim(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> StoreResult<Vec<StreamEntry>> {
        let mut conn = self.conn().await?;
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(key)
            .arg(group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;
        parse_autoclaim_reply(reply)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        conn.zadd::<_, _, _, ()>(key, member, score).await?;
        Ok(())
    }

    async fn zrevrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
        let mut conn = self.conn().await?;
        Ok(conn.zrevrange(key, start, stop).await?)
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
        let mut conn = self.conn().await?;
        Ok(conn.zrange(key, start, stop).await?)
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        conn.zrem::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn zcard(&self, key: &str) -> StoreResult<usize> {
        let mut conn = self.conn().await?;
        Ok(conn.zcard(key).await?)
    }

    async fn set_add(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        conn.sadd::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn().await?;
        Ok(conn.smembers(key).await?)
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        Ok(())
    }
}
