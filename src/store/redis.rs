//! Redis-backed `QueueStore`.
//!
//! Pending orderings are sorted sets, active sets are Redis sets, history is
//! a capped list and records are plain strings with a PX expiry. `ZREM`
//! returns the removed count, which is what makes claims safe across
//! processes. `SET NX` keeps a task id from being submitted twice.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use secrecy::{ExposeSecret, SecretString};

use crate::error::StoreError;
use crate::store::traits::QueueStore;

/// Keys fetched per SCAN round trip.
const SCAN_COUNT: usize = 200;

/// Shared store on top of a multiplexed, auto-reconnecting connection.
#[derive(Clone)]
pub struct RedisStore {
    con: ConnectionManager,
}

impl RedisStore {
    /// Connect to the Redis server at `url`.
    pub async fn connect(url: &SecretString) -> Result<Self, StoreError> {
        let client = redis::Client::open(url.expose_secret())
            .map_err(|e| StoreError::Connection(format!("invalid Redis URL: {e}")))?;
        let con = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        tracing::info!("Connected to Redis queue store");
        Ok(Self { con })
    }

    fn con(&self) -> ConnectionManager {
        self.con.clone()
    }
}

fn cmd_err(command: &str) -> impl FnOnce(redis::RedisError) -> StoreError + '_ {
    move |e| StoreError::command(command, e)
}

#[async_trait]
impl QueueStore for RedisStore {
    async fn add_pending(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let mut con = self.con();
        let _: i64 = con.zadd(key, member, score).await.map_err(cmd_err("ZADD"))?;
        Ok(())
    }

    async fn lowest_pending(&self, key: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut con = self.con();
        con.zrange(key, 0, limit as isize - 1)
            .await
            .map_err(cmd_err("ZRANGE"))
    }

    async fn remove_pending(&self, key: &str, member: &str) -> Result<u64, StoreError> {
        let mut con = self.con();
        con.zrem(key, member).await.map_err(cmd_err("ZREM"))
    }

    async fn pending_len(&self, key: &str) -> Result<usize, StoreError> {
        let mut con = self.con();
        con.zcard(key).await.map_err(cmd_err("ZCARD"))
    }

    async fn add_active(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut con = self.con();
        let _: i64 = con.sadd(key, member).await.map_err(cmd_err("SADD"))?;
        Ok(())
    }

    async fn remove_active(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut con = self.con();
        let removed: i64 = con.srem(key, member).await.map_err(cmd_err("SREM"))?;
        Ok(removed > 0)
    }

    async fn active_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut con = self.con();
        con.smembers(key).await.map_err(cmd_err("SMEMBERS"))
    }

    async fn push_history(&self, key: &str, member: &str, cap: usize) -> Result<(), StoreError> {
        let mut con = self.con();
        let _: i64 = con.lpush(key, member).await.map_err(cmd_err("LPUSH"))?;
        if cap == 0 {
            let _: () = con.del(key).await.map_err(cmd_err("DEL"))?;
        } else {
            let _: () = con
                .ltrim(key, 0, cap as isize - 1)
                .await
                .map_err(cmd_err("LTRIM"))?;
        }
        Ok(())
    }

    async fn history(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut con = self.con();
        con.lrange(key, 0, -1).await.map_err(cmd_err("LRANGE"))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut con = self.con();
        con.get(key).await.map_err(cmd_err("GET"))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut con = self.con();
        let millis = (ttl.as_millis() as u64).max(1);
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(millis)
            .query_async(&mut con)
            .await
            .map_err(cmd_err("SET"))?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut con = self.con();
        let millis = (ttl.as_millis() as u64).max(1);
        // SET NX replies OK on write and nil when the key already exists.
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis)
            .query_async(&mut con)
            .await
            .map_err(cmd_err("SET NX"))?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut con = self.con();
        let _: () = con.del(key).await.map_err(cmd_err("DEL"))?;
        Ok(())
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut con = self.con();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut con)
                .await
                .map_err(cmd_err("SCAN"))?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, StoreError> {
        let mut con = self.con();
        con.publish(channel, payload).await.map_err(cmd_err("PUBLISH"))
    }
}
