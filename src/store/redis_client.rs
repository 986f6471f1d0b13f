//! Redis implementation of the key/value client

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::keyvalue::KeyValueClient;
use crate::error::{StoreError, StoreResult};

/// Redis connection shared by all requests
#[derive(Clone)]
pub struct RedisClient {
    connection: ConnectionManager,
}

impl RedisClient {
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url).map_err(backend)?;
        let connection = client.get_connection_manager().await.map_err(backend)?;
        tracing::info!("Connected to Redis at {}", url);
        Ok(Self { connection })
    }
}

fn backend(err: redis::RedisError) -> StoreError {
    StoreError::Backend(format!("Redis error: {}", err))
}

fn seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl KeyValueClient for RedisClient {
    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut con = self.connection.clone();
        con.exists(key).await.map_err(backend)
    }

    async fn set_new(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<bool> {
        let mut con = self.connection.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(seconds(ttl))
            .query_async(&mut con)
            .await
            .map_err(backend)?;
        Ok(reply.is_some())
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        let mut con = self.connection.clone();
        con.set_ex(key, value, seconds(ttl)).await.map_err(backend)
    }

    async fn append(&self, key: &str, value: &[u8]) -> StoreResult<u64> {
        let mut con = self.connection.clone();
        con.append(key, value).await.map_err(backend)
    }

    async fn len(&self, key: &str) -> StoreResult<u64> {
        let mut con = self.connection.clone();
        con.strlen(key).await.map_err(backend)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let mut con = self.connection.clone();
        con.expire(key, seconds(ttl) as i64).await.map_err(backend)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>> {
        let mut con = self.connection.clone();
        let value: Option<Vec<u8>> = con.get(key).await.map_err(backend)?;
        Ok(value.map(Bytes::from))
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut con = self.connection.clone();
        con.del(key).await.map_err(backend)
    }
}
