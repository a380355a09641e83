use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use redis::{AsyncCommands, Client, aio::MultiplexedConnection};
use tracing::info;
use uuid::Uuid;

use crate::{models::template::Template, store::TemplateCache};

pub struct RedisTemplateCache {
    connection: MultiplexedConnection,
    ttl_seconds: u64,
}

impl RedisTemplateCache {
    pub async fn connect(redis_url: &str, ttl_seconds: u64) -> Result<Self, Error> {
        info!("Connecting to Redis");

        let client =
            Client::open(redis_url).map_err(|e| anyhow!("Failed to create redis client: {}", e))?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| anyhow!("Failed to connect to redis: {}", e))?;

        info!("Redis connection established");

        Ok(Self {
            connection,
            ttl_seconds: ttl_seconds.max(1),
        })
    }
}

fn cache_key(id: Uuid) -> String {
    format!("template:{}", id)
}

#[async_trait]
impl TemplateCache for RedisTemplateCache {
    async fn get(&self, id: Uuid) -> Result<Option<Template>, Error> {
        let mut connection = self.connection.clone();

        let cached: Option<String> = connection
            .get(cache_key(id))
            .await
            .map_err(|e| anyhow!("Failed to read cached template: {}", e))?;

        cached
            .map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(|e| anyhow!("Corrupt cached template {}: {}", id, e))
    }

    async fn put(&self, template: &Template) -> Result<(), Error> {
        let mut connection = self.connection.clone();
        let json = serde_json::to_string(template)?;

        connection
            .set_ex::<_, _, ()>(cache_key(template.id), json, self.ttl_seconds)
            .await
            .map_err(|e| anyhow!("Failed to cache template: {}", e))
    }

    async fn invalidate(&self, id: Uuid) -> Result<(), Error> {
        let mut connection = self.connection.clone();

        connection
            .del::<_, ()>(cache_key(id))
            .await
            .map_err(|e| anyhow!("Failed to invalidate cached template: {}", e))
    }
}
