//! Redis 服务注册发现实现
//!
//! Redis 没有租约原语：注册时写入带过期时间的 key（服务 ID -> 地址），
//! 再由后台任务在过期前重写。续期任务停止后，key 在一个 TTL 内自然过期。

use anyhow::anyhow;
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::renewal::{RenewalTask, Renewer};
use super::{Registration, ServiceRegistry};
use crate::config::RedisConfig;
use crate::error::{DiscoverError, Result, with_timeout};
use crate::identity::{name_prefix_of, new_service_id, validate_service_name};
use crate::types::ServiceAddress;

const BACKEND: &str = "redis";

/// 注册发现用到的 Redis 命令
#[async_trait]
pub trait TtlCache: Send + Sync + 'static {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()>;
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn del(&self, key: &str) -> anyhow::Result<()>;
    async fn keys(&self, pattern: &str) -> anyhow::Result<Vec<String>>;
}

#[async_trait]
impl TtlCache for ConnectionManager {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        let mut conn = self.clone();
        AsyncCommands::set_ex::<_, _, ()>(&mut conn, key, value, ttl.as_secs().max(1))
            .await
            .map_err(|err| anyhow!("failed to write redis key: {err}"))
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut conn = self.clone();
        AsyncCommands::get(&mut conn, key)
            .await
            .map_err(|err| anyhow!("failed to read redis key: {err}"))
    }

    async fn del(&self, key: &str) -> anyhow::Result<()> {
        let mut conn = self.clone();
        AsyncCommands::del::<_, ()>(&mut conn, key)
            .await
            .map_err(|err| anyhow!("failed to delete redis key: {err}"))
    }

    async fn keys(&self, pattern: &str) -> anyhow::Result<Vec<String>> {
        let mut conn = self.clone();
        AsyncCommands::keys(&mut conn, pattern)
            .await
            .map_err(|err| anyhow!("failed to list redis keys: {err}"))
    }
}

/// 转义 glob 元字符，使前缀按字面匹配
fn escape_pattern(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\' | '^') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('*');
    escaped
}

/// 定时重写 key 的续期器
struct KeyRefresher<C> {
    cache: Arc<C>,
    key: String,
    value: String,
    ttl: Duration,
    timeout: Duration,
}

#[async_trait]
impl<C: TtlCache> Renewer for KeyRefresher<C> {
    async fn renew(&mut self) -> anyhow::Result<()> {
        tokio::time::timeout(self.timeout, self.cache.set_ex(&self.key, &self.value, self.ttl))
            .await
            .map_err(|_| anyhow!("key refresh timed out"))??;
        debug!(service_id = %self.key, "Registration key refreshed");
        Ok(())
    }
}

/// Redis 服务注册发现
pub struct RedisRegistry<C = ConnectionManager> {
    cache: Arc<C>,
    config: RedisConfig,
    registrations: Mutex<HashMap<String, Registration<RenewalTask>>>,
}

impl RedisRegistry<ConnectionManager> {
    /// 连接 Redis 并确认可达
    pub async fn connect(config: RedisConfig) -> Result<Self> {
        config.validate()?;
        let client = redis::Client::open(config.url.as_str())
            .map_err(|err| DiscoverError::backend(BACKEND, format!("failed to open redis client: {err}")))?;

        let mut conn = with_timeout(BACKEND, "connect", config.op_timeout(), async {
            ConnectionManager::new(client)
                .await
                .map_err(|err| anyhow!("failed to connect to redis: {err}"))
        })
        .await?;

        with_timeout(BACKEND, "ping", config.op_timeout(), async {
            redis::cmd("PING")
                .query_async::<String>(&mut conn)
                .await
                .map_err(|err| anyhow!("failed to ping redis: {err}"))
        })
        .await?;

        info!(url = %config.url, "Connected to redis");
        Ok(Self::with_client(conn, config))
    }
}

impl<C: TtlCache> RedisRegistry<C> {
    pub fn with_client(cache: C, config: RedisConfig) -> Self {
        Self {
            cache: Arc::new(cache),
            config,
            registrations: Mutex::new(HashMap::new()),
        }
    }

    async fn call<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = anyhow::Result<T>>,
    {
        with_timeout(BACKEND, operation, self.config.op_timeout(), fut).await
    }
}

#[async_trait]
impl<C: TtlCache> ServiceRegistry for RedisRegistry<C> {
    fn scheme(&self) -> &'static str {
        "redis"
    }

    async fn register(&self, name: &str, address: &str) -> Result<String> {
        validate_service_name(name)?;
        ServiceAddress::parse(address)?;

        let id = new_service_id(name);
        self.call("set", self.cache.set_ex(&id, address, self.config.ttl()))
            .await?;

        let refresher = KeyRefresher {
            cache: self.cache.clone(),
            key: id.clone(),
            value: address.to_string(),
            ttl: self.config.ttl(),
            timeout: self.config.op_timeout(),
        };
        let task = RenewalTask::spawn(id.clone(), self.config.refresh_interval(), refresher);

        self.registrations.lock().await.insert(
            id.clone(),
            Registration {
                id: id.clone(),
                name: name.to_string(),
                address: address.to_string(),
                handle: task,
            },
        );

        info!(
            service_name = %name,
            address = %address,
            service_id = %id,
            "Service registered with redis"
        );
        Ok(id)
    }

    async fn unregister(&self, id: &str) -> Result<()> {
        let registration = self
            .registrations
            .lock()
            .await
            .remove(id)
            .ok_or(DiscoverError::ServiceNotFound)?;

        // 先停掉续期，避免删除之后又被重写
        registration.handle.stop().await;
        self.call("del", self.cache.del(id)).await?;

        info!(
            service_name = %registration.name,
            service_id = %id,
            "Service unregistered from redis"
        );
        Ok(())
    }

    async fn discover_by_name(&self, name: &str) -> Result<Vec<String>> {
        let keys = self
            .call("keys", self.cache.keys(&escape_pattern(&name_prefix_of(name))))
            .await?;

        let mut addresses = Vec::with_capacity(keys.len());
        let mut last_err = None;
        for key in keys {
            // key 可能在 KEYS 和 GET 之间过期
            match self.call("get", self.cache.get(&key)).await {
                Ok(Some(address)) => addresses.push(address),
                Ok(None) => {}
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to read registration");
                    last_err = Some(e);
                }
            }
        }

        if addresses.is_empty() {
            return Err(last_err.unwrap_or(DiscoverError::ServiceNotFound));
        }
        Ok(addresses)
    }

    async fn discover_by_id(&self, id: &str) -> Result<String> {
        self.call("get", self.cache.get(id))
            .await?
            .ok_or(DiscoverError::ServiceNotFound)
    }

    async fn registered_ids(&self) -> Vec<String> {
        self.registrations.lock().await.keys().cloned().collect()
    }
}
