//! etcd 服务注册发现实现
//!
//! 每个注册记录申请一个固定 TTL 的租约，key 为服务 ID、value 为地址并绑定该租约。
//! 后台任务通过 keep-alive 流在到期前续约；进程消失后租约到期，etcd 原子地删除 key。

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, GetOptions, PutOptions};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::renewal::{RenewalTask, Renewer};
use super::{Registration, ServiceRegistry};
use crate::config::EtcdConfig;
use crate::error::{DiscoverError, Result, with_timeout};
use crate::identity::{name_prefix_of, new_service_id, validate_service_name};
use crate::types::ServiceAddress;

const BACKEND: &str = "etcd";

/// etcd 租约 keep-alive 流
#[async_trait]
pub trait LeaseKeepAlive: Send {
    /// 发送一次续约请求并等待响应，返回服务端给出的剩余 TTL（秒）
    async fn renew(&mut self) -> anyhow::Result<i64>;
}

/// 注册发现用到的 etcd 原语
#[async_trait]
pub trait LeaseKv: Send + Sync + 'static {
    async fn grant(&self, ttl: i64) -> anyhow::Result<i64>;
    async fn put_with_lease(&self, key: &str, value: &str, lease_id: i64) -> anyhow::Result<()>;
    async fn get(&self, key: &str) -> anyhow::Result<Vec<String>>;
    async fn get_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, String)>>;
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
    async fn revoke(&self, lease_id: i64) -> anyhow::Result<()>;
    async fn keep_alive(&self, lease_id: i64) -> anyhow::Result<Box<dyn LeaseKeepAlive>>;
}

struct EtcdKeepAlive {
    keeper: etcd_client::LeaseKeeper,
    stream: etcd_client::LeaseKeepAliveStream,
}

#[async_trait]
impl LeaseKeepAlive for EtcdKeepAlive {
    async fn renew(&mut self) -> anyhow::Result<i64> {
        self.keeper
            .keep_alive()
            .await
            .map_err(|e| anyhow::anyhow!("failed to send keep-alive: {e}"))?;
        let resp = self
            .stream
            .message()
            .await
            .map_err(|e| anyhow::anyhow!("keep-alive stream error: {e}"))?
            .ok_or_else(|| anyhow::anyhow!("keep-alive stream closed"))?;
        Ok(resp.ttl())
    }
}

#[async_trait]
impl LeaseKv for Client {
    async fn grant(&self, ttl: i64) -> anyhow::Result<i64> {
        let mut client = self.clone();
        let resp = client
            .lease_grant(ttl, None)
            .await
            .map_err(|e| anyhow::anyhow!("failed to grant lease: {e}"))?;
        Ok(resp.id())
    }

    async fn put_with_lease(&self, key: &str, value: &str, lease_id: i64) -> anyhow::Result<()> {
        let mut client = self.clone();
        client
            .put(key, value, Some(PutOptions::new().with_lease(lease_id)))
            .await
            .map_err(|e| anyhow::anyhow!("failed to put key: {e}"))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Vec<String>> {
        let mut client = self.clone();
        let resp = Client::get(&mut client, key, None)
            .await
            .map_err(|e| anyhow::anyhow!("failed to get key: {e}"))?;
        Ok(resp
            .kvs()
            .iter()
            .map(|kv| String::from_utf8_lossy(kv.value()).into_owned())
            .collect())
    }

    async fn get_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, String)>> {
        let mut client = self.clone();
        let resp = Client::get(&mut client, prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| anyhow::anyhow!("failed to get prefix: {e}"))?;
        Ok(resp
            .kvs()
            .iter()
            .map(|kv| {
                (
                    String::from_utf8_lossy(kv.key()).into_owned(),
                    String::from_utf8_lossy(kv.value()).into_owned(),
                )
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let mut client = self.clone();
        Client::delete(&mut client, key, None)
            .await
            .map_err(|e| anyhow::anyhow!("failed to delete key: {e}"))?;
        Ok(())
    }

    async fn revoke(&self, lease_id: i64) -> anyhow::Result<()> {
        let mut client = self.clone();
        client
            .lease_revoke(lease_id)
            .await
            .map_err(|e| anyhow::anyhow!("failed to revoke lease: {e}"))?;
        Ok(())
    }

    async fn keep_alive(&self, lease_id: i64) -> anyhow::Result<Box<dyn LeaseKeepAlive>> {
        let mut client = self.clone();
        let (keeper, stream) = client
            .lease_keep_alive(lease_id)
            .await
            .map_err(|e| anyhow::anyhow!("failed to open keep-alive stream: {e}"))?;
        Ok(Box::new(EtcdKeepAlive { keeper, stream }))
    }
}

/// 续约器：流断开后在下一次醒来时重新打开
struct LeaseRenewer<C> {
    kv: Arc<C>,
    lease_id: i64,
    stream: Option<Box<dyn LeaseKeepAlive>>,
    timeout: Duration,
}

#[async_trait]
impl<C: LeaseKv> Renewer for LeaseRenewer<C> {
    async fn renew(&mut self) -> anyhow::Result<()> {
        let mut stream = match self.stream.take() {
            Some(stream) => stream,
            None => tokio::time::timeout(self.timeout, self.kv.keep_alive(self.lease_id))
                .await
                .map_err(|_| anyhow::anyhow!("keep-alive reopen timed out"))??,
        };

        let ttl = tokio::time::timeout(self.timeout, stream.renew())
            .await
            .map_err(|_| anyhow::anyhow!("keep-alive timed out"))??;
        if ttl <= 0 {
            anyhow::bail!("lease {} has expired", self.lease_id);
        }

        debug!(lease_id = self.lease_id, ttl, "Lease renewed");
        self.stream = Some(stream);
        Ok(())
    }
}

/// 注册记录的存活句柄
#[derive(Debug)]
pub struct EtcdLease {
    pub lease_id: i64,
    keep_alive: RenewalTask,
}

/// etcd 服务注册发现
pub struct EtcdRegistry<C = Client> {
    kv: Arc<C>,
    config: EtcdConfig,
    registrations: Mutex<HashMap<String, Registration<EtcdLease>>>,
}

impl EtcdRegistry<Client> {
    /// 连接 etcd 集群
    pub async fn connect(config: EtcdConfig) -> Result<Self> {
        config.validate()?;
        let mut options = ConnectOptions::new()
            .with_connect_timeout(config.connect_timeout())
            .with_timeout(config.op_timeout());
        if let (Some(user), Some(password)) = (&config.user, &config.password) {
            options = options.with_user(user.clone(), password.clone());
        }

        let client = Client::connect(&config.endpoints, Some(options))
            .await
            .map_err(|e| DiscoverError::backend(BACKEND, format!("failed to connect to etcd: {e}")))?;

        info!(endpoints = ?config.endpoints, "Connected to etcd");
        Ok(Self::with_client(client, config))
    }
}

impl<C: LeaseKv> EtcdRegistry<C> {
    pub fn with_client(kv: C, config: EtcdConfig) -> Self {
        Self {
            kv: Arc::new(kv),
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

    /// 注册中途失败时撤销租约，绑定的 key 随之删除
    async fn revoke_quietly(&self, lease_id: i64) {
        if let Err(e) = self.call("revoke", self.kv.revoke(lease_id)).await {
            warn!(lease_id, error = %e, "Failed to revoke lease after partial registration");
        }
    }
}

#[async_trait]
impl<C: LeaseKv> ServiceRegistry for EtcdRegistry<C> {
    fn scheme(&self) -> &'static str {
        "etcd"
    }

    async fn register(&self, name: &str, address: &str) -> Result<String> {
        validate_service_name(name)?;
        ServiceAddress::parse(address)?;

        let ttl = i64::try_from(self.config.lease_ttl_secs).map_err(|_| {
            DiscoverError::config(format!(
                "etcd lease ttl {}s is out of range",
                self.config.lease_ttl_secs
            ))
        })?;

        let id = new_service_id(name);
        let lease_id = self.call("lease_grant", self.kv.grant(ttl)).await?;

        if let Err(e) = self
            .call("put", self.kv.put_with_lease(&id, address, lease_id))
            .await
        {
            self.revoke_quietly(lease_id).await;
            return Err(e);
        }

        let stream = match self.call("lease_keep_alive", self.kv.keep_alive(lease_id)).await {
            Ok(stream) => stream,
            Err(e) => {
                self.revoke_quietly(lease_id).await;
                return Err(e);
            }
        };

        let renewer = LeaseRenewer {
            kv: self.kv.clone(),
            lease_id,
            stream: Some(stream),
            timeout: self.config.op_timeout(),
        };
        let keep_alive = RenewalTask::spawn(id.clone(), self.config.keep_alive_interval(), renewer);

        self.registrations.lock().await.insert(
            id.clone(),
            Registration {
                id: id.clone(),
                name: name.to_string(),
                address: address.to_string(),
                handle: EtcdLease {
                    lease_id,
                    keep_alive,
                },
            },
        );

        info!(
            service_name = %name,
            address = %address,
            service_id = %id,
            lease_id,
            "Service registered with etcd"
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

        let EtcdLease {
            lease_id,
            keep_alive,
        } = registration.handle;
        keep_alive.stop().await;

        let deleted = self.call("delete", self.kv.delete(id)).await;
        let revoked = self.call("lease_revoke", self.kv.revoke(lease_id)).await;
        deleted.and(revoked)?;

        info!(
            service_name = %registration.name,
            service_id = %id,
            "Service unregistered from etcd"
        );
        Ok(())
    }

    async fn discover_by_name(&self, name: &str) -> Result<Vec<String>> {
        let kvs = self
            .call("get_prefix", self.kv.get_prefix(&name_prefix_of(name)))
            .await?;
        if kvs.is_empty() {
            return Err(DiscoverError::ServiceNotFound);
        }
        Ok(kvs.into_iter().map(|(_, address)| address).collect())
    }

    async fn discover_by_id(&self, id: &str) -> Result<String> {
        let mut values = self.call("get", self.kv.get(id)).await?;
        if values.len() != 1 {
            return Err(DiscoverError::ServiceNotFound);
        }
        Ok(values.remove(0))
    }

    async fn registered_ids(&self) -> Vec<String> {
        self.registrations.lock().await.keys().cloned().collect()
    }
}
