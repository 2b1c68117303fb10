//! 服务注册发现模块
//!
//! 同一套契约（注册、注销、自动注销、按名称/ID 发现）分别实现在三种协调存储上：
//! - **etcd**: 服务端租约 + 后台 keep-alive 流
//! - **Redis**: 带过期时间的 key + 客户端定时重写
//! - **Consul**: agent 注册 + 由 Consul 轮询的 HTTP 健康检查

#[cfg(feature = "consul")]
pub mod consul;
#[cfg(feature = "etcd")]
pub mod etcd;
pub mod factory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod renewal;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::Result;
use crate::lifecycle::Lifecycle;

#[cfg(feature = "consul")]
pub use consul::{AgentApi, ConsulHttpClient, ConsulRegistry};
#[cfg(feature = "etcd")]
pub use etcd::{EtcdRegistry, LeaseKeepAlive, LeaseKv};
pub use factory::create_registry;
#[cfg(feature = "redis")]
pub use redis::{RedisRegistry, TtlCache};
pub use renewal::{RenewalTask, Renewer};

/// 一个本地持有的注册记录
///
/// `handle` 是各后端特有的存活句柄：租约、续期任务或健康检查地址。
#[derive(Debug)]
pub struct Registration<H> {
    pub id: String,
    pub name: String,
    pub address: String,
    pub handle: H,
}

/// 服务注册发现契约
///
/// 注册记录只属于创建它的适配器实例；注销一个本实例不知道的 ID 返回
/// [`DiscoverError::ServiceNotFound`](crate::DiscoverError::ServiceNotFound)。
#[async_trait]
pub trait ServiceRegistry: Send + Sync + 'static {
    /// 解析器使用的 URI scheme
    fn scheme(&self) -> &'static str;

    /// 发布 `服务名 -> 地址`，启动存活机制，返回新生成的实例 ID
    async fn register(&self, name: &str, address: &str) -> Result<String>;

    /// 停止续期并删除后端记录
    async fn unregister(&self, id: &str) -> Result<()>;

    /// 按名称发现所有健康实例的地址，结果为空时返回 `ServiceNotFound`
    async fn discover_by_name(&self, name: &str) -> Result<Vec<String>>;

    /// 按实例 ID 发现地址
    async fn discover_by_id(&self, id: &str) -> Result<String>;

    /// 本实例当前持有的注册 ID
    async fn registered_ids(&self) -> Vec<String>;

    /// 在给定的生命周期上挂载 `unregister(id)` 清理回调
    fn auto_unregister_with(self: Arc<Self>, id: &str, lifecycle: &Lifecycle) {
        let id = id.to_string();
        let registry = self;
        lifecycle.on_terminate(format!("unregister:{id}"), move || async move {
            match registry.unregister(&id).await {
                Ok(()) => info!(service_id = %id, "Service unregistered on shutdown"),
                Err(e) => warn!(service_id = %id, error = %e, "Failed to unregister service on shutdown"),
            }
        });
    }

    /// 收到终止信号时自动注销，然后退出进程
    fn auto_unregister(self: Arc<Self>, id: &str) {
        let lifecycle = Lifecycle::global();
        self.auto_unregister_with(id, lifecycle);
        lifecycle.listen();
    }
}
