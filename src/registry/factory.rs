//! 根据配置创建注册发现后端

use std::sync::Arc;
use tracing::info;

use super::ServiceRegistry;
use crate::config::{BackendType, DiscoverConfig};
use crate::error::{DiscoverError, Result};

/// 创建配置中选定的后端适配器
pub async fn create_registry(config: &DiscoverConfig) -> Result<Arc<dyn ServiceRegistry>> {
    config.validate()?;
    info!(backend = config.backend.scheme(), "Creating service registry");

    match config.backend {
        BackendType::Etcd => connect_etcd(config).await,
        BackendType::Redis => connect_redis(config).await,
        BackendType::Consul => connect_consul(config),
    }
}

#[cfg(feature = "etcd")]
async fn connect_etcd(config: &DiscoverConfig) -> Result<Arc<dyn ServiceRegistry>> {
    let registry = super::EtcdRegistry::connect(config.etcd.clone()).await?;
    Ok(Arc::new(registry))
}

#[cfg(not(feature = "etcd"))]
async fn connect_etcd(_config: &DiscoverConfig) -> Result<Arc<dyn ServiceRegistry>> {
    Err(disabled(BackendType::Etcd))
}

#[cfg(feature = "redis")]
async fn connect_redis(config: &DiscoverConfig) -> Result<Arc<dyn ServiceRegistry>> {
    let registry = super::RedisRegistry::connect(config.redis.clone()).await?;
    Ok(Arc::new(registry))
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(_config: &DiscoverConfig) -> Result<Arc<dyn ServiceRegistry>> {
    Err(disabled(BackendType::Redis))
}

#[cfg(feature = "consul")]
fn connect_consul(config: &DiscoverConfig) -> Result<Arc<dyn ServiceRegistry>> {
    let registry = super::ConsulRegistry::connect(config.consul.clone())?;
    Ok(Arc::new(registry))
}

#[cfg(not(feature = "consul"))]
fn connect_consul(_config: &DiscoverConfig) -> Result<Arc<dyn ServiceRegistry>> {
    Err(disabled(BackendType::Consul))
}

#[allow(dead_code)]
fn disabled(backend: BackendType) -> DiscoverError {
    DiscoverError::config(format!(
        "backend {} is not enabled, rebuild with feature \"{}\"",
        backend.scheme(),
        backend.scheme()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn invalid_config_is_rejected_before_connecting() {
        let mut config = DiscoverConfig::default();
        config.etcd.endpoints.clear();
        let err = create_registry(&config).await.err().unwrap();
        assert!(matches!(err, DiscoverError::Config(_)));
    }

    #[cfg(feature = "consul")]
    #[tokio::test]
    async fn consul_registry_is_built_without_network() {
        let config = DiscoverConfig {
            backend: BackendType::Consul,
            ..DiscoverConfig::default()
        };
        let registry = create_registry(&config).await.unwrap();
        assert_eq!(registry.scheme(), "consul");
        assert!(registry.registered_ids().await.is_empty());
    }
}
