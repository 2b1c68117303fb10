//! gRPC 服务注册与发现
//!
//! 服务端把 `服务名 -> 地址` 发布到协调存储（etcd、Redis 或 Consul），并持续续期；
//! 客户端通过 `scheme:///服务名` 形式的目标解析出全部健康实例，交给 tonic 负载均衡通道。
//!
//! ```no_run
//! use grpc_discover::{DialOptions, DiscoverConfig, ResolverRegistry, ServiceRegistry, create_registry};
//!
//! # async fn run() -> grpc_discover::Result<()> {
//! let registry = create_registry(&DiscoverConfig::default()).await?;
//! let id = registry.register("Greeter", "10.0.0.1:9000").await?;
//! registry.clone().auto_unregister(&id);
//!
//! let mut resolvers = ResolverRegistry::new();
//! resolvers.register_registry(registry);
//! let dialed = resolvers.dial("etcd:///Greeter", DialOptions::default()).await?;
//! let _channel = dialed.channel();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod health;
pub mod identity;
pub mod lifecycle;
pub mod logging;
pub mod registry;
pub mod resolver;
pub mod types;

// Re-exports
pub use config::{BackendType, ConsulConfig, DiscoverConfig, EtcdConfig, RedisConfig};
pub use error::{DiscoverError, ErrorCode, Result};
pub use health::{HealthService, HealthStatus, heartbeat_router, serve_heartbeat};
pub use identity::{name_of, name_prefix_of, new_service_id};
pub use lifecycle::{Lifecycle, ShutdownSignal, SignalListener};
pub use logging::{LogConfig, init_tracing};
pub use registry::{Registration, ServiceRegistry, create_registry};
pub use resolver::{
    BalanceChannelConn, ClientConn, DialOptions, DialedChannel, DiscoverResolverBuilder, Resolver,
    ResolverBuilder, ResolverRegistry, ResolverState, Target,
};
pub use types::ServiceAddress;

#[cfg(feature = "consul")]
pub use registry::ConsulRegistry;
#[cfg(feature = "etcd")]
pub use registry::EtcdRegistry;
#[cfg(feature = "redis")]
pub use registry::RedisRegistry;
