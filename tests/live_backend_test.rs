//! 真实后端集成测试
//!
//! 这些测试需要运行中的 etcd / Redis / Consul 实例。
//! 默认情况下，测试会被忽略，需要使用 `cargo test --test live_backend_test -- --ignored` 运行。
//!
//! 启动依赖：
//! ```bash
//! docker run -d --name etcd-test -p 2379:2379 \
//!   quay.io/coreos/etcd:v3.5.9 \
//!   etcd --advertise-client-urls=http://127.0.0.1:2379 \
//!        --listen-client-urls=http://0.0.0.0:2379
//!
//! docker run -d --name redis-test -p 6379:6379 redis:7
//!
//! docker run -d --name consul-test --network host hashicorp/consul:1.17 agent -dev -client=127.0.0.1
//! ```

use grpc_discover::{
    BackendType, ConsulRegistry, DiscoverConfig, HealthService, ServiceRegistry, create_registry,
    serve_heartbeat,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::{Duration, sleep};

/// etcd 服务器地址
/// 可以通过环境变量 ETCD_ENDPOINTS 覆盖，默认为 http://127.0.0.1:2379
fn etcd_endpoints() -> Vec<String> {
    std::env::var("ETCD_ENDPOINTS")
        .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_else(|_| vec!["http://127.0.0.1:2379".to_string()])
}

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

fn consul_addr() -> String {
    std::env::var("CONSUL_ADDR").unwrap_or_else(|_| "http://127.0.0.1:8500".to_string())
}

fn create_test_config(backend: BackendType) -> DiscoverConfig {
    let mut config = DiscoverConfig {
        backend,
        ..DiscoverConfig::default()
    };
    config.etcd.endpoints = etcd_endpoints();
    config.redis.url = redis_url();
    config.consul.address = consul_addr();
    config
}

async fn create_test_registry(backend: BackendType) -> Arc<dyn ServiceRegistry> {
    create_registry(&create_test_config(backend))
        .await
        .expect("Failed to create registry")
}

/// 注册、发现、注销完整流程
async fn register_discover_unregister(registry: Arc<dyn ServiceRegistry>) {
    let id1 = registry
        .register("LiveGreeter", "10.0.0.1:9000")
        .await
        .expect("Failed to register instance1");
    let id2 = registry
        .register("LiveGreeter", "10.0.0.2:9000")
        .await
        .expect("Failed to register instance2");

    let mut addresses = registry
        .discover_by_name("LiveGreeter")
        .await
        .expect("Failed to discover services");
    addresses.sort();
    assert!(addresses.contains(&"10.0.0.1:9000".to_string()));
    assert!(addresses.contains(&"10.0.0.2:9000".to_string()));

    assert_eq!(
        registry.discover_by_id(&id1).await.expect("Failed to discover by id"),
        "10.0.0.1:9000"
    );

    // 清理
    registry.unregister(&id1).await.expect("Failed to unregister instance1");
    registry.unregister(&id2).await.expect("Failed to unregister instance2");

    assert!(
        registry
            .discover_by_id(&id1)
            .await
            .expect_err("Instance still exists after unregistration")
            .is_not_found()
    );
}

/// 测试：etcd 注册发现
#[tokio::test]
#[ignore]
async fn test_etcd_register_discover() {
    register_discover_unregister(create_test_registry(BackendType::Etcd).await).await;
}

/// 测试：租约在 TTL 之后仍然有效
#[tokio::test]
#[ignore]
async fn test_etcd_keep_alive() {
    let registry = create_test_registry(BackendType::Etcd).await;
    let id = registry
        .register("LiveKeepAlive", "10.0.0.1:9000")
        .await
        .expect("Failed to register service");

    sleep(Duration::from_secs(15)).await;
    assert_eq!(
        registry.discover_by_id(&id).await.expect("Lease expired"),
        "10.0.0.1:9000"
    );

    registry.unregister(&id).await.expect("Failed to unregister service");
}

/// 测试：Redis 注册发现
#[tokio::test]
#[ignore]
async fn test_redis_register_discover() {
    register_discover_unregister(create_test_registry(BackendType::Redis).await).await;
}

/// 测试：Redis key 在 TTL 之后仍然存在
#[tokio::test]
#[ignore]
async fn test_redis_refresh() {
    let registry = create_test_registry(BackendType::Redis).await;
    let id = registry
        .register("LiveRefresh", "10.0.0.1:9000")
        .await
        .expect("Failed to register service");

    sleep(Duration::from_secs(15)).await;
    assert_eq!(
        registry.discover_by_id(&id).await.expect("Key expired"),
        "10.0.0.1:9000"
    );

    registry.unregister(&id).await.expect("Failed to unregister service");
}

/// 测试：Consul 通过心跳端点判定健康
#[tokio::test]
#[ignore]
async fn test_consul_heartbeat() {
    let heartbeat: SocketAddr = "127.0.0.1:18080".parse().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(serve_heartbeat(heartbeat, HealthService::new(), async move {
        let _ = rx.await;
    }));

    let config = create_test_config(BackendType::Consul);
    let registry = ConsulRegistry::connect(config.consul).expect("Failed to create consul registry");
    let id = registry
        .register_with_check("LiveConsul", "127.0.0.1:19000", "http://127.0.0.1:18080/heartbeat")
        .await
        .expect("Failed to register service");

    // 等待第一次健康检查通过
    let mut found = false;
    for _ in 0..20 {
        if registry.discover_by_id(&id).await.is_ok() {
            found = true;
            break;
        }
        sleep(Duration::from_millis(500)).await;
    }
    assert!(found, "Service never became healthy");

    registry.unregister(&id).await.expect("Failed to unregister service");
    tx.send(()).unwrap();
    server.await.unwrap().expect("Heartbeat endpoint failed");
}
