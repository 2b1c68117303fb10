//! 健康检查模块
//!
//! Consul 后端依赖服务自身暴露的 HTTP 心跳端点。[`heartbeat_router`] 根据
//! [`HealthService`] 的状态应答：服务中返回 `200 ack`，否则返回 `503`。

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{DiscoverError, Result};

/// 心跳端点的默认路径
pub const HEARTBEAT_PATH: &str = "/heartbeat";

/// 整个进程的状态使用空服务名
const OVERALL: &str = "";

/// 健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Unknown,
    Serving,
    NotServing,
}

/// 健康检查服务
#[derive(Clone)]
pub struct HealthService {
    statuses: Arc<RwLock<HashMap<String, HealthStatus>>>,
}

impl HealthService {
    /// 新建时整体状态为 `Serving`
    pub fn new() -> Self {
        let mut statuses = HashMap::new();
        statuses.insert(OVERALL.to_string(), HealthStatus::Serving);
        Self {
            statuses: Arc::new(RwLock::new(statuses)),
        }
    }

    pub async fn set_status(&self, service: impl Into<String>, status: HealthStatus) {
        let mut statuses = self.statuses.write().await;
        statuses.insert(service.into(), status);
    }

    pub async fn get_status(&self, service: &str) -> HealthStatus {
        let statuses = self.statuses.read().await;
        statuses
            .get(service)
            .copied()
            .unwrap_or(HealthStatus::Unknown)
    }

    pub async fn overall_status(&self) -> HealthStatus {
        self.get_status(OVERALL).await
    }

    pub async fn set_serving(&self) {
        self.set_all(HealthStatus::Serving).await;
    }

    /// 关闭前调用，让 Consul 尽快把实例标记为不健康
    pub async fn set_not_serving(&self) {
        self.set_all(HealthStatus::NotServing).await;
    }

    async fn set_all(&self, status: HealthStatus) {
        let mut statuses = self.statuses.write().await;
        for value in statuses.values_mut() {
            *value = status;
        }
        statuses.insert(OVERALL.to_string(), status);
    }
}

impl Default for HealthService {
    fn default() -> Self {
        Self::new()
    }
}

fn respond(status: HealthStatus) -> (StatusCode, &'static str) {
    match status {
        HealthStatus::Serving => (StatusCode::OK, "ack"),
        HealthStatus::NotServing => (StatusCode::SERVICE_UNAVAILABLE, "not serving"),
        HealthStatus::Unknown => (StatusCode::SERVICE_UNAVAILABLE, "unknown"),
    }
}

async fn overall_heartbeat(State(health): State<HealthService>) -> (StatusCode, &'static str) {
    respond(health.overall_status().await)
}

async fn service_heartbeat(
    State(health): State<HealthService>,
    Path(service): Path<String>,
) -> (StatusCode, &'static str) {
    respond(health.get_status(&service).await)
}

/// 心跳路由：`/heartbeat` 对应整体状态，`/heartbeat/{service}` 对应单个服务
pub fn heartbeat_router(health: HealthService) -> Router {
    Router::new()
        .route(HEARTBEAT_PATH, get(overall_heartbeat))
        .route(&format!("{HEARTBEAT_PATH}/{{service}}"), get(service_heartbeat))
        .with_state(health)
}

/// 在 `addr` 上运行心跳端点，直到 `shutdown` 完成
pub async fn serve_heartbeat<F>(addr: SocketAddr, health: HealthService, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| DiscoverError::config(format!("failed to bind heartbeat endpoint {addr}: {e}")))?;
    info!(addr = %addr, path = HEARTBEAT_PATH, "Heartbeat endpoint listening");

    axum::serve(listener, heartbeat_router(health))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| DiscoverError::config(format!("heartbeat endpoint failed: {e}")))?;

    info!(addr = %addr, "Heartbeat endpoint stopped");
    Ok(())
}
