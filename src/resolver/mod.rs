//! 客户端名称解析
//!
//! 把 `scheme:///服务名` 形式的目标解析为地址集合，并推送给 RPC 连接。
//! 每个后端适配器对应一个 scheme（`etcd`、`redis`、`consul`），
//! [`ResolverRegistry`] 保存 scheme 到构建器的映射，由调用方显式创建和传递。
//!
//! 解析失败时只记录日志，连接保持上一次成功推送的地址。

pub mod balance;

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info, warn};

use crate::error::{DiscoverError, Result};
use crate::registry::ServiceRegistry;

pub use balance::BalanceChannelConn;

/// 解析目标，例如 `etcd:///Greeter`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    scheme: String,
    authority: String,
    endpoint: String,
}

impl Target {
    pub fn new(scheme: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            authority: String::new(),
            endpoint: endpoint.into(),
        }
    }

    /// 解析 `scheme://[authority]/endpoint`
    pub fn parse(uri: &str) -> Result<Self> {
        let invalid = || DiscoverError::InvalidTarget(uri.to_string());

        let (scheme, rest) = uri.split_once("://").ok_or_else(invalid)?;
        if scheme.is_empty() {
            return Err(invalid());
        }
        let (authority, endpoint) = rest.split_once('/').ok_or_else(invalid)?;
        if endpoint.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            scheme: scheme.to_string(),
            authority: authority.to_string(),
            endpoint: endpoint.to_string(),
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// 要解析的服务名
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl FromStr for Target {
    type Err = DiscoverError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.authority, self.endpoint)
    }
}

/// 一次解析结果：完整的地址集合
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverState {
    pub addresses: Vec<String>,
}

impl ResolverState {
    pub fn new(addresses: Vec<String>) -> Self {
        Self { addresses }
    }
}

/// 接收解析结果的 RPC 连接
pub trait ClientConn: Send + Sync + 'static {
    /// 用新的地址集合整体替换连接当前的地址
    fn update_state(&self, state: ResolverState) -> Result<()>;
}

/// 为某个目标工作的解析器
#[async_trait]
pub trait Resolver: Send + Sync + 'static {
    /// 立即执行一次解析并推送结果
    async fn resolve_now(&self);

    /// 关闭解析器，之后的 `resolve_now` 不再推送
    fn close(&self);
}

/// 按 scheme 创建解析器
#[async_trait]
pub trait ResolverBuilder: Send + Sync + 'static {
    fn scheme(&self) -> &str;

    async fn build(&self, target: Target, conn: Arc<dyn ClientConn>) -> Result<Arc<dyn Resolver>>;
}

/// 基于 [`ServiceRegistry`] 的解析器构建器，scheme 与后端一致
pub struct DiscoverResolverBuilder {
    registry: Arc<dyn ServiceRegistry>,
}

impl DiscoverResolverBuilder {
    pub fn new(registry: Arc<dyn ServiceRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ResolverBuilder for DiscoverResolverBuilder {
    fn scheme(&self) -> &str {
        self.registry.scheme()
    }

    async fn build(&self, target: Target, conn: Arc<dyn ClientConn>) -> Result<Arc<dyn Resolver>> {
        if target.scheme() != self.scheme() {
            return Err(DiscoverError::UnknownScheme(target.scheme().to_string()));
        }

        info!(target = %target, "Building resolver");
        let resolver = DiscoverResolver {
            registry: Arc::clone(&self.registry),
            target,
            conn,
            closed: AtomicBool::new(false),
        };
        resolver.resolve_now().await;
        Ok(Arc::new(resolver))
    }
}

/// 调用 `discover_by_name` 并推送结果的解析器
pub struct DiscoverResolver {
    registry: Arc<dyn ServiceRegistry>,
    target: Target,
    conn: Arc<dyn ClientConn>,
    closed: AtomicBool,
}

impl DiscoverResolver {
    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Resolver for DiscoverResolver {
    async fn resolve_now(&self) {
        if self.is_closed() {
            debug!(target = %self.target, "Resolver closed, skip resolving");
            return;
        }

        let addresses = match self.registry.discover_by_name(self.target.endpoint()).await {
            Ok(addresses) => addresses,
            Err(e) => {
                warn!(
                    target = %self.target,
                    error = %e,
                    "Failed to resolve target, keeping previous addresses"
                );
                return;
            }
        };

        // 等待发现期间可能已被关闭
        if self.is_closed() {
            return;
        }

        debug!(target = %self.target, count = addresses.len(), "Resolved addresses");
        if let Err(e) = self.conn.update_state(ResolverState::new(addresses)) {
            warn!(target = %self.target, error = %e, "Failed to update connection state");
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(target = %self.target, "Resolver closed");
        }
    }
}

/// 建立负载均衡连接时的选项
#[derive(Debug, Clone)]
pub struct DialOptions {
    /// 地址变更通道容量
    pub buffer: usize,
    pub connect_timeout: Option<Duration>,
    /// 设置后按该周期重新解析
    pub refresh_interval: Option<Duration>,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            buffer: 1024,
            connect_timeout: None,
            refresh_interval: None,
        }
    }
}

/// scheme 到解析器构建器的映射
#[derive(Default, Clone)]
pub struct ResolverRegistry {
    builders: HashMap<String, Arc<dyn ResolverBuilder>>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册构建器，同一 scheme 后注册的覆盖先注册的
    pub fn register(&mut self, builder: Arc<dyn ResolverBuilder>) {
        let scheme = builder.scheme().to_string();
        if self.builders.insert(scheme.clone(), builder).is_some() {
            warn!(scheme = %scheme, "Resolver builder replaced");
        }
    }

    /// 为注册发现后端注册默认构建器
    pub fn register_registry(&mut self, registry: Arc<dyn ServiceRegistry>) {
        self.register(Arc::new(DiscoverResolverBuilder::new(registry)));
    }

    pub fn get(&self, scheme: &str) -> Option<Arc<dyn ResolverBuilder>> {
        self.builders.get(scheme).cloned()
    }

    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.builders.keys().cloned().collect();
        schemes.sort();
        schemes
    }

    /// 为目标构建解析器，结果推送到给定连接
    pub async fn build(&self, target: &str, conn: Arc<dyn ClientConn>) -> Result<Arc<dyn Resolver>> {
        let target = Target::parse(target)?;
        let builder = self
            .get(target.scheme())
            .ok_or_else(|| DiscoverError::UnknownScheme(target.scheme().to_string()))?;
        builder.build(target, conn).await
    }

    /// 建立一个由解析结果驱动的 tonic 负载均衡通道
    ///
    /// 必须在 tokio 运行时中调用。
    pub async fn dial(&self, target: &str, options: DialOptions) -> Result<DialedChannel> {
        let (channel, tx) = Channel::balance_channel::<String>(options.buffer);

        let connect_timeout = options.connect_timeout;
        let conn = BalanceChannelConn::new(tx).with_endpoint_config(move |endpoint: Endpoint| {
            match connect_timeout {
                Some(timeout) => endpoint.connect_timeout(timeout),
                None => endpoint,
            }
        });

        let resolver = self.build(target, Arc::new(conn)).await?;
        let mut dialed = DialedChannel {
            channel,
            resolver,
            refresh: None,
        };
        if let Some(period) = options.refresh_interval {
            dialed.spawn_refresh(period);
        }
        Ok(dialed)
    }
}

struct RefreshTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// 解析器驱动的 tonic 通道
///
/// 释放时关闭解析器并停止定期刷新。
pub struct DialedChannel {
    channel: Channel,
    resolver: Arc<dyn Resolver>,
    refresh: Option<RefreshTask>,
}

impl DialedChannel {
    /// 用于构造生成的 gRPC 客户端
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    pub fn resolver(&self) -> Arc<dyn Resolver> {
        Arc::clone(&self.resolver)
    }

    pub async fn resolve_now(&self) {
        self.resolver.resolve_now().await;
    }

    /// 按固定周期重新解析，替换已有的刷新任务
    pub fn spawn_refresh(&mut self, period: Duration) {
        self.stop_refresh();

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let resolver = Arc::clone(&self.resolver);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => resolver.resolve_now().await,
                }
            }
        });
        self.refresh = Some(RefreshTask { cancel, handle });
    }

    fn stop_refresh(&mut self) {
        if let Some(task) = self.refresh.take() {
            task.cancel.cancel();
            task.handle.abort();
        }
    }

    pub fn close(mut self) {
        self.stop_refresh();
        self.resolver.close();
    }
}

impl Drop for DialedChannel {
    fn drop(&mut self) {
        self.stop_refresh();
        self.resolver.close();
    }
}
