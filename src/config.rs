//! 配置
//!
//! 可以从 TOML 文件加载，再用环境变量覆盖：
//!
//! ```toml
//! backend = "etcd"
//!
//! [etcd]
//! endpoints = ["127.0.0.1:2379"]
//! lease_ttl_secs = 10
//!
//! [log]
//! level = "info"
//! ```

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{DiscoverError, Result};
use crate::logging::LogConfig;

/// etcd 服务端允许的最大租约 TTL（秒）
pub const MAX_LEASE_TTL_SECS: u64 = 9_000_000_000;

/// 心跳端点的默认端口
pub const DEFAULT_CHECK_PORT: u16 = 5030;

/// 协调存储类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    #[default]
    Etcd,
    Redis,
    Consul,
}

impl BackendType {
    /// 该后端对应的解析器 scheme
    pub fn scheme(&self) -> &'static str {
        match self {
            BackendType::Etcd => "etcd",
            BackendType::Redis => "redis",
            BackendType::Consul => "consul",
        }
    }
}

impl FromStr for BackendType {
    type Err = DiscoverError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "etcd" => Ok(BackendType::Etcd),
            "redis" => Ok(BackendType::Redis),
            "consul" => Ok(BackendType::Consul),
            _ => Err(DiscoverError::config(format!("unknown backend type: {s}"))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverConfig {
    pub backend: BackendType,
    pub etcd: EtcdConfig,
    pub redis: RedisConfig,
    pub consul: ConsulConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    /// 租约 TTL（秒）
    pub lease_ttl_secs: u64,
    /// keep-alive 间隔（秒），默认 TTL 的三分之一
    pub keep_alive_interval_secs: Option<u64>,
    pub connect_timeout_secs: u64,
    pub op_timeout_secs: u64,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["127.0.0.1:2379".to_string()],
            user: None,
            password: None,
            lease_ttl_secs: 10,
            keep_alive_interval_secs: None,
            connect_timeout_secs: 5,
            op_timeout_secs: 3,
        }
    }
}

impl EtcdConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        let secs = self
            .keep_alive_interval_secs
            .unwrap_or(self.lease_ttl_secs / 3)
            .max(1);
        Duration::from_secs(secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(DiscoverError::config("etcd endpoints not configured"));
        }
        if self.lease_ttl_secs == 0 {
            return Err(DiscoverError::config("etcd lease ttl must be at least 1s"));
        }
        if self.lease_ttl_secs > MAX_LEASE_TTL_SECS {
            return Err(DiscoverError::config(format!(
                "etcd lease ttl must not exceed {MAX_LEASE_TTL_SECS}s"
            )));
        }
        if self.keep_alive_interval() >= self.lease_ttl() {
            return Err(DiscoverError::config(
                "etcd keep-alive interval must be shorter than the lease ttl",
            ));
        }
        if self.op_timeout_secs == 0 {
            return Err(DiscoverError::config("etcd op timeout must be at least 1s"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    /// key 过期时间（秒）
    pub ttl_secs: u64,
    /// 重写间隔（秒）
    pub refresh_interval_secs: u64,
    pub op_timeout_secs: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            ttl_secs: 10,
            refresh_interval_secs: 3,
            op_timeout_secs: 3,
        }
    }
}

impl RedisConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(DiscoverError::config("redis url not configured"));
        }
        if self.ttl_secs == 0 {
            return Err(DiscoverError::config("redis ttl must be at least 1s"));
        }
        if self.refresh_interval_secs == 0 || self.refresh_interval_secs >= self.ttl_secs {
            return Err(DiscoverError::config(
                "redis refresh interval must be between 1s and the key ttl",
            ));
        }
        if self.op_timeout_secs == 0 {
            return Err(DiscoverError::config("redis op timeout must be at least 1s"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsulConfig {
    /// agent 地址，缺省 scheme 时按 http 处理
    pub address: String,
    /// ACL token
    pub token: Option<String>,
    /// 固定的健康检查地址；不设置时使用 `http://<服务主机>:<check_port><check_path>`
    pub check_url: Option<String>,
    /// 心跳端点监听的端口，与 gRPC 端口分开
    pub check_port: u16,
    pub check_path: String,
    pub check_interval_secs: u64,
    pub check_timeout_secs: u64,
    /// 检查持续失败多久后由 Consul 自动注销
    pub deregister_after_secs: u64,
    pub op_timeout_secs: u64,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:8500".to_string(),
            token: None,
            check_url: None,
            check_port: DEFAULT_CHECK_PORT,
            check_path: "/heartbeat".to_string(),
            check_interval_secs: 5,
            check_timeout_secs: 5,
            deregister_after_secs: 10,
            op_timeout_secs: 3,
        }
    }
}

impl ConsulConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            return Err(DiscoverError::config("consul address not configured"));
        }
        if self.check_url.is_none() && self.check_port == 0 {
            return Err(DiscoverError::config(
                "consul check port must be set when check_url is not configured",
            ));
        }
        if !self.check_path.starts_with('/') {
            return Err(DiscoverError::config("consul check path must start with '/'"));
        }
        if self.check_interval_secs == 0 || self.check_timeout_secs == 0 {
            return Err(DiscoverError::config(
                "consul check interval and timeout must be at least 1s",
            ));
        }
        if self.op_timeout_secs == 0 {
            return Err(DiscoverError::config("consul op timeout must be at least 1s"));
        }
        Ok(())
    }
}

impl DiscoverConfig {
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DiscoverError::config(format!("failed to read {path}: {e}")))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| DiscoverError::config(format!("failed to parse config: {e}")))
    }

    /// 用进程环境变量覆盖配置
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// 用给定的查找函数覆盖配置
    ///
    /// 支持 `DISCOVER_BACKEND`、`ETCD_ENDPOINTS`（逗号分隔）、`ETCD_LEASE_TTL_SECONDS`、
    /// `REDIS_URL`、`REDIS_TTL_SECONDS`、`CONSUL_ADDR`、`CONSUL_TOKEN`、`CONSUL_CHECK_PORT`。
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(backend) = lookup("DISCOVER_BACKEND") {
            self.backend = backend.parse()?;
        }
        if let Some(endpoints) = lookup("ETCD_ENDPOINTS") {
            self.etcd.endpoints = endpoints
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(ttl) = lookup("ETCD_LEASE_TTL_SECONDS") {
            self.etcd.lease_ttl_secs = parse_secs("ETCD_LEASE_TTL_SECONDS", &ttl)?;
        }
        if let Some(url) = lookup("REDIS_URL") {
            self.redis.url = url;
        }
        if let Some(ttl) = lookup("REDIS_TTL_SECONDS") {
            self.redis.ttl_secs = parse_secs("REDIS_TTL_SECONDS", &ttl)?;
        }
        if let Some(address) = lookup("CONSUL_ADDR") {
            self.consul.address = address;
        }
        if let Some(token) = lookup("CONSUL_TOKEN") {
            self.consul.token = Some(token);
        }
        if let Some(port) = lookup("CONSUL_CHECK_PORT") {
            self.consul.check_port = port.trim().parse().map_err(|e| {
                DiscoverError::config(format!("invalid CONSUL_CHECK_PORT={port:?}: {e}"))
            })?;
        }
        Ok(self)
    }

    /// 校验当前选中的后端配置
    pub fn validate(&self) -> Result<()> {
        match self.backend {
            BackendType::Etcd => self.etcd.validate(),
            BackendType::Redis => self.redis.validate(),
            BackendType::Consul => self.consul.validate(),
        }
    }
}

fn parse_secs(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|e| DiscoverError::config(format!("invalid {key}={value:?}: {e}")))
}
