//! 服务注册发现错误定义
//!
//! 所有后端适配器共用一组封闭的错误条件：
//! - 后端通信错误（网络、超时、协议）
//! - 未找到（存储可达，但没有匹配记录）
//! - 输入格式错误（地址、服务名、目标 URI）

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// 统一结果类型
pub type Result<T> = std::result::Result<T, DiscoverError>;

/// 错误代码，用于日志和跨进程传递
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u32)]
pub enum ErrorCode {
    ServiceNotFound = 1000,
    BackendUnavailable = 2000,
    BackendTimeout = 2001,
    InvalidArgument = 3000,
    ConfigError = 4000,
    InternalError = 5000,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ServiceNotFound => "SERVICE_NOT_FOUND",
            ErrorCode::BackendUnavailable => "BACKEND_UNAVAILABLE",
            ErrorCode::BackendTimeout => "BACKEND_TIMEOUT",
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::ConfigError => "CONFIG_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    pub fn as_u32(&self) -> u32 {
        *self as u32
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 服务注册发现错误
#[derive(Error, Debug)]
pub enum DiscoverError {
    /// 存储可达，但没有匹配的记录；`UnRegister` 对未知 ID 也返回此错误
    #[error("service not found")]
    ServiceNotFound,

    /// 与协调存储通信失败
    #[error("{backend} backend error: {message}")]
    Backend {
        backend: &'static str,
        message: String,
    },

    /// 后端调用超过固定超时
    #[error("{backend} {operation} timed out after {timeout:?}")]
    Timeout {
        backend: &'static str,
        operation: &'static str,
        timeout: Duration,
    },

    /// 无法拆分为 host:port 的地址
    #[error("invalid address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// 无法编码进服务 ID 的服务名
    #[error("invalid service name {name:?}: {reason}")]
    InvalidServiceName { name: String, reason: String },

    /// 不是 `scheme:///name` 形式的目标
    #[error("invalid target {0:?}")]
    InvalidTarget(String),

    /// 没有为该 scheme 注册解析器
    #[error("no resolver registered for scheme {0:?}")]
    UnknownScheme(String),

    #[error("config error: {0}")]
    Config(String),

    /// 无法把地址集合推送给 RPC 连接
    #[error("failed to update connection state: {0}")]
    StateUpdate(String),
}

impl DiscoverError {
    /// 将后端客户端错误包装为通信错误
    pub fn backend(backend: &'static str, err: impl fmt::Display) -> Self {
        DiscoverError::Backend {
            backend,
            message: err.to_string(),
        }
    }

    /// 从 `anyhow::Error` 包装，保留完整的错误链
    pub fn from_anyhow(backend: &'static str, err: anyhow::Error) -> Self {
        DiscoverError::Backend {
            backend,
            message: format!("{err:#}"),
        }
    }

    pub fn invalid_address(address: impl Into<String>, reason: impl Into<String>) -> Self {
        DiscoverError::InvalidAddress {
            address: address.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_service_name(name: impl Into<String>, reason: impl Into<String>) -> Self {
        DiscoverError::InvalidServiceName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        DiscoverError::Config(msg.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            DiscoverError::ServiceNotFound => ErrorCode::ServiceNotFound,
            DiscoverError::Backend { .. } => ErrorCode::BackendUnavailable,
            DiscoverError::Timeout { .. } => ErrorCode::BackendTimeout,
            DiscoverError::InvalidAddress { .. }
            | DiscoverError::InvalidServiceName { .. }
            | DiscoverError::InvalidTarget(_)
            | DiscoverError::UnknownScheme(_) => ErrorCode::InvalidArgument,
            DiscoverError::Config(_) => ErrorCode::ConfigError,
            DiscoverError::StateUpdate(_) => ErrorCode::InternalError,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DiscoverError::ServiceNotFound)
    }

    /// 是否为后端通信类错误（网络或超时）
    pub fn is_backend(&self) -> bool {
        matches!(
            self,
            DiscoverError::Backend { .. } | DiscoverError::Timeout { .. }
        )
    }
}

/// 为一次后端调用加上固定超时，并把客户端错误转换为 `DiscoverError`
pub async fn with_timeout<T, F>(
    backend: &'static str,
    operation: &'static str,
    timeout: Duration,
    fut: F,
) -> Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(DiscoverError::from_anyhow(backend, err)),
        Err(_) => Err(DiscoverError::Timeout {
            backend,
            operation,
            timeout,
        }),
    }
}
