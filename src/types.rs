//! 服务地址

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{DiscoverError, Result};

/// 一个实例可拨号的 `host:port` 端点
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceAddress {
    pub host: String,
    pub port: u16,
}

impl ServiceAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// 拆分 `host:port` 或 `[v6]:port`
    pub fn parse(address: &str) -> Result<Self> {
        let (host, port) = if let Some(rest) = address.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| DiscoverError::invalid_address(address, "missing ']' in address"))?;
            let port = tail
                .strip_prefix(':')
                .ok_or_else(|| DiscoverError::invalid_address(address, "missing port in address"))?;
            (host, port)
        } else {
            let (host, port) = address
                .rsplit_once(':')
                .ok_or_else(|| DiscoverError::invalid_address(address, "missing port in address"))?;
            if host.contains(':') {
                return Err(DiscoverError::invalid_address(
                    address,
                    "too many colons in address",
                ));
            }
            (host, port)
        };

        if host.is_empty() {
            return Err(DiscoverError::invalid_address(address, "missing host"));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| DiscoverError::invalid_address(address, format!("invalid port: {e}")))?;

        Ok(Self::new(host, port))
    }
}

impl FromStr for ServiceAddress {
    type Err = DiscoverError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
