//! Consul 服务注册发现实现
//!
//! 存活由 Consul 自己判定：注册时声明一个 HTTP 健康检查，agent 按固定间隔轮询，
//! 连续失败超过宽限期后自动注销实例。发现只返回检查通过的实例。

use anyhow::anyhow;
use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::info;

use super::{Registration, ServiceRegistry};
use crate::config::ConsulConfig;
use crate::error::{DiscoverError, Result, with_timeout};
use crate::identity::{name_of, new_service_id, validate_service_name};
use crate::types::ServiceAddress;

const BACKEND: &str = "consul";

/// `PUT /v1/agent/service/register` 请求体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentServiceRegistration {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "Check")]
    pub check: AgentServiceCheck,
}

/// 由 agent 轮询的 HTTP 健康检查
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentServiceCheck {
    #[serde(rename = "HTTP")]
    pub http: String,
    #[serde(rename = "Interval")]
    pub interval: String,
    #[serde(rename = "Timeout")]
    pub timeout: String,
    #[serde(rename = "DeregisterCriticalServiceAfter")]
    pub deregister_critical_service_after: String,
}

/// `GET /v1/health/service/:name` 的一项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEntry {
    #[serde(rename = "Node", default)]
    pub node: Option<ServiceNode>,
    #[serde(rename = "Service")]
    pub service: AgentService,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceNode {
    #[serde(rename = "Address", default)]
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentService {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Service")]
    pub service: String,
    #[serde(rename = "Address", default)]
    pub address: String,
    #[serde(rename = "Port")]
    pub port: u16,
}

impl ServiceEntry {
    /// 可拨号地址；服务未声明地址时使用节点地址
    pub fn dial_address(&self) -> String {
        let host = if self.service.address.is_empty() {
            self.node
                .as_ref()
                .map(|n| n.address.as_str())
                .unwrap_or_default()
        } else {
            self.service.address.as_str()
        };
        ServiceAddress::new(host, self.service.port).to_string()
    }
}

/// 注册发现用到的 Consul agent API
#[async_trait]
pub trait AgentApi: Send + Sync + 'static {
    async fn register_service(&self, registration: &AgentServiceRegistration) -> anyhow::Result<()>;
    async fn deregister_service(&self, service_id: &str) -> anyhow::Result<()>;
    /// 只返回健康检查通过的实例
    async fn healthy_service(&self, name: &str) -> anyhow::Result<Vec<ServiceEntry>>;
}

/// 基于 reqwest 的 Consul HTTP 客户端
#[derive(Clone)]
pub struct ConsulHttpClient {
    http: reqwest::Client,
    base_url: Url,
    token: Option<String>,
}

impl ConsulHttpClient {
    pub fn new(config: &ConsulConfig) -> Result<Self> {
        let address = config.address.trim_end_matches('/');
        let address = if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{address}")
        };
        let base_url = Url::parse(&address)
            .map_err(|e| DiscoverError::config(format!("invalid consul address {address:?}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(DiscoverError::config(format!(
                "invalid consul address {address:?}"
            )));
        }

        let http = reqwest::Client::builder()
            .timeout(config.op_timeout())
            .build()
            .map_err(|e| DiscoverError::config(format!("failed to build http client: {e}")))?;

        Ok(Self {
            http,
            base_url,
            token: config.token.clone(),
        })
    }

    fn url(&self, segments: &[&str]) -> anyhow::Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("consul address cannot be a base url"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn with_token(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header("X-Consul-Token", token),
            None => request,
        }
    }
}

#[async_trait]
impl AgentApi for ConsulHttpClient {
    async fn register_service(&self, registration: &AgentServiceRegistration) -> anyhow::Result<()> {
        let url = self.url(&["v1", "agent", "service", "register"])?;
        self.with_token(self.http.put(url))
            .json(registration)
            .send()
            .await
            .map_err(|e| anyhow!("failed to register service with consul: {e}"))?
            .error_for_status()
            .map_err(|e| anyhow!("consul rejected registration: {e}"))?;
        Ok(())
    }

    async fn deregister_service(&self, service_id: &str) -> anyhow::Result<()> {
        let url = self.url(&["v1", "agent", "service", "deregister", service_id])?;
        self.with_token(self.http.put(url))
            .send()
            .await
            .map_err(|e| anyhow!("failed to deregister service from consul: {e}"))?
            .error_for_status()
            .map_err(|e| anyhow!("consul rejected deregistration: {e}"))?;
        Ok(())
    }

    async fn healthy_service(&self, name: &str) -> anyhow::Result<Vec<ServiceEntry>> {
        let mut url = self.url(&["v1", "health", "service", name])?;
        url.query_pairs_mut().append_pair("passing", "true");
        let entries = self
            .with_token(self.http.get(url))
            .send()
            .await
            .map_err(|e| anyhow!("failed to query consul health: {e}"))?
            .error_for_status()
            .map_err(|e| anyhow!("consul health query failed: {e}"))?
            .json::<Vec<ServiceEntry>>()
            .await
            .map_err(|e| anyhow!("failed to parse consul response: {e}"))?;
        Ok(entries)
    }
}

/// Consul 服务注册发现
///
/// 本地记录的存活句柄是声明给 agent 的健康检查地址。
pub struct ConsulRegistry<A = ConsulHttpClient> {
    agent: A,
    config: ConsulConfig,
    registrations: Mutex<HashMap<String, Registration<String>>>,
}

impl ConsulRegistry<ConsulHttpClient> {
    pub fn connect(config: ConsulConfig) -> Result<Self> {
        config.validate()?;
        let agent = ConsulHttpClient::new(&config)?;
        Ok(Self::with_agent(agent, config))
    }
}

impl<A: AgentApi> ConsulRegistry<A> {
    pub fn with_agent(agent: A, config: ConsulConfig) -> Self {
        Self {
            agent,
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

    fn check_url_for(&self, address: &ServiceAddress) -> String {
        match &self.config.check_url {
            Some(url) => url.clone(),
            None => format!(
                "http://{}{}",
                ServiceAddress::new(address.host.clone(), self.config.check_port),
                self.config.check_path
            ),
        }
    }

    /// 注册并显式指定健康检查地址
    pub async fn register_with_check(
        &self,
        name: &str,
        address: &str,
        check_url: &str,
    ) -> Result<String> {
        validate_service_name(name)?;
        let parsed = ServiceAddress::parse(address)?;

        let id = new_service_id(name);
        let registration = AgentServiceRegistration {
            id: id.clone(),
            name: name.to_string(),
            address: parsed.host.clone(),
            port: parsed.port,
            check: AgentServiceCheck {
                http: check_url.to_string(),
                interval: format!("{}s", self.config.check_interval_secs),
                timeout: format!("{}s", self.config.check_timeout_secs),
                deregister_critical_service_after: format!("{}s", self.config.deregister_after_secs),
            },
        };

        self.call("register", self.agent.register_service(&registration))
            .await?;

        self.registrations.lock().await.insert(
            id.clone(),
            Registration {
                id: id.clone(),
                name: name.to_string(),
                address: address.to_string(),
                handle: check_url.to_string(),
            },
        );

        info!(
            service_name = %name,
            address = %address,
            service_id = %id,
            check = %check_url,
            "Service registered with consul"
        );
        Ok(id)
    }
}

#[async_trait]
impl<A: AgentApi> ServiceRegistry for ConsulRegistry<A> {
    fn scheme(&self) -> &'static str {
        "consul"
    }

    async fn register(&self, name: &str, address: &str) -> Result<String> {
        let parsed = ServiceAddress::parse(address)?;
        let check_url = self.check_url_for(&parsed);
        self.register_with_check(name, address, &check_url).await
    }

    async fn unregister(&self, id: &str) -> Result<()> {
        let registration = self
            .registrations
            .lock()
            .await
            .remove(id)
            .ok_or(DiscoverError::ServiceNotFound)?;

        if let Err(e) = self.call("deregister", self.agent.deregister_service(id)).await {
            // 没有续期任务，放回本地记录以便调用方重试
            self.registrations
                .lock()
                .await
                .insert(id.to_string(), registration);
            return Err(e);
        }

        info!(
            service_name = %registration.name,
            service_id = %id,
            "Service unregistered from consul"
        );
        Ok(())
    }

    async fn discover_by_name(&self, name: &str) -> Result<Vec<String>> {
        let entries = self
            .call("health_service", self.agent.healthy_service(name))
            .await?;
        if entries.is_empty() {
            return Err(DiscoverError::ServiceNotFound);
        }
        Ok(entries.iter().map(ServiceEntry::dial_address).collect())
    }

    async fn discover_by_id(&self, id: &str) -> Result<String> {
        let name = name_of(id).ok_or(DiscoverError::ServiceNotFound)?;
        let entries = self
            .call("health_service", self.agent.healthy_service(name))
            .await?;
        entries
            .iter()
            .find(|entry| entry.service.id == id)
            .map(ServiceEntry::dial_address)
            .ok_or(DiscoverError::ServiceNotFound)
    }

    async fn registered_ids(&self) -> Vec<String> {
        self.registrations.lock().await.keys().cloned().collect()
    }
}
