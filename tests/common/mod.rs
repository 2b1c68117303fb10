//! 集成测试共用的内存后端
//!
//! 过期时间使用 `tokio::time::Instant`，配合 `start_paused` 可以精确推进时间。

#![allow(dead_code)]

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use grpc_discover::registry::consul::{
    AgentApi, AgentService, AgentServiceRegistration, ServiceEntry, ServiceNode,
};
use grpc_discover::registry::{LeaseKeepAlive, LeaseKv, TtlCache};

/// 可以整体打开/关闭的故障开关
#[derive(Clone, Default)]
pub struct Switch(Arc<AtomicBool>);

impl Switch {
    pub fn on(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn off(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_on(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ===== etcd =====

struct Lease {
    ttl: i64,
    deadline: Instant,
}

#[derive(Default)]
struct EtcdState {
    next_lease: i64,
    leases: HashMap<i64, Lease>,
    kvs: BTreeMap<String, (String, i64)>,
}

impl EtcdState {
    fn purge_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<i64> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.revoke(id);
        }
    }

    fn revoke(&mut self, lease_id: i64) -> bool {
        let existed = self.leases.remove(&lease_id).is_some();
        self.kvs.retain(|_, (_, lease)| *lease != lease_id);
        existed
    }
}

/// 带租约语义的内存 KV
#[derive(Clone, Default)]
pub struct FakeLeaseKv {
    state: Arc<Mutex<EtcdState>>,
    /// 所有请求失败
    pub unavailable: Switch,
    /// keep-alive 流报错，租约不再续期
    pub break_keep_alive: Switch,
    /// 只有带租约的写入失败
    pub fail_put: Switch,
    /// 只有打开 keep-alive 流失败
    pub fail_keep_alive: Switch,
    keep_alive_opens: Arc<AtomicUsize>,
}

impl FakeLeaseKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.unavailable.is_on() {
            bail!("etcd unavailable");
        }
        Ok(())
    }

    pub fn key_count(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        state.purge_expired();
        state.kvs.len()
    }

    pub fn lease_count(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        state.purge_expired();
        state.leases.len()
    }

    /// keep-alive 流被成功打开的次数
    pub fn keep_alive_opens(&self) -> usize {
        self.keep_alive_opens.load(Ordering::SeqCst)
    }
}

struct FakeKeepAlive {
    kv: FakeLeaseKv,
    lease_id: i64,
}

#[async_trait]
impl LeaseKeepAlive for FakeKeepAlive {
    async fn renew(&mut self) -> anyhow::Result<i64> {
        if self.kv.break_keep_alive.is_on() {
            bail!("keep-alive stream closed");
        }
        self.kv.check()?;
        let mut state = self.kv.state.lock().unwrap();
        state.purge_expired();
        match state.leases.get_mut(&self.lease_id) {
            Some(lease) => {
                lease.deadline = Instant::now() + Duration::from_secs(lease.ttl as u64);
                Ok(lease.ttl)
            }
            None => Ok(0),
        }
    }
}

#[async_trait]
impl LeaseKv for FakeLeaseKv {
    async fn grant(&self, ttl: i64) -> anyhow::Result<i64> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        state.next_lease += 1;
        let id = state.next_lease;
        state.leases.insert(
            id,
            Lease {
                ttl,
                deadline: Instant::now() + Duration::from_secs(ttl as u64),
            },
        );
        Ok(id)
    }

    async fn put_with_lease(&self, key: &str, value: &str, lease_id: i64) -> anyhow::Result<()> {
        self.check()?;
        if self.fail_put.is_on() {
            bail!("etcdserver: request timed out");
        }
        let mut state = self.state.lock().unwrap();
        state.purge_expired();
        if !state.leases.contains_key(&lease_id) {
            bail!("requested lease not found");
        }
        state
            .kvs
            .insert(key.to_string(), (value.to_string(), lease_id));
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Vec<String>> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        state.purge_expired();
        Ok(state.kvs.get(key).map(|(v, _)| v.clone()).into_iter().collect())
    }

    async fn get_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, String)>> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        state.purge_expired();
        Ok(state
            .kvs
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, (v, _))| (k.clone(), v.clone()))
            .collect())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.check()?;
        self.state.lock().unwrap().kvs.remove(key);
        Ok(())
    }

    async fn revoke(&self, lease_id: i64) -> anyhow::Result<()> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        state.purge_expired();
        if !state.revoke(lease_id) {
            bail!("requested lease not found");
        }
        Ok(())
    }

    async fn keep_alive(&self, lease_id: i64) -> anyhow::Result<Box<dyn LeaseKeepAlive>> {
        self.check()?;
        if self.fail_keep_alive.is_on() {
            bail!("failed to open keep-alive stream");
        }
        self.keep_alive_opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeKeepAlive {
            kv: self.clone(),
            lease_id,
        }))
    }
}

// ===== redis =====

/// 带过期时间的内存缓存，`KEYS` 只支持前缀 glob
#[derive(Clone, Default)]
pub struct FakeTtlCache {
    entries: Arc<Mutex<HashMap<String, (String, Instant)>>>,
    pub unavailable: Switch,
    /// 写入失败，用于模拟续期中断
    pub reject_writes: Switch,
}

impl FakeTtlCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.unavailable.is_on() {
            bail!("redis unavailable");
        }
        Ok(())
    }

    pub fn key_count(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, (_, deadline)| *deadline > now);
        entries.len()
    }
}

/// 把 `escaped-prefix*` 还原为字面前缀
fn literal_prefix(pattern: &str) -> anyhow::Result<String> {
    let body = pattern
        .strip_suffix('*')
        .ok_or_else(|| anyhow!("unsupported pattern {pattern:?}"))?;
    let mut prefix = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => prefix.extend(chars.next()),
            '*' | '?' | '[' => bail!("unsupported pattern {pattern:?}"),
            c => prefix.push(c),
        }
    }
    Ok(prefix)
}

#[async_trait]
impl TtlCache for FakeTtlCache {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        self.check()?;
        if self.reject_writes.is_on() {
            bail!("READONLY You can't write against a read only replica");
        }
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        self.check()?;
        let now = Instant::now();
        Ok(self
            .entries
            .lock()
            .unwrap()
            .get(key)
            .filter(|(_, deadline)| *deadline > now)
            .map(|(value, _)| value.clone()))
    }

    async fn del(&self, key: &str) -> anyhow::Result<()> {
        self.check()?;
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> anyhow::Result<Vec<String>> {
        self.check()?;
        let prefix = literal_prefix(pattern)?;
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, (_, deadline))| key.starts_with(&prefix) && *deadline > now)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

// ===== consul =====

#[derive(Default)]
struct AgentState {
    services: BTreeMap<String, AgentServiceRegistration>,
    critical: HashSet<String>,
}

/// 内存 Consul agent，健康检查结果由测试直接设置
#[derive(Clone, Default)]
pub struct FakeAgent {
    state: Arc<Mutex<AgentState>>,
    pub unavailable: Switch,
}

impl FakeAgent {
    pub fn new() -> Self {
        Self::default()
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.unavailable.is_on() {
            bail!("consul agent unavailable");
        }
        Ok(())
    }

    /// 模拟健康检查失败
    pub fn mark_critical(&self, service_id: &str) {
        self.state
            .lock()
            .unwrap()
            .critical
            .insert(service_id.to_string());
    }

    pub fn registration(&self, service_id: &str) -> Option<AgentServiceRegistration> {
        self.state.lock().unwrap().services.get(service_id).cloned()
    }

    pub fn service_count(&self) -> usize {
        self.state.lock().unwrap().services.len()
    }
}

#[async_trait]
impl AgentApi for FakeAgent {
    async fn register_service(&self, registration: &AgentServiceRegistration) -> anyhow::Result<()> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        state.critical.remove(&registration.id);
        state
            .services
            .insert(registration.id.clone(), registration.clone());
        Ok(())
    }

    async fn deregister_service(&self, service_id: &str) -> anyhow::Result<()> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        if state.services.remove(service_id).is_none() {
            bail!("unknown service ID {service_id:?}");
        }
        state.critical.remove(service_id);
        Ok(())
    }

    async fn healthy_service(&self, name: &str) -> anyhow::Result<Vec<ServiceEntry>> {
        self.check()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .services
            .values()
            .filter(|r| r.name == name && !state.critical.contains(&r.id))
            .map(|r| ServiceEntry {
                node: Some(ServiceNode {
                    address: "192.168.0.1".to_string(),
                }),
                service: AgentService {
                    id: r.id.clone(),
                    service: r.name.clone(),
                    address: r.address.clone(),
                    port: r.port,
                },
            })
            .collect())
    }
}
