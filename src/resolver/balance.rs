//! tonic 负载均衡通道适配
//!
//! 解析器每次推送完整的地址集合，`Channel::balance_channel` 需要的是增量的
//! [`Change`]。[`BalanceChannelConn`] 记住已经发送过的集合，把差异转换为
//! `Remove` / `Insert` 事件。

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::Sender;
use tokio::sync::mpsc::error::TrySendError;
use tonic::transport::Endpoint;
use tonic::transport::channel::Change;
use tracing::{debug, warn};

use super::{ClientConn, ResolverState};
use crate::error::{DiscoverError, Result};

type EndpointConfig = Arc<dyn Fn(Endpoint) -> Endpoint + Send + Sync>;

/// 把解析结果转发给 tonic 负载均衡通道的 [`ClientConn`]
pub struct BalanceChannelConn {
    tx: Sender<Change<String, Endpoint>>,
    current: Mutex<BTreeSet<String>>,
    configure: EndpointConfig,
}

impl BalanceChannelConn {
    pub fn new(tx: Sender<Change<String, Endpoint>>) -> Self {
        Self {
            tx,
            current: Mutex::new(BTreeSet::new()),
            configure: Arc::new(|endpoint| endpoint),
        }
    }

    /// 对每个新建的 endpoint 应用额外配置（超时、keep-alive 等）
    pub fn with_endpoint_config<F>(mut self, configure: F) -> Self
    where
        F: Fn(Endpoint) -> Endpoint + Send + Sync + 'static,
    {
        self.configure = Arc::new(configure);
        self
    }

    /// 已经推送给通道的地址
    pub fn addresses(&self) -> Vec<String> {
        match self.current.lock() {
            Ok(current) => current.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    fn endpoint_for(&self, address: &str) -> Result<Endpoint> {
        let uri = http::Uri::builder()
            .scheme("http")
            .authority(address)
            .path_and_query("/")
            .build()
            .map_err(|e| DiscoverError::invalid_address(address, e.to_string()))?;
        Ok((self.configure)(Endpoint::from(uri)))
    }

    fn send(&self, change: Change<String, Endpoint>) -> Result<()> {
        self.tx.try_send(change).map_err(|e| match e {
            TrySendError::Full(_) => DiscoverError::StateUpdate("balance channel is full".to_string()),
            TrySendError::Closed(_) => {
                DiscoverError::StateUpdate("balance channel is closed".to_string())
            }
        })
    }
}

impl ClientConn for BalanceChannelConn {
    fn update_state(&self, state: ResolverState) -> Result<()> {
        let next: BTreeSet<String> = state.addresses.into_iter().collect();
        let mut current = self
            .current
            .lock()
            .map_err(|_| DiscoverError::StateUpdate("address set lock poisoned".to_string()))?;

        let removed: Vec<String> = current.difference(&next).cloned().collect();
        for address in removed {
            self.send(Change::Remove(address.clone()))?;
            debug!(address = %address, "Endpoint removed");
            current.remove(&address);
        }

        let added: Vec<String> = next.difference(&current).cloned().collect();
        for address in added {
            let endpoint = match self.endpoint_for(&address) {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    warn!(address = %address, error = %e, "Skipping unusable address");
                    continue;
                }
            };
            self.send(Change::Insert(address.clone(), endpoint))?;
            debug!(address = %address, "Endpoint inserted");
            current.insert(address);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn state(addresses: &[&str]) -> ResolverState {
        ResolverState::new(addresses.iter().map(|a| a.to_string()).collect())
    }

    fn describe(change: Change<String, Endpoint>) -> String {
        match change {
            Change::Insert(key, endpoint) => format!("+{key} {}", endpoint.uri()),
            Change::Remove(key) => format!("-{key}"),
        }
    }

    #[tokio::test]
    async fn full_sets_become_incremental_changes() {
        let (tx, mut rx) = mpsc::channel(16);
        let conn = BalanceChannelConn::new(tx);

        conn.update_state(state(&["10.0.0.2:9000", "10.0.0.1:9000"])).unwrap();
        assert_eq!(describe(rx.recv().await.unwrap()), "+10.0.0.1:9000 http://10.0.0.1:9000/");
        assert_eq!(describe(rx.recv().await.unwrap()), "+10.0.0.2:9000 http://10.0.0.2:9000/");

        conn.update_state(state(&["10.0.0.2:9000", "10.0.0.3:9000"])).unwrap();
        assert_eq!(describe(rx.recv().await.unwrap()), "-10.0.0.1:9000");
        assert_eq!(describe(rx.recv().await.unwrap()), "+10.0.0.3:9000 http://10.0.0.3:9000/");

        // 相同集合不产生事件
        conn.update_state(state(&["10.0.0.3:9000", "10.0.0.2:9000"])).unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(conn.addresses(), vec!["10.0.0.2:9000", "10.0.0.3:9000"]);
    }

    #[tokio::test]
    async fn unsent_changes_are_retried_next_time() {
        let (tx, mut rx) = mpsc::channel(1);
        let conn = BalanceChannelConn::new(tx);

        let err = conn
            .update_state(state(&["10.0.0.1:9000", "10.0.0.2:9000"]))
            .unwrap_err();
        assert!(matches!(err, DiscoverError::StateUpdate(_)));
        assert_eq!(conn.addresses(), vec!["10.0.0.1:9000"]);

        rx.recv().await.unwrap();
        conn.update_state(state(&["10.0.0.1:9000", "10.0.0.2:9000"])).unwrap();
        assert_eq!(describe(rx.recv().await.unwrap()), "+10.0.0.2:9000 http://10.0.0.2:9000/");
    }

    #[tokio::test]
    async fn invalid_addresses_are_skipped() {
        let (tx, mut rx) = mpsc::channel(16);
        let conn = BalanceChannelConn::new(tx)
            .with_endpoint_config(|endpoint| endpoint.connect_timeout(Duration::from_secs(1)));

        conn.update_state(state(&["bad address", "10.0.0.1:9000"])).unwrap();
        assert_eq!(describe(rx.recv().await.unwrap()), "+10.0.0.1:9000 http://10.0.0.1:9000/");
        assert!(rx.try_recv().is_err());
        assert_eq!(conn.addresses(), vec!["10.0.0.1:9000"]);
    }

    #[tokio::test]
    async fn closed_channel_is_reported() {
        let (tx, rx) = mpsc::channel(16);
        drop(rx);
        let conn = BalanceChannelConn::new(tx);
        assert!(conn.update_state(state(&["10.0.0.1:9000"])).is_err());
        assert!(conn.addresses().is_empty());
    }
}
