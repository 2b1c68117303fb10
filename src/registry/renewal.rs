//! 后台续期任务
//!
//! 每个需要客户端续期的注册记录持有一个长期运行的任务：按固定间隔醒来做一次续期，
//! 失败只记录日志，下一次照常重试。注销时通过取消令牌通知任务退出并等待其结束。

use async_trait::async_trait;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 一次续期动作
#[async_trait]
pub trait Renewer: Send + 'static {
    async fn renew(&mut self) -> anyhow::Result<()>;
}

/// 可取消的续期任务句柄
#[derive(Debug)]
pub struct RenewalTask {
    service_id: String,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl RenewalTask {
    /// 启动续期任务，第一次续期在一个间隔之后
    pub fn spawn<R: Renewer>(service_id: impl Into<String>, period: Duration, mut renewer: R) -> Self {
        let service_id = service_id.into();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task_id = service_id.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = renewer.renew().await {
                            warn!(service_id = %task_id, error = %format!("{e:#}"), "Liveness renewal failed");
                        }
                    }
                }
            }
            debug!(service_id = %task_id, "Renewal task stopped");
        });

        Self {
            service_id,
            cancel,
            handle: Some(handle),
        }
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    /// 通知任务退出并等待它结束
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    warn!(service_id = %self.service_id, "Renewal task panicked");
                }
            }
        }
    }
}

impl Drop for RenewalTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Renewer for Counting {
        async fn renew(&mut self) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("store unavailable");
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn renews_on_each_period() {
        let calls = Arc::new(AtomicUsize::new(0));
        let task = RenewalTask::spawn(
            "svc-1",
            Duration::from_secs(3),
            Counting { calls: calls.clone(), fail: false },
        );

        tokio::time::sleep(Duration::from_millis(9500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        task.stop().await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_do_not_stop_the_loop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let task = RenewalTask::spawn(
            "svc-2",
            Duration::from_secs(1),
            Counting { calls: calls.clone(), fail: true },
        );

        tokio::time::sleep(Duration::from_millis(5500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(!task.is_finished());
        task.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_joins_the_task() {
        let calls = Arc::new(AtomicUsize::new(0));
        let task = RenewalTask::spawn(
            "svc-3",
            Duration::from_secs(1),
            Counting { calls, fail: false },
        );
        assert_eq!(task.service_id(), "svc-3");
        task.stop().await;
    }
}
