//! 进程生命周期钩子
//!
//! [`Lifecycle`] 保存一组具名的清理回调。第一次收到中断/终止类信号时按注册顺序执行
//! 全部回调，之后退出进程；重启类信号（SIGHUP）直接退出，不执行回调。
//! 回调最多执行一次，无论信号到达多少次。
//!
//! 测试可以直接调用 [`Lifecycle::trigger`] 模拟关闭，不需要发送真实的系统信号。

use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{info, warn};

/// 触发关闭的信号
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGINT / Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
    /// SIGQUIT
    Quit,
    /// SIGHUP
    Hangup,
}

impl ShutdownSignal {
    /// 该信号是否需要执行清理回调
    pub fn runs_cleanup(&self) -> bool {
        !matches!(self, ShutdownSignal::Hangup)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownSignal::Interrupt => "SIGINT",
            ShutdownSignal::Terminate => "SIGTERM",
            ShutdownSignal::Quit => "SIGQUIT",
            ShutdownSignal::Hangup => "SIGHUP",
        }
    }
}

type Cleanup = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct Hook {
    name: String,
    cleanup: Cleanup,
}

#[derive(Default)]
struct Inner {
    hooks: Mutex<Vec<Hook>>,
    fired: AtomicBool,
    listening: AtomicBool,
}

/// 可注入的生命周期注册表
#[derive(Clone, Default)]
pub struct Lifecycle {
    inner: Arc<Inner>,
}

static GLOBAL: OnceLock<Lifecycle> = OnceLock::new();

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// 进程级实例，`AutoUnRegister` 默认使用它
    pub fn global() -> &'static Lifecycle {
        GLOBAL.get_or_init(Lifecycle::new)
    }

    /// 注册一个具名清理回调
    ///
    /// 返回回调是否被接受；已经触发过之后再注册的回调不会被执行。
    pub fn on_terminate<F, Fut>(&self, name: impl Into<String>, cleanup: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        // 触发标记与回调列表在同一把锁下读写
        let mut hooks = self.lock_hooks();
        if self.is_fired() {
            warn!(hook = %name, "Lifecycle already triggered, cleanup hook ignored");
            return false;
        }
        hooks.push(Hook {
            name,
            cleanup: Box::new(move || -> BoxFuture<'static, ()> { Box::pin(cleanup()) }),
        });
        true
    }

    /// 已注册且尚未执行的回调名称
    pub fn hook_names(&self) -> Vec<String> {
        self.lock_hooks().iter().map(|h| h.name.clone()).collect()
    }

    pub fn is_fired(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    /// 处理一个关闭信号
    ///
    /// 只有第一次调用会生效；返回本次调用是否执行了触发。
    /// 对 [`ShutdownSignal::Hangup`] 不执行回调，但同样视为已触发。
    pub async fn trigger(&self, signal: ShutdownSignal) -> bool {
        let hooks = {
            let mut hooks = self.lock_hooks();
            if self.inner.fired.swap(true, Ordering::SeqCst) {
                return false;
            }
            std::mem::take(&mut *hooks)
        };
        if !signal.runs_cleanup() {
            info!(signal = signal.as_str(), skipped = hooks.len(), "Shutdown without cleanup");
            return true;
        }

        info!(signal = signal.as_str(), hooks = hooks.len(), "Running shutdown cleanup");
        for hook in hooks {
            info!(hook = %hook.name, "Running cleanup hook");
            (hook.cleanup)().await;
        }
        true
    }

    /// 启动系统信号监听任务（每个实例只会启动一次）
    ///
    /// 信号处理器在返回前安装完成，之后收到信号时执行 [`trigger`](Self::trigger)，
    /// 然后以状态码 0 退出进程。需要在 tokio 运行时中调用。
    pub fn listen(&self) {
        if self.inner.listening.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut listener = match SignalListener::install() {
            Ok(listener) => listener,
            Err(e) => {
                warn!(error = %e, "Failed to install signal handlers");
                self.inner.listening.store(false, Ordering::SeqCst);
                return;
            }
        };

        let lifecycle = self.clone();
        tokio::spawn(async move {
            let signal = listener.recv().await;
            info!(signal = signal.as_str(), "Shutdown signal received");
            lifecycle.trigger(signal).await;
            std::process::exit(0);
        });
    }

    fn lock_hooks(&self) -> std::sync::MutexGuard<'_, Vec<Hook>> {
        // 回调只在锁外执行，锁中毒时内容仍然有效
        self.inner
            .hooks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// 已安装的关闭信号处理器
#[cfg(unix)]
pub struct SignalListener {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    quit: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl SignalListener {
    /// 同步安装处理器，返回后这些信号不再走默认动作
    pub fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            quit: signal(SignalKind::quit())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }

    /// 等待下一个关闭信号
    pub async fn recv(&mut self) -> ShutdownSignal {
        tokio::select! {
            _ = self.interrupt.recv() => ShutdownSignal::Interrupt,
            _ = self.terminate.recv() => ShutdownSignal::Terminate,
            _ = self.quit.recv() => ShutdownSignal::Quit,
            _ = self.hangup.recv() => ShutdownSignal::Hangup,
        }
    }
}

/// 已安装的关闭信号处理器
#[cfg(not(unix))]
pub struct SignalListener {
    ctrl_c: tokio::signal::windows::CtrlC,
}

#[cfg(not(unix))]
impl SignalListener {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            ctrl_c: tokio::signal::windows::ctrl_c()?,
        })
    }

    pub async fn recv(&mut self) -> ShutdownSignal {
        self.ctrl_c.recv().await;
        ShutdownSignal::Interrupt
    }
}
