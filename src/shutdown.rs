use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, info, warn};

struct ShutdownInner {
    sender: broadcast::Sender<()>,
    triggered: AtomicBool,
}

/// 优雅关闭管理器
///
/// 所有后台任务订阅同一个广播通道，触发一次后后续订阅者立即收到信号。
#[derive(Clone)]
pub struct ShutdownManager {
    inner: Arc<ShutdownInner>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(ShutdownInner {
                sender,
                triggered: AtomicBool::new(false),
            }),
        }
    }

    /// 订阅关闭信号
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        let receiver = self.inner.sender.subscribe();
        if !self.inner.triggered.load(Ordering::SeqCst) {
            return receiver;
        }

        let (sender, receiver) = broadcast::channel(1);
        let _ = sender.send(());
        receiver
    }

    /// 触发关闭，只有第一次调用会广播信号
    pub fn shutdown(&self) -> bool {
        if self.inner.triggered.swap(true, Ordering::SeqCst) {
            debug!("关闭信号已经发送过");
            return false;
        }

        let receivers = self.inner.sender.send(()).unwrap_or(0);
        info!("关闭信号已发送给 {receivers} 个订阅者");
        true
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// 在限定时间内等待关闭步骤完成，超时返回false
    pub async fn wait_with_timeout<F>(&self, step: &str, limit: Duration, future: F) -> bool
    where
        F: Future<Output = ()>,
    {
        match timeout(limit, future).await {
            Ok(()) => {
                debug!("{step} 已完成");
                true
            }
            Err(_) => {
                warn!("{step} 超时（{}秒），继续关闭流程", limit.as_secs());
                false
            }
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}
