use analysis_core::{RateLimitStore, WindowAdmission, WorkerError, WorkerResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// 进程内滑动窗口存储
///
/// 每次操作都在同一把锁内完成剪枝、计数和记录，与Redis脚本的原子性一致。
/// 用于测试和单实例部署。
#[derive(Debug, Default)]
pub struct InMemoryRateLimitStore {
    windows: Mutex<HashMap<String, Vec<(i64, String)>>>,
    unavailable: AtomicBool,
}

impl InMemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟存储不可用，之后的所有操作返回错误
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// 窗口内的原始记录数（不剪枝）
    pub fn raw_len(&self, key: &str) -> usize {
        self.lock().get(key).map_or(0, Vec::len)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<(i64, String)>>> {
        self.windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self) -> WorkerResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(WorkerError::RateLimitStore("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn try_acquire(
        &self,
        key: &str,
        now_ms: i64,
        window_start_ms: i64,
        limit: u32,
        member: &str,
        _ttl_seconds: u64,
    ) -> WorkerResult<WindowAdmission> {
        self.check_available()?;

        let mut windows = self.lock();
        let entries = windows.entry(key.to_string()).or_default();
        entries.retain(|(score, _)| *score > window_start_ms);

        let count = entries.len() as u64;
        if count < u64::from(limit) {
            entries.push((now_ms, member.to_string()));
            return Ok(WindowAdmission {
                allowed: true,
                count: count + 1,
            });
        }

        Ok(WindowAdmission {
            allowed: false,
            count,
        })
    }

    async fn window_count(&self, key: &str, window_start_ms: i64) -> WorkerResult<u64> {
        self.check_available()?;

        let mut windows = self.lock();
        let Some(entries) = windows.get_mut(key) else {
            return Ok(0);
        };
        entries.retain(|(score, _)| *score > window_start_ms);
        Ok(entries.len() as u64)
    }

    async fn clear(&self, key: &str) -> WorkerResult<()> {
        self.check_available()?;
        self.lock().remove(key);
        Ok(())
    }

    async fn ping(&self) -> WorkerResult<()> {
        self.check_available()
    }
}
