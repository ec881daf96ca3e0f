use async_trait::async_trait;

use crate::WorkerResult;

/// 一次准入尝试的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowAdmission {
    pub allowed: bool,
    /// 尝试之后窗口内的记录数
    pub count: u64,
}

/// 滑动窗口存储
///
/// 实现必须保证 `try_acquire` 的剪枝、计数和有条件记录在存储端作为一个原子单元执行。
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// 删除 `window_start_ms` 及更早的记录，若剩余数量小于 `limit` 则以 `now_ms` 为分数记录 `member`
    async fn try_acquire(
        &self,
        key: &str,
        now_ms: i64,
        window_start_ms: i64,
        limit: u32,
        member: &str,
        ttl_seconds: u64,
    ) -> WorkerResult<WindowAdmission>;

    /// 剪枝后返回窗口内的记录数
    async fn window_count(&self, key: &str, window_start_ms: i64) -> WorkerResult<u64>;

    async fn clear(&self, key: &str) -> WorkerResult<()>;

    async fn ping(&self) -> WorkerResult<()>;
}
