//! 单节点分布式锁
//!
//! 基于 Redis SET NX EX 实现带租约的互斥锁：加锁写入本实例唯一的
//! token，续约与释放通过 Lua 脚本原子校验 token 后再变更，
//! 保证过期后被其他实例重新获取的锁不会被旧持有者干扰。
//!
//! 未显式指定租约时自动开启看门狗模式，由后台任务周期性续约，
//! 长时间持有锁的调用方不会因租约到期而失去锁。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::config::{LockConfig, LockOptions, BLOCK_POLL_INTERVAL};
use crate::error::{LockError, Result};
use crate::store::{StoreClient, LUA_CHECK_AND_DELETE, LUA_CHECK_AND_EXPIRE};
use crate::watchdog::Watchdog;

/// 将存储调用与调用方的取消信号竞争，取消优先
pub(crate) async fn with_cancel<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(LockError::Cancelled),
        result = fut => result,
    }
}

/// 单节点分布式锁
///
/// 每个实例持有独立生成的 token 作为所有权凭证，同一 key 上的
/// 两个实例永远不会共享 token。实例可以跨任务共享（内部为 Arc），
/// 但典型用法是一次加锁、一次释放的单持有者生命周期。
pub struct RedisLock {
    inner: Arc<LockInner>,
}

pub(crate) struct LockInner {
    pub(crate) key: String,
    pub(crate) token: String,
    pub(crate) config: LockConfig,
    pub(crate) client: Arc<dyn StoreClient>,
    pub(crate) watchdog: Watchdog,
}

impl RedisLock {
    /// 创建锁实例
    ///
    /// token 由进程 id 与 UUIDv4 组合生成，保证每个实例唯一。
    pub fn new(key: impl Into<String>, client: Arc<dyn StoreClient>, options: LockOptions) -> Self {
        Self {
            inner: Arc::new(LockInner {
                key: key.into(),
                token: format!("{}:{}", std::process::id(), Uuid::new_v4()),
                config: options.repair(),
                client,
                watchdog: Watchdog::new(),
            }),
        }
    }

    /// 锁的 key（不含命名空间前缀）
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// 本实例的所有权 token
    pub fn token(&self) -> &str {
        &self.inner.token
    }

    /// 获取锁
    ///
    /// 首先尝试一次原子的 SET NX EX；key 已被占用时返回
    /// [`LockError::Contention`]。配置为阻塞模式时进入轮询重试，
    /// 直到成功、等待预算耗尽或取消信号触发。存储层故障立即返回，
    /// 不做任何重试。
    ///
    /// 成功后若处于看门狗模式，则启动后台续约任务。
    #[instrument(skip(self, cancel), fields(key = %self.inner.key, token = %self.inner.token))]
    pub async fn lock(&self, cancel: &CancellationToken) -> Result<()> {
        let result = self.acquire(cancel).await;

        if result.is_ok() && self.inner.config.watchdog_enabled {
            self.inner.watchdog.start(self.inner.clone(), cancel);
        }

        result
    }

    async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        match with_cancel(cancel, self.inner.try_acquire()).await {
            Ok(()) => return Ok(()),
            Err(err) if self.inner.config.blocking && err.is_retryable() => {}
            Err(err) => return Err(err),
        }

        self.blocking_acquire(cancel).await
    }

    /// 阻塞重试：固定短间隔轮询，直到成功 / 取消 / 等待预算耗尽 /
    /// 存储层故障。每次发起存储调用之前先响应取消信号。
    async fn blocking_acquire(&self, cancel: &CancellationToken) -> Result<()> {
        let wait_budget = tokio::time::sleep(self.inner.config.block_wait);
        tokio::pin!(wait_budget);

        let mut poll = tokio::time::interval(BLOCK_POLL_INTERVAL);
        // interval 的首个 tick 立即完成，而首次尝试已经失败过，消费掉
        poll.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("blocking acquire cancelled by caller");
                    return Err(LockError::Cancelled);
                }
                _ = &mut wait_budget => {
                    debug!("blocking acquire wait budget exhausted");
                    return Err(LockError::WaitTimeout {
                        key: self.inner.key.clone(),
                    });
                }
                _ = poll.tick() => {}
            }

            match with_cancel(cancel, self.inner.try_acquire()).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// 手动续约：将租约延长至 `ttl`
    ///
    /// 通常由看门狗在后台调用，也可由调用方手动续约。
    /// 存储值与本实例 token 不符（租约已过期、可能已被他人重新获取）
    /// 时返回 [`LockError::NotOwner`]，且不产生任何变更。
    #[instrument(skip(self, cancel), fields(key = %self.inner.key))]
    pub async fn delay_expire(&self, cancel: &CancellationToken, ttl: Duration) -> Result<()> {
        with_cancel(cancel, self.inner.renew(ttl)).await
    }

    /// 释放锁
    ///
    /// 先停止看门狗（发出取消信号，不等待其当前休眠结束），
    /// 再通过 Lua 脚本原子校验 token 并删除 key。token 不符时
    /// 返回 [`LockError::NotOwner`]，绝不删除他人的租约。
    #[instrument(skip(self, cancel), fields(key = %self.inner.key, token = %self.inner.token))]
    pub async fn unlock(&self, cancel: &CancellationToken) -> Result<()> {
        self.inner.watchdog.stop();
        with_cancel(cancel, self.inner.release()).await
    }
}

impl LockInner {
    /// 带命名空间前缀的存储 key
    pub(crate) fn lock_key(&self) -> String {
        format!("{}{}", self.config.key_prefix, self.key)
    }

    async fn try_acquire(&self) -> Result<()> {
        let was_set = self
            .client
            .set_nx_ex(&self.lock_key(), &self.token, self.config.lease)
            .await?;

        if !was_set {
            return Err(LockError::Contention {
                key: self.key.clone(),
            });
        }

        debug!(key = %self.key, "lock acquired");
        Ok(())
    }

    pub(crate) async fn renew(&self, ttl: Duration) -> Result<()> {
        let reply = self
            .client
            .eval(
                LUA_CHECK_AND_EXPIRE,
                &self.lock_key(),
                vec![self.token.clone(), ttl.as_secs().to_string()],
            )
            .await?;

        if reply != 1 {
            return Err(LockError::NotOwner {
                key: self.key.clone(),
            });
        }

        debug!(key = %self.key, ttl_secs = ttl.as_secs(), "lease renewed");
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        let reply = self
            .client
            .eval(
                LUA_CHECK_AND_DELETE,
                &self.lock_key(),
                vec![self.token.clone()],
            )
            .await?;

        if reply != 1 {
            return Err(LockError::NotOwner {
                key: self.key.clone(),
            });
        }

        debug!(key = %self.key, "lock released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MockStoreClient;

    fn nonblocking_options() -> LockOptions {
        LockOptions {
            lease: Some(Duration::from_secs(10)),
            ..LockOptions::default()
        }
    }

    #[test]
    fn test_tokens_are_unique_per_instance() {
        let client: Arc<dyn StoreClient> = Arc::new(MockStoreClient::new());
        let lock1 = RedisLock::new("same_key", client.clone(), nonblocking_options());
        let lock2 = RedisLock::new("same_key", client, nonblocking_options());

        assert_ne!(lock1.token(), lock2.token());
        // token 以进程 id 开头
        let pid = std::process::id().to_string();
        assert!(lock1.token().starts_with(&pid));
    }

    #[test]
    fn test_lock_key_carries_prefix() {
        let client: Arc<dyn StoreClient> = Arc::new(MockStoreClient::new());
        let lock = RedisLock::new("order:42", client, nonblocking_options());

        assert_eq!(lock.inner.lock_key(), "distlock:order:42");
    }

    #[tokio::test]
    async fn test_occupied_key_returns_contention_without_blocking() {
        let mut mock = MockStoreClient::new();
        mock.expect_set_nx_ex().times(1).returning(|_, _, _| Ok(false));

        let lock = RedisLock::new("k", Arc::new(mock), nonblocking_options());
        let err = lock.lock(&CancellationToken::new()).await.unwrap_err();

        assert_eq!(err.code(), "LOCK_CONTENTION");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_store_failure_aborts_blocking_retry() {
        let mut mock = MockStoreClient::new();
        // 即使配置为阻塞模式，存储层故障也必须立即返回，不能重试
        mock.expect_set_nx_ex().times(1).returning(|_, _, _| {
            Err(LockError::Store(redis::RedisError::from((
                redis::ErrorKind::Io,
                "connection refused",
            ))))
        });

        let options = LockOptions {
            blocking: true,
            block_wait: Duration::from_secs(5),
            lease: Some(Duration::from_secs(10)),
            ..LockOptions::default()
        };
        let lock = RedisLock::new("k", Arc::new(mock), options);
        let err = lock.lock(&CancellationToken::new()).await.unwrap_err();

        assert_eq!(err.code(), "STORE_ERROR");
    }

    #[tokio::test]
    async fn test_pre_cancelled_token_short_circuits() {
        // 已取消的 token 在发起存储调用之前生效，mock 不设置任何期望
        let mock = MockStoreClient::new();
        let lock = RedisLock::new("k", Arc::new(mock), nonblocking_options());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = lock.lock(&cancel).await.unwrap_err();

        assert_eq!(err.code(), "CANCELLED");
    }

    #[tokio::test]
    async fn test_unlock_without_ownership_fails() {
        let mut mock = MockStoreClient::new();
        // 脚本返回 0 表示存储值与 token 不符
        mock.expect_eval().times(1).returning(|_, _, _| Ok(0));

        let lock = RedisLock::new("k", Arc::new(mock), nonblocking_options());
        let err = lock.unlock(&CancellationToken::new()).await.unwrap_err();

        assert_eq!(err.code(), "NOT_OWNER");
    }

    #[tokio::test]
    async fn test_delay_expire_without_ownership_fails() {
        let mut mock = MockStoreClient::new();
        mock.expect_eval().times(1).returning(|_, _, _| Ok(0));

        let lock = RedisLock::new("k", Arc::new(mock), nonblocking_options());
        let err = lock
            .delay_expire(&CancellationToken::new(), Duration::from_secs(15))
            .await
            .unwrap_err();

        assert_eq!(err.code(), "NOT_OWNER");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlock_abandons_inflight_renewal() {
        let store = Arc::new(crate::test_utils::MemoryStore::new());
        let cancel = CancellationToken::new();

        let lock = RedisLock::new("job", store.clone(), LockOptions::default());
        lock.lock(&cancel).await.unwrap();
        assert!(lock.inner.watchdog.is_running());

        // 10s 处的续约卡在一个极慢的存储调用上
        store.set_latency(Duration::from_secs(1000));
        tokio::time::sleep(Duration::from_secs(11)).await;
        store.set_latency(Duration::ZERO);

        // 释放必须立即终止看门狗，不等待在途续约返回
        lock.unlock(&cancel).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!lock.inner.watchdog.is_running());
    }

    #[tokio::test]
    async fn test_explicit_lease_does_not_start_watchdog() {
        let mut mock = MockStoreClient::new();
        mock.expect_set_nx_ex().times(1).returning(|_, _, _| Ok(true));
        // 看门狗若被启动会周期性调用 eval，这里不设置 eval 期望，
        // 任何续约调用都会使测试失败
        mock.expect_eval().times(0);

        let lock = RedisLock::new("k", Arc::new(mock), nonblocking_options());
        lock.lock(&CancellationToken::new()).await.unwrap();

        assert!(!lock.inner.watchdog.is_running());
    }
}
