//! 多数派锁（RedLock 变体）
//!
//! 在 N 个相互独立的存储节点上协调 N 个单节点锁：逐个节点尝试
//! 加锁并测量耗时，只有在单节点耗时上限内成功的节点才计入多数派。
//! 有效成功数达到严格多数（N/2 + 1）才算加锁成功，否则对所有
//! 节点做尽力而为的回滚。个别节点故障或变慢不影响整体可用性。

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::{LockOptions, NodeConfig, QuorumOptions};
use crate::error::{LockError, Result};
use crate::lock::RedisLock;
use crate::store::{RedisStore, StoreClient};

/// 多数派锁
///
/// 各节点锁共享同一逻辑 key，但 token 与租约相互独立。节点锁
/// 统一使用多数派配置中的租约并保持非阻塞，单节点的看门狗不参与。
pub struct QuorumLock {
    locks: Vec<RedisLock>,
    options: QuorumOptions,
}

impl std::fmt::Debug for QuorumLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuorumLock")
            .field("nodes", &self.locks.len())
            .field("options", &self.options)
            .finish()
    }
}

impl QuorumLock {
    /// 按节点连接描述创建多数派锁
    ///
    /// 构造期完成全部校验（节点数、耗时上限与租约的比例），
    /// 不发起任何网络调用。
    pub fn new(
        key: impl Into<String>,
        nodes: &[NodeConfig],
        options: QuorumOptions,
    ) -> Result<Self> {
        options.validate(nodes.len())?;

        let mut clients: Vec<Arc<dyn StoreClient>> = Vec::with_capacity(nodes.len());
        for node in nodes {
            clients.push(Arc::new(RedisStore::new(&node.url)?));
        }
        Self::with_clients(key, clients, options)
    }

    /// 用已有的存储客户端创建多数派锁
    ///
    /// 供依赖注入与测试使用，每个客户端必须绑定一个独立节点。
    pub fn with_clients(
        key: impl Into<String>,
        clients: Vec<Arc<dyn StoreClient>>,
        options: QuorumOptions,
    ) -> Result<Self> {
        options.validate(clients.len())?;

        let key = key.into();
        let locks = clients
            .into_iter()
            .map(|client| {
                RedisLock::new(
                    key.clone(),
                    client,
                    LockOptions {
                        lease: Some(options.lease),
                        blocking: false,
                        ..LockOptions::default()
                    },
                )
            })
            .collect();

        Ok(Self { locks, options })
    }

    /// 达成多数派所需的有效成功数（严格多数）
    fn required(&self) -> usize {
        self.locks.len() / 2 + 1
    }

    /// 获取多数派锁
    ///
    /// 逐个节点加锁并测量单节点耗时。成功但超过耗时上限的节点
    /// 不计入多数派——慢节点的授予相对整体租约预算可能已经陈旧。
    /// 未达多数时回滚所有节点并返回聚合的
    /// [`LockError::QuorumNotReached`]，不携带单节点明细。
    #[instrument(skip(self, cancel), fields(nodes = self.locks.len()))]
    pub async fn lock(&self, cancel: &CancellationToken) -> Result<()> {
        let mut granted = 0usize;

        for (index, lock) in self.locks.iter().enumerate() {
            let started = tokio::time::Instant::now();
            let result = lock.lock(cancel).await;
            let elapsed = started.elapsed();

            match result {
                Ok(()) if elapsed <= self.options.single_node_timeout => {
                    granted += 1;
                }
                Ok(()) => {
                    // 节点确实授予了锁，但因超时被折价；释放阶段仍会清理
                    warn!(
                        node = index,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "node granted lock too slowly, discounted from quorum"
                    );
                }
                Err(LockError::Cancelled) => {
                    // 取消必须原样上报，不能伪装成多数派失败；
                    // 调用方的 token 已经失效，回滚使用新的 token
                    debug!(node = index, "quorum acquisition cancelled by caller");
                    self.release_all(&CancellationToken::new()).await;
                    return Err(LockError::Cancelled);
                }
                Err(err) => {
                    debug!(node = index, error = %err, "node lock attempt failed");
                }
            }
        }

        let required = self.required();
        if granted < required {
            // 被折价或已授予的节点也必须清理，部分释放仍好于全部滞留
            self.release_all(cancel).await;
            return Err(LockError::QuorumNotReached { granted, required });
        }

        debug!(granted, required, "quorum lock acquired");
        Ok(())
    }

    /// 释放多数派锁
    ///
    /// 无条件对每个节点发起释放——被折价的节点可能也持有授予，
    /// 必须清理。记录遇到的最后一个错误，但不会因此跳过任何节点。
    #[instrument(skip(self, cancel), fields(nodes = self.locks.len()))]
    pub async fn unlock(&self, cancel: &CancellationToken) -> Result<()> {
        let mut last_err = None;

        for (index, lock) in self.locks.iter().enumerate() {
            if let Err(err) = lock.unlock(cancel).await {
                debug!(node = index, error = %err, "node unlock failed");
                last_err = Some(err);
            }
        }

        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// 加锁失败后的尽力而为回滚，错误只记录不传播
    async fn release_all(&self, cancel: &CancellationToken) {
        for (index, lock) in self.locks.iter().enumerate() {
            if let Err(err) = lock.unlock(cancel).await {
                debug!(node = index, error = %err, "rollback unlock failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::store::MockStoreClient;

    fn mock_clients(n: usize) -> Vec<Arc<dyn StoreClient>> {
        (0..n)
            .map(|_| Arc::new(MockStoreClient::new()) as Arc<dyn StoreClient>)
            .collect()
    }

    #[test]
    fn test_construction_rejects_fewer_than_three_nodes() {
        let err = QuorumLock::with_clients("k", mock_clients(2), QuorumOptions::default())
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIG");
    }

    #[test]
    fn test_construction_rejects_unsafe_timing_before_any_network_call() {
        // 5 节点 * 50ms * 10 = 2.5s > 1s，必须在构造期失败。
        // mock 不设置任何期望，任何存储调用都会使测试失败。
        let options = QuorumOptions {
            single_node_timeout: Duration::from_millis(50),
            lease: Duration::from_secs(1),
        };
        let err = QuorumLock::with_clients("k", mock_clients(5), options).unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIG");
    }

    #[test]
    fn test_required_is_strict_majority() {
        let lock = QuorumLock::with_clients("k", mock_clients(3), QuorumOptions::default())
            .unwrap();
        assert_eq!(lock.required(), 2);

        let lock = QuorumLock::with_clients("k", mock_clients(5), QuorumOptions::default())
            .unwrap();
        assert_eq!(lock.required(), 3);
    }

    #[test]
    fn test_debug_reports_node_count() {
        let lock = QuorumLock::with_clients("k", mock_clients(3), QuorumOptions::default())
            .unwrap();
        let rendered = format!("{:?}", lock);
        assert!(rendered.contains("QuorumLock"));
        assert!(rendered.contains("nodes: 3"));
    }

    #[test]
    fn test_node_locks_share_key_but_not_tokens() {
        let lock = QuorumLock::with_clients("k", mock_clients(3), QuorumOptions::default())
            .unwrap();

        assert!(lock.locks.iter().all(|l| l.key() == "k"));
        let tokens: Vec<&str> = lock.locks.iter().map(|l| l.token()).collect();
        assert_ne!(tokens[0], tokens[1]);
        assert_ne!(tokens[1], tokens[2]);
    }
}
