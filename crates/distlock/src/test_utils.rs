//! 测试工具模块
//!
//! 提供无外部依赖的内存版存储实现，语义与 Redis 适配层一致：
//! SET NX EX、两个条件脚本、懒惰过期。配合 tokio 的暂停时钟，
//! 可以对租约过期、看门狗续约等时序行为做确定性测试。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::error::{LockError, Result};
use crate::store::{StoreClient, LUA_CHECK_AND_DELETE, LUA_CHECK_AND_EXPIRE};

struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self) -> bool {
        self.expires_at > Instant::now()
    }
}

/// 内存版存储节点
///
/// 过期采用懒惰删除：读到已过期的记录视同不存在，与 Redis 对
/// 调用方可见的行为一致。`set_fail` 可以模拟节点不可达，
/// `set_latency` 可以模拟慢节点。
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
    fail: AtomicBool,
    latency: parking_lot::Mutex<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟节点不可达：后续所有操作返回存储层错误
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// 模拟慢节点：每次操作前附加固定延迟
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// 读取 key 当前的存活值，测试断言用
    pub async fn value_of(&self, key: &str) -> Option<String> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|entry| entry.is_live())
            .map(|entry| entry.value.clone())
    }

    async fn simulate_node(&self) -> Result<()> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(LockError::Store(redis::RedisError::from((
                redis::ErrorKind::Io,
                "simulated connection failure",
            ))));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.simulate_node().await?;

        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|entry| entry.is_live()) {
            return Ok(false);
        }

        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn eval(&self, script: &str, key: &str, args: Vec<String>) -> Result<i64> {
        self.simulate_node().await?;

        let mut entries = self.entries.write().await;
        let owned = entries
            .get(key)
            .is_some_and(|entry| entry.is_live() && Some(&entry.value) == args.first());

        if script == LUA_CHECK_AND_EXPIRE {
            if !owned {
                return Ok(0);
            }
            let ttl_secs: u64 = args
                .get(1)
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| LockError::InvalidConfig("脚本缺少 ttl 参数".to_string()))?;
            let entry = entries.get_mut(key).unwrap();
            entry.expires_at = Instant::now() + Duration::from_secs(ttl_secs);
            Ok(1)
        } else if script == LUA_CHECK_AND_DELETE {
            if !owned {
                return Ok(0);
            }
            entries.remove(key);
            Ok(1)
        } else {
            Err(LockError::InvalidConfig("不支持的脚本".to_string()))
        }
    }

    async fn health_check(&self) -> Result<()> {
        self.simulate_node().await
    }
}
