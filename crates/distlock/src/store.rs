//! 存储适配层
//!
//! 定义锁核心消费的最小存储接口，并提供基于 Redis 的实现。
//! 接口只有三个操作：原子的 SET NX EX、原子的 Lua 脚本求值和健康检查。
//! 续约与释放必须通过 Lua 脚本在存储端一次性完成「校验 + 变更」，
//! 拆成两次往返会让其他进程的加锁插入到校验与变更之间。

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Client;
use tracing::info;

use crate::error::{LockError, Result};

/// 校验并续期脚本：仅当存储值等于本实例 token 时延长过期时间。
/// 返回 1 表示续期成功，0 表示没有所有权（无任何变更）。
pub const LUA_CHECK_AND_EXPIRE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('EXPIRE', KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// 校验并删除脚本：仅当存储值等于本实例 token 时删除 key。
/// 返回 1 表示删除成功，0 表示没有所有权（无任何变更）。
pub const LUA_CHECK_AND_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

/// 锁核心消费的存储接口
///
/// 针对单个存储节点；多数派锁为每个节点各持有一个实现实例。
/// 实现必须支持多个调用方并发使用。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// 原子地在 key 不存在时写入 value 并设置过期时间。
    /// 返回 true 表示写入成功（key 此前不存在），false 表示 key 已被占用。
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// 原子地执行单 key 的 Lua 脚本，返回脚本的整数结果
    async fn eval(&self, script: &str, key: &str, args: Vec<String>) -> Result<i64>;

    /// 健康检查
    async fn health_check(&self) -> Result<()>;
}

/// 基于 Redis 的存储实现
///
/// 内部持有 `redis::Client`，按需获取多路复用异步连接，
/// 同一实例可被多个锁并发共享。
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// 创建 Redis 存储客户端
    pub fn new(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        info!(url = %url, "Redis store client created");
        Ok(Self { client })
    }

    async fn get_conn(&self) -> Result<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(LockError::from)
    }
}

#[async_trait]
impl StoreClient for RedisStore {
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        if key.is_empty() || value.is_empty() {
            return Err(LockError::InvalidConfig(
                "set_nx_ex 的 key 和 value 不能为空".to_string(),
            ));
        }

        let mut conn = self.get_conn().await?;

        // SET key value NX EX seconds
        // NX: 只在 key 不存在时设置；EX: 过期时间（秒）
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async(&mut conn)
            .await?;

        // SET NX 成功时返回 "OK"，失败时返回 None
        Ok(reply.is_some())
    }

    async fn eval(&self, script: &str, key: &str, args: Vec<String>) -> Result<i64> {
        if key.is_empty() {
            return Err(LockError::InvalidConfig(
                "eval 的 key 不能为空".to_string(),
            ));
        }

        let mut conn = self.get_conn().await?;

        let mut cmd = redis::cmd("EVAL");
        cmd.arg(script).arg(1).arg(key);
        for arg in &args {
            cmd.arg(arg);
        }

        let reply: i64 = cmd.query_async(&mut conn).await?;
        Ok(reply)
    }

    async fn health_check(&self) -> Result<()> {
        let mut conn = self.get_conn().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(LockError::from)
    }
}
