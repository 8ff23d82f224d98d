//! distlock — 基于 Redis 的分布式互斥锁
//!
//! 在带过期时间的共享键值存储之上实现分布式互斥：调用方以 key
//! 标识互斥域获取一个独占的、有时限的租约，完成工作后释放；
//! 进程崩溃时租约自动过期，不会造成死锁。
//!
//! 提供两种锁：
//! - [`RedisLock`]：单节点锁，支持阻塞重试与看门狗自动续约；
//! - [`QuorumLock`]：多数派锁，跨 N 个独立节点容忍个别节点
//!   故障或变慢。
//!
//! 这不是共识协议：安全性依赖有界的时钟漂移与执行时间，
//! 多数派变体收窄但不消除双持有者窗口。

pub mod config;
pub mod error;
pub mod lock;
pub mod observability;
pub mod quorum;
pub mod store;
pub mod test_utils;

pub(crate) mod watchdog;

pub use config::{DistlockConfig, LockOptions, NodeConfig, QuorumOptions};
pub use error::{LockError, Result};
pub use lock::RedisLock;
pub use quorum::QuorumLock;
pub use store::{RedisStore, StoreClient};
