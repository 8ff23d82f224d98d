//! 统一错误处理模块
//!
//! 定义分布式锁的错误分类，使用 thiserror 提供良好的错误信息。
//! 可重试错误（锁竞争、阻塞等待超时）与致命错误（所有权校验失败、
//! 存储层故障、配置无效）严格区分，阻塞重试只对前者生效。

use thiserror::Error;

/// 分布式锁错误类型
#[derive(Debug, Error)]
pub enum LockError {
    // ==================== 竞争类错误（可重试） ====================
    #[error("锁已被其他持有者占用: key={key}")]
    Contention { key: String },

    #[error("阻塞等待超时，未能获取锁: key={key}")]
    WaitTimeout { key: String },

    // ==================== 取消 ====================
    #[error("操作被调用方取消")]
    Cancelled,

    // ==================== 所有权错误 ====================
    #[error("没有锁的所有权，拒绝操作: key={key}")]
    NotOwner { key: String },

    // ==================== 存储层错误 ====================
    #[error("Redis 错误: {0}")]
    Store(#[from] redis::RedisError),

    // ==================== 配置错误 ====================
    #[error("配置无效: {0}")]
    InvalidConfig(String),

    // ==================== 多数派错误 ====================
    #[error("未达到多数派: 有效成功 {granted}/{required}")]
    QuorumNotReached { granted: usize, required: usize },
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, LockError>;

impl LockError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Contention { .. } => "LOCK_CONTENTION",
            Self::WaitTimeout { .. } => "LOCK_WAIT_TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::NotOwner { .. } => "NOT_OWNER",
            Self::Store(_) => "STORE_ERROR",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::QuorumNotReached { .. } => "QUORUM_NOT_REACHED",
        }
    }

    /// 是否为可重试错误
    ///
    /// 只有锁竞争与等待超时属于可重试一族：竞争触发阻塞重试，
    /// 等待超时对本次调用是终态，但上层可以选择稍后再试。
    /// 所有权错误与存储层故障永远不会在本层被重试。
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Contention { .. } | Self::WaitTimeout { .. })
    }
}
