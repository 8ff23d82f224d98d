//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。
//! 锁的运行参数在构造时一次性校验并补全默认值，此后不可变。

use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::error::{LockError, Result};

/// 未显式指定租约时使用的默认租约时长
pub const DEFAULT_LEASE: Duration = Duration::from_secs(30);

/// 阻塞模式下默认的等待预算
pub const DEFAULT_BLOCK_WAIT: Duration = Duration::from_secs(5);

/// 阻塞模式下的轮询间隔
pub const BLOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// 看门狗续约周期
pub const WATCHDOG_WORK_STEP: Duration = Duration::from_secs(10);

/// 看门狗续约目标在工作周期之上追加的安全余量
pub const WATCHDOG_RENEW_MARGIN: Duration = Duration::from_secs(5);

/// 多数派模式下单节点的默认耗时上限
pub const DEFAULT_SINGLE_NODE_TIMEOUT: Duration = Duration::from_millis(50);

/// 多数派模式的构造期安全系数：
/// 节点数 * 单节点耗时上限 * 该系数 不得超过租约时长
pub const QUORUM_SAFETY_MULTIPLIER: u32 = 10;

/// 锁 key 的默认命名空间前缀
pub const DEFAULT_KEY_PREFIX: &str = "distlock:";

// ---------------------------------------------------------------------------
// LockOptions — 单节点锁配置
// ---------------------------------------------------------------------------

/// 单节点锁配置
///
/// `lease` 为 `None` 表示调用方未显式指定租约，此时锁使用默认租约
/// 并自动开启看门狗续约模式；显式指定租约则由调用方对过期负责，
/// 看门狗保持关闭。
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// key 命名空间前缀，显式传递而非进程级全局量，
    /// 使多个独立锁组可以在同一进程内共存
    pub key_prefix: String,
    /// 获取失败时是否阻塞轮询
    pub blocking: bool,
    /// 阻塞模式下的最大等待时长
    pub block_wait: Duration,
    /// 显式租约时长；None 表示启用看门狗模式
    pub lease: Option<Duration>,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            blocking: false,
            block_wait: DEFAULT_BLOCK_WAIT,
            lease: None,
        }
    }
}

impl LockOptions {
    /// 补全默认值并派生看门狗开关，产出构造后不可变的运行配置
    pub(crate) fn repair(self) -> LockConfig {
        let watchdog_enabled = self.lease.is_none();
        LockConfig {
            key_prefix: self.key_prefix,
            blocking: self.blocking,
            block_wait: self.block_wait,
            lease: self.lease.unwrap_or(DEFAULT_LEASE),
            watchdog_enabled,
        }
    }
}

/// 补全后的锁运行配置，构造后不可变
#[derive(Debug, Clone)]
pub(crate) struct LockConfig {
    pub(crate) key_prefix: String,
    pub(crate) blocking: bool,
    pub(crate) block_wait: Duration,
    pub(crate) lease: Duration,
    pub(crate) watchdog_enabled: bool,
}

// ---------------------------------------------------------------------------
// QuorumOptions — 多数派锁配置
// ---------------------------------------------------------------------------

/// 多数派锁配置
#[derive(Debug, Clone)]
pub struct QuorumOptions {
    /// 单节点加锁耗时上限，超过该上限的成功不计入多数派
    pub single_node_timeout: Duration,
    /// 所有节点共用的租约时长
    pub lease: Duration,
}

impl Default for QuorumOptions {
    fn default() -> Self {
        Self {
            single_node_timeout: DEFAULT_SINGLE_NODE_TIMEOUT,
            lease: DEFAULT_LEASE,
        }
    }
}

impl QuorumOptions {
    /// 构造期校验，在任何网络调用之前拒绝不可能安全的配置
    pub(crate) fn validate(&self, node_count: usize) -> Result<()> {
        if node_count < 3 {
            return Err(LockError::InvalidConfig(format!(
                "多数派锁至少需要 3 个节点，当前 {}",
                node_count
            )));
        }

        // 加锁阶段的总耗时必须远小于租约时长，否则达成多数派时
        // 最早获取的节点租约可能已接近过期
        let acquisition_budget =
            self.single_node_timeout * node_count as u32 * QUORUM_SAFETY_MULTIPLIER;
        if acquisition_budget > self.lease {
            return Err(LockError::InvalidConfig(format!(
                "单节点耗时上限相对租约过长: {} 节点 * {:?} * {} > {:?}",
                node_count, self.single_node_timeout, QUORUM_SAFETY_MULTIPLIER, self.lease
            )));
        }

        Ok(())
    }
}

/// 单个存储节点的连接描述
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Redis 连接 URL，如 `redis://:password@127.0.0.1:6379`
    pub url: String,
}

// ---------------------------------------------------------------------------
// 可观测性配置
// ---------------------------------------------------------------------------

/// 可观测性配置
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// 日志输出格式：json（结构化）或 pretty（人类可读）
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// 文件 / 环境变量加载
// ---------------------------------------------------------------------------

/// 单节点锁的文件配置表示，字段以秒为单位便于书写
#[derive(Debug, Clone, Deserialize)]
pub struct LockSettings {
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default)]
    pub blocking: bool,
    #[serde(default = "default_block_wait_seconds")]
    pub block_wait_seconds: u64,
    /// 缺省表示启用看门狗模式
    #[serde(default)]
    pub lease_seconds: Option<u64>,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            blocking: false,
            block_wait_seconds: default_block_wait_seconds(),
            lease_seconds: None,
        }
    }
}

impl LockSettings {
    pub fn to_options(&self) -> LockOptions {
        LockOptions {
            key_prefix: self.key_prefix.clone(),
            blocking: self.blocking,
            block_wait: Duration::from_secs(self.block_wait_seconds),
            lease: self.lease_seconds.map(Duration::from_secs),
        }
    }
}

/// 多数派锁的文件配置表示
#[derive(Debug, Clone, Deserialize)]
pub struct QuorumSettings {
    #[serde(default = "default_single_node_timeout_ms")]
    pub single_node_timeout_ms: u64,
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,
}

impl Default for QuorumSettings {
    fn default() -> Self {
        Self {
            single_node_timeout_ms: default_single_node_timeout_ms(),
            lease_seconds: default_lease_seconds(),
        }
    }
}

impl QuorumSettings {
    pub fn to_options(&self) -> QuorumOptions {
        QuorumOptions {
            single_node_timeout: Duration::from_millis(self.single_node_timeout_ms),
            lease: Duration::from_secs(self.lease_seconds),
        }
    }
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_block_wait_seconds() -> u64 {
    DEFAULT_BLOCK_WAIT.as_secs()
}

fn default_single_node_timeout_ms() -> u64 {
    DEFAULT_SINGLE_NODE_TIMEOUT.as_millis() as u64
}

fn default_lease_seconds() -> u64 {
    DEFAULT_LEASE.as_secs()
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct DistlockConfig {
    /// 参与加锁的存储节点列表；单节点锁取第一个，多数派锁使用全部
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub lock: LockSettings,
    #[serde(default)]
    pub quorum: QuorumSettings,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl DistlockConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. {config_dir}/default.toml（默认配置）
    /// 2. 环境变量（DISTLOCK_ 前缀，如 DISTLOCK_LOCK__BLOCKING -> lock.blocking）
    pub fn load() -> std::result::Result<Self, ConfigError> {
        let config_dir = std::env::var("DISTLOCK_CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        Config::builder()
            .add_source(File::from(Path::new(&config_dir).join("default.toml")).required(false))
            .add_source(
                Environment::with_prefix("DISTLOCK")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
