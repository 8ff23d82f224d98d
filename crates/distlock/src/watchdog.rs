//! 看门狗续约任务
//!
//! 持锁期间的后台租约续约：每个锁实例至多存在一个续约任务，
//! 以固定周期将租约延长到「工作周期 + 安全余量」，正常情况下
//! key 永远不会在两次续约之间过期。单次续约失败只记录日志，
//! 任务继续运行，下一个周期仍可能在过期前续约成功。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{WATCHDOG_RENEW_MARGIN, WATCHDOG_WORK_STEP};
use crate::lock::LockInner;

/// 看门狗任务句柄
///
/// `running` 是单写者启动闸门：compare_exchange 失败说明已有任务
/// 在运行，重复启动是空操作。`stop` 持有当前任务的取消 token，
/// 释放锁时立即取消，无需等待任务的下一次 tick。
pub(crate) struct Watchdog {
    running: AtomicBool,
    stop: Mutex<Option<CancellationToken>>,
}

impl Watchdog {
    pub(crate) fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            stop: Mutex::new(None),
        }
    }

    /// 启动续约任务；已有任务在运行时为空操作
    ///
    /// 取消 token 派生自调用方的 token，调用方取消时任务一并终止。
    pub(crate) fn start(&self, inner: Arc<LockInner>, parent: &CancellationToken) {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let cancel = parent.child_token();
        *self.stop.lock() = Some(cancel.clone());

        tokio::spawn(run(inner, cancel));
    }

    /// 取消当前续约任务；从未启动时为空操作
    pub(crate) fn stop(&self) {
        if let Some(cancel) = self.stop.lock().take() {
            cancel.cancel();
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// 续约循环
///
/// 每个 tick 先检查取消信号，再发起一次续约。任务终止时清除
/// running 标记，同一实例之后的加锁周期可以重新启动看门狗。
async fn run(inner: Arc<LockInner>, cancel: CancellationToken) {
    let renew_ttl = WATCHDOG_WORK_STEP + WATCHDOG_RENEW_MARGIN;

    let mut ticker = tokio::time::interval(WATCHDOG_WORK_STEP);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // 首个 tick 立即完成，加锁本身刚写入完整租约，跳过
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // 续约在途时同样响应取消，卡住的存储调用不能拖住任务退出
        let renewal = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = inner.renew(renew_ttl) => result,
        };

        if let Err(err) = renewal {
            // 瞬时失败不终止任务，下一个 tick 可能赶在过期前续约成功
            warn!(key = %inner.key, error = %err, "watchdog renewal attempt failed");
        }
    }

    inner.watchdog.running.store(false, Ordering::Release);
    debug!(key = %inner.key, "watchdog stopped");
}
