use crate::fetcher::Fetcher;
use crate::pool::TaskPool;
use crate::stream::StreamSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 一次收敛对单个任务池做出的变更
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Convergence {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    /// 竞争导致的 "已存在" / "未找到" 等失败次数
    pub failed: usize,
}

impl Convergence {
    pub fn is_noop(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty()
    }
}

/// 将任务池的实际集合收敛到期望集合
///
/// 基于快照做差集：实际有而期望无的停止，期望有而实际无的启动，两者都有的不动。
/// 单个操作失败只记录日志，不影响其余操作，下个周期自然修正。
pub fn reconcile(pool: &Arc<TaskPool>, desired: &StreamSet) -> Convergence {
    let active = pool.active_set();
    let mut result = Convergence::default();

    for id in active.sorted_ids() {
        if desired.contains(&id) {
            continue;
        }
        match pool.stop(&id) {
            Ok(()) => result.stopped.push(id),
            Err(e) => {
                warn!(pool = pool.name(), "stopping: {}", e);
                result.failed += 1;
            }
        }
    }

    let mut wanted: Vec<_> = desired.iter().filter(|s| !active.contains(&s.id)).collect();
    wanted.sort_by(|a, b| a.id.cmp(&b.id));
    for stream in wanted {
        match pool.start(stream.clone()) {
            Ok(()) => result.started.push(stream.id.clone()),
            Err(e) => {
                warn!(pool = pool.name(), "starting: {}", e);
                result.failed += 1;
            }
        }
    }

    if result.is_noop() {
        info!(pool = pool.name(), "nothing to update");
    } else {
        info!(
            pool = pool.name(),
            started = result.started.len(),
            stopped = result.stopped.len(),
            "reconciled"
        );
    }
    result
}

/// 周期性拉取期望流集合并收敛各任务池
pub struct Scheduler {
    fetcher: Arc<dyn Fetcher>,
    pools: Vec<Arc<TaskPool>>,
    interval: Duration,
}

impl Scheduler {
    pub fn new(fetcher: Arc<dyn Fetcher>, pools: Vec<Arc<TaskPool>>, interval: Duration) -> Self {
        Self {
            fetcher,
            pools,
            interval,
        }
    }

    /// 启动后立即收敛一次，之后按间隔执行，直到 `token` 被取消
    ///
    /// 返回时不排空任务池，排空由工作站在关闭时负责
    pub async fn run(&self, token: CancellationToken) {
        info!(
            pools = self.pools.len(),
            interval_ms = self.interval.as_millis() as u64,
            "update scheduler is started"
        );
        self.tick(&token).await;

        let mut interval = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    self.tick(&token).await;
                }
            }
        }

        info!("update scheduler is being terminated");
    }

    /// 执行一次收敛；拉取失败时跳过整个周期并返回 `None`
    pub async fn tick(&self, token: &CancellationToken) -> Option<Vec<Convergence>> {
        let desired = match self.fetcher.fetch_streams(token).await {
            Ok(desired) => desired,
            Err(e) => {
                warn!(error = e.as_label(), "failed to fetch streams, skip this tick: {}", e);
                return None;
            }
        };

        if token.is_cancelled() {
            return None;
        }

        Some(
            self.pools
                .iter()
                .map(|pool| reconcile(pool, &desired))
                .collect(),
        )
    }
}
