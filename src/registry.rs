//! # 工作站 (Fleet Registry)
//!
//! 构造时为每个 worker 创建一个任务池，之后不再增删。
//! 提供按名称取池、运行时快照以及关闭时逐池排空。

use crate::error::{PoolError, RegistryError};
use crate::frame::DATETIME_FORMAT;
use crate::pool::TaskPool;
use crate::worker::WorkerRef;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 单个任务的展示信息
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub name: String,
    pub started_at: String,
}

/// 单个任务池的快照
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub name: String,
    pub label: String,
    pub total_processes: usize,
    pub processes: Vec<ProcessInfo>,
}

/// 主机内存 (MB) 与 1 分钟负载，读取失败时为 0
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HostStats {
    pub mem_total: u64,
    pub mem_avail: u64,
    pub load_avg: f64,
}

impl HostStats {
    pub fn collect() -> Self {
        let (mem_total, mem_avail) = sys_info::mem_info()
            .map(|m| (m.total / 1024, m.avail / 1024))
            .unwrap_or((0, 0));
        let load_avg = sys_info::loadavg().map(|l| l.one).unwrap_or(0.0);
        Self {
            mem_total,
            mem_avail,
            load_avg,
        }
    }
}

/// 进程级运行时信息
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeInfo {
    pub uptime: f64,
    #[serde(flatten)]
    pub host: HostStats,
    pub active_tasks: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub workspaces: BTreeMap<String, PoolSnapshot>,
    pub runtime: RuntimeInfo,
}

pub struct Registry {
    pools: BTreeMap<String, Arc<TaskPool>>,
    root: CancellationToken,
    started_at: Instant,
}

impl Registry {
    pub fn new(root: CancellationToken, workers: Vec<WorkerRef>, drain_timeout: Duration) -> Self {
        let pools = workers
            .into_iter()
            .map(|worker| {
                let name = worker.name().to_string();
                (name, TaskPool::new(worker, root.clone(), drain_timeout))
            })
            .collect();

        Self {
            pools,
            root,
            started_at: Instant::now(),
        }
    }

    pub fn pool(&self, name: &str) -> Result<Arc<TaskPool>, RegistryError> {
        self.pools
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::PoolNotFound(name.to_string()))
    }

    pub fn pools(&self) -> Vec<Arc<TaskPool>> {
        self.pools.values().cloned().collect()
    }

    /// 根令牌，取消后所有任务都会收到取消
    pub fn token(&self) -> &CancellationToken {
        &self.root
    }

    /// 运行时快照
    ///
    /// 逐池获取读锁，不会长时间阻塞写入
    pub fn snapshot(&self) -> Snapshot {
        let mut active_tasks = 0;
        let workspaces = self
            .pools
            .iter()
            .map(|(name, pool)| {
                let processes: Vec<ProcessInfo> = pool
                    .tasks()
                    .into_iter()
                    .map(|task| ProcessInfo {
                        name: format!("{}{}", pool.label(), task.id),
                        started_at: task.started_at.format(DATETIME_FORMAT).to_string(),
                    })
                    .collect();
                active_tasks += processes.len();

                let snapshot = PoolSnapshot {
                    name: name.clone(),
                    label: pool.label().to_string(),
                    total_processes: processes.len(),
                    processes,
                };
                (name.clone(), snapshot)
            })
            .collect();

        Snapshot {
            workspaces,
            runtime: RuntimeInfo {
                uptime: self.started_at.elapsed().as_secs_f64(),
                host: HostStats::collect(),
                active_tasks,
            },
        }
    }

    /// 并发排空所有任务池，失败只记为警告
    ///
    /// 不取消任务；调用方应先取消根令牌。各池的等待都有预算，因此总会返回。
    pub async fn shutdown(&self) -> Vec<PoolError> {
        let mut drains = JoinSet::new();
        for pool in self.pools.values() {
            let pool = Arc::clone(pool);
            drains.spawn(async move { pool.drain().await });
        }

        let mut failures = Vec::new();
        while let Some(joined) = drains.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("{}", e);
                    failures.push(e);
                }
                Err(e) => warn!("drain task failed: {}", e),
            }
        }

        if failures.is_empty() {
            info!("workstation completed successfully");
        }
        failures
    }
}
