//! # 任务池 (Workspace)
//!
//! 每种 worker 一个任务池，按流 id 跟踪正在运行的任务：
//! - `start` 拒绝重复 id，为任务派生根令牌的子令牌并在后台运行 worker
//! - `stop` 取消任务并移出任务表；取消是协作式的，进程由 worker 自己回收
//! - 后台任务结束 (任何路径，包括 panic) 时回到池中摘除自己，并递减待完成计数
//! - `drain` 等待待完成计数归零，超出预算则返回 [`PoolError::DrainTimeout`]
//!
//! 任务表与待完成计数只在池的写锁下修改。

use crate::error::PoolError;
use crate::stream::{StreamRef, StreamSet};
use crate::worker::WorkerRef;
use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// 一个正在运行的受托管调用
struct Task {
    cancel: CancellationToken,
    started_at: DateTime<Local>,
    /// 区分同一 id 先后启动的不同任务
    seq: u64,
}

#[derive(Default)]
struct PoolState {
    tasks: HashMap<String, Task>,
    next_seq: u64,
}

/// 任务的只读信息 (快照使用)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: String,
    pub started_at: DateTime<Local>,
}

pub struct TaskPool {
    worker: WorkerRef,
    root: CancellationToken,
    state: RwLock<PoolState>,
    /// 已启动但尚未结束的后台任务数
    pending: watch::Sender<usize>,
    drain_timeout: Duration,
}

impl TaskPool {
    pub fn new(worker: WorkerRef, root: CancellationToken, drain_timeout: Duration) -> Arc<Self> {
        let (pending, _) = watch::channel(0);
        Arc::new(Self {
            worker,
            root,
            state: RwLock::new(PoolState::default()),
            pending,
            drain_timeout,
        })
    }

    pub fn name(&self) -> &str {
        self.worker.name()
    }

    pub fn label(&self) -> &str {
        self.worker.label()
    }

    /// 启动一路流的任务
    ///
    /// 必须在 tokio 运行时内调用
    pub fn start(self: &Arc<Self>, stream: StreamRef) -> Result<(), PoolError> {
        let id = stream.id.clone();
        let (token, seq) = {
            let mut state = self.write();
            if state.tasks.contains_key(&id) {
                return Err(PoolError::TaskAlreadyExists(id));
            }

            let token = self.root.child_token();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.tasks.insert(
                id.clone(),
                Task {
                    cancel: token.clone(),
                    started_at: Local::now(),
                    seq,
                },
            );
            self.pending.send_modify(|n| *n += 1);
            (token, seq)
        };

        info!(pool = self.name(), stream = %id, "launch, attach to pool");

        let guard = Detach {
            pool: Arc::clone(self),
            id,
            seq,
        };
        tokio::spawn(async move {
            let outcome = guard.pool.worker.run(token, stream).await;
            info!(
                pool = guard.pool.name(),
                stream = %guard.id,
                outcome = ?outcome,
                "finished, removed from pool"
            );
            drop(guard);
        });

        Ok(())
    }

    /// 取消任务并移出任务表
    pub fn stop(&self, id: &str) -> Result<(), PoolError> {
        let task = self
            .write()
            .tasks
            .remove(id)
            .ok_or_else(|| PoolError::TaskNotFound(id.to_string()))?;
        task.cancel.cancel();
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().tasks.contains_key(id)
    }

    pub fn active_count(&self) -> usize {
        self.read().tasks.len()
    }

    /// 当前任务的 id 集合 (不含 url)，供调度器做差集
    pub fn active_set(&self) -> StreamSet {
        self.read()
            .tasks
            .keys()
            .map(|id| StreamRef::new(id.clone(), ""))
            .collect()
    }

    /// 任务信息，按启动时间从新到旧排序
    pub fn tasks(&self) -> Vec<TaskInfo> {
        let mut tasks: Vec<TaskInfo> = self
            .read()
            .tasks
            .iter()
            .map(|(id, task)| TaskInfo {
                id: id.clone(),
                started_at: task.started_at,
            })
            .collect();
        tasks.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    /// 尚未结束的后台任务数
    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    /// 等待所有已启动的后台任务结束
    ///
    /// 不会取消任何任务，也不拒绝新的 `start`。超出预算时已发出的取消仍然有效，
    /// 只是调用方不再等待，子进程可能尚未回收。
    pub async fn drain(&self) -> Result<(), PoolError> {
        let mut rx = self.pending.subscribe();
        let completed = tokio::time::timeout(self.drain_timeout, rx.wait_for(|n| *n == 0))
            .await
            .is_ok();
        if !completed {
            return Err(PoolError::DrainTimeout {
                pool: self.name().to_string(),
                budget: self.drain_timeout,
            });
        }

        info!(pool = self.name(), "all asynchronous tasks in workspace completed");
        Ok(())
    }

    /// 后台任务结束时摘除自己
    ///
    /// 只摘除同一次启动的任务；已被 `stop` 移除或已被新任务替换时仅递减计数
    fn detach(&self, id: &str, seq: u64) {
        let mut state = self.write();
        if state.tasks.get(id).is_some_and(|task| task.seq == seq) {
            if let Some(task) = state.tasks.remove(id) {
                if !task.cancel.is_cancelled() {
                    task.cancel.cancel();
                }
            }
        }
        self.pending.send_modify(|n| {
            if *n == 0 {
                warn!(pool = self.worker.name(), stream = id, "pending counter underflow");
            }
            *n = n.saturating_sub(1);
        });
    }

    fn read(&self) -> RwLockReadGuard<'_, PoolState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, PoolState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 后台任务退出时 (含 panic) 执行摘除
struct Detach {
    pool: Arc<TaskPool>,
    id: String,
    seq: u64,
}

impl Drop for Detach {
    fn drop(&mut self) {
        self.pool.detach(&self.id, self.seq);
    }
}
