//! Worker：对一路流运行一个外部进程，直到被取消或进程退出
//!
//! 两种实现共享同一形状：
//! - [`metrics::MetricsWorker`] 解析 ffprobe 逐帧输出，生成指标样本
//! - [`screenshot::ScreenshotWorker`] 运行 ffmpeg 抓取关键帧并推送截图
//!
//! 进程托管由 [`crate::process::ProcessHandle`] 组合提供。

pub mod metrics;
pub mod screenshot;

use crate::process::{ExitKind, ProcessHandle};
use crate::stream::StreamRef;
use async_trait::async_trait;
use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 一次运行的结束方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// 外部取消
    Cancelled,
    /// 进程自行退出
    Exited(ExitKind),
    /// 进程未能启动
    SpawnFailed,
}

/// 固定能力提供者，每个 worker 对应一个任务池
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    /// 任务池名称
    fn name(&self) -> &str;

    /// 快照中任务显示名的前缀
    fn label(&self) -> &str;

    /// 阻塞当前任务，直到 `token` 被取消或进程结束
    async fn run(&self, token: CancellationToken, stream: StreamRef) -> RunOutcome;
}

pub type WorkerRef = Arc<dyn Worker>;

/// 记录退出结果并转换为 [`RunOutcome`]
pub(crate) fn exit_outcome(
    worker: &str,
    stream_id: &str,
    pid: Option<u32>,
    result: io::Result<ExitStatus>,
) -> RunOutcome {
    let kind = match result {
        Ok(status) => ExitKind::classify(status),
        Err(e) => {
            warn!(pool = worker, stream = stream_id, "failed to wait for process: {}", e);
            ExitKind::Unknown
        }
    };

    if kind.is_normal() {
        info!(pool = worker, stream = stream_id, pid = ?pid, "process finished, task is removed from the pool");
    } else {
        warn!(
            pool = worker,
            stream = stream_id,
            pid = ?pid,
            "process was terminated with an error, task is removed from the pool \
             and will be restarted in the future: {}",
            kind
        );
    }
    RunOutcome::Exited(kind)
}

/// 启动失败统一日志
pub(crate) fn spawn_failed(worker: &str, stream_id: &str, err: &dyn std::fmt::Display) -> RunOutcome {
    warn!(
        pool = worker,
        stream = stream_id,
        "process will not be started, previous error: {}",
        err
    );
    RunOutcome::SpawnFailed
}

/// 结束本次运行：释放进程资源后返回结果
pub(crate) async fn finish(
    handle: ProcessHandle,
    worker: &str,
    stream_id: &str,
    outcome: RunOutcome,
) -> RunOutcome {
    handle.cleanup(worker, stream_id).await;
    outcome
}
