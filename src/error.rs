//! 核心错误类型
//!
//! 调用方通过枚举变体区分具体情况 (例如 "已存在" 与 "未找到")，不做字符串比较。
//! 每个错误都提供 `as_label`，返回稳定的 snake_case 标签用于日志。

use std::time::Duration;
use thiserror::Error;

/// 任务池错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// 该 id 已有任务在运行
    #[error("task [{0}] already exists in current pool, skipping it")]
    TaskAlreadyExists(String),

    /// 该 id 没有被跟踪
    #[error("task [{0}] not found in current pool")]
    TaskNotFound(String),

    /// 优雅关闭超出等待预算
    #[error("pool [{pool}] shutdown completed without graceful completion after {budget:?}")]
    DrainTimeout { pool: String, budget: Duration },
}

impl PoolError {
    pub fn as_label(&self) -> &'static str {
        match self {
            PoolError::TaskAlreadyExists(_) => "task_already_exists",
            PoolError::TaskNotFound(_) => "task_not_found",
            PoolError::DrainTimeout { .. } => "drain_timeout",
        }
    }
}

/// 工作站 (任务池集合) 错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("workspace [{0}] not found")]
    PoolNotFound(String),
}

/// 外部进程启动阶段的错误
#[derive(Error, Debug)]
pub enum ProcessError {
    /// 无法创建诊断输出临时文件
    #[error("failed to create scratch file: {0}")]
    Scratch(#[source] std::io::Error),

    #[error("failed to spawn [{program}]: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid url [{url}]: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// 子进程已启动，但拿不到 stdout 管道
    #[error("stdout of [{0}] is not captured")]
    NoStdout(String),
}

impl ProcessError {
    pub fn as_label(&self) -> &'static str {
        match self {
            ProcessError::Scratch(_) => "scratch_failed",
            ProcessError::Spawn { .. } => "spawn_failed",
            ProcessError::InvalidUrl { .. } => "invalid_url",
            ProcessError::NoStdout(_) => "no_stdout",
        }
    }
}

/// 拉取期望流集合失败
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("failed to read stream list: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse stream list: {0}")]
    Parse(String),

    #[error("stream list request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("stream list request returned status {0}")]
    Status(u16),

    /// 拉取过程中收到取消信号
    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn as_label(&self) -> &'static str {
        match self {
            FetchError::Io(_) => "fetch_io",
            FetchError::Parse(_) => "fetch_parse",
            FetchError::Http(_) => "fetch_http",
            FetchError::Status(_) => "fetch_status",
            FetchError::Cancelled => "fetch_cancelled",
        }
    }
}

/// 指标写入失败，仅丢失当前这一条样本
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("failed to write sample: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode sample: {0}")]
    Encode(#[from] serde_json::Error),
}
