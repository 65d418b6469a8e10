//! VTX Probe - 直播流监测
//!
//! 为每路直播流、每种 worker 维持恰好一个外部测量进程 (ffprobe 指标 / ffmpeg 截图)，
//! 周期性地把运行中的任务收敛到拉取到的期望流集合。

pub mod config;
pub mod error;
pub mod fetcher;
pub mod frame;
pub mod pool;
pub mod process;
pub mod registry;
pub mod scheduler;
pub mod signals;
pub mod sink;
pub mod stream;
pub mod web;
pub mod worker;

pub use error::{FetchError, PoolError, ProcessError, RegistryError, SinkError};
pub use pool::TaskPool;
pub use registry::Registry;
pub use scheduler::Scheduler;
pub use stream::{StreamRef, StreamSet};
pub use worker::{RunOutcome, Worker, WorkerRef};
