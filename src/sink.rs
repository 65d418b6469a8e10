use crate::error::SinkError;
use crate::frame::MetricSample;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

/// 指标样本的持久化目标
///
/// 每个完整关键帧区间调用一次；失败只丢失该条样本
#[async_trait]
pub trait Sink: Send + Sync + 'static {
    async fn write(&self, sample: MetricSample) -> Result<(), SinkError>;
}

/// 以 JSON Lines 形式追加写入文件
pub struct JsonLinesSink {
    path: PathBuf,
    file: Mutex<Option<tokio::fs::File>>,
}

impl JsonLinesSink {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Sink for JsonLinesSink {
    async fn write(&self, sample: MetricSample) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(&sample)?;
        line.push(b'\n');

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            *guard = Some(file);
        }
        if let Some(file) = guard.as_mut() {
            let written = match file.write_all(&line).await {
                Ok(()) => file.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                // 下次写入时重新打开
                *guard = None;
                return Err(e.into());
            }
        }
        Ok(())
    }
}

/// 只把样本写入日志
pub struct LogSink;

#[async_trait]
impl Sink for LogSink {
    async fn write(&self, sample: MetricSample) -> Result<(), SinkError> {
        info!(
            stream = %sample.stream_id,
            fps = sample.fps,
            bitrate = sample.bitrate,
            frames = sample.frames,
            seconds = sample.seconds,
            height = sample.height,
            "metric sample"
        );
        Ok(())
    }
}
