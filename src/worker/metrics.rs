use super::{exit_outcome, finish, spawn_failed, RunOutcome, Worker};
use crate::frame::{ceil_micros, Frame, MetricSample};
use crate::process::{Invocation, Output, ProcessHandle};
use crate::sink::Sink;
use crate::stream::StreamRef;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const RECORD_COLUMNS: usize = 5;
/// 带有损坏 side data 的记录多出一列
const RECORD_COLUMNS_BROKEN_SIDE_DATA: usize = 6;

const KEYFRAME_POS: usize = 1;
const TIME_POS: usize = 2;
const BYTES_POS: usize = 3;
const HEIGHT_POS: usize = 4;

/// ffprobe `-of csv` 输出的一行帧记录
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRecord {
    pub keyframe: bool,
    pub timestamp: f64,
    pub bytes: u64,
    pub height: u64,
}

impl FrameRecord {
    /// 解析 `frame,<key>,<ts>,<size>,<height>[,<extra>]`
    ///
    /// 列数不符时返回 `None`；无法解析的数值列按 0 处理
    pub fn parse(line: &str) -> Option<Self> {
        let cols: Vec<&str> = line.split(',').collect();
        if cols.len() != RECORD_COLUMNS && cols.len() != RECORD_COLUMNS_BROKEN_SIDE_DATA {
            return None;
        }

        Some(Self {
            keyframe: cols[KEYFRAME_POS] == "1",
            timestamp: parse_f64(cols[TIME_POS]),
            bytes: parse_u64(cols[BYTES_POS]),
            height: parse_u64(cols[HEIGHT_POS]),
        })
    }
}

fn parse_u64(s: &str) -> u64 {
    s.trim().parse().unwrap_or(0)
}

fn parse_f64(s: &str) -> f64 {
    match s.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => v,
        _ => 0.0,
    }
}

/// 按关键帧切分区间的状态机
///
/// 每条记录都先计入累加器；遇到关键帧时结算上一个区间。
/// 首个关键帧只建立时间基线，不产生样本。
#[derive(Debug, Default)]
pub struct IntervalMeter {
    frame: Frame,
    last_keyframe: Option<f64>,
}

impl IntervalMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// 处理一条记录，若完成了一个区间则返回它
    pub fn observe(&mut self, record: &FrameRecord) -> Option<Frame> {
        self.frame.accumulate(record.bytes);
        if !record.keyframe {
            return None;
        }

        let timestamp = ceil_micros(record.timestamp);
        let completed = self.last_keyframe.map(|last| {
            self.frame.height = record.height;
            self.frame.seconds = ceil_micros(timestamp - last);
            self.frame.clone()
        });

        self.frame.reset();
        self.last_keyframe = Some(timestamp);
        completed
    }
}

/// 指标 worker 配置
#[derive(Debug, Clone)]
pub struct MetricsOptions {
    pub name: String,
    pub binary: String,
    /// 流地址与请求头之前的探测参数
    pub args: Vec<String>,
    pub headers: BTreeMap<String, String>,
    pub scratch_dir: PathBuf,
}

impl Default for MetricsOptions {
    fn default() -> Self {
        Self {
            name: "metrics".to_string(),
            binary: "ffprobe".to_string(),
            args: probe_args(),
            headers: BTreeMap::new(),
            scratch_dir: PathBuf::from("./tmp"),
        }
    }
}

/// 默认的 ffprobe 参数：逐帧输出关键帧标志、时间戳、包大小与高度
pub fn probe_args() -> Vec<String> {
    [
        "-loglevel",
        "error",
        "-threads",
        "1",
        "-select_streams",
        "v:0",
        "-show_frames",
        "-show_entries",
        "frame=key_frame,pkt_pts_time,pkt_size,height,repeat_pict",
        "-of",
        "csv",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// 运行 ffprobe 逐帧分析，并把每个关键帧区间写入 sink
pub struct MetricsWorker {
    options: MetricsOptions,
    sink: Arc<dyn Sink>,
}

impl MetricsWorker {
    pub fn new(options: MetricsOptions, sink: Arc<dyn Sink>) -> Self {
        Self { options, sink }
    }

    fn invocation(&self, stream: &StreamRef) -> Invocation {
        Invocation::new(&self.options.binary, Output::Lines)
            .args(self.options.args.iter().cloned())
            .headers(&self.options.headers)
            .arg(&stream.url)
    }

    async fn handle_line(&self, meter: &mut IntervalMeter, stream_id: &str, line: &str) {
        let Some(record) = FrameRecord::parse(line) else {
            debug!(pool = %self.options.name, stream = stream_id, "skip malformed record: {}", line);
            return;
        };

        if let Some(frame) = meter.observe(&record) {
            let sample = MetricSample::new(stream_id, &frame);
            if let Err(e) = self.sink.write(sample).await {
                warn!(pool = %self.options.name, stream = stream_id, "failed to store sample: {}", e);
            }
        }
    }

    /// 进程退出后读完通道中剩余的行，直到读取任务遇到 EOF 或被取消
    async fn drain_lines(
        &self,
        token: &CancellationToken,
        lines: &mut mpsc::Receiver<String>,
        meter: &mut IntervalMeter,
        stream_id: &str,
    ) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                line = lines.recv() => match line {
                    Some(line) => self.handle_line(meter, stream_id, &line).await,
                    None => break,
                },
            }
        }
    }
}

#[async_trait]
impl Worker for MetricsWorker {
    fn name(&self) -> &str {
        &self.options.name
    }

    fn label(&self) -> &str {
        "metrics/"
    }

    async fn run(&self, token: CancellationToken, stream: StreamRef) -> RunOutcome {
        let name = self.options.name.as_str();
        let id = stream.id.as_str();
        let prefix = format!("{}_metrics_", id);

        let mut handle = match ProcessHandle::spawn(
            &self.invocation(&stream),
            &self.options.scratch_dir,
            &prefix,
        )
        .await
        {
            Ok(handle) => handle,
            Err(e) => return spawn_failed(name, id, &e),
        };

        let mut lines = match handle.lines(id) {
            Ok(lines) => lines,
            Err(e) => {
                let outcome = spawn_failed(name, id, &e);
                return finish(handle, name, id, outcome).await;
            }
        };

        let mut meter = IntervalMeter::new();
        let pid = handle.pid();
        let outcome = loop {
            tokio::select! {
                _ = token.cancelled() => break RunOutcome::Cancelled,
                result = handle.wait() => {
                    // 退出前写出的行可能还在通道里
                    self.drain_lines(&token, &mut lines, &mut meter, id).await;
                    break exit_outcome(name, id, pid, result);
                }
                Some(line) = lines.recv() => {
                    self.handle_line(&mut meter, id, &line).await;
                }
            }
        };

        drop(lines);
        finish(handle, name, id, outcome).await
    }
}
