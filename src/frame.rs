use chrono::{DateTime, Local};
use serde::Serialize;

const BITS_IN_BYTE: f64 = 8.0;
const BYTES_IN_KB: f64 = 1024.0;

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// 两个关键帧之间的解码输出累加器
///
/// 只属于一次 worker 运行，不共享、不持久化
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Frame {
    pub frames: u64,
    pub bytes: u64,
    pub seconds: f64,
    pub height: u64,
    pub keyframe_interval: u64,
}

impl Frame {
    pub fn accumulate(&mut self, bytes: u64) {
        self.bytes += bytes;
        self.frames += 1;
        self.keyframe_interval += 1;
    }

    pub fn reset(&mut self) {
        *self = Frame::default();
    }
}

/// 一个完整关键帧区间的指标样本，交给外部 sink 后不再保留
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSample {
    pub date: String,
    pub insert_ts: String,
    pub fps: f64,
    pub bitrate: f64,
    pub stream_id: String,
    pub seconds: f64,
    pub bytes: u64,
    pub frames: u64,
    pub height: u64,
    pub keyframe_interval: u64,
}

impl MetricSample {
    pub fn new(stream_id: &str, frame: &Frame) -> Self {
        Self::at(stream_id, frame, Local::now())
    }

    /// 以指定时间生成样本
    pub fn at(stream_id: &str, frame: &Frame, now: DateTime<Local>) -> Self {
        let fps = round_to(frame.frames as f64 / frame.seconds, 100.0);
        let bitrate = round_to(
            (frame.bytes as f64 * BITS_IN_BYTE) / (frame.seconds * BYTES_IN_KB),
            1000.0,
        );

        Self {
            date: now.format(DATE_FORMAT).to_string(),
            insert_ts: now.format(DATETIME_FORMAT).to_string(),
            fps,
            bitrate,
            stream_id: stream_id.to_string(),
            seconds: frame.seconds,
            bytes: frame.bytes,
            frames: frame.frames,
            height: frame.height,
            keyframe_interval: frame.keyframe_interval,
        }
    }
}

/// 按 scale 四舍五入；非有限值 (区间时长为 0) 记为 0
fn round_to(value: f64, scale: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    (value * scale).round() / scale
}

/// 向上取整到微秒精度
pub fn ceil_micros(value: f64) -> f64 {
    (value * 1_000_000.0).ceil() / 1_000_000.0
}
