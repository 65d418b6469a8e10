use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub fetcher: FetcherConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// 管理接口监听地址
    #[serde(default = "default_listen")]
    pub listen: String,

    /// 调度周期
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,

    /// 每个任务池关闭时的等待预算
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// 外部进程诊断输出的临时文件目录
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,

    /// 默认日志级别，`RUST_LOG` 优先
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            refresh_interval_ms: default_refresh_interval_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            scratch_dir: default_scratch_dir(),
            log_level: default_log_level(),
        }
    }
}

impl ServerConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms.max(1))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FetcherKind {
    File,
    Http,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetcherConfig {
    #[serde(default = "default_fetcher_kind")]
    pub kind: FetcherKind,
    /// file: YAML 流列表路径
    #[serde(default = "default_streams_path")]
    pub path: PathBuf,
    /// http: 返回 JSON 数组的地址
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_fetch_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            kind: default_fetcher_kind(),
            path: default_streams_path(),
            url: String::new(),
            headers: BTreeMap::new(),
            timeout_ms: default_fetch_timeout_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Jsonl,
    Log,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SinkConfig {
    #[serde(default = "default_sink_kind")]
    pub kind: SinkKind,
    #[serde(default = "default_sink_path")]
    pub path: PathBuf,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: default_sink_kind(),
            path: default_sink_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct WorkersConfig {
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub screenshot: ScreenshotConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_ffprobe")]
    pub binary: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            binary: default_ffprobe(),
            headers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScreenshotConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_ffmpeg")]
    pub binary: String,
    /// 截图上传基础地址
    #[serde(default)]
    pub upload: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub use_strftime: bool,
}

impl Default for ScreenshotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            binary: default_ffmpeg(),
            upload: String::new(),
            headers: BTreeMap::new(),
            use_strftime: false,
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8090".to_string()
}

fn default_refresh_interval_ms() -> u64 {
    30_000
}

fn default_drain_timeout_ms() -> u64 {
    5_000
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from("./tmp")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_fetcher_kind() -> FetcherKind {
    FetcherKind::File
}

fn default_streams_path() -> PathBuf {
    PathBuf::from("streams.yaml")
}

fn default_fetch_timeout_ms() -> u64 {
    10_000
}

fn default_sink_kind() -> SinkKind {
    SinkKind::Jsonl
}

fn default_sink_path() -> PathBuf {
    PathBuf::from("metrics.jsonl")
}

fn default_ffprobe() -> String {
    "ffprobe".to_string()
}

fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: AppConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.fetcher.kind == FetcherKind::Http && self.fetcher.url.is_empty() {
            anyhow::bail!("fetcher.url is required when fetcher.kind is http");
        }
        if self.workers.screenshot.enabled && self.workers.screenshot.upload.is_empty() {
            anyhow::bail!("workers.screenshot.upload is required when the screenshot worker is enabled");
        }
        if !self.workers.metrics.enabled && !self.workers.screenshot.enabled {
            anyhow::bail!("at least one worker must be enabled");
        }
        Ok(())
    }
}
