use super::{exit_outcome, finish, spawn_failed, RunOutcome, Worker};
use crate::error::ProcessError;
use crate::process::{Invocation, Output, ProcessHandle};
use crate::stream::StreamRef;
use async_trait::async_trait;
use reqwest::Url;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// 截图推送路径的格式化策略
///
/// 替换实现即可更换命名方案，无需改动 worker
pub trait PathFormatter: Send + Sync + 'static {
    fn format(&self, push: &Url, pull: &Url, stream_id: &str, use_strftime: bool) -> String;
}

/// 在推送地址路径后拼接 `{id}.jpg`
#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleFormatter;

impl PathFormatter for SimpleFormatter {
    fn format(&self, push: &Url, _pull: &Url, stream_id: &str, _use_strftime: bool) -> String {
        format!("{}/{}.jpg", push.path().trim_end_matches('/'), stream_id)
    }
}

#[derive(Debug, Clone)]
pub struct ScreenshotOptions {
    pub name: String,
    pub binary: String,
    /// 截图上传的基础地址 (HTTP PUT)
    pub upload: String,
    pub headers: BTreeMap<String, String>,
    pub use_strftime: bool,
    pub scratch_dir: PathBuf,
}

impl Default for ScreenshotOptions {
    fn default() -> Self {
        Self {
            name: "screenshot".to_string(),
            binary: "ffmpeg".to_string(),
            upload: "http://127.0.0.1:8080/screens/".to_string(),
            headers: BTreeMap::new(),
            use_strftime: false,
            scratch_dir: PathBuf::from("./tmp"),
        }
    }
}

/// 运行 ffmpeg 只解码关键帧，并把最新一帧推送到上传地址
///
/// 没有输出解析，运行结果仅由退出分类体现
pub struct ScreenshotWorker {
    options: ScreenshotOptions,
    formatter: Arc<dyn PathFormatter>,
}

impl ScreenshotWorker {
    pub fn new(options: ScreenshotOptions, formatter: Arc<dyn PathFormatter>) -> Self {
        Self { options, formatter }
    }

    /// 计算推送地址
    pub fn push_url(&self, stream: &StreamRef) -> Result<Url, ProcessError> {
        let mut push = parse_url(&self.options.upload)?;
        let pull = parse_url(&stream.url)?;

        let path = self
            .formatter
            .format(&push, &pull, &stream.id, self.options.use_strftime);
        push.set_path(&path);
        Ok(push)
    }

    fn invocation(&self, stream: &StreamRef) -> Result<Invocation, ProcessError> {
        let push = self.push_url(stream)?;
        let strftime = if self.options.use_strftime { "1" } else { "0" };

        Ok(Invocation::new(&self.options.binary, Output::Scratch)
            .args(["-y", "-nostdin", "-threads", "1", "-skip_frame", "nokey"])
            .headers(&self.options.headers)
            .args(["-i", stream.url.as_str()])
            .args(["-vsync", "0", "-r", "30", "-f", "image2"])
            .args(["-strftime", strftime, "-update", "1"])
            .args(["-protocol_opts", "method=PUT"])
            .arg(push.as_str()))
    }
}

fn parse_url(raw: &str) -> Result<Url, ProcessError> {
    Url::parse(raw).map_err(|e| ProcessError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl Worker for ScreenshotWorker {
    fn name(&self) -> &str {
        &self.options.name
    }

    fn label(&self) -> &str {
        "screenshot/"
    }

    async fn run(&self, token: CancellationToken, stream: StreamRef) -> RunOutcome {
        let name = self.options.name.as_str();
        let id = stream.id.as_str();

        let spawned = match self.invocation(&stream) {
            Ok(inv) => {
                let prefix = format!("{}_capture_", id);
                ProcessHandle::spawn(&inv, &self.options.scratch_dir, &prefix).await
            }
            Err(e) => Err(e),
        };
        let mut handle = match spawned {
            Ok(handle) => handle,
            Err(e) => return spawn_failed(name, id, &e),
        };

        let pid = handle.pid();
        let outcome = tokio::select! {
            _ = token.cancelled() => RunOutcome::Cancelled,
            result = handle.wait() => exit_outcome(name, id, pid, result),
        };

        finish(handle, name, id, outcome).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn worker(options: ScreenshotOptions) -> ScreenshotWorker {
        ScreenshotWorker::new(options, Arc::new(SimpleFormatter))
    }

    #[test]
    fn simple_formatter_joins_base_path() {
        let push = Url::parse("http://storage:9000/screens/").unwrap();
        let pull = Url::parse("rtmp://origin/live/a").unwrap();
        assert_eq!(
            SimpleFormatter.format(&push, &pull, "a", false),
            "/screens/a.jpg"
        );

        let root = Url::parse("http://storage:9000").unwrap();
        assert_eq!(SimpleFormatter.format(&root, &pull, "b", true), "/b.jpg");
    }

    struct DatedFormatter;

    impl PathFormatter for DatedFormatter {
        fn format(&self, push: &Url, _pull: &Url, id: &str, use_strftime: bool) -> String {
            if use_strftime {
                format!("{}{}/%Y%m%d-%H%M%S.jpg", push.path(), id)
            } else {
                format!("{}{}.jpg", push.path(), id)
            }
        }
    }

    #[test]
    fn formatter_is_pluggable() {
        let w = ScreenshotWorker::new(
            ScreenshotOptions {
                upload: "http://storage/shots/".to_string(),
                use_strftime: true,
                ..ScreenshotOptions::default()
            },
            Arc::new(DatedFormatter),
        );
        let url = w.push_url(&StreamRef::new("cam", "rtmp://o/live/cam")).unwrap();
        assert!(url.path().starts_with("/shots/cam/"));
        assert!(url.path().ends_with(".jpg"));
    }

    #[test]
    fn invocation_pushes_to_formatted_url() {
        let mut options = ScreenshotOptions {
            upload: "http://storage:9000/screens".to_string(),
            ..ScreenshotOptions::default()
        };
        options
            .headers
            .insert("Referer".to_string(), "vtx".to_string());
        let w = worker(options);

        let inv = w.invocation(&StreamRef::new("a", "rtmp://origin/live/a")).unwrap();
        assert_eq!(inv.program, "ffmpeg");
        assert_eq!(inv.output, Output::Scratch);
        assert_eq!(
            inv.args.last().map(String::as_str),
            Some("http://storage:9000/screens/a.jpg")
        );

        let headers = inv.args.iter().position(|a| a == "-headers").unwrap();
        let input = inv.args.iter().position(|a| a == "-i").unwrap();
        assert!(headers < input);
        assert_eq!(inv.args[input + 1], "rtmp://origin/live/a");
    }

    #[test]
    fn invalid_stream_url_is_rejected() {
        let w = worker(ScreenshotOptions::default());
        let err = w.invocation(&StreamRef::new("a", "not a url")).unwrap_err();
        assert_eq!(err.as_label(), "invalid_url");
    }

    #[tokio::test]
    async fn invalid_url_fails_before_spawning() {
        let dir = tempfile::TempDir::new().unwrap();
        let w = worker(ScreenshotOptions {
            scratch_dir: dir.path().to_path_buf(),
            ..ScreenshotOptions::default()
        });

        let outcome = w
            .run(CancellationToken::new(), StreamRef::new("a", "::"))
            .await;
        assert_eq!(outcome, RunOutcome::SpawnFailed);
        assert_eq!(std::fs::read_dir(dir.path()).map(|d| d.count()).unwrap_or(0), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn rejected_arguments_surface_as_abnormal_exit() {
        let dir = tempfile::TempDir::new().unwrap();
        // sh 不认识 `-y` 之类的选项，会以非零状态退出
        let w = worker(ScreenshotOptions {
            binary: "sh".to_string(),
            scratch_dir: dir.path().to_path_buf(),
            ..ScreenshotOptions::default()
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            w.run(CancellationToken::new(), StreamRef::new("a", "rtmp://origin/live/a")),
        )
        .await
        .expect("run must finish");

        match outcome {
            RunOutcome::Exited(kind) => assert!(!kind.is_normal()),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
