//! 外部测量进程的托管
//!
//! 每次 worker 运行持有一个 [`ProcessHandle`]：
//! - 启动前创建诊断输出用的临时文件
//! - stdout 由独立任务逐行读取，经有界通道交给 worker，等待退出不会被读取阻塞
//! - [`ProcessHandle::cleanup`] 在所有退出路径上恰好执行一次：删除临时文件，必要时终止并回收进程

use crate::error::ProcessError;
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 输出行通道容量
pub const LINE_BUFFER: usize = 1000;

/// stdout 的去向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Output {
    /// 通过管道逐行交给 worker，stderr 写入临时文件
    Lines,
    /// stdout 与 stderr 都写入临时文件
    Scratch,
}

/// 一次外部进程调用的描述
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub output: Output,
}

impl Invocation {
    pub fn new(program: impl Into<String>, output: Output) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            output,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// 追加 `-headers` 选项；为空时不追加
    pub fn headers(self, headers: &BTreeMap<String, String>) -> Self {
        match render_headers(headers) {
            Some(rendered) => self.arg("-headers").arg(rendered),
            None => self,
        }
    }
}

/// 将请求头渲染为 `"K: V\r\n"` 串联形式
pub fn render_headers(headers: &BTreeMap<String, String>) -> Option<String> {
    if headers.is_empty() {
        return None;
    }
    Some(
        headers
            .iter()
            .map(|(k, v)| format!("{}: {}\r\n", k, v))
            .collect(),
    )
}

/// 进程退出分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Normal,
    Code(i32),
    Signal(i32),
    Unknown,
}

impl ExitKind {
    pub fn classify(status: ExitStatus) -> Self {
        if status.success() {
            return ExitKind::Normal;
        }
        if let Some(code) = status.code() {
            return ExitKind::Code(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ExitKind::Signal(signal);
            }
        }
        ExitKind::Unknown
    }

    pub fn is_normal(&self) -> bool {
        matches!(self, ExitKind::Normal)
    }
}

impl fmt::Display for ExitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitKind::Normal => write!(f, "exited normally"),
            ExitKind::Code(code) => write!(f, "exit code is {}", code),
            ExitKind::Signal(signal) => write!(f, "killed by signal {}", signal),
            ExitKind::Unknown => write!(f, "exited with unknown status"),
        }
    }
}

/// 外部进程句柄
pub struct ProcessHandle {
    child: Child,
    pid: Option<u32>,
    scratch: Option<NamedTempFile>,
    reader: Option<JoinHandle<()>>,
    exited: bool,
}

impl ProcessHandle {
    /// 启动外部进程
    ///
    /// 临时文件创建于 `scratch_dir`，名称形如 `{prefix}*.log`。
    /// 启动失败时临时文件立即关闭并删除。
    pub async fn spawn(
        invocation: &Invocation,
        scratch_dir: &Path,
        prefix: &str,
    ) -> Result<Self, ProcessError> {
        tokio::fs::create_dir_all(scratch_dir)
            .await
            .map_err(ProcessError::Scratch)?;
        let scratch = create_scratch(scratch_dir.to_path_buf(), prefix.to_string()).await?;

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args);
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);

        // 复制的描述符共享写偏移，stdout 与 stderr 不会互相覆盖
        let stderr = scratch.as_file().try_clone().map_err(ProcessError::Scratch)?;
        match invocation.output {
            Output::Lines => {
                cmd.stdout(Stdio::piped());
            }
            Output::Scratch => {
                let stdout = stderr.try_clone().map_err(ProcessError::Scratch)?;
                cmd.stdout(Stdio::from(stdout));
            }
        }
        cmd.stderr(Stdio::from(stderr));

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                remove_scratch(scratch);
                return Err(ProcessError::Spawn {
                    program: invocation.program.clone(),
                    source,
                });
            }
        };

        let pid = child.id();
        debug!(program = %invocation.program, pid = ?pid, "process spawned");

        Ok(Self {
            child,
            pid,
            scratch: Some(scratch),
            reader: None,
            exited: false,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn scratch_path(&self) -> Option<&Path> {
        self.scratch.as_ref().map(|f| f.path())
    }

    /// 启动独立的读取任务，把非空的 stdout 行送入有界通道
    ///
    /// 进程关闭 stdout 或接收端被丢弃时读取任务结束
    pub fn lines(&mut self, stream_id: &str) -> Result<mpsc::Receiver<String>, ProcessError> {
        let stdout = self
            .child
            .stdout
            .take()
            .ok_or_else(|| ProcessError::NoStdout(stream_id.to_string()))?;

        let (tx, rx) = mpsc::channel(LINE_BUFFER);
        let id = stream_id.to_string();
        self.reader = Some(tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.is_empty() {
                            continue;
                        }
                        if tx.send(line).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(stream = %id, "reading from stdout completed with error: {}", e);
                        break;
                    }
                }
            }
        }));

        Ok(rx)
    }

    /// 等待进程退出，可安全地在 `select!` 中取消
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        let status = self.child.wait().await?;
        self.exited = true;
        Ok(status)
    }

    /// 进程是否已确认退出
    pub fn has_exited(&self) -> bool {
        self.exited
    }

    /// 释放资源：删除临时文件，进程可能存活时终止并回收
    ///
    /// "进程已结束" 不视为错误，也不记录
    pub async fn cleanup(mut self, worker: &str, stream_id: &str) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(scratch) = self.scratch.take() {
            remove_scratch(scratch);
        }
        if self.exited {
            return;
        }

        match self.child.kill().await {
            Ok(()) => {
                info!(pool = worker, stream = stream_id, pid = ?self.pid, "process killed");
            }
            Err(e) if is_already_finished(&e) => {}
            Err(e) => {
                warn!(
                    pool = worker,
                    stream = stream_id,
                    pid = ?self.pid,
                    "failed to kill process: {}",
                    e
                );
            }
        }
    }
}

/// 在阻塞线程池中创建临时文件
async fn create_scratch(dir: PathBuf, prefix: String) -> Result<NamedTempFile, ProcessError> {
    tokio::task::spawn_blocking(move || {
        tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".log")
            .tempfile_in(&dir)
    })
    .await
    .map_err(|e| ProcessError::Scratch(io::Error::new(io::ErrorKind::Other, e)))?
    .map_err(ProcessError::Scratch)
}

fn remove_scratch(scratch: NamedTempFile) {
    let path = scratch.path().to_path_buf();
    if let Err(e) = scratch.close() {
        warn!("failed to remove scratch file {:?}: {}", path, e);
    }
}

/// tokio 对已回收的子进程调用 kill 时返回 `InvalidInput`
fn is_already_finished(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::InvalidInput
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn sh(script: &str, output: Output) -> Invocation {
        Invocation::new("sh", output).arg("-c").arg(script)
    }

    fn scratch_files(dir: &TempDir) -> usize {
        std::fs::read_dir(dir.path()).map(|d| d.count()).unwrap_or(0)
    }

    #[test]
    fn headers_render_in_key_order() {
        let mut headers = BTreeMap::new();
        headers.insert("User-Agent".to_string(), "probe".to_string());
        headers.insert("Authorization".to_string(), "Bearer x".to_string());

        assert_eq!(
            render_headers(&headers).as_deref(),
            Some("Authorization: Bearer x\r\nUser-Agent: probe\r\n")
        );
        assert!(render_headers(&BTreeMap::new()).is_none());

        let inv = Invocation::new("ffprobe", Output::Lines).headers(&headers);
        assert_eq!(inv.args[0], "-headers");
    }

    #[tokio::test]
    async fn spawn_failure_leaves_no_scratch_file() {
        let dir = TempDir::new().unwrap();
        let inv = Invocation::new("/definitely/not/a/binary", Output::Lines);

        let err = ProcessHandle::spawn(&inv, dir.path(), "x_metrics_")
            .await
            .err()
            .expect("spawn must fail");
        assert_eq!(err.as_label(), "spawn_failed");
        assert_eq!(scratch_files(&dir), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn missing_scratch_dir_is_created() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("shm").join("vtx-probe");
        let inv = sh("exit 0", Output::Scratch);

        let mut handle = ProcessHandle::spawn(&inv, &nested, "d_screenshot_")
            .await
            .unwrap();
        let path = handle.scratch_path().unwrap().to_path_buf();
        assert_eq!(path.parent(), Some(nested.as_path()));
        let file_name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(file_name.starts_with("d_screenshot_"));
        assert!(file_name.ends_with(".log"));

        handle.wait().await.unwrap();
        handle.cleanup("screenshot", "d").await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn streams_lines_and_classifies_exit() {
        let dir = TempDir::new().unwrap();
        let inv = sh("echo one; echo; echo two; exit 3", Output::Lines);
        let mut handle = ProcessHandle::spawn(&inv, dir.path(), "a_metrics_").await.unwrap();
        assert_eq!(scratch_files(&dir), 1);

        let mut lines = handle.lines("a").unwrap();
        let mut got = Vec::new();
        while let Some(line) = lines.recv().await {
            got.push(line);
        }
        assert_eq!(got, vec!["one", "two"]);

        let status = handle.wait().await.unwrap();
        assert_eq!(ExitKind::classify(status), ExitKind::Code(3));
        assert!(handle.has_exited());

        handle.cleanup("metrics", "a").await;
        assert_eq!(scratch_files(&dir), 0);
    }

    #[tokio::test]
    async fn cleanup_kills_running_process() {
        let dir = TempDir::new().unwrap();
        let inv = sh("sleep 30", Output::Scratch);
        let handle = ProcessHandle::spawn(&inv, dir.path(), "b_screenshot_").await.unwrap();
        assert!(!handle.has_exited());

        tokio::time::timeout(Duration::from_secs(5), handle.cleanup("screenshot", "b"))
            .await
            .expect("cleanup must not hang");
        assert_eq!(scratch_files(&dir), 0);
    }

    #[tokio::test]
    async fn scratch_output_is_captured() {
        let dir = TempDir::new().unwrap();
        let inv = sh("echo diag 1>&2; echo out", Output::Scratch);
        let mut handle = ProcessHandle::spawn(&inv, dir.path(), "c_screenshot_").await.unwrap();
        handle.wait().await.unwrap();

        let path = handle.scratch_path().unwrap().to_path_buf();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("diag"));
        assert!(content.contains("out"));

        handle.cleanup("screenshot", "c").await;
        assert!(!path.exists());
    }
}
