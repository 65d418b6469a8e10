use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use vtx_probe::fetcher::Fetcher;
use vtx_probe::{
    FetchError, Registry, RunOutcome, Scheduler, StreamRef, StreamSet, Worker, WorkerRef,
};

const INTERVAL: Duration = Duration::from_secs(60);

/// 按顺序返回预设结果的 fetcher，用完后返回错误
struct ScriptedFetcher {
    script: Mutex<VecDeque<Result<StreamSet, FetchError>>>,
    calls: AtomicUsize,
}

impl ScriptedFetcher {
    fn new(script: Vec<Result<StreamSet, FetchError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch_streams(&self, _token: &CancellationToken) -> Result<StreamSet, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(FetchError::Parse("script exhausted".to_string())))
    }
}

/// 运行到被取消为止，记录启动次数
struct IdleWorker {
    name: &'static str,
    runs: AtomicUsize,
}

impl IdleWorker {
    fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            runs: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Worker for IdleWorker {
    fn name(&self) -> &str {
        self.name
    }

    fn label(&self) -> &str {
        "idle/"
    }

    async fn run(&self, token: CancellationToken, _stream: StreamRef) -> RunOutcome {
        self.runs.fetch_add(1, Ordering::SeqCst);
        token.cancelled().await;
        RunOutcome::Cancelled
    }
}

fn set(ids: &[&str]) -> StreamSet {
    ids.iter()
        .map(|id| StreamRef::new(*id, format!("rtmp://origin/live/{}", id)))
        .collect()
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

fn active(registry: &Registry, pool: &str) -> Vec<String> {
    registry.pool(pool).unwrap().active_set().sorted_ids()
}

#[tokio::test(start_paused = true)]
async fn scheduler_converges_every_pool_and_skips_failed_ticks() {
    let root = CancellationToken::new();
    let metrics = IdleWorker::new("metrics");
    let screenshot = IdleWorker::new("screenshot");
    let registry = Registry::new(
        root.clone(),
        vec![metrics.clone() as WorkerRef, screenshot.clone() as WorkerRef],
        Duration::from_secs(5),
    );

    let fetcher = ScriptedFetcher::new(vec![
        Ok(set(&["a", "b", "c"])),
        Err(FetchError::Status(503)),
        Ok(set(&["b", "c", "d"])),
        Ok(set(&["b", "c", "d"])),
    ]);
    let scheduler = Scheduler::new(fetcher.clone(), registry.pools(), INTERVAL);

    let stop = CancellationToken::new();
    let run = tokio::spawn({
        let stop = stop.clone();
        async move { scheduler.run(stop).await }
    });

    // 启动后立即收敛一次
    settle().await;
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    assert_eq!(active(&registry, "metrics"), vec!["a", "b", "c"]);
    assert_eq!(active(&registry, "screenshot"), vec!["a", "b", "c"]);

    // 拉取失败：整个周期跳过
    tokio::time::advance(INTERVAL).await;
    settle().await;
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    assert_eq!(active(&registry, "metrics"), vec!["a", "b", "c"]);

    // 停止 a，启动 d
    tokio::time::advance(INTERVAL).await;
    settle().await;
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    assert_eq!(active(&registry, "metrics"), vec!["b", "c", "d"]);
    assert_eq!(active(&registry, "screenshot"), vec!["b", "c", "d"]);
    assert_eq!(metrics.runs.load(Ordering::SeqCst), 4);

    // 期望集合不变时不重复启动
    tokio::time::advance(INTERVAL).await;
    settle().await;
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 4);
    assert_eq!(metrics.runs.load(Ordering::SeqCst), 4);
    assert_eq!(screenshot.runs.load(Ordering::SeqCst), 4);

    // 调度器退出时不排空任务池
    stop.cancel();
    run.await.unwrap();
    assert_eq!(registry.pool("metrics").unwrap().active_count(), 3);

    root.cancel();
    assert!(registry.shutdown().await.is_empty());
    assert!(registry.pools().iter().all(|p| p.active_count() == 0));
}

#[tokio::test]
async fn tick_returns_per_pool_changes() {
    let root = CancellationToken::new();
    let registry = Registry::new(
        root.clone(),
        vec![IdleWorker::new("metrics") as WorkerRef],
        Duration::from_secs(5),
    );
    let pool = registry.pool("metrics").unwrap();
    for stream in set(&["a", "b", "c"]).iter() {
        pool.start(stream.clone()).unwrap();
    }

    let fetcher = ScriptedFetcher::new(vec![Ok(set(&["b", "c", "d"]))]);
    let scheduler = Scheduler::new(fetcher, registry.pools(), INTERVAL);

    let token = CancellationToken::new();
    let changes = scheduler.tick(&token).await.unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].stopped, vec!["a"]);
    assert_eq!(changes[0].started, vec!["d"]);

    // 脚本已用完，拉取失败返回 None
    assert!(scheduler.tick(&token).await.is_none());

    root.cancel();
    assert!(registry.shutdown().await.is_empty());
}

#[tokio::test]
async fn racing_stop_is_tolerated() {
    let root = CancellationToken::new();
    let registry = Registry::new(
        root.clone(),
        vec![IdleWorker::new("metrics") as WorkerRef],
        Duration::from_secs(5),
    );
    let pool = registry.pool("metrics").unwrap();
    pool.start(StreamRef::new("a", "rtmp://a")).unwrap();

    // 另一方抢先停止后，再次停止得到可区分的 "未找到"
    pool.stop("a").unwrap();
    assert!(matches!(
        pool.stop("a"),
        Err(vtx_probe::PoolError::TaskNotFound(ref id)) if id == "a"
    ));

    root.cancel();
    assert!(registry.shutdown().await.is_empty());
}
