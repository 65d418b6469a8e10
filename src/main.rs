use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vtx_probe::config::{AppConfig, FetcherKind, SinkKind};
use vtx_probe::fetcher::{ConfigFetcher, Fetcher, HttpFetcher};
use vtx_probe::sink::{JsonLinesSink, LogSink, Sink};
use vtx_probe::worker::metrics::{probe_args, MetricsOptions, MetricsWorker};
use vtx_probe::worker::screenshot::{ScreenshotOptions, ScreenshotWorker, SimpleFormatter};
use vtx_probe::{signals, web, Registry, Scheduler, WorkerRef};

/// VTX Probe - 直播流监测
/// 解析命令行参数，加载配置文件，启动调度器、管理接口，并在收到信号后优雅关闭
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "vtx-probe.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 解析命令行参数，获取配置文件路径
    let args = Args::parse();

    // 加载配置文件
    let config = AppConfig::load(&args.config)?;

    // 初始化日志系统，RUST_LOG 优先于配置
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.server.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    info!(
        "VTX Probe initialized. Scratch dir: {:?}",
        config.server.scratch_dir
    );

    let fetcher: Arc<dyn Fetcher> = match config.fetcher.kind {
        FetcherKind::File => Arc::new(ConfigFetcher::new(&config.fetcher.path)),
        FetcherKind::Http => Arc::new(HttpFetcher::new(
            &config.fetcher.url,
            config.fetcher.headers.clone(),
            Duration::from_millis(config.fetcher.timeout_ms),
        )?),
    };

    let sink: Arc<dyn Sink> = match config.sink.kind {
        SinkKind::Jsonl => Arc::new(JsonLinesSink::new(&config.sink.path)),
        SinkKind::Log => Arc::new(LogSink),
    };

    // 按配置创建 worker，每个 worker 对应一个任务池
    let mut workers: Vec<WorkerRef> = Vec::new();
    if config.workers.metrics.enabled {
        workers.push(Arc::new(MetricsWorker::new(
            MetricsOptions {
                name: "metrics".to_string(),
                binary: config.workers.metrics.binary.clone(),
                args: probe_args(),
                headers: config.workers.metrics.headers.clone(),
                scratch_dir: config.server.scratch_dir.clone(),
            },
            sink,
        )));
    }
    if config.workers.screenshot.enabled {
        workers.push(Arc::new(ScreenshotWorker::new(
            ScreenshotOptions {
                name: "screenshot".to_string(),
                binary: config.workers.screenshot.binary.clone(),
                upload: config.workers.screenshot.upload.clone(),
                headers: config.workers.screenshot.headers.clone(),
                use_strftime: config.workers.screenshot.use_strftime,
                scratch_dir: config.server.scratch_dir.clone(),
            },
            Arc::new(SimpleFormatter),
        )));
    }

    let root = CancellationToken::new();
    let registry = Arc::new(Registry::new(
        root.clone(),
        workers,
        config.server.drain_timeout(),
    ));

    // 启动后台调度器
    let scheduler = Scheduler::new(
        fetcher,
        registry.pools(),
        config.server.refresh_interval(),
    );
    let scheduler_task = tokio::spawn({
        let token = root.clone();
        async move { scheduler.run(token).await }
    });

    // 启动管理接口
    info!("Listening on {}", config.server.listen);
    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    let server_task = tokio::spawn({
        let app = web::router(registry.clone());
        let token = root.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
        }
    });

    if let Err(e) = signals::wait_for_shutdown_signal().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received, stopping all tasks");

    // 取消根令牌：调度器退出，所有任务收到取消
    root.cancel();
    if let Err(e) = scheduler_task.await {
        warn!("Scheduler task failed: {}", e);
    }

    let failures = registry.shutdown().await;
    if !failures.is_empty() {
        warn!(
            pools = failures.len(),
            "Shutdown completed without graceful completion, some processes may be left running"
        );
    }

    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Admin server error: {}", e),
        Err(e) => warn!("Admin server task failed: {}", e),
    }

    info!("VTX Probe completed");
    Ok(())
}
