//! Dockhand 命令行入口
//!
//! 从文件参数（或标准输入）读取 JobRequest JSON，用演练工具执行作业，把 JobResult JSON 打印到标准输出。
//!
//! 用法：`dockhand [--config <path>] [request.json | -]`

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dockhand::config::load_config;
use dockhand::core::{EngineBuilder, ShutdownCoordinator, ShutdownManager};
use dockhand::retry::HeuristicFixProvider;
use dockhand::tools::{dry_run_registry, RequiredFieldsValidator};
use dockhand::workflow::{AnalysisEnricher, ChannelProgressSink, JobRequest};

#[derive(Debug, Parser)]
#[command(name = "dockhand", version, about = "Run a containerize-and-deploy job")]
struct Args {
    /// 额外的配置文件，覆盖 config/default.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// JobRequest JSON 文件；省略或为 `-` 时读标准输入
    request: Option<PathBuf>,
}

impl Args {
    fn request_path(&self) -> Option<&Path> {
        self.request.as_deref().filter(|p| *p != Path::new("-"))
    }
}

fn read_request(path: Option<&Path>) -> anyhow::Result<JobRequest> {
    let raw = match path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read request from stdin")?;
            buf
        }
    };
    serde_json::from_str(&raw).context("Invalid job request JSON")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.clone()).context("Failed to load config")?;
    dockhand::observability::init(&config.log.level);

    let request = read_request(args.request_path())?;

    let (progress, mut progress_rx) = ChannelProgressSink::new(config.app.progress_buffer);
    let progress_log = tokio::spawn(async move {
        while let Some(update) = progress_rx.recv().await {
            tracing::info!(
                stage = %update.stage,
                status = %update.status,
                percent = update.percent,
                "{}",
                update.message
            );
        }
    });

    let mut engine = EngineBuilder::new(config.clone(), dry_run_registry())
        .with_progress(Arc::new(progress))
        .with_enricher(Arc::new(AnalysisEnricher))
        .with_validator(Arc::new(RequiredFieldsValidator::for_default_plan()))
        .with_fix_provider(Arc::new(HeuristicFixProvider::new()))
        .build()
        .context("Failed to build engine")?;

    let manager = Arc::new(ShutdownManager::new());
    manager.install_signal_handlers();
    let mut shutdown = ShutdownCoordinator::new(Arc::clone(&manager)).with_timeout(config.app.shutdown_timeout_secs);
    engine.register_cleanups(&mut shutdown);

    // Ctrl+C 通过令牌取消作业，作业自行收尾并写回最终状态
    let cancel = manager.token();
    let outcome = if request.options.run_async {
        let handle = engine.orchestrator.spawn(request, &cancel);
        println!(
            "{}",
            serde_json::json!({ "session_id": handle.session_id(), "status": "accepted" })
        );
        handle.join().await
    } else {
        engine.orchestrator.execute(request, &cancel).await
    };

    shutdown.run_cleanup().await;
    // 进度通道在最后一个编排器引用释放后关闭
    drop(shutdown);
    drop(engine);
    let _ = progress_log.await;

    let result = outcome.context("Job could not be started")?;
    println!(
        "{}",
        serde_json::to_string_pretty(&result).context("Failed to encode job result")?
    );
    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}
