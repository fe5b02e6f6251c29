//! Maestro - 工作流编排核心
//!
//! 入口：初始化日志、装配编排器、初始化（或恢复）工作流，输出事件流直到收到关闭信号。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use maestro::background::ProcSampler;
use maestro::core::{
    create_orchestrator_builder, run_with_graceful_shutdown, ShutdownCoordinator, ShutdownManager,
};
use maestro::observability;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 日志：默认 info，可通过 RUST_LOG 覆盖
    observability::init();

    let builder = create_orchestrator_builder(None).with_sampler(Arc::new(ProcSampler));
    let variant = builder.variant().context("Invalid workflow variant")?;
    let retain_finished = Duration::from_secs(builder.config().background.retain_finished_secs);
    let orchestrator = builder.build().context("Failed to assemble orchestrator")?;

    let manager = Arc::new(ShutdownManager::for_orchestrator(&orchestrator));
    let cleanup = ShutdownCoordinator::for_orchestrator(&orchestrator);

    // 先启动监听，初始阶段的 phase-entered 才会触发角色初始化
    let mut events = orchestrator.events().subscribe_all();
    orchestrator.start();
    let instance = orchestrator
        .state()
        .initialize(variant)
        .await
        .context("Failed to initialize workflow")?;
    tracing::info!(
        "Workflow at phase '{}' ({}), {:.0}% complete",
        instance.current_phase,
        instance.variant,
        orchestrator.state().progress_percentage().unwrap_or(0.0)
    );

    let executor = orchestrator.executor().clone();
    let app = async move {
        let mut prune = tokio::time::interval(retain_finished.max(Duration::from_secs(60)));
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => match serde_json::to_string(&event) {
                        Ok(json) => println!("{json}"),
                        Err(e) => tracing::warn!("Failed to serialize event: {}", e),
                    },
                    None => break,
                },
                _ = prune.tick() => {
                    let removed = executor.cleanup_finished(retain_finished).await;
                    if removed > 0 {
                        tracing::debug!("Pruned {} finished background execution(s)", removed);
                    }
                }
            }
        }
    };

    let failed = run_with_graceful_shutdown(manager, app, cleanup).await;
    if failed > 0 {
        tracing::warn!("{} cleanup task(s) did not complete", failed);
    }

    Ok(())
}
