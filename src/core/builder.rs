//! 编排器构建器：统一的组件装配逻辑
//!
//! 所有组件从同一份 `AppConfig` 与注入的 `RoleInvoker` 构造，依赖显式传入，不使用全局注册表。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::background::{BackgroundExecutor, ResourceSampler};
use crate::channel::MessageChannel;
use crate::collaboration::CollaborationCoordinator;
use crate::config::AppConfig;
use crate::core::orchestrator::{BlockingPredicate, Orchestrator};
use crate::core::SetupError;
use crate::decision::DecisionRouter;
use crate::events::EventBus;
use crate::graph::DependencyGraph;
use crate::invoker::{EchoInvoker, RoleInvoker};
use crate::workflow::{PhaseCatalog, StateMachine, StateStore, Variant};

/// 编排器构建器
pub struct OrchestratorBuilder {
    config: AppConfig,
    invoker: Option<Arc<dyn RoleInvoker>>,
    events: Option<EventBus>,
    catalog: Option<PhaseCatalog>,
    sampler: Option<Arc<dyn ResourceSampler>>,
    predicates: Vec<BlockingPredicate>,
    shutdown: CancellationToken,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            invoker: None,
            events: None,
            catalog: None,
            sampler: None,
            predicates: Vec::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// 注入角色调用器（未设置时使用 EchoInvoker）
    pub fn with_invoker(mut self, invoker: Arc<dyn RoleInvoker>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    /// 共享外部事件总线
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// 直接指定阶段目录（优先于 workflow.catalog_path）
    pub fn with_catalog(mut self, catalog: PhaseCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// 启用资源监控
    pub fn with_sampler(mut self, sampler: Arc<dyn ResourceSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn with_predicate(mut self, predicate: BlockingPredicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    /// 与外部关闭信号联动
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 配置中的初始变体
    pub fn variant(&self) -> Result<Variant, SetupError> {
        self.config
            .workflow
            .variant
            .parse()
            .map_err(SetupError::InvalidVariant)
    }

    fn build_catalog(&mut self) -> Result<PhaseCatalog, SetupError> {
        if let Some(catalog) = self.catalog.take() {
            return Ok(catalog);
        }
        match &self.config.workflow.catalog_path {
            Some(path) => {
                tracing::info!("Loading phase catalog from {}", path.display());
                Ok(PhaseCatalog::from_file(path)?)
            }
            None => Ok(PhaseCatalog::standard()),
        }
    }

    fn build_graph(&self) -> DependencyGraph {
        if self.config.dependencies.is_empty() {
            DependencyGraph::standard()
        } else {
            DependencyGraph::from_dependencies(self.config.dependencies.clone())
        }
    }

    /// 构建编排器（不启动后台任务，见 `Orchestrator::start`）
    pub fn build(mut self) -> Result<Arc<Orchestrator>, SetupError> {
        self.variant()?;
        let catalog = Arc::new(self.build_catalog()?);
        let graph = Arc::new(self.build_graph());
        let events = self.events.take().unwrap_or_default();
        let invoker = self
            .invoker
            .take()
            .unwrap_or_else(|| Arc::new(EchoInvoker));
        let config = self.config;

        let channel = Arc::new(MessageChannel::new(
            invoker,
            Duration::from_millis(config.channel.default_timeout_ms),
        ));

        let store = StateStore::new(&config.workflow.state_dir, config.workflow.backup_retention);
        let state = Arc::new(
            StateMachine::new(catalog, events.clone())
                .with_store(store)
                .with_auto_persist(config.workflow.auto_persist),
        );

        let router = Arc::new(DecisionRouter::new(
            &config.router,
            Arc::clone(&channel),
            events.clone(),
        )?);

        let coordinator = Arc::new(CollaborationCoordinator::new(
            config.collaboration.clone(),
            Arc::clone(&channel),
            graph,
            events.clone(),
        ));

        let mut executor = BackgroundExecutor::new(
            config.background.clone(),
            Arc::clone(&channel),
            events.clone(),
        )
        .with_shutdown(self.shutdown.clone());
        if let Some(sampler) = self.sampler {
            executor = executor.with_sampler(sampler);
        }

        let mut orchestrator = Orchestrator::new(
            state,
            channel,
            router,
            coordinator,
            executor,
            events,
            config.orchestrator.clone(),
            self.shutdown,
        );
        for predicate in self.predicates {
            orchestrator = orchestrator.with_predicate(predicate);
        }

        tracing::info!(
            "Orchestrator assembled (state dir: {})",
            config.workflow.state_dir.display()
        );
        Ok(Arc::new(orchestrator))
    }
}

/// 便捷函数：从默认路径加载配置并创建构建器
pub fn create_orchestrator_builder(config_path: Option<PathBuf>) -> OrchestratorBuilder {
    let config = crate::config::load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    OrchestratorBuilder::new(config)
}
