//! 组件装配：从配置构建存储、agent 目录、派发引擎、关联协议与编排器
//!
//! 所有组件显式构造、以 Arc 共享；Provider / 投递通道 / 等待实现可替换（测试注入 Mock）。

use std::sync::Arc;
use std::time::Duration;

use crate::agents::AgentDirectory;
use crate::cleanup::CleanupSweeper;
use crate::config::AppConfig;
use crate::core::BridgeError;
use crate::correlation::CorrelationProtocol;
use crate::dispatch::{DeliveryTransport, DispatchEngine, HttpTransport, Sleeper, TokioSleeper};
use crate::orchestrator::{Orchestrator, PollSettings};
use crate::provider::{ConversationProvider, OpenAiAssistantsProvider, ProviderRetry};
use crate::store::PendingCallStore;

/// 装配完成的桥接组件
pub struct Bridge {
    pub config: AppConfig,
    pub store: Arc<PendingCallStore>,
    pub agents: Arc<AgentDirectory>,
    pub dispatch: Arc<DispatchEngine>,
    pub correlation: Arc<CorrelationProtocol>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Bridge {
    /// 按 [cleanup] 段构建清理器
    pub fn sweeper(&self) -> CleanupSweeper {
        CleanupSweeper::new(
            Arc::clone(&self.store),
            self.config.cleanup.sweep_policy(),
            Duration::from_secs(self.config.cleanup.interval_secs.max(1)),
        )
        .with_correlation(Arc::clone(&self.correlation))
    }
}

/// 构建器
pub struct BridgeBuilder {
    config: AppConfig,
    provider: Option<Arc<dyn ConversationProvider>>,
    transport: Option<Arc<dyn DeliveryTransport>>,
    sleeper: Option<Arc<dyn Sleeper>>,
}

impl BridgeBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            provider: None,
            transport: None,
            sleeper: None,
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn ConversationProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn DeliveryTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// 退避与轮询共用的等待实现
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = Some(sleeper);
        self
    }

    pub fn build(self) -> Result<Bridge, BridgeError> {
        let cfg = self.config;

        let agents = AgentDirectory::from_config(&cfg);
        if let Some(default_agent) = &cfg.default_agent {
            agents.resolve(default_agent)?;
        }
        for agent in agents.list() {
            if agent.endpoint().is_none() {
                tracing::warn!(
                    agent_id = %agent.id,
                    "agent has no usable webhook_url; its tool calls will not be dispatched"
                );
            }
        }
        let agents = Arc::new(agents);

        let provider = match self.provider {
            Some(provider) => provider,
            None => {
                let openai = OpenAiAssistantsProvider::new(
                    cfg.provider.base_url.as_deref(),
                    cfg.provider.api_key.as_deref(),
                    cfg.provider.request_timeout_secs,
                );
                if !openai.has_api_key() {
                    return Err(BridgeError::Configuration(
                        "No provider API key: set [provider].api_key or OPENAI_API_KEY".to_string(),
                    ));
                }
                Arc::new(openai)
            }
        };
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(HttpTransport::new()));
        let sleeper = self.sleeper.unwrap_or_else(|| Arc::new(TokioSleeper));

        let store = Arc::new(PendingCallStore::new(cfg.cleanup.archive_capacity));
        let dispatch = Arc::new(
            DispatchEngine::new(
                Arc::clone(&store),
                Arc::clone(&agents),
                transport,
                cfg.dispatch.retry_policy(),
                Duration::from_secs(cfg.dispatch.timeout_secs.max(1)),
            )
            .with_sleeper(Arc::clone(&sleeper)),
        );
        let correlation = Arc::new(CorrelationProtocol::new(
            Arc::clone(&store),
            Arc::clone(&agents),
            cfg.correlation.max_output_chars,
        ));
        let retry = ProviderRetry::new(
            cfg.provider.retry_policy(),
            Duration::from_secs(cfg.provider.step_timeout_secs.max(1)),
        )
        .with_sleeper(Arc::clone(&sleeper));
        let orchestrator = Arc::new(
            Orchestrator::new(
                provider,
                Arc::clone(&dispatch),
                Arc::clone(&correlation),
                Arc::clone(&store),
                Arc::clone(&agents),
            )
            .with_retry(retry)
            .with_poll(PollSettings {
                interval: Duration::from_millis(cfg.provider.poll_interval_ms),
                timeout: Duration::from_secs(cfg.provider.poll_timeout_secs),
            })
            .with_sleeper(sleeper),
        );

        tracing::info!(
            agents = agents.list().len(),
            default_agent = cfg.default_agent.as_deref().unwrap_or(""),
            max_attempts = cfg.dispatch.max_attempts,
            "bridge components ready"
        );

        Ok(Bridge {
            config: cfg,
            store,
            agents,
            dispatch,
            correlation,
            orchestrator,
        })
    }
}
