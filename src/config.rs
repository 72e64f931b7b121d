//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TOOLHOOK__*` 覆盖（双下划线表示嵌套，如 `TOOLHOOK__DISPATCH__MAX_ATTEMPTS=5`）。

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::dispatch::backoff::RetryPolicy;
use crate::store::SweepPolicy;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSection,
    pub provider: ProviderSection,
    pub dispatch: DispatchSection,
    pub cleanup: CleanupSection,
    pub correlation: CorrelationSection,
    /// 挂起记录丢失时恢复 Run 所用的 agent
    pub default_agent: Option<String>,
    /// [agents.<id>] 段：agent 目录
    pub agents: BTreeMap<String, AgentSection>,
}

/// [server] 段
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

fn default_bind() -> String {
    "0.0.0.0:3000".to_string()
}

/// [provider] 段：对话 Provider 地址、超时、轮询与分步重试
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSection {
    pub base_url: Option<String>,
    /// 未设置时读 OPENAI_API_KEY
    pub api_key: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
    #[serde(default = "default_provider_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_provider_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_provider_retry_max_ms")]
    pub retry_max_ms: u64,
    /// 单步超时（含重试中的每一次），区别于轮询总超时
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            request_timeout_secs: default_request_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_timeout_secs: default_poll_timeout_secs(),
            retry_attempts: default_provider_retry_attempts(),
            retry_base_ms: default_provider_retry_base_ms(),
            retry_max_ms: default_provider_retry_max_ms(),
            step_timeout_secs: default_step_timeout_secs(),
        }
    }
}

impl ProviderSection {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_attempts,
            Duration::from_millis(self.retry_base_ms),
            Duration::from_millis(self.retry_max_ms),
        )
    }
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_poll_timeout_secs() -> u64 {
    60
}

fn default_provider_retry_attempts() -> u32 {
    3
}

fn default_provider_retry_base_ms() -> u64 {
    500
}

fn default_provider_retry_max_ms() -> u64 {
    4000
}

fn default_step_timeout_secs() -> u64 {
    45
}

/// [dispatch] 段：投递退避与超时
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchSection {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// 单次投递超时（秒）
    #[serde(default = "default_dispatch_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            timeout_secs: default_dispatch_timeout_secs(),
        }
    }
}

impl DispatchSection {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

fn default_base_delay_ms() -> u64 {
    2000
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_dispatch_timeout_secs() -> u64 {
    30
}

/// [cleanup] 段：扫描间隔与两档年龄阈值
#[derive(Debug, Clone, Deserialize)]
pub struct CleanupSection {
    #[serde(default = "default_cleanup_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: i64,
    #[serde(default = "default_failed_max_age_secs")]
    pub failed_max_age_secs: i64,
    #[serde(default = "default_archive_capacity")]
    pub archive_capacity: usize,
}

impl Default for CleanupSection {
    fn default() -> Self {
        Self {
            interval_secs: default_cleanup_interval_secs(),
            max_age_secs: default_max_age_secs(),
            failed_max_age_secs: default_failed_max_age_secs(),
            archive_capacity: default_archive_capacity(),
        }
    }
}

impl CleanupSection {
    pub fn sweep_policy(&self) -> SweepPolicy {
        SweepPolicy {
            max_age: chrono::Duration::seconds(self.max_age_secs),
            failed_max_age: chrono::Duration::seconds(self.failed_max_age_secs),
        }
    }
}

fn default_cleanup_interval_secs() -> u64 {
    300
}

fn default_max_age_secs() -> i64 {
    3600
}

fn default_failed_max_age_secs() -> i64 {
    600
}

fn default_archive_capacity() -> usize {
    200
}

/// [correlation] 段
#[derive(Debug, Clone, Deserialize)]
pub struct CorrelationSection {
    /// 超过此字符数的输出被截断并追加标记
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
}

impl Default for CorrelationSection {
    fn default() -> Self {
        Self {
            max_output_chars: default_max_output_chars(),
        }
    }
}

fn default_max_output_chars() -> usize {
    100_000
}

/// [agents.<id>] 段：一个 agent 的对话配置与投递端点
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AgentSection {
    pub name: Option<String>,
    /// Provider 侧的 assistant 配置 id
    #[serde(default)]
    pub assistant_id: String,
    /// 工具调用投递地址
    pub webhook_url: Option<String>,
}

/// 从 config 目录加载配置，环境变量 TOOLHOOK__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TOOLHOOK__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TOOLHOOK")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
