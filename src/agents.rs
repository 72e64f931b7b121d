//! Agent 目录：agent id → 对话配置（assistant id）与工具投递端点
//!
//! 投递地址为空、非 http(s)、或仍是模板占位符时视为不可用，派发前即报配置错误。

use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::AppConfig;
use crate::core::BridgeError;

/// 单个 agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    pub assistant_id: String,
    pub webhook_url: Option<String>,
}

impl AgentProfile {
    pub fn new(id: impl Into<String>, assistant_id: impl Into<String>, webhook_url: Option<&str>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            assistant_id: assistant_id.into(),
            webhook_url: webhook_url.map(String::from),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// 可用的投递端点；占位符 / 空值返回 None
    pub fn endpoint(&self) -> Option<&str> {
        self.webhook_url
            .as_deref()
            .map(str::trim)
            .filter(|url| is_usable_endpoint(url))
    }

    /// 可用端点，否则返回配置错误
    pub fn require_endpoint(&self) -> Result<&str, BridgeError> {
        self.endpoint().ok_or_else(|| {
            BridgeError::Configuration(format!(
                "Agent '{}' has no usable webhook endpoint configured (got {:?})",
                self.id,
                self.webhook_url.as_deref().unwrap_or("")
            ))
        })
    }
}

const PLACEHOLDER_MARKERS: [&str; 5] = ["your-", "placeholder", "example.com", "<", "changeme"];

fn is_usable_endpoint(url: &str) -> bool {
    if url.is_empty() || !(url.starts_with("http://") || url.starts_with("https://")) {
        return false;
    }
    let lower = url.to_lowercase();
    !PLACEHOLDER_MARKERS.iter().any(|m| lower.contains(m))
}

/// agent 目录（只读，启动时构建）
#[derive(Debug, Clone, Default)]
pub struct AgentDirectory {
    agents: BTreeMap<String, AgentProfile>,
    default_agent: Option<String>,
}

impl AgentDirectory {
    pub fn new(agents: impl IntoIterator<Item = AgentProfile>) -> Self {
        Self {
            agents: agents.into_iter().map(|a| (a.id.clone(), a)).collect(),
            default_agent: None,
        }
    }

    pub fn with_default(mut self, agent_id: impl Into<String>) -> Self {
        self.default_agent = Some(agent_id.into());
        self
    }

    pub fn from_config(cfg: &AppConfig) -> Self {
        let agents = cfg.agents.iter().map(|(id, section)| {
            let mut profile = AgentProfile::new(id, &section.assistant_id, section.webhook_url.as_deref());
            if let Some(name) = &section.name {
                profile = profile.with_name(name);
            }
            profile
        });
        let mut dir = Self::new(agents);
        dir.default_agent = cfg.default_agent.clone();
        dir
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentProfile> {
        self.agents.get(agent_id)
    }

    /// 解析 agent；未知 id 为配置错误
    pub fn resolve(&self, agent_id: &str) -> Result<&AgentProfile, BridgeError> {
        self.get(agent_id)
            .ok_or_else(|| BridgeError::Configuration(format!("Unknown agent '{}'", agent_id)))
    }

    pub fn default_agent(&self) -> Option<&AgentProfile> {
        self.default_agent.as_deref().and_then(|id| self.get(id))
    }

    pub fn list(&self) -> Vec<AgentProfile> {
        self.agents.values().cloned().collect()
    }
}
