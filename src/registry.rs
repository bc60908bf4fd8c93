//! Agent 注册表：从配置发现后端，维护可热替换的描述符快照
//!
//! 每条 [[backends]] 配置独立构建，单条失败只记日志并跳过，不影响其余条目。
//! 快照为 Arc<HashMap>，reload 时整体原子替换；正在进行中的请求继续持有
//! 旧快照直到完成。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::backend::{
    AgentBackend, AgentMode, OpenAiCompatBackend, ScriptedBackend, ToolPipelineBackend,
};
use crate::config::{AppConfig, BackendEntry};
use crate::dedup::DedupCache;
use crate::store::ThreadStore;
use crate::tools::build_tool;

/// 一个已注册 agent 的完整描述：元数据 + 后端实例
pub struct AgentDescriptor {
    pub id: String,
    pub name: String,
    pub description: String,
    pub mode: AgentMode,
    pub suggestions: Vec<String>,
    pub backend: Arc<dyn AgentBackend>,
}

impl AgentDescriptor {
    /// 网关是否需要替该 agent 持久化线程消息
    pub fn gateway_persists(&self) -> bool {
        self.mode == AgentMode::Chat && !self.backend.supports_memory()
    }
}

type Snapshot = Arc<HashMap<String, Arc<AgentDescriptor>>>;

/// Agent 注册表
pub struct Registry {
    config: AppConfig,
    store: Arc<dyn ThreadStore>,
    dedup: Arc<DedupCache>,
    agents: RwLock<Snapshot>,
}

/// 按家族构建单个后端实例；Err 信息写入日志后该条目被跳过
fn build_backend(
    entry: &BackendEntry,
    config: &AppConfig,
    store: &Arc<dyn ThreadStore>,
    dedup: &Arc<DedupCache>,
) -> Result<Arc<dyn AgentBackend>, String> {
    let mode = AgentMode::parse(&entry.mode);
    match entry.family.as_str() {
        "openai" => {
            let base_url = entry
                .base_url
                .as_deref()
                .ok_or("openai backend requires base_url")?;
            let model = entry.model.as_deref().ok_or("openai backend requires model")?;
            let api_key = match &entry.api_key_env {
                Some(var) => std::env::var(var)
                    .map_err(|_| format!("env var {} not set", var))?,
                None => String::new(),
            };
            // chat 模式下把线程历史拼进每次请求
            let history = if mode == AgentMode::Chat {
                Some(Arc::clone(store))
            } else {
                None
            };
            Ok(Arc::new(OpenAiCompatBackend::new(
                base_url,
                model,
                &api_key,
                entry.system_prompt.clone(),
                history,
                &config.timeouts,
            )))
        }
        "pipeline" => {
            let tool_name = entry.tool.as_deref().ok_or("pipeline backend requires tool")?;
            let tool = build_tool(tool_name, &config.timeouts, Arc::clone(dedup))
                .ok_or_else(|| format!("unknown tool: {}", tool_name))?;
            Ok(Arc::new(ToolPipelineBackend::new(
                tool,
                entry.answer_template.clone(),
            )))
        }
        "scripted" => {
            let text = entry.script.join("");
            Ok(Arc::new(ScriptedBackend::replaying(&text)))
        }
        other => Err(format!("unknown backend family: {}", other)),
    }
}

fn build_snapshot(
    config: &AppConfig,
    store: &Arc<dyn ThreadStore>,
    dedup: &Arc<DedupCache>,
) -> Snapshot {
    let mut agents = HashMap::new();
    for entry in &config.backends {
        match build_backend(entry, config, store, dedup) {
            Ok(backend) => {
                let descriptor = AgentDescriptor {
                    id: entry.id.clone(),
                    name: entry.name.clone().unwrap_or_else(|| entry.id.clone()),
                    description: entry.description.clone().unwrap_or_default(),
                    mode: AgentMode::parse(&entry.mode),
                    suggestions: entry.suggestions.clone(),
                    backend,
                };
                tracing::info!(agent = %entry.id, family = %entry.family, "registered agent");
                agents.insert(entry.id.clone(), Arc::new(descriptor));
            }
            Err(e) => {
                tracing::warn!(agent = %entry.id, family = %entry.family, error = %e, "skipping agent");
            }
        }
    }
    Arc::new(agents)
}

impl Registry {
    /// 从配置构建注册表；每条后端独立尝试，失败条目跳过
    pub fn discover(
        config: AppConfig,
        store: Arc<dyn ThreadStore>,
        dedup: Arc<DedupCache>,
    ) -> Self {
        let snapshot = build_snapshot(&config, &store, &dedup);
        tracing::info!(count = snapshot.len(), "agent registry ready");
        Self {
            config,
            store,
            dedup,
            agents: RwLock::new(snapshot),
        }
    }

    pub async fn get(&self, agent_id: &str) -> Option<Arc<AgentDescriptor>> {
        self.agents.read().await.get(agent_id).cloned()
    }

    /// 当前快照中的全部描述符，按 id 排序
    pub async fn list(&self) -> Vec<Arc<AgentDescriptor>> {
        let snapshot = self.agents.read().await;
        let mut all: Vec<_> = snapshot.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// 重新发现并原子替换快照；返回新快照中的 agent 数
    pub async fn reload(&self) -> usize {
        let snapshot = build_snapshot(&self.config, &self.store, &self.dedup);
        let count = snapshot.len();
        *self.agents.write().await = snapshot;
        tracing::info!(count, "agent registry reloaded");
        count
    }
}
