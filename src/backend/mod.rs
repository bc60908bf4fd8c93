//! Agent 后端抽象
//!
//! 所有后端家族（openai 兼容 / pipeline 工具流水线 / scripted 回放）实现 AgentBackend：
//! invoke（非流式单次结果）、stream（原生事件流）、supports_memory（后端侧是否自带线程记忆）。
//! 原生事件收敛为封闭的 NativeEvent 集合，由协议适配器统一翻译为线框，
//! 禁止在运行时做类型嗅探式分发。

mod openai;
mod pipeline;
mod scripted;

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use thiserror::Error;

pub use openai::OpenAiCompatBackend;
pub use pipeline::ToolPipelineBackend;
pub use scripted::{ScriptedBackend, ScriptedFailure};

/// Agent 模式：single-shot 无记忆单问单答；chat 多轮，由网关持久化线程
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentMode {
    SingleShot,
    Chat,
}

impl AgentMode {
    pub fn parse(s: &str) -> Self {
        match s {
            "chat" => AgentMode::Chat,
            _ => AgentMode::SingleShot,
        }
    }
}

/// 后端原生事件（封闭集合）：各家族把自己的线格式翻译成这些变体
#[derive(Debug, Clone)]
pub enum NativeEvent {
    /// 模型 token：content 与 reasoning 至多各一段，二者可同时为 None（心跳类事件）
    Token {
        content: Option<String>,
        reasoning: Option<String>,
    },
    /// 工具开始执行
    ToolStarted {
        name: String,
        input: serde_json::Value,
    },
    /// 工具执行结束；error 为 Some 时表示失败
    ToolFinished {
        name: String,
        error: Option<String>,
    },
    /// 流正常结束
    Done,
}

/// 后端错误：恢复策略按变体分类决定重试 / 换线程 / 无状态降级
#[derive(Error, Debug, Clone)]
pub enum BackendError {
    /// 后端侧会话记忆丢失或过期
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// 持久化历史中存在没有对应结果的工具调用（记忆与后端消息格式不一致时的已知隐患）
    #[error("Tool call history corrupted: {0}")]
    ToolHistoryCorrupt(String),

    /// 后端不可达（连接失败、超时）
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// 后端执行失败
    #[error("Backend execution failed: {0}")]
    Execution(String),
}

/// 原生事件流：调用方可提前 drop 以取消消费，实现必须随之释放后端资源
pub type NativeEventStream = Pin<Box<dyn Stream<Item = Result<NativeEvent, BackendError>> + Send>>;

/// Agent 后端 trait：每个可被 Registry 暴露的后端都要实现
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// 非流式单次调用，返回最终文本
    async fn invoke(&self, query: &str, thread_id: &str) -> Result<String, BackendError>;

    /// 流式调用，返回原生事件流；drop 即取消
    async fn stream(&self, query: &str, thread_id: &str) -> Result<NativeEventStream, BackendError>;

    /// thread_id 是否映射到后端侧的持久记忆；为 false 时网关自行持久化消息
    fn supports_memory(&self) -> bool {
        false
    }
}
