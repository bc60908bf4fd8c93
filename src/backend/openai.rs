//! OpenAI 兼容家族：任意 /chat/completions 端点（DeepSeek、Chutes、自建代理等）
//!
//! 流式走 SSE（`data: {...}` + `[DONE]` 哨兵），手工解析以同时取出
//! `delta.content` 与 `delta.reasoning_content`（部分供应商用 `delta.reasoning`）。
//! chat 模式下从网关的 ThreadStore 取线程历史拼进请求 —— 该家族
//! supports_memory 为 false，记忆由网关持久化。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use serde::Deserialize;
use serde_json::json;

use super::{AgentBackend, BackendError, NativeEvent, NativeEventStream};
use crate::config::TimeoutsSection;
use crate::store::{Role, ThreadStore};

/// SSE 流中的单个 chunk
#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    /// 常见字段名（Chutes / DeepSeek）
    #[serde(default)]
    reasoning_content: Option<String>,
    /// 部分供应商（Cerebras）直接叫 reasoning
    #[serde(default)]
    reasoning: Option<String>,
}

/// 非流式响应
#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

/// 解析一行 SSE；返回 None 表示空行/注释/[DONE]/无增量
fn parse_sse_line(line: &str) -> Result<Option<NativeEvent>, BackendError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return Ok(None);
    }

    if let Some(data) = line.strip_prefix("data:") {
        let data = data.trim();
        if data == "[DONE]" {
            return Ok(None);
        }
        let chunk: StreamChunk = serde_json::from_str(data)
            .map_err(|e| BackendError::Execution(format!("bad SSE chunk: {}", e)))?;
        if let Some(choice) = chunk.choices.into_iter().next() {
            let reasoning = choice
                .delta
                .reasoning_content
                .or(choice.delta.reasoning)
                .filter(|r| !r.is_empty());
            let content = choice.delta.content.filter(|c| !c.is_empty());
            if content.is_some() || reasoning.is_some() {
                return Ok(Some(NativeEvent::Token { content, reasoning }));
            }
        }
    }
    Ok(None)
}

/// reqwest 错误分类：连接/超时 → Unavailable，其余 → Execution
fn classify_reqwest(e: reqwest::Error) -> BackendError {
    if e.is_connect() || e.is_timeout() {
        BackendError::Unavailable(e.to_string())
    } else {
        BackendError::Execution(e.to_string())
    }
}

/// OpenAI 兼容后端
pub struct OpenAiCompatBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    system_prompt: Option<String>,
    /// chat 模式的记忆句柄；single-shot 为 None
    history: Option<Arc<dyn ThreadStore>>,
}

impl OpenAiCompatBackend {
    pub fn new(
        base_url: &str,
        model: &str,
        api_key: &str,
        system_prompt: Option<String>,
        history: Option<Arc<dyn ThreadStore>>,
        timeouts: &TimeoutsSection,
    ) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(timeouts.connect_secs))
            .timeout(Duration::from_secs(timeouts.request_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.to_string(),
            system_prompt,
            history,
        }
    }

    /// 组装 API 消息：system prompt + 线程历史 + 当前 query
    async fn build_messages(&self, query: &str, thread_id: &str) -> Vec<serde_json::Value> {
        let mut messages = Vec::new();
        if let Some(prompt) = &self.system_prompt {
            messages.push(json!({"role": "system", "content": prompt}));
        }
        if let Some(store) = &self.history {
            if let Ok(Some(history)) = store.get_messages(thread_id).await {
                for m in history {
                    let role = match m.role {
                        Role::User => "user",
                        Role::Assistant => "assistant",
                    };
                    messages.push(json!({"role": role, "content": m.content}));
                }
            }
        }
        messages.push(json!({"role": "user", "content": query}));
        messages
    }

    async fn post_completions(
        &self,
        query: &str,
        thread_id: &str,
        stream: bool,
    ) -> Result<reqwest::Response, BackendError> {
        let body = json!({
            "model": self.model,
            "messages": self.build_messages(query, thread_id).await,
            "stream": stream,
        });
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            // 供应商把会话过期报成普通错误文本，按内容归类
            if text.contains("Session not found") {
                return Err(BackendError::SessionNotFound(text));
            }
            if status.as_u16() >= 500 {
                return Err(BackendError::Unavailable(format!("HTTP {}: {}", status, text)));
            }
            return Err(BackendError::Execution(format!("HTTP {}: {}", status, text)));
        }
        Ok(resp)
    }
}

#[async_trait]
impl AgentBackend for OpenAiCompatBackend {
    async fn invoke(&self, query: &str, thread_id: &str) -> Result<String, BackendError> {
        let resp = self.post_completions(query, thread_id, false).await?;
        let parsed: CompletionResponse = resp.json().await.map_err(classify_reqwest)?;
        Ok(parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }

    async fn stream(&self, query: &str, thread_id: &str) -> Result<NativeEventStream, BackendError> {
        let resp = self.post_completions(query, thread_id, true).await?;

        let (tx, rx) = tokio::sync::mpsc::channel::<Result<NativeEvent, BackendError>>(100);
        tokio::spawn(async move {
            let mut buffer = String::new();
            let mut bytes_stream = resp.bytes_stream();

            while let Some(item) = bytes_stream.next().await {
                match item {
                    Ok(bytes) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        while let Some(pos) = buffer.find('\n') {
                            let line: String = buffer.drain(..=pos).collect();
                            match parse_sse_line(&line) {
                                Ok(Some(event)) => {
                                    if tx.send(Ok(event)).await.is_err() {
                                        return; // 接收端已放弃，停止消费并释放响应
                                    }
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    let _ = tx.send(Err(e)).await;
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(classify_reqwest(e))).await;
                        return;
                    }
                }
            }
            let _ = tx.send(Ok(NativeEvent::Done)).await;
        });

        Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }
}
