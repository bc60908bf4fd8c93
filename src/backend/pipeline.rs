//! Pipeline 家族：工具调用 → 格式化回答（天气、搜索类 agent）
//!
//! 事件序列：ToolStarted → 执行工具 → ToolFinished（或携带错误）→
//! 成功时把 answer_template 渲染结果按词组切块逐条吐出 → Done。
//! 工具执行发生在流被消费时，消费方提前 drop 流即取消。

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use serde_json::json;

use super::{AgentBackend, BackendError, NativeEvent, NativeEventStream};
use crate::protocol::chunk_words;
use crate::tools::Tool;

const WORDS_PER_CHUNK: usize = 6;

/// 工具流水线后端
pub struct ToolPipelineBackend {
    tool: Arc<dyn Tool>,
    /// {result} 占位符替换为工具输出
    answer_template: String,
    /// 工具输入的字段名（get_weather → location，其余 → query）
    input_key: &'static str,
}

/// 执行一次流水线，产出完整事件序列
async fn run_pipeline(
    tool: Arc<dyn Tool>,
    template: String,
    input_key: &'static str,
    query: String,
) -> Vec<NativeEvent> {
    let name = tool.name().to_string();
    let input = json!({ input_key: query });

    let mut events = vec![NativeEvent::ToolStarted {
        name: name.clone(),
        input: input.clone(),
    }];

    match tool.execute(input).await {
        Ok(result) => {
            events.push(NativeEvent::ToolFinished { name, error: None });
            let answer = template.replace("{result}", &result);
            for chunk in chunk_words(&answer, WORDS_PER_CHUNK) {
                events.push(NativeEvent::Token {
                    content: Some(chunk),
                    reasoning: None,
                });
            }
        }
        Err(e) => {
            tracing::warn!(tool = %name, error = %e, "pipeline tool failed");
            events.push(NativeEvent::ToolFinished {
                name,
                error: Some(e),
            });
        }
    }
    events.push(NativeEvent::Done);
    events
}

impl ToolPipelineBackend {
    pub fn new(tool: Arc<dyn Tool>, answer_template: Option<String>) -> Self {
        let input_key = if tool.name().contains("weather") {
            "location"
        } else {
            "query"
        };
        Self {
            tool,
            answer_template: answer_template.unwrap_or_else(|| "{result}".to_string()),
            input_key,
        }
    }
}

#[async_trait]
impl AgentBackend for ToolPipelineBackend {
    async fn invoke(&self, query: &str, _thread_id: &str) -> Result<String, BackendError> {
        let result = self
            .tool
            .execute(json!({ self.input_key: query }))
            .await
            .map_err(BackendError::Execution)?;
        Ok(self.answer_template.replace("{result}", &result))
    }

    async fn stream(&self, query: &str, _thread_id: &str) -> Result<NativeEventStream, BackendError> {
        // 工具执行推迟到首次 poll；在此之前 drop 流不产生任何外部调用
        let deferred = run_pipeline(
            Arc::clone(&self.tool),
            self.answer_template.clone(),
            self.input_key,
            query.to_string(),
        );

        Ok(Box::pin(
            stream::once(deferred).flat_map(|events| stream::iter(events.into_iter().map(Ok))),
        ))
    }
}
