//! Scripted 后端（用于测试与本地演示，无需外部服务）
//!
//! 按脚本回放原生事件；可注入失败（调用时失败或流中途失败），
//! 用于驱动恢复策略与协议适配器的测试。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream;

use super::{AgentBackend, BackendError, NativeEvent, NativeEventStream};

/// 可注入的失败类型；对应 BackendError 的恢复分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFailure {
    /// 派发即失败：后端侧会话记忆丢失
    SessionNotFound,
    /// 派发即失败：历史中有未闭合的工具调用
    ToolHistoryCorrupt,
    /// 派发即失败：后端不可达
    Unavailable,
    /// 流中途失败：先吐一半事件再报错
    MidStream,
}

impl ScriptedFailure {
    fn to_error(self) -> BackendError {
        match self {
            ScriptedFailure::SessionNotFound => {
                BackendError::SessionNotFound("scripted: session expired".into())
            }
            ScriptedFailure::ToolHistoryCorrupt => {
                BackendError::ToolHistoryCorrupt("scripted: dangling tool call".into())
            }
            ScriptedFailure::Unavailable | ScriptedFailure::MidStream => {
                BackendError::Unavailable("scripted: backend down".into())
            }
        }
    }
}

/// 回放固定事件脚本的后端；记录收到的 thread_id 供测试断言
pub struct ScriptedBackend {
    events: Vec<NativeEvent>,
    final_text: String,
    supports_memory: bool,
    /// 每次 stream 调用弹出一个待注入的失败；空则正常回放
    pending_failures: Mutex<VecDeque<ScriptedFailure>>,
    stream_calls: AtomicUsize,
    invoke_calls: AtomicUsize,
    seen_thread_ids: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    /// 把一段文本拆成逐词 token 的回放脚本
    pub fn replaying(text: &str) -> Self {
        let events = text
            .split_inclusive(' ')
            .map(|w| NativeEvent::Token {
                content: Some(w.to_string()),
                reasoning: None,
            })
            .chain(std::iter::once(NativeEvent::Done))
            .collect();
        Self::with_events(events, text)
    }

    pub fn with_events(events: Vec<NativeEvent>, final_text: &str) -> Self {
        Self {
            events,
            final_text: final_text.to_string(),
            supports_memory: false,
            pending_failures: Mutex::new(VecDeque::new()),
            stream_calls: AtomicUsize::new(0),
            invoke_calls: AtomicUsize::new(0),
            seen_thread_ids: Mutex::new(Vec::new()),
        }
    }

    /// 声明该后端自带线程记忆（测试 supports_memory 分支）
    pub fn with_memory(mut self) -> Self {
        self.supports_memory = true;
        self
    }

    /// 注入失败队列：接下来的 stream 调用按顺序各失败一次
    pub fn fail_next_streams(self, failures: Vec<ScriptedFailure>) -> Self {
        *self.pending_failures.lock().unwrap() = failures.into();
        self
    }

    pub fn stream_call_count(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    pub fn invoke_call_count(&self) -> usize {
        self.invoke_calls.load(Ordering::SeqCst)
    }

    /// stream 历次收到的 thread_id（派发失败的调用也计入）
    pub fn seen_thread_ids(&self) -> Vec<String> {
        self.seen_thread_ids.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    async fn invoke(&self, _query: &str, _thread_id: &str) -> Result<String, BackendError> {
        self.invoke_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.final_text.clone())
    }

    async fn stream(&self, _query: &str, thread_id: &str) -> Result<NativeEventStream, BackendError> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        self.seen_thread_ids
            .lock()
            .unwrap()
            .push(thread_id.to_string());

        let failure = self.pending_failures.lock().unwrap().pop_front();
        match failure {
            Some(ScriptedFailure::MidStream) => {
                // 先回放一半事件，再在流中报错
                let half = self.events.len() / 2;
                let items: Vec<Result<NativeEvent, BackendError>> = self
                    .events
                    .iter()
                    .take(half)
                    .cloned()
                    .map(Ok)
                    .chain(std::iter::once(Err(ScriptedFailure::MidStream.to_error())))
                    .collect();
                Ok(Box::pin(stream::iter(items)))
            }
            Some(f) => Err(f.to_error()),
            None => {
                let items: Vec<Result<NativeEvent, BackendError>> =
                    self.events.iter().cloned().map(Ok).collect();
                Ok(Box::pin(stream::iter(items)))
            }
        }
    }

    fn supports_memory(&self) -> bool {
        self.supports_memory
    }
}
