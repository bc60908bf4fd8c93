//! 恢复策略：驱动一次补全，按错误分类决定重试、换线程或无状态降级
//!
//! 分类处理（每类至多一次，整体受补全截止时间约束）：
//! - SessionNotFound：用从 thread_id 派生的会话 id 重试一次，再失败则无状态降级
//! - ToolHistoryCorrupt：先发 recovery 状态帧，换全新线程 id 重试一次，再失败则降级
//! - 其余错误：直接无状态降级（invoke 拿完整答案，按词组切块模拟流式）
//!
//! 无论成败，客户端收到的帧序列始终格式完整：finish 永远是最后一帧。

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc::UnboundedSender;

use crate::backend::{AgentBackend, BackendError, NativeEvent};
use crate::config::TimeoutsSection;
use crate::error::GatewayError;
use crate::protocol::{chunk_words, CompletionContext, Frame, StreamAdapter, Turn};

const FALLBACK_WORDS_PER_CHUNK: usize = 6;

/// 客户端断开后写入线程的占位文案
const DISCONNECT_PLACEHOLDER: &str = "Response interrupted: client disconnected.";

/// 一次补全驱动完毕后的结果；error 为 Some 表示已向客户端发过 error 帧
pub struct CompletionOutcome {
    pub turn: Turn,
    pub error: Option<String>,
}

/// 驱动结束的方式：正常走完，或客户端断开后被放弃
#[derive(Debug, PartialEq, Eq)]
enum DriveEnd {
    Completed,
    Abandoned,
}

/// 从原线程 id 派生确定性的会话 id；同一线程多次失败映射到同一派生 id
pub fn derive_session_id(thread_id: &str) -> String {
    let mut hasher = DefaultHasher::new();
    thread_id.hash(&mut hasher);
    format!("session_{}", hasher.finish() % 10000)
}

fn send(sink: &UnboundedSender<Frame>, frame: Frame) {
    // 客户端断开后的收尾帧允许发送失败
    let _ = sink.send(frame);
}

/// 打开并消费一条后端流，事件经适配器翻译后立即下发。
/// 每条事件前检查接收端是否仍在：客户端断开即放弃消费，
/// 流被 drop 随之释放后端资源（reqwest 响应体、脚本迭代器）。
/// 派发失败与流中途失败统一以 Err 返回，交由上层分类。
async fn drive_stream(
    adapter: &mut StreamAdapter,
    backend: &Arc<dyn AgentBackend>,
    query: &str,
    thread_id: &str,
    sink: &UnboundedSender<Frame>,
) -> Result<DriveEnd, BackendError> {
    let mut stream = backend.stream(query, thread_id).await?;
    while let Some(item) = stream.next().await {
        if sink.is_closed() {
            tracing::info!(thread = %thread_id, "client disconnected, abandoning backend stream");
            return Ok(DriveEnd::Abandoned);
        }
        let event = item?;
        for frame in adapter.on_event(event) {
            send(sink, frame);
        }
    }
    Ok(DriveEnd::Completed)
}

/// 无状态降级：invoke 拿完整答案，切块后走同一适配器下发
async fn stateless_fallback(
    adapter: &mut StreamAdapter,
    backend: &Arc<dyn AgentBackend>,
    ctx: &CompletionContext,
    sink: &UnboundedSender<Frame>,
) -> Result<DriveEnd, GatewayError> {
    if sink.is_closed() {
        return Ok(DriveEnd::Abandoned);
    }
    tracing::info!(agent = %ctx.agent_id, thread = %ctx.thread_id, "stateless fallback");
    let answer = backend
        .invoke(&ctx.query, &ctx.thread_id)
        .await
        .map_err(|e| {
            tracing::error!(agent = %ctx.agent_id, error = %e, "stateless fallback failed");
            GatewayError::RecoveryExhausted
        })?;

    for chunk in chunk_words(&answer, FALLBACK_WORDS_PER_CHUNK) {
        for frame in adapter.on_event(NativeEvent::Token {
            content: Some(chunk),
            reasoning: None,
        }) {
            send(sink, frame);
        }
    }
    Ok(DriveEnd::Completed)
}

async fn drive_with_recovery(
    adapter: &mut StreamAdapter,
    backend: &Arc<dyn AgentBackend>,
    ctx: &CompletionContext,
    sink: &UnboundedSender<Frame>,
) -> Result<DriveEnd, GatewayError> {
    match drive_stream(adapter, backend, &ctx.query, &ctx.thread_id, sink).await {
        Ok(end) => return Ok(end),
        Err(BackendError::SessionNotFound(msg)) => {
            let derived = derive_session_id(&ctx.thread_id);
            tracing::warn!(
                agent = %ctx.agent_id,
                thread = %ctx.thread_id,
                derived = %derived,
                error = %msg,
                "session lost, retrying with derived session id"
            );
            if let Ok(end) = drive_stream(adapter, backend, &ctx.query, &derived, sink).await {
                return Ok(end);
            }
        }
        Err(BackendError::ToolHistoryCorrupt(msg)) => {
            tracing::warn!(
                agent = %ctx.agent_id,
                thread = %ctx.thread_id,
                error = %msg,
                "tool history corrupted, retrying on a fresh thread"
            );
            send(
                sink,
                Frame::Recovery {
                    id: ctx.completion_id.clone(),
                    message: "Conversation history needed repair; continuing in a fresh context."
                        .to_string(),
                },
            );
            let fresh = uuid::Uuid::new_v4().to_string();
            if let Ok(end) = drive_stream(adapter, backend, &ctx.query, &fresh, sink).await {
                return Ok(end);
            }
        }
        Err(e) => {
            tracing::warn!(agent = %ctx.agent_id, thread = %ctx.thread_id, error = %e, "stream failed");
        }
    }

    stateless_fallback(adapter, backend, ctx, sink).await
}

/// 驱动一次完整补全：start → 事件翻译（含恢复）→ 收尾帧。
/// 整体受 completion_secs 截止时间约束，超时同样以格式完整的序列收尾。
pub async fn run_completion(
    backend: &Arc<dyn AgentBackend>,
    ctx: &CompletionContext,
    timeouts: &TimeoutsSection,
    sink: &UnboundedSender<Frame>,
) -> CompletionOutcome {
    let mut adapter = StreamAdapter::new(&ctx.completion_id);
    send(sink, adapter.start());

    let deadline = Duration::from_secs(timeouts.completion_secs);
    let driven = tokio::time::timeout(
        deadline,
        drive_with_recovery(&mut adapter, backend, ctx, sink),
    )
    .await;

    let error = match driven {
        Ok(Ok(DriveEnd::Completed)) => None,
        // 放弃的补全只落盘占位文案，不落盘半截答案
        Ok(Ok(DriveEnd::Abandoned)) => Some(DISCONNECT_PLACEHOLDER.to_string()),
        Ok(Err(e)) => Some(e.client_message()),
        Err(_) => {
            tracing::error!(agent = %ctx.agent_id, thread = %ctx.thread_id, "completion deadline exceeded");
            Some(GatewayError::BackendUnavailable("completion deadline exceeded".into()).client_message())
        }
    };

    let (frames, turn) = adapter.finish(error.as_deref());
    for frame in frames {
        send(sink, frame);
    }
    CompletionOutcome { turn, error }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ScriptedBackend, ScriptedFailure};
    use tokio::sync::mpsc;

    fn ctx() -> CompletionContext {
        CompletionContext::new("echo", "t1", "u1", "hi")
    }

    async fn run(backend: ScriptedBackend) -> (Vec<Frame>, CompletionOutcome) {
        let backend: Arc<dyn AgentBackend> = Arc::new(backend);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = run_completion(&backend, &ctx(), &TimeoutsSection::default(), &tx).await;
        drop(tx);
        let mut frames = Vec::new();
        while let Some(f) = rx.recv().await {
            frames.push(f);
        }
        (frames, outcome)
    }

    fn frame_types(frames: &[Frame]) -> Vec<String> {
        frames
            .iter()
            .map(|f| {
                serde_json::to_value(f).unwrap()["type"]
                    .as_str()
                    .unwrap()
                    .to_string()
            })
            .collect()
    }

    #[test]
    fn test_derive_session_id_is_stable() {
        assert_eq!(derive_session_id("t1"), derive_session_id("t1"));
        assert!(derive_session_id("t1").starts_with("session_"));
    }

    #[tokio::test]
    async fn test_clean_stream_no_recovery() {
        let backend = ScriptedBackend::replaying("hello world");
        let (frames, outcome) = run(backend).await;

        assert!(outcome.error.is_none());
        assert_eq!(outcome.turn.text, "hello world");
        assert!(matches!(frames.first(), Some(Frame::Start { .. })));
        assert_eq!(frames.last(), Some(&Frame::Finish));
        assert!(!frame_types(&frames).contains(&"error".to_string()));
    }

    #[tokio::test]
    async fn test_session_not_found_retries_with_derived_id() {
        let backend = ScriptedBackend::replaying("recovered answer")
            .fail_next_streams(vec![ScriptedFailure::SessionNotFound]);
        let backend = Arc::new(backend);
        let dyn_backend: Arc<dyn AgentBackend> = backend.clone();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = run_completion(&dyn_backend, &ctx(), &TimeoutsSection::default(), &tx).await;
        drop(tx);
        let mut frames = Vec::new();
        while let Some(f) = rx.recv().await {
            frames.push(f);
        }

        // 恰好重试一次，用的是派生会话 id，且没有无状态降级
        assert_eq!(backend.stream_call_count(), 2);
        assert_eq!(backend.invoke_call_count(), 0);
        assert_eq!(
            backend.seen_thread_ids(),
            vec!["t1".to_string(), derive_session_id("t1")]
        );
        assert!(outcome.error.is_none());
        assert_eq!(outcome.turn.text, "recovered answer");
        assert!(!frame_types(&frames).contains(&"error".to_string()));
    }

    #[tokio::test]
    async fn test_tool_history_corrupt_emits_recovery_and_new_thread() {
        let backend = ScriptedBackend::replaying("fresh start")
            .fail_next_streams(vec![ScriptedFailure::ToolHistoryCorrupt]);
        let backend = Arc::new(backend);
        let dyn_backend: Arc<dyn AgentBackend> = backend.clone();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = run_completion(&dyn_backend, &ctx(), &TimeoutsSection::default(), &tx).await;
        drop(tx);
        let mut frames = Vec::new();
        while let Some(f) = rx.recv().await {
            frames.push(f);
        }

        assert!(frame_types(&frames).contains(&"recovery".to_string()));
        let seen = backend.seen_thread_ids();
        assert_eq!(seen.len(), 2);
        assert_ne!(seen[1], "t1");
        assert_ne!(seen[1], derive_session_id("t1"));
        assert!(outcome.error.is_none());
        assert_eq!(outcome.turn.text, "fresh start");
    }

    #[tokio::test]
    async fn test_unavailable_falls_back_to_stateless_invoke() {
        let backend = ScriptedBackend::replaying("stateless answer here")
            .fail_next_streams(vec![ScriptedFailure::Unavailable]);
        let backend = Arc::new(backend);
        let dyn_backend: Arc<dyn AgentBackend> = backend.clone();

        let (tx, _rx) = mpsc::unbounded_channel();
        let outcome = run_completion(&dyn_backend, &ctx(), &TimeoutsSection::default(), &tx).await;

        assert_eq!(backend.stream_call_count(), 1);
        assert_eq!(backend.invoke_call_count(), 1);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.turn.text, "stateless answer here");
    }

    #[tokio::test]
    async fn test_midstream_failure_keeps_partial_then_falls_back() {
        let backend = ScriptedBackend::replaying("one two three four")
            .fail_next_streams(vec![ScriptedFailure::MidStream]);
        let (frames, outcome) = run(backend).await;

        // 部分 token 已发出，降级答案追加其后；序列仍以 finish 收尾
        assert!(outcome.error.is_none());
        assert!(outcome.turn.text.contains("one two three four"));
        assert_eq!(frames.last(), Some(&Frame::Finish));
    }

    #[tokio::test]
    async fn test_client_disconnect_abandons_backend_stream() {
        let backend = Arc::new(ScriptedBackend::replaying("this answer is never delivered"));
        let dyn_backend: Arc<dyn AgentBackend> = backend.clone();

        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let outcome = run_completion(&dyn_backend, &ctx(), &TimeoutsSection::default(), &tx).await;

        // 断开后不再消费事件，也不走无状态降级；只记录占位错误
        assert!(outcome.turn.text.is_empty());
        assert!(outcome.error.is_some());
        assert_eq!(backend.invoke_call_count(), 0);
    }

    #[tokio::test]
    async fn test_double_failure_exhausts_with_wellformed_tail() {
        // 首次派发 SessionNotFound，派生 id 重试又失败 → 降级 invoke 成功
        let backend = ScriptedBackend::replaying("eventually fine").fail_next_streams(vec![
            ScriptedFailure::SessionNotFound,
            ScriptedFailure::Unavailable,
        ]);
        let backend = Arc::new(backend);
        let dyn_backend: Arc<dyn AgentBackend> = backend.clone();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = run_completion(&dyn_backend, &ctx(), &TimeoutsSection::default(), &tx).await;
        drop(tx);
        let mut frames = Vec::new();
        while let Some(f) = rx.recv().await {
            frames.push(f);
        }

        assert_eq!(backend.stream_call_count(), 2);
        assert_eq!(backend.invoke_call_count(), 1);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.turn.text, "eventually fine");

        let types = frame_types(&frames);
        assert_eq!(types.last().map(String::as_str), Some("finish"));
        // text-start / text-end 各恰好一次
        assert_eq!(types.iter().filter(|t| *t == "text-start").count(), 1);
        assert_eq!(types.iter().filter(|t| *t == "text-end").count(), 1);
    }
}
