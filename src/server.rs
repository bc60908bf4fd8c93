//! HTTP 层：聊天入口（SSE / 非流式）、模型列表、线程管理、健康检查
//!
//! POST /ui/chat          聊天补全（默认 SSE，stream=false 返回聚合 JSON）
//! GET  /v1/models        OpenAI 风格的 agent 列表
//! POST /admin/reload-agents  重新发现并原子替换注册表快照
//! GET  /threads          按用户列线程（可按 agent 过滤）
//! GET  /threads/:id      线程消息
//! DELETE /threads/:id    删除线程
//! GET  /api/health       健康检查

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures_util::stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::config::AppConfig;
use crate::error::GatewayError;
use crate::protocol::{CompletionContext, Frame};
use crate::recovery::{run_completion, CompletionOutcome};
use crate::registry::{AgentDescriptor, Registry};
use crate::store::{Message, ThreadStore};

/// 共享应用状态
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<Registry>,
    pub store: Arc<dyn ThreadStore>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ui/chat", post(ui_chat))
        .route("/v1/models", get(list_models))
        .route("/admin/reload-agents", post(reload_agents))
        .route("/threads", get(list_threads))
        .route("/threads/:thread_id", get(get_thread))
        .route("/threads/:thread_id", delete(delete_thread))
        .route("/api/health", get(health))
        .with_state(state)
}

// ─── 聊天入口 ───────────────────────────────────────────────

/// AI-SDK useChat 的消息形态：文本在 content 或 parts 里
#[derive(Debug, Deserialize)]
pub struct UiMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub parts: Vec<UiPart>,
}

#[derive(Debug, Deserialize)]
pub struct UiPart {
    #[serde(rename = "type")]
    pub part_type: String,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub messages: Vec<UiMessage>,
    /// agent id；对外复用 OpenAI 的 model 字段
    pub model: Option<String>,
    #[serde(default, alias = "session_id")]
    pub thread_id: Option<String>,
    #[serde(default, alias = "user")]
    pub user_id: Option<String>,
    #[serde(default = "default_stream")]
    pub stream: bool,
}

fn default_stream() -> bool {
    true
}

impl UiMessage {
    /// 取出消息文本：优先 content，否则拼接 parts 中的 text 片段
    fn text(&self) -> String {
        if let Some(c) = &self.content {
            if !c.trim().is_empty() {
                return c.trim().to_string();
            }
        }
        self.parts
            .iter()
            .filter(|p| p.part_type == "text")
            .filter_map(|p| p.text.as_deref())
            .collect::<Vec<_>>()
            .join("")
            .trim()
            .to_string()
    }
}

/// 校验请求并解析出 agent 与补全上下文
async fn resolve_chat(
    state: &AppState,
    req: &ChatRequest,
) -> Result<(Arc<AgentDescriptor>, CompletionContext), GatewayError> {
    let last_user = req
        .messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .ok_or_else(|| GatewayError::BadRequest("No user message provided".into()))?;
    let query = last_user.text();
    if query.is_empty() {
        return Err(GatewayError::BadRequest("Empty message text".into()));
    }

    let model = req
        .model
        .as_deref()
        .ok_or_else(|| GatewayError::BadRequest("Missing model".into()))?;
    let descriptor = state
        .registry
        .get(model)
        .await
        .ok_or_else(|| GatewayError::NotFound(format!("Model '{}' not found", model)))?;

    let thread_id = req
        .thread_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let user_id = req.user_id.clone().unwrap_or_else(|| "anonymous".to_string());
    let ctx = CompletionContext::new(&descriptor.id, &thread_id, &user_id, &query);
    Ok((descriptor, ctx))
}

/// 补全结束后按需落盘；失败补全写入礼貌的占位答案，保证线程历史完整
async fn persist_turn(
    store: &Arc<dyn ThreadStore>,
    descriptor: &AgentDescriptor,
    ctx: &CompletionContext,
    outcome: &CompletionOutcome,
) {
    if !descriptor.gateway_persists() {
        return;
    }
    let assistant = match &outcome.error {
        Some(msg) => Message::assistant(msg.clone(), None),
        None => Message::assistant(
            outcome.turn.text.clone(),
            Some(outcome.turn.reasoning.clone()),
        ),
    };
    if let Err(e) = store
        .append_turn(
            &ctx.thread_id,
            &ctx.user_id,
            &ctx.agent_id,
            Message::user(ctx.query.clone()),
            Some(assistant),
        )
        .await
    {
        tracing::error!(thread = %ctx.thread_id, error = %e, "failed to persist turn");
    }
}

pub async fn ui_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Response, (StatusCode, String)> {
    let (descriptor, ctx) = match resolve_chat(&state, &req).await {
        Ok(resolved) => resolved,
        Err(GatewayError::NotFound(_)) => {
            // 404 附上可用 agent 列表，便于前端自纠
            let available: Vec<String> =
                state.registry.list().await.iter().map(|d| d.id.clone()).collect();
            let model = req.model.as_deref().unwrap_or("");
            return Err((
                StatusCode::NOT_FOUND,
                format!("Model '{}' not found. Available: {}", model, available.join(", ")),
            ));
        }
        Err(e) => {
            tracing::warn!(error = %e, "chat request rejected");
            return Err(e.into_response_parts());
        }
    };

    tracing::info!(
        agent = %ctx.agent_id,
        thread = %ctx.thread_id,
        user = %ctx.user_id,
        stream = req.stream,
        "chat completion started"
    );

    if req.stream {
        Ok(stream_response(state, descriptor, ctx).into_response())
    } else {
        Ok(aggregate_response(state, descriptor, ctx).await.into_response())
    }
}

/// SSE 路径：生产者任务驱动补全并落盘，响应流逐帧转发
fn stream_response(
    state: AppState,
    descriptor: Arc<AgentDescriptor>,
    ctx: CompletionContext,
) -> Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::unbounded_channel::<Frame>();

    tokio::spawn(async move {
        let outcome =
            run_completion(&descriptor.backend, &ctx, &state.config.timeouts, &tx).await;
        persist_turn(&state.store, &descriptor, &ctx, &outcome).await;
        tracing::info!(
            agent = %ctx.agent_id,
            thread = %ctx.thread_id,
            chars = outcome.turn.text.chars().count(),
            elapsed_ms = ctx.started_at.elapsed().as_millis() as u64,
            "chat completion finished"
        );
    });

    let events = stream::unfold(rx, |mut rx| async move {
        let frame = rx.recv().await?;
        let event = match serde_json::to_string(&frame) {
            Ok(json) => Event::default().data(json),
            Err(_) => Event::default().data("{\"type\":\"finish\"}"),
        };
        Some((Ok(event), rx))
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}

/// 非流式路径：同一条恢复管线，只取聚合结果。
/// 接收端保持存活到补全结束，避免被当成客户端断开
async fn aggregate_response(
    state: AppState,
    descriptor: Arc<AgentDescriptor>,
    ctx: CompletionContext,
) -> Json<Value> {
    let (tx, _rx) = mpsc::unbounded_channel::<Frame>();
    let outcome = run_completion(&descriptor.backend, &ctx, &state.config.timeouts, &tx).await;
    persist_turn(&state.store, &descriptor, &ctx, &outcome).await;

    let mut parts = Vec::new();
    if !outcome.turn.reasoning.is_empty() {
        parts.push(json!({"type": "reasoning", "text": outcome.turn.reasoning}));
    }
    let text = match &outcome.error {
        Some(msg) => msg.clone(),
        None => outcome.turn.text.clone(),
    };
    parts.push(json!({"type": "text", "text": text}));

    Json(json!({
        "id": ctx.completion_id,
        "object": "chat.ui.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": ctx.agent_id,
        "message": {
            "id": uuid::Uuid::new_v4().to_string(),
            "role": "assistant",
            "parts": parts,
        },
    }))
}

// ─── 模型与管理 ─────────────────────────────────────────────

pub async fn list_models(State(state): State<AppState>) -> Json<Value> {
    let created = chrono::Utc::now().timestamp();
    let data: Vec<Value> = state
        .registry
        .list()
        .await
        .iter()
        .map(|d| {
            json!({
                "id": d.id,
                "object": "model",
                "created": created,
                "owned_by": "hive",
                "name": d.name,
                "description": d.description,
                "mode": d.mode,
                "suggestions": d.suggestions,
            })
        })
        .collect();
    Json(json!({"object": "list", "data": data}))
}

pub async fn reload_agents(State(state): State<AppState>) -> Json<Value> {
    let count = state.registry.reload().await;
    let ids: Vec<String> = state.registry.list().await.iter().map(|d| d.id.clone()).collect();
    Json(json!({"status": "ok", "count": count, "agents": ids}))
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "agents": state.registry.list().await.len(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ─── 线程管理 ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ThreadsQuery {
    pub user_id: Option<String>,
    pub agent_id: Option<String>,
}

pub async fn list_threads(
    State(state): State<AppState>,
    Query(query): Query<ThreadsQuery>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let user_id = query
        .user_id
        .as_deref()
        .filter(|u| !u.is_empty())
        .ok_or((StatusCode::BAD_REQUEST, "Missing user_id".to_string()))?;

    let threads = state
        .store
        .list_threads(user_id, query.agent_id.as_deref())
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "list threads failed");
            e.into_response_parts()
        })?;
    Ok(Json(json!({"threads": threads})))
}

pub async fn get_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let messages = state
        .store
        .get_messages(&thread_id)
        .await
        .map_err(|e| {
            tracing::error!(thread = %thread_id, error = %e, "get thread failed");
            e.into_response_parts()
        })?
        .ok_or_else(|| GatewayError::NotFound("Thread not found".into()).into_response_parts())?;
    Ok(Json(json!({"thread_id": thread_id, "messages": messages})))
}

pub async fn delete_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, String)> {
    state.store.delete(&thread_id).await.map_err(|e| {
        tracing::error!(thread = %thread_id, error = %e, "delete thread failed");
        e.into_response_parts()
    })?;
    Ok(Json(json!({"status": "deleted", "thread_id": thread_id})))
}
