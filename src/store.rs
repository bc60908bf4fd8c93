//! 线程存储：thread_id → 有序消息历史
//!
//! 统一的 ThreadStore 接口，内存与 SQLite（sqlx）两种实现；
//! 配置了 db_path 时用持久化存储，失败或未配置时优雅退化为内存存储。
//! thread_id 是唯一的并发边界：不同线程的补全互不阻塞，
//! 同一线程并发写时行级 last-write-wins，存储本身不做隐式加锁。

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use tokio::sync::RwLock;

use crate::error::GatewayError;

/// 消息角色；存储不强制 user/assistant 交替（重试可能产生连续同角色条目），但绝不丢失顺序
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// 单条消息；id 在线程内唯一
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role: Role::User,
            content: content.into(),
            reasoning: None,
        }
    }

    pub fn assistant(content: impl Into<String>, reasoning: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role: Role::Assistant,
            content: content.into(),
            reasoning: reasoning.filter(|r| !r.is_empty()),
        }
    }
}

/// 线程列表项（侧栏展示用）
#[derive(Clone, Debug, Serialize)]
pub struct ThreadSummary {
    pub thread_id: String,
    pub user_id: String,
    pub agent_id: String,
    /// 首条用户消息的前 100 字符
    pub preview: String,
    pub message_count: usize,
    pub updated_at: String,
}

/// 线程存储接口
#[async_trait]
pub trait ThreadStore: Send + Sync {
    /// 追加一轮对话：恰好一条用户消息 + 至多一条助手消息（失败补全传入错误占位）。
    /// preview 仅在未设置时从首条用户消息计算。
    async fn append_turn(
        &self,
        thread_id: &str,
        user_id: &str,
        agent_id: &str,
        user_message: Message,
        assistant_message: Option<Message>,
    ) -> Result<(), GatewayError>;

    /// 按 updated_at 倒序列出用户的线程，可按 agent 过滤
    async fn list_threads(
        &self,
        user_id: &str,
        agent_id: Option<&str>,
    ) -> Result<Vec<ThreadSummary>, GatewayError>;

    /// 线程的有序消息序列；线程不存在时返回 None
    async fn get_messages(&self, thread_id: &str) -> Result<Option<Vec<Message>>, GatewayError>;

    /// 立即且不可逆地删除线程
    async fn delete(&self, thread_id: &str) -> Result<(), GatewayError>;
}

/// 从首条用户消息取前 100 字符作为 preview
fn compute_preview(messages: &[Message]) -> String {
    messages
        .iter()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.chars().take(100).collect())
        .unwrap_or_default()
}

// ─── 内存实现 ───────────────────────────────────────────────

struct ThreadRecord {
    user_id: String,
    agent_id: String,
    messages: Vec<Message>,
    preview: String,
    updated_at: String,
}

/// 内存线程存储（未配置 db_path 时的默认实现）
#[derive(Default)]
pub struct MemoryThreadStore {
    threads: RwLock<HashMap<String, ThreadRecord>>,
}

impl MemoryThreadStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ThreadStore for MemoryThreadStore {
    async fn append_turn(
        &self,
        thread_id: &str,
        user_id: &str,
        agent_id: &str,
        user_message: Message,
        assistant_message: Option<Message>,
    ) -> Result<(), GatewayError> {
        let now = chrono::Utc::now().to_rfc3339();
        let mut threads = self.threads.write().await;
        let record = threads.entry(thread_id.to_string()).or_insert_with(|| ThreadRecord {
            user_id: user_id.to_string(),
            agent_id: agent_id.to_string(),
            messages: Vec::new(),
            preview: String::new(),
            updated_at: now.clone(),
        });
        record.messages.push(user_message);
        if let Some(assistant) = assistant_message {
            record.messages.push(assistant);
        }
        if record.preview.is_empty() {
            record.preview = compute_preview(&record.messages);
        }
        record.updated_at = now;
        Ok(())
    }

    async fn list_threads(
        &self,
        user_id: &str,
        agent_id: Option<&str>,
    ) -> Result<Vec<ThreadSummary>, GatewayError> {
        let threads = self.threads.read().await;
        let mut out: Vec<ThreadSummary> = threads
            .iter()
            .filter(|(_, r)| r.user_id == user_id)
            .filter(|(_, r)| agent_id.map_or(true, |a| r.agent_id == a))
            .map(|(id, r)| ThreadSummary {
                thread_id: id.clone(),
                user_id: r.user_id.clone(),
                agent_id: r.agent_id.clone(),
                preview: r.preview.clone(),
                message_count: r.messages.len(),
                updated_at: r.updated_at.clone(),
            })
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(out)
    }

    async fn get_messages(&self, thread_id: &str) -> Result<Option<Vec<Message>>, GatewayError> {
        let threads = self.threads.read().await;
        Ok(threads.get(thread_id).map(|r| r.messages.clone()))
    }

    async fn delete(&self, thread_id: &str) -> Result<(), GatewayError> {
        self.threads.write().await.remove(thread_id);
        Ok(())
    }
}

// ─── SQLite 实现 ────────────────────────────────────────────

/// 持久化线程存储：单表，messages 存为 JSON 序列
pub struct SqliteThreadStore {
    pool: sqlx::sqlite::SqlitePool,
}

impl SqliteThreadStore {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, sqlx::Error> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());

        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    async fn init_tables(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS chat_threads (
                thread_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                messages TEXT NOT NULL,
                preview TEXT NOT NULL DEFAULT '',
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chat_threads_user ON chat_threads(user_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    fn parse_messages(raw: &str) -> Vec<Message> {
        serde_json::from_str(raw).unwrap_or_else(|e| {
            tracing::error!("corrupted messages blob, dropping history: {}", e);
            Vec::new()
        })
    }
}

#[async_trait]
impl ThreadStore for SqliteThreadStore {
    async fn append_turn(
        &self,
        thread_id: &str,
        user_id: &str,
        agent_id: &str,
        user_message: Message,
        assistant_message: Option<Message>,
    ) -> Result<(), GatewayError> {
        // 读-改-写；同线程并发时行级 last-write-wins
        let row = sqlx::query("SELECT messages, preview FROM chat_threads WHERE thread_id = ?")
            .bind(thread_id)
            .fetch_optional(&self.pool)
            .await?;

        let (mut messages, preview) = match row {
            Some(row) => {
                let raw: String = row.get("messages");
                let preview: String = row.get("preview");
                (Self::parse_messages(&raw), preview)
            }
            None => (Vec::new(), String::new()),
        };

        messages.push(user_message);
        if let Some(assistant) = assistant_message {
            messages.push(assistant);
        }

        let preview = if preview.is_empty() {
            compute_preview(&messages)
        } else {
            preview
        };
        let blob = serde_json::to_string(&messages)
            .map_err(|e| GatewayError::Config(format!("serialize messages: {}", e)))?;
        let now = chrono::Utc::now().to_rfc3339();

        sqlx::query(
            "INSERT INTO chat_threads (thread_id, user_id, agent_id, messages, preview, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(thread_id) DO UPDATE SET
                 messages = excluded.messages,
                 preview = excluded.preview,
                 updated_at = excluded.updated_at",
        )
        .bind(thread_id)
        .bind(user_id)
        .bind(agent_id)
        .bind(&blob)
        .bind(&preview)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_threads(
        &self,
        user_id: &str,
        agent_id: Option<&str>,
    ) -> Result<Vec<ThreadSummary>, GatewayError> {
        let rows = sqlx::query(
            "SELECT thread_id, user_id, agent_id, messages, preview, updated_at
             FROM chat_threads
             WHERE user_id = ?
             ORDER BY updated_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::new();
        for row in rows {
            let thread_agent_id: String = row.get("agent_id");
            if agent_id.is_some_and(|a| a != thread_agent_id) {
                continue;
            }
            let raw: String = row.get("messages");
            out.push(ThreadSummary {
                thread_id: row.get("thread_id"),
                user_id: row.get("user_id"),
                agent_id: thread_agent_id,
                preview: row.get("preview"),
                message_count: Self::parse_messages(&raw).len(),
                updated_at: row.get("updated_at"),
            });
        }
        Ok(out)
    }

    async fn get_messages(&self, thread_id: &str) -> Result<Option<Vec<Message>>, GatewayError> {
        let row = sqlx::query("SELECT messages FROM chat_threads WHERE thread_id = ?")
            .bind(thread_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| {
            let raw: String = r.get("messages");
            Self::parse_messages(&raw)
        }))
    }

    async fn delete(&self, thread_id: &str) -> Result<(), GatewayError> {
        sqlx::query("DELETE FROM chat_threads WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// 创建线程存储
///
/// 提供了 db_path 时使用 SQLite 持久化；连接失败时回退到内存存储并告警
pub async fn create_thread_store(db_path: Option<&Path>) -> Arc<dyn ThreadStore> {
    if let Some(path) = db_path {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        match SqliteThreadStore::new(path).await {
            Ok(store) => {
                tracing::info!("Using persistent thread store: {:?}", path);
                return Arc::new(store);
            }
            Err(e) => {
                tracing::warn!("Failed to create persistent store, falling back to memory: {}", e);
            }
        }
    }

    tracing::info!("Using in-memory thread store");
    Arc::new(MemoryThreadStore::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_append_then_get_ordered() {
        let store = MemoryThreadStore::new();
        store
            .append_turn(
                "t1",
                "u1",
                "weather-agent",
                Message::user("What is the weather in Paris?"),
                Some(Message::assistant("Sunny, 21°C", None)),
            )
            .await
            .unwrap();

        let messages = store.get_messages("t1").await.unwrap().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "Sunny, 21°C");
    }

    #[tokio::test]
    async fn test_memory_delete_then_get_none() {
        let store = MemoryThreadStore::new();
        store
            .append_turn("t1", "u1", "a1", Message::user("hi"), None)
            .await
            .unwrap();
        assert!(store.get_messages("t1").await.unwrap().is_some());
        store.delete("t1").await.unwrap();
        // 删除后与从未存在无法区分
        assert!(store.get_messages("t1").await.unwrap().is_none());
        assert!(store.get_messages("never-seen").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_preview_from_first_user_message() {
        let store = MemoryThreadStore::new();
        let long: String = "x".repeat(150);
        store
            .append_turn("t1", "u1", "a1", Message::user(long), Some(Message::assistant("ok", None)))
            .await
            .unwrap();
        store
            .append_turn("t1", "u1", "a1", Message::user("second"), None)
            .await
            .unwrap();

        let threads = store.list_threads("u1", None).await.unwrap();
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].preview.chars().count(), 100);
        assert_eq!(threads[0].message_count, 3);
    }

    #[tokio::test]
    async fn test_memory_list_filter_by_agent() {
        let store = MemoryThreadStore::new();
        store
            .append_turn("t1", "u1", "a1", Message::user("hi"), None)
            .await
            .unwrap();
        store
            .append_turn("t2", "u1", "a2", Message::user("yo"), None)
            .await
            .unwrap();

        assert_eq!(store.list_threads("u1", None).await.unwrap().len(), 2);
        let filtered = store.list_threads("u1", Some("a2")).await.unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].thread_id, "t2");
    }

    #[tokio::test]
    async fn test_sqlite_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteThreadStore::new(dir.path().join("history.db"))
            .await
            .unwrap();

        store
            .append_turn(
                "t1",
                "u1",
                "weather-agent",
                Message::user("weather?"),
                Some(Message::assistant("sunny", Some("checked the sky".into()))),
            )
            .await
            .unwrap();

        let messages = store.get_messages("t1").await.unwrap().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].reasoning.as_deref(), Some("checked the sky"));

        let threads = store.list_threads("u1", Some("weather-agent")).await.unwrap();
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].preview, "weather?");

        store.delete("t1").await.unwrap();
        assert!(store.get_messages("t1").await.unwrap().is_none());
        assert!(store.list_threads("u1", None).await.unwrap().is_empty());
    }
}
