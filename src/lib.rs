//! Hive - 智能体流式网关
//!
//! 在一组异构 Agent 后端（OpenAI 兼容端点、工具流水线、脚本回放）之上
//! 提供统一的聊天协议：AI-SDK 兼容的归一化帧流（SSE）、OpenAI 风格的
//! 模型列表、线程持久化与按错误分类的恢复策略。
//!
//! 分层：
//! - backend:  后端抽象与三个家族实现（原生事件的封闭集合）
//! - protocol: 线协议帧与流式状态机（NativeEvent → Frame）
//! - recovery: 错误分类恢复（派生会话重试 / 换线程 / 无状态降级）
//! - registry: 配置驱动的 agent 发现与热重载快照
//! - store:    线程历史（内存 / SQLite）
//! - dedup:    时间窗口相似查询去重缓存
//! - server:   axum HTTP 层（聊天、模型、线程、管理）

pub mod backend;
pub mod config;
pub mod dedup;
pub mod error;
pub mod protocol;
pub mod recovery;
pub mod registry;
pub mod server;
pub mod store;
pub mod tools;
