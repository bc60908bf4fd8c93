//! 网关错误类型
//!
//! 后端错误先走 RecoveryPolicy，只有分类失败才作为 500 冒泡到 HTTP 层；
//! 面向客户端的文案一律脱敏，原始错误只进日志。

use axum::http::StatusCode;
use thiserror::Error;

/// 网关运行过程中可能出现的错误（路由、存储、后端、恢复耗尽）
#[derive(Error, Debug)]
pub enum GatewayError {
    /// 未知的 agent id 或 thread id
    #[error("Not found: {0}")]
    NotFound(String),

    /// 请求格式错误（空消息列表、缺少必填字段等）
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// 后端不可达（连接失败、超时）
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// 后端执行失败（流中途抛错）
    #[error("Backend execution error: {0}")]
    BackendExecutionError(String),

    /// 恢复策略的所有重试与降级均失败
    #[error("All recovery attempts exhausted")]
    RecoveryExhausted,

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Config error: {0}")]
    Config(String),
}

impl GatewayError {
    /// HTTP 状态码映射
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::BackendUnavailable(_)
            | GatewayError::BackendExecutionError(_)
            | GatewayError::RecoveryExhausted
            | GatewayError::Storage(_)
            | GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 面向客户端的文案：404/400 保留原文，其余一律用礼貌的通用文案
    pub fn client_message(&self) -> String {
        match self {
            GatewayError::NotFound(msg) => msg.clone(),
            GatewayError::BadRequest(msg) => msg.clone(),
            _ => "Sorry, something went wrong while answering. Please try again.".to_string(),
        }
    }

    /// 转为 axum handler 的 (StatusCode, String) 错误；原始错误由调用方记日志
    pub fn into_response_parts(self) -> (StatusCode, String) {
        (self.status(), self.client_message())
    }
}
