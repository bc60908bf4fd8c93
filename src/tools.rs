//! 工具：pipeline 家族后端调用的外部能力
//!
//! 所有工具实现 Tool trait（name / description / execute）；
//! 昂贵且幂等的工具（web 搜索）在执行前先查去重缓存，命中则跳过外部调用。
//! 工具内部的网络请求带独立的连接/读取超时，与补全总体截止时间无关。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::TimeoutsSection;
use crate::dedup::DedupCache;

/// 工具 trait：名称、描述、异步执行（args 为 JSON 对象）
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    async fn execute(&self, args: Value) -> Result<String, String>;
}

/// 简易去除 HTML 标签（搜索结果降噪）
fn strip_html_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect::<String>() + "\n...[truncated]"
    }
}

fn build_client(timeouts: &TimeoutsSection) -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(timeouts.connect_secs))
        .timeout(Duration::from_secs(timeouts.request_secs))
        .build()
        .unwrap_or_default()
}

/// 天气查询：wttr.in 单行格式，args: {"location": "Paris"}
pub struct WeatherTool {
    client: reqwest::Client,
}

impl WeatherTool {
    pub fn new(timeouts: &TimeoutsSection) -> Self {
        Self {
            client: build_client(timeouts),
        }
    }
}

#[async_trait]
impl Tool for WeatherTool {
    fn name(&self) -> &str {
        "get_weather"
    }

    fn description(&self) -> &str {
        "Current weather for a location. Args: {\"location\": \"Paris\"}."
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let location = args
            .get("location")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        if location.is_empty() {
            return Err("Missing location".to_string());
        }

        tracing::info!(location = %location, "weather tool fetch");
        let url = format!("https://wttr.in/{}?format=3", location);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("Request failed: {}", e))?;
        if !resp.status().is_success() {
            return Err(format!("HTTP {}", resp.status()));
        }
        let body = resp.text().await.map_err(|e| format!("Read body: {}", e))?;
        Ok(body.trim().to_string())
    }
}

/// Web 搜索：执行前先查去重缓存，近似重复的查询复用缓存结果
pub struct WebSearchTool {
    client: reqwest::Client,
    dedup: Arc<DedupCache>,
    max_result_chars: usize,
}

impl WebSearchTool {
    pub fn new(timeouts: &TimeoutsSection, dedup: Arc<DedupCache>) -> Self {
        Self {
            client: build_client(timeouts),
            dedup,
            max_result_chars: 8000,
        }
    }

    async fn fetch(&self, query: &str) -> Result<String, String> {
        let resp = self
            .client
            .get("https://html.duckduckgo.com/html/")
            .query(&[("q", query)])
            .send()
            .await
            .map_err(|e| format!("Request failed: {}", e))?;
        if !resp.status().is_success() {
            return Err(format!("HTTP {}", resp.status()));
        }
        let body = resp.text().await.map_err(|e| format!("Read body: {}", e))?;
        Ok(truncate_chars(&strip_html_tags(&body), self.max_result_chars))
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web for current information. Args: {\"query\": \"...\"}."
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        if query.is_empty() {
            return Err("Missing query".to_string());
        }

        // 缓存查找在锁内完成；外部调用始终在锁外
        if let Some(cached) = self.dedup.lookup(&query) {
            tracing::info!(query = %query, "web_search served from dedup cache");
            return Ok(cached);
        }

        tracing::info!(query = %query, "web_search fetch");
        let result = self.fetch(&query).await?;
        self.dedup.store(&query, &result);
        Ok(result)
    }
}

/// 按名称构建 pipeline 家族可用的工具
pub fn build_tool(
    name: &str,
    timeouts: &TimeoutsSection,
    dedup: Arc<DedupCache>,
) -> Option<Arc<dyn Tool>> {
    match name {
        "get_weather" | "weather" => Some(Arc::new(WeatherTool::new(timeouts))),
        "web_search" | "search" => Some(Arc::new(WebSearchTool::new(timeouts, dedup))),
        _ => None,
    }
}
