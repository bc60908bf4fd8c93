//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__SERVER__PORT=9000`）。
//! `[[backends]]` 表定义可发现的 Agent 后端，Registry 启动时据此构建描述符。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub dedup: DedupSection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
    /// Agent 后端定义，Registry 逐条独立构建，单条失败不影响其余
    #[serde(default)]
    pub backends: Vec<BackendEntry>,
}

/// [server] 段：监听地址
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// [store] 段：线程持久化；db_path 未设置时退化为内存存储
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StoreSection {
    pub db_path: Option<PathBuf>,
}

/// [dedup] 段：去重缓存的清扫窗口与复用窗口（秒）
#[derive(Debug, Clone, Deserialize)]
pub struct DedupSection {
    #[serde(default = "default_sweep_secs")]
    pub sweep_secs: u64,
    #[serde(default = "default_reuse_secs")]
    pub reuse_secs: u64,
}

fn default_sweep_secs() -> u64 {
    60
}

fn default_reuse_secs() -> u64 {
    30
}

impl Default for DedupSection {
    fn default() -> Self {
        Self {
            sweep_secs: default_sweep_secs(),
            reuse_secs: default_reuse_secs(),
        }
    }
}

/// [timeouts] 段：后端网络超时与单次补全的总体软上限（秒）
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutsSection {
    /// 连接超时
    #[serde(default = "default_connect_secs")]
    pub connect_secs: u64,
    /// 单次请求/读取超时
    #[serde(default = "default_request_secs")]
    pub request_secs: u64,
    /// 含重试在内的补全总体截止时间
    #[serde(default = "default_completion_secs")]
    pub completion_secs: u64,
}

fn default_connect_secs() -> u64 {
    5
}

fn default_request_secs() -> u64 {
    30
}

fn default_completion_secs() -> u64 {
    120
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_secs(),
            request_secs: default_request_secs(),
            completion_secs: default_completion_secs(),
        }
    }
}

/// [[backends]] 单条配置：一条对应一个 AgentDescriptor
#[derive(Debug, Clone, Deserialize)]
pub struct BackendEntry {
    /// 稳定且 URL 安全的 agent id（对外即 model id）
    pub id: String,
    /// 后端家族：openai / pipeline / scripted
    pub family: String,
    pub name: Option<String>,
    pub description: Option<String>,
    /// chat（多轮，网关持久化线程）或 single-shot
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub suggestions: Vec<String>,
    /// openai 家族：端点与模型
    pub base_url: Option<String>,
    pub model: Option<String>,
    /// API Key 所在环境变量名
    pub api_key_env: Option<String>,
    /// openai 家族：注入的 system prompt
    pub system_prompt: Option<String>,
    /// pipeline 家族：工具名（weather / web_search）
    pub tool: Option<String>,
    /// pipeline 家族：答案模板，{result} 占位符替换为工具输出
    pub answer_template: Option<String>,
    /// scripted 家族：逐条回放的文本 token
    #[serde(default)]
    pub script: Vec<String>,
}

fn default_mode() -> String {
    "single-shot".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerSection::default(),
            store: StoreSection::default(),
            dedup: DedupSection::default(),
            timeouts: TimeoutsSection::default(),
            backends: Vec::new(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
