//! 线协议与协议适配器（流式状态机）
//!
//! Frame 是网关对外的归一化输出单元（AI-SDK Data Stream Protocol 兼容），
//! StreamAdapter 把某个后端的 NativeEvent 序列翻译为合法的 Frame 序列：
//! reasoning 先于 text 开闭、工具生命周期标记、错误后仍补齐收尾帧。
//! 状态机：INIT → DISPATCHED → {TEXT, REASONING, TOOL} → DONE | ERROR。
//!
//! 不变量（对每次补全）：
//! - 恰好一个 text-start 与一个 text-end，即使没有任何文本内容
//! - 任何 reasoning-delta 之前有 reasoning-start，之后（finish 前）必有 reasoning-end
//! - finish 永远是最后一帧，有无 error 皆然
//! - 帧顺序严格按后端产出顺序，适配器不重排、不超出开闭决策所需的缓冲

use serde::Serialize;
use serde_json::Value;

use crate::backend::NativeEvent;

/// 归一化线帧；`type` 字段区分帧类型，SSE 模式下逐帧 `data: <json>\n\n` 发送
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Frame {
    Start { id: String },
    TextStart { id: String },
    TextDelta { id: String, delta: String },
    TextEnd { id: String },
    ReasoningStart { id: String },
    ReasoningDelta { id: String, delta: String },
    ReasoningEnd { id: String },
    ToolStart { id: String, name: String, context: String },
    ToolEnd { id: String, name: String },
    ToolError { id: String, name: String, message: String },
    /// 恢复策略在重试前发给客户端的状态提示（非错误）
    Recovery { id: String, message: String },
    Error {
        #[serde(rename = "errorText")]
        error_text: String,
    },
    Finish,
}

/// 一次请求的短命上下文；只活到该次补全结束，存储层按需另行落盘
#[derive(Debug, Clone)]
pub struct CompletionContext {
    pub completion_id: String,
    pub agent_id: String,
    pub thread_id: String,
    pub user_id: String,
    pub query: String,
    pub started_at: std::time::Instant,
}

impl CompletionContext {
    pub fn new(agent_id: &str, thread_id: &str, user_id: &str, query: &str) -> Self {
        Self {
            completion_id: format!("chatcmpl-{}", &uuid::Uuid::new_v4().simple().to_string()[..29]),
            agent_id: agent_id.to_string(),
            thread_id: thread_id.to_string(),
            user_id: user_id.to_string(),
            query: query.to_string(),
            started_at: std::time::Instant::now(),
        }
    }
}

/// 补全结束后沉淀下来的完整内容，供 ThreadStore 落盘
#[derive(Debug, Clone, Default)]
pub struct Turn {
    pub text: String,
    pub reasoning: String,
}

/// 流式状态机：消费 NativeEvent，产出 Frame，并累积完整 text/reasoning
pub struct StreamAdapter {
    id: String,
    reasoning_open: bool,
    reasoning_closed: bool,
    text_open: bool,
    text: String,
    reasoning: String,
}

impl StreamAdapter {
    pub fn new(completion_id: &str) -> Self {
        Self {
            id: completion_id.to_string(),
            reasoning_open: false,
            reasoning_closed: false,
            text_open: false,
            text: String::new(),
            reasoning: String::new(),
        }
    }

    /// 起始帧；驱动方在消费事件前发送
    pub fn start(&self) -> Frame {
        Frame::Start { id: self.id.clone() }
    }

    /// 翻译一条原生事件，返回应立即发送的帧（可能为空或多帧）
    pub fn on_event(&mut self, event: NativeEvent) -> Vec<Frame> {
        let mut frames = Vec::new();
        match event {
            NativeEvent::Token { content, reasoning } => {
                // reasoning 渠道先于 text 开启；客户端把 reasoning 渲染为先出现的独立区块
                if let Some(r) = reasoning.filter(|r| !r.is_empty()) {
                    if !self.reasoning_open && !self.reasoning_closed {
                        frames.push(Frame::ReasoningStart { id: self.id.clone() });
                        self.reasoning_open = true;
                    }
                    if self.reasoning_open {
                        frames.push(Frame::ReasoningDelta {
                            id: self.id.clone(),
                            delta: r.clone(),
                        });
                        self.reasoning.push_str(&r);
                    }
                }
                if let Some(c) = content.filter(|c| !c.is_empty()) {
                    if !self.text_open {
                        if self.reasoning_open {
                            frames.push(Frame::ReasoningEnd { id: self.id.clone() });
                            self.reasoning_open = false;
                            self.reasoning_closed = true;
                        }
                        frames.push(Frame::TextStart { id: self.id.clone() });
                        self.text_open = true;
                    }
                    frames.push(Frame::TextDelta {
                        id: self.id.clone(),
                        delta: c.clone(),
                    });
                    self.text.push_str(&c);
                }
            }
            NativeEvent::ToolStarted { name, input } => {
                frames.push(Frame::ToolStart {
                    id: self.id.clone(),
                    name: normalize_tool_name(&name),
                    context: tool_context(&input),
                });
            }
            NativeEvent::ToolFinished { name, error } => {
                let name = normalize_tool_name(&name);
                frames.push(match error {
                    Some(message) => Frame::ToolError {
                        id: self.id.clone(),
                        name,
                        message,
                    },
                    None => Frame::ToolEnd {
                        id: self.id.clone(),
                        name,
                    },
                });
            }
            NativeEvent::Done => {}
        }
        frames
    }

    /// 收尾：错误帧（如有）→ 关闭打开的渠道 → 补齐 text-start/text-end → finish。
    /// 出错也输出部分但格式完整的序列，客户端永远不会等不到终止帧。
    pub fn finish(mut self, error: Option<&str>) -> (Vec<Frame>, Turn) {
        let mut frames = Vec::new();
        if let Some(msg) = error {
            frames.push(Frame::Error {
                error_text: msg.to_string(),
            });
        }
        if self.reasoning_open {
            frames.push(Frame::ReasoningEnd { id: self.id.clone() });
            self.reasoning_open = false;
        }
        if !self.text_open {
            frames.push(Frame::TextStart { id: self.id.clone() });
        }
        frames.push(Frame::TextEnd { id: self.id.clone() });
        frames.push(Frame::Finish);
        (
            frames,
            Turn {
                text: self.text,
                reasoning: self.reasoning,
            },
        )
    }
}

/// 工具标识归一化：小写，空白转下划线
pub fn normalize_tool_name(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

/// 从工具输入提取简短的人类可读上下文：按固定优先级取第一个命中的字段，截断约 30 字符
pub fn tool_context(input: &Value) -> String {
    const PRIORITY: &[&[&str]] = &[
        &["location", "city", "place"],
        &["query", "q", "search"],
        &["url"],
        &["file", "path", "filename"],
        &["to", "recipient"],
        &["expression", "expr"],
    ];

    let obj = match input.as_object() {
        Some(o) => o,
        None => return truncate_context(&value_preview(input)),
    };

    for group in PRIORITY {
        for key in *group {
            if let Some(v) = obj.get(*key) {
                let s = value_preview(v);
                if !s.is_empty() {
                    return truncate_context(&s);
                }
            }
        }
    }

    // 兜底：按插入顺序取第一个非空值（serde_json 开启 preserve_order）
    for v in obj.values() {
        let s = value_preview(v);
        if !s.is_empty() {
            return truncate_context(&s);
        }
    }
    String::new()
}

fn value_preview(v: &Value) -> String {
    match v {
        Value::String(s) => s.trim().to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// 把整段文本按固定词数切块，为非流式结果保留"流式"观感
pub fn chunk_words(text: &str, words_per_chunk: usize) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return Vec::new();
    }
    words
        .chunks(words_per_chunk.max(1))
        .enumerate()
        .map(|(i, chunk)| {
            let mut s = chunk.join(" ");
            if i > 0 {
                s.insert(0, ' ');
            }
            s
        })
        .collect()
}

fn truncate_context(s: &str) -> String {
    const MAX: usize = 30;
    if s.chars().count() <= MAX {
        s.to_string()
    } else {
        let head: String = s.chars().take(MAX - 1).collect();
        format!("{}…", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn token(content: &str, reasoning: &str) -> NativeEvent {
        NativeEvent::Token {
            content: (!content.is_empty()).then(|| content.to_string()),
            reasoning: (!reasoning.is_empty()).then(|| reasoning.to_string()),
        }
    }

    fn types(frames: &[Frame]) -> Vec<String> {
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
    fn test_plain_text_sequence() {
        let mut adapter = StreamAdapter::new("c1");
        let mut frames = vec![adapter.start()];
        frames.extend(adapter.on_event(token("Hello", "")));
        frames.extend(adapter.on_event(token(" world", "")));
        let (tail, turn) = adapter.finish(None);
        frames.extend(tail);

        assert_eq!(
            types(&frames),
            vec!["start", "text-start", "text-delta", "text-delta", "text-end", "finish"]
        );
        assert_eq!(turn.text, "Hello world");
    }

    #[test]
    fn test_empty_stream_still_wellformed() {
        let adapter = StreamAdapter::new("c1");
        let start = adapter.start();
        let (tail, turn) = adapter.finish(None);
        let mut frames = vec![start];
        frames.extend(tail);

        assert_eq!(types(&frames), vec!["start", "text-start", "text-end", "finish"]);
        assert!(turn.text.is_empty());
    }

    #[test]
    fn test_reasoning_opens_and_closes_before_text() {
        let mut adapter = StreamAdapter::new("c1");
        let mut frames = Vec::new();
        frames.extend(adapter.on_event(token("", "thinking")));
        frames.extend(adapter.on_event(token("", " harder")));
        frames.extend(adapter.on_event(token("answer", "")));
        let (tail, turn) = adapter.finish(None);
        frames.extend(tail);

        assert_eq!(
            types(&frames),
            vec![
                "reasoning-start",
                "reasoning-delta",
                "reasoning-delta",
                "reasoning-end",
                "text-start",
                "text-delta",
                "text-end",
                "finish"
            ]
        );
        assert_eq!(turn.reasoning, "thinking harder");
        assert_eq!(turn.text, "answer");
    }

    #[test]
    fn test_reasoning_only_closed_at_finish() {
        let mut adapter = StreamAdapter::new("c1");
        let mut frames = Vec::new();
        frames.extend(adapter.on_event(token("", "pondering")));
        let (tail, _) = adapter.finish(None);
        frames.extend(tail);

        assert_eq!(
            types(&frames),
            vec![
                "reasoning-start",
                "reasoning-delta",
                "reasoning-end",
                "text-start",
                "text-end",
                "finish"
            ]
        );
    }

    #[test]
    fn test_error_midstream_still_closes_channels() {
        let mut adapter = StreamAdapter::new("c1");
        let mut frames = Vec::new();
        frames.extend(adapter.on_event(token("partial", "")));
        let (tail, turn) = adapter.finish(Some("backend gave up"));
        frames.extend(tail);

        assert_eq!(
            types(&frames),
            vec!["text-start", "text-delta", "error", "text-end", "finish"]
        );
        assert_eq!(turn.text, "partial");
        // finish 永远最后
        assert_eq!(frames.last(), Some(&Frame::Finish));
    }

    #[test]
    fn test_tool_lifecycle_frames() {
        let mut adapter = StreamAdapter::new("c1");
        let started = adapter.on_event(NativeEvent::ToolStarted {
            name: "Get Weather".into(),
            input: json!({"location": "Paris"}),
        });
        assert_eq!(
            started,
            vec![Frame::ToolStart {
                id: "c1".into(),
                name: "get_weather".into(),
                context: "Paris".into(),
            }]
        );

        let failed = adapter.on_event(NativeEvent::ToolFinished {
            name: "get_weather".into(),
            error: Some("upstream 503".into()),
        });
        assert!(matches!(&failed[0], Frame::ToolError { name, .. } if name == "get_weather"));
    }

    #[test]
    fn test_tool_context_priority() {
        // location 优先于 query
        let ctx = tool_context(&json!({"query": "ignored", "location": "Lisbon"}));
        assert_eq!(ctx, "Lisbon");

        let ctx = tool_context(&json!({"query": "rust streams"}));
        assert_eq!(ctx, "rust streams");

        let ctx = tool_context(&json!({"somefield": "fallback value"}));
        assert_eq!(ctx, "fallback value");

        let long = "x".repeat(64);
        let ctx = tool_context(&json!({ "url": long }));
        assert_eq!(ctx.chars().count(), 30);
        assert!(ctx.ends_with('…'));
    }

    #[test]
    fn test_tool_context_fallback_respects_insertion_order() {
        // 两个键都不在优先级表里：取先插入的，而非字典序靠前的
        let ctx = tool_context(&json!({"zebra": "first value", "alpha": "second value"}));
        assert_eq!(ctx, "first value");
    }

    #[test]
    fn test_chunk_words_rejoins_to_original() {
        let text = "one two three four five six seven";
        let chunks = chunk_words(text, 3);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), text);
        assert!(chunk_words("", 6).is_empty());
    }

    #[test]
    fn test_frame_wire_format() {
        let frame = Frame::TextDelta {
            id: "c1".into(),
            delta: "hi".into(),
        };
        let v = serde_json::to_value(&frame).unwrap();
        assert_eq!(v, json!({"type": "text-delta", "id": "c1", "delta": "hi"}));

        let v = serde_json::to_value(&Frame::Error {
            error_text: "oops".into(),
        })
        .unwrap();
        assert_eq!(v, json!({"type": "error", "errorText": "oops"}));

        let v = serde_json::to_value(&Frame::Finish).unwrap();
        assert_eq!(v, json!({"type": "finish"}));
    }
}
