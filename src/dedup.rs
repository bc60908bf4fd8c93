//! 去重缓存：时间窗口 + 相似度
//!
//! 守护昂贵的幂等外部调用（如 web 搜索）：窗口内的近似重复查询直接复用缓存结果。
//! 相似判定沿用启发式「互为子串 或 共享 token ≥ 2」，且候选条目必须比复用窗口（默认 30s）
//! 年轻 —— 一条 59 秒的旧条目虽未被清扫（清扫窗口默认 60s），也不再视为"新鲜"。
//! 该启发式可能过度或不足地合并查询，保留原行为，只把窗口做成可调参数。
//!
//! 清扫 + 查找 + 插入都在同一把锁内完成；锁绝不跨网络调用持有。

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// 单条缓存：插入时间 + 结果文本，键为归一化后的查询
struct Entry {
    inserted_at: Instant,
    result: String,
}

/// 时间窗口去重缓存；并发工具调用共享一个实例
pub struct DedupCache {
    entries: Mutex<HashMap<String, Entry>>,
    /// 超过该窗口的条目在每次查找前被清扫
    sweep_window: Duration,
    /// 仅比该窗口年轻的条目可被复用
    reuse_window: Duration,
}

/// 查询归一化：小写 + 去首尾空白
fn normalize(query: &str) -> String {
    query.trim().to_lowercase()
}

/// 相似判定：互为子串，或共享 token ≥ 2
fn is_similar(a: &str, b: &str) -> bool {
    if a.contains(b) || b.contains(a) {
        return true;
    }
    let tokens_a: std::collections::HashSet<&str> = a.split_whitespace().collect();
    let tokens_b: std::collections::HashSet<&str> = b.split_whitespace().collect();
    tokens_a.intersection(&tokens_b).count() >= 2
}

impl DedupCache {
    pub fn new(sweep_window: Duration, reuse_window: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            sweep_window,
            reuse_window,
        }
    }

    /// 默认窗口：清扫 60s、复用 30s
    pub fn with_defaults() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_secs(30))
    }

    /// 查找近似重复：先清扫过期条目，再扫描剩余条目找相似且新鲜的缓存
    pub fn lookup(&self, query: &str) -> Option<String> {
        self.lookup_at(query, Instant::now())
    }

    /// 存入计算结果，供后续近似查询复用
    pub fn store(&self, query: &str, result: &str) {
        self.store_at(query, result, Instant::now());
    }

    fn lookup_at(&self, query: &str, now: Instant) -> Option<String> {
        let key = normalize(query);
        let mut entries = self.entries.lock().expect("dedup cache lock poisoned");

        entries.retain(|_, e| now.duration_since(e.inserted_at) <= self.sweep_window);

        for (cached_key, entry) in entries.iter() {
            if now.duration_since(entry.inserted_at) < self.reuse_window
                && is_similar(&key, cached_key)
            {
                tracing::debug!(query = %key, hit = %cached_key, "dedup cache hit");
                return Some(entry.result.clone());
            }
        }
        None
    }

    fn store_at(&self, query: &str, result: &str, now: Instant) {
        let key = normalize(query);
        let mut entries = self.entries.lock().expect("dedup cache lock poisoned");
        entries.insert(
            key,
            Entry {
                inserted_at: now,
                result: result.to_string(),
            },
        );
    }

    #[cfg(test)]
    fn backdate(&self, query: &str, age: Duration) {
        let key = normalize(query);
        let mut entries = self.entries.lock().unwrap();
        if let Some(e) = entries.get_mut(&key) {
            e.inserted_at -= age;
        }
    }
}
