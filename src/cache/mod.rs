//! 多级结果缓存：线程历史 -> 精确 -> 语义，严格按优先级短路
//!
//! 只有校验通过且执行成功的结果才会回写；失败或未校验的结果一律不入缓存。

pub mod exact;
pub mod normalize;
pub mod semantic;
pub mod thread_history;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::llm::EmbeddingProvider;

pub use exact::ExactCache;
pub use normalize::normalize;
pub use semantic::{cosine_similarity, SemanticCache, SemanticHit};
pub use thread_history::ThreadHistoryCache;

/// 缓存层级，亦即查找优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    ThreadHistory,
    Exact,
    Semantic,
}

impl std::fmt::Display for CacheTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CacheTier::ThreadHistory => "thread_history",
            CacheTier::Exact => "exact",
            CacheTier::Semantic => "semantic",
        };
        write!(f, "{}", name)
    }
}

/// 可复用的已执行答案
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedAnswer {
    pub query: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub analysis: Option<String>,
}

/// 一次缓存查找的命中
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub tier: CacheTier,
    pub answer: CachedAnswer,
    /// 语义层命中时的相似度
    pub similarity: Option<f32>,
    /// 语义层命中时匹配到的原始文本
    pub matched_text: Option<String>,
    /// 须经澄清确认后才能复用
    pub needs_confirmation: bool,
}

/// 缓存服务配置
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_entries: usize,
    pub thread_history_limit: usize,
    pub reuse_threshold: f32,
    pub confirm_threshold: f32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 1024,
            thread_history_limit: 100,
            reuse_threshold: 0.95,
            confirm_threshold: 0.80,
        }
    }
}

/// 三级缓存服务；语义层需要嵌入提供方，未配置时自动降级为两级
pub struct CacheService {
    cfg: CacheConfig,
    thread: ThreadHistoryCache,
    exact: ExactCache,
    semantic: Option<SemanticCache>,
}

impl CacheService {
    pub fn new(cfg: CacheConfig, embedder: Option<Arc<dyn EmbeddingProvider>>) -> Self {
        let semantic = embedder.map(|e| {
            SemanticCache::new(
                e,
                cfg.reuse_threshold,
                cfg.confirm_threshold,
                cfg.max_entries,
            )
        });
        Self {
            thread: ThreadHistoryCache::new(cfg.thread_history_limit),
            exact: ExactCache::new(cfg.max_entries),
            semantic,
            cfg,
        }
    }

    pub fn enabled(&self) -> bool {
        self.cfg.enabled
    }

    /// 按固定优先级查找：线程历史 -> 精确 -> 语义；首个命中即返回
    pub async fn lookup(&self, thread_id: &str, datasource_id: &str, text: &str) -> Option<CacheHit> {
        if !self.cfg.enabled {
            return None;
        }
        let normalized = normalize(text);

        if let Some(answer) = self.thread.lookup(thread_id, &normalized).await {
            return Some(CacheHit {
                tier: CacheTier::ThreadHistory,
                answer,
                similarity: None,
                matched_text: None,
                needs_confirmation: false,
            });
        }

        if let Some(answer) = self.exact.lookup(datasource_id, &normalized).await {
            return Some(CacheHit {
                tier: CacheTier::Exact,
                answer,
                similarity: None,
                matched_text: None,
                needs_confirmation: false,
            });
        }

        if let Some(semantic) = &self.semantic {
            if let Some(hit) = semantic.lookup(datasource_id, text).await {
                return Some(CacheHit {
                    tier: CacheTier::Semantic,
                    answer: hit.answer,
                    similarity: Some(hit.similarity),
                    matched_text: Some(hit.matched_text),
                    needs_confirmation: hit.needs_confirmation,
                });
            }
        }
        None
    }

    /// 回写三层；只应在校验通过且执行成功后调用
    pub async fn store(&self, thread_id: &str, datasource_id: &str, text: &str, answer: CachedAnswer) {
        if !self.cfg.enabled {
            return;
        }
        let normalized = normalize(text);
        self.thread.store(thread_id, &normalized, answer.clone()).await;
        self.exact.store(datasource_id, &normalized, answer.clone()).await;
        if let Some(semantic) = &self.semantic {
            semantic.store(datasource_id, text, answer).await;
        }
    }

    pub async fn clear_thread(&self, thread_id: &str) {
        self.thread.clear_thread(thread_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::HashEmbedder;

    fn answer(query: &str) -> CachedAnswer {
        CachedAnswer {
            query: query.to_string(),
            columns: vec![],
            rows: vec![],
            analysis: None,
        }
    }

    fn service() -> CacheService {
        CacheService::new(CacheConfig::default(), Some(Arc::new(HashEmbedder::default())))
    }

    #[tokio::test]
    async fn test_exact_beats_semantic() {
        let cache = service();
        // 同一文本同时写入精确与语义层
        cache.store("t1", "ds", "top customers", answer("Q")).await;
        // 另一线程查同一数据源：线程历史未命中，精确与语义都可命中
        let hit = cache.lookup("t2", "ds", "Top Customers!").await.unwrap();
        assert_eq!(hit.tier, CacheTier::Exact);
    }

    #[tokio::test]
    async fn test_thread_history_beats_exact() {
        let cache = service();
        cache.store("t1", "ds", "top customers", answer("Q")).await;
        let hit = cache.lookup("t1", "ds", "top customers").await.unwrap();
        assert_eq!(hit.tier, CacheTier::ThreadHistory);
    }

    #[tokio::test]
    async fn test_semantic_reached_only_on_exact_miss() {
        let cache = service();
        cache.store("t1", "ds", "top customers by revenue", answer("Q")).await;
        // 措辞不同（规范化后不相等）但语义相近
        let hit = cache.lookup("t2", "ds", "revenue top customers by").await;
        if let Some(hit) = hit {
            assert_eq!(hit.tier, CacheTier::Semantic);
        }
    }

    #[tokio::test]
    async fn test_disabled_cache_never_hits() {
        let cfg = CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        };
        let cache = CacheService::new(cfg, None);
        cache.store("t1", "ds", "q", answer("Q")).await;
        assert!(cache.lookup("t1", "ds", "q").await.is_none());
    }
}
