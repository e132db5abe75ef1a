//! 语义全局缓存：向量最近邻 + 双阈值
//!
//! 相似度 >= reuse_threshold 直接复用；落在 [confirm_threshold, reuse_threshold)
//! 时必须经澄清确认等价后才复用，绝不静默返回可能不同的答案。

use tokio::sync::RwLock;

use crate::cache::CachedAnswer;
use crate::llm::EmbeddingProvider;
use std::sync::Arc;

/// 单条语义缓存记录
#[derive(Debug, Clone)]
pub struct SemanticCacheEntry {
    /// 原始（未规范化）请求文本，用于澄清提问展示
    pub text: String,
    pub datasource_id: String,
    pub embedding: Vec<f32>,
    pub answer: CachedAnswer,
}

/// 语义命中
#[derive(Debug, Clone)]
pub struct SemanticHit {
    pub answer: CachedAnswer,
    pub matched_text: String,
    pub similarity: f32,
    /// 落在确认区间时为 true：须经澄清确认
    pub needs_confirmation: bool,
}

/// 语义缓存层
pub struct SemanticCache {
    embedder: Arc<dyn EmbeddingProvider>,
    entries: RwLock<Vec<SemanticCacheEntry>>,
    reuse_threshold: f32,
    confirm_threshold: f32,
    max_entries: usize,
}

impl SemanticCache {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        reuse_threshold: f32,
        confirm_threshold: f32,
        max_entries: usize,
    ) -> Self {
        Self {
            embedder,
            entries: RwLock::new(Vec::new()),
            reuse_threshold,
            confirm_threshold: confirm_threshold.min(reuse_threshold),
            max_entries: max_entries.max(1),
        }
    }

    /// 最近邻查找；低于确认阈值视为未命中
    pub async fn lookup(&self, datasource_id: &str, text: &str) -> Option<SemanticHit> {
        let query_emb = match self.embedder.embed(text).await {
            Ok(v) if !v.is_empty() => v,
            Ok(_) => return None,
            Err(e) => {
                tracing::debug!("semantic lookup skipped: {}", e);
                return None;
            }
        };

        let entries = self.entries.read().await;
        let best = entries
            .iter()
            .filter(|e| e.datasource_id == datasource_id)
            .map(|e| (cosine_similarity(&query_emb, &e.embedding), e))
            .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))?;

        let (similarity, entry) = best;
        if similarity < self.confirm_threshold {
            return None;
        }
        Some(SemanticHit {
            answer: entry.answer.clone(),
            matched_text: entry.text.clone(),
            similarity,
            needs_confirmation: similarity < self.reuse_threshold,
        })
    }

    pub async fn store(&self, datasource_id: &str, text: &str, answer: CachedAnswer) {
        let embedding = match self.embedder.embed(text).await {
            Ok(v) if !v.is_empty() => v,
            _ => return,
        };
        let mut entries = self.entries.write().await;
        entries.push(SemanticCacheEntry {
            text: text.to_string(),
            datasource_id: datasource_id.to_string(),
            embedding,
            answer,
        });
        if entries.len() > self.max_entries {
            let drop = entries.len() - self.max_entries;
            entries.drain(..drop);
        }
    }
}

/// 余弦相似度
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
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

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 0.001);
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 0.001);
    }

    #[tokio::test]
    async fn test_identical_text_reused_without_confirmation() {
        let cache = SemanticCache::new(Arc::new(HashEmbedder::default()), 0.95, 0.8, 64);
        cache.store("ds", "top customers by revenue", answer("Q")).await;
        let hit = cache.lookup("ds", "top customers by revenue").await.unwrap();
        assert!(hit.similarity > 0.99);
        assert!(!hit.needs_confirmation);
    }

    #[tokio::test]
    async fn test_unrelated_text_misses() {
        let cache = SemanticCache::new(Arc::new(HashEmbedder::default()), 0.95, 0.8, 64);
        cache.store("ds", "top customers by revenue", answer("Q")).await;
        assert!(cache.lookup("ds", "weather in berlin tomorrow").await.is_none());
    }

    #[tokio::test]
    async fn test_near_match_requires_confirmation() {
        // 确认阈值调低，使近似文本落入确认区间
        let cache = SemanticCache::new(Arc::new(HashEmbedder::default()), 0.999, 0.3, 64);
        cache.store("ds", "top customers by revenue", answer("Q")).await;
        let hit = cache.lookup("ds", "top customers by total revenue").await.unwrap();
        assert!(hit.needs_confirmation);
        assert_eq!(hit.matched_text, "top customers by revenue");
    }
}
