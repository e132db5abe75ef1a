//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `NECTAR__*` 覆盖（双下划线表示嵌套，如 `NECTAR__LLM__PROVIDER=openai`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::cache::CacheConfig;
use crate::core::{CoordinatorConfig, GuardConfig};
use crate::llm::RetryConfig;
use crate::validation::ValidatorConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub pipeline: PipelineSection,
    pub cache: CacheSection,
    pub validation: ValidationSection,
    pub execution: ExecutionSection,
    pub checkpoint: CheckpointSection,
    pub embedding: EmbeddingSection,
}

/// [app] 段：应用名
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [llm] 段：后端选择、超时与重试
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LlmSection {
    /// 后端：deepseek / openai；优先级由 API Key 与 provider 共同决定
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default)]
    pub deepseek: LlmDeepSeekSection,
    #[serde(default)]
    pub openai: LlmOpenAiSection,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
    #[serde(default)]
    pub retry: LlmRetrySection,
}

fn default_provider() -> String {
    "deepseek".to_string()
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LlmDeepSeekSection {
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LlmOpenAiSection {
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    pub request: u64,
    pub stream: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: 60,
            stream: 120,
        }
    }
}

/// [llm.retry] 段：指数退避参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmRetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub jitter_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for LlmRetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            multiplier: 2.0,
            jitter_ms: 250,
            max_delay_ms: 8_000,
        }
    }
}

impl LlmRetrySection {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            base_delay_ms: self.base_delay_ms,
            multiplier: self.multiplier,
            jitter_ms: self.jitter_ms,
            max_delay_ms: self.max_delay_ms,
        }
    }
}

/// [pipeline] 段：守卫与重试预算
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    pub max_turns: u32,
    pub max_retries: u32,
    pub loop_window: usize,
    pub max_gen_retries: u32,
    pub history_window: usize,
    /// 是否用 LLM 判定澄清需求
    pub clarify_with_llm: bool,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            max_turns: 30,
            max_retries: 3,
            loop_window: 3,
            max_gen_retries: 3,
            history_window: 12,
            clarify_with_llm: true,
        }
    }
}

/// [cache] 段：三层缓存与语义阈值
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub enabled: bool,
    pub max_entries: usize,
    pub thread_history_limit: usize,
    /// 相似度达到该值可无条件复用
    pub reuse_threshold: f32,
    /// 落在 [confirm, reuse) 区间须经澄清确认
    pub confirm_threshold: f32,
}

impl Default for CacheSection {
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

impl CacheSection {
    pub fn to_cache_config(&self) -> CacheConfig {
        CacheConfig {
            enabled: self.enabled,
            max_entries: self.max_entries,
            thread_history_limit: self.thread_history_limit,
            reuse_threshold: self.reuse_threshold,
            confirm_threshold: self.confirm_threshold,
        }
    }
}

/// [validation] 段：行限制与标识符建议阈值
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValidationSection {
    pub default_row_limit: u64,
    pub max_row_limit: u64,
    pub min_suggest_score: f64,
}

impl Default for ValidationSection {
    fn default() -> Self {
        Self {
            default_row_limit: 1000,
            max_row_limit: 10_000,
            min_suggest_score: 0.5,
        }
    }
}

impl ValidationSection {
    pub fn to_validator_config(&self) -> ValidatorConfig {
        ValidatorConfig {
            default_row_limit: self.default_row_limit,
            max_row_limit: self.max_row_limit,
            min_suggest_score: self.min_suggest_score,
        }
    }
}

/// [execution] 段：查询超时与批量刷新并发上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionSection {
    pub timeout_secs: u64,
    pub max_bulk_concurrency: usize,
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_bulk_concurrency: 4,
        }
    }
}

/// [checkpoint] 段：持久化后端
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CheckpointSection {
    /// 设置后（且启用 async-sqlite）使用 SQLite，否则内存存储
    pub db_path: Option<PathBuf>,
    /// 内存存储每线程保留的版本数
    pub keep_versions: usize,
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            db_path: None,
            keep_versions: 20,
        }
    }
}

/// [embedding] 段：语义缓存的嵌入模型
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingSection {
    pub model: String,
    pub base_url: Option<String>,
}

impl Default for EmbeddingSection {
    fn default() -> Self {
        Self {
            model: "text-embedding-3-small".to_string(),
            base_url: None,
        }
    }
}

impl AppConfig {
    /// 汇总为协调器配置
    pub fn to_coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            guard: GuardConfig {
                max_turns: self.pipeline.max_turns,
                loop_window: self.pipeline.loop_window,
                max_gen_retries: self.pipeline.max_gen_retries,
                history_window: self.pipeline.history_window,
            },
            max_retries: self.pipeline.max_retries,
            execution_timeout: Duration::from_secs(self.execution.timeout_secs),
            clarify_with_llm: self.pipeline.clarify_with_llm,
        }
    }
}

/// 从 config 目录加载配置，环境变量 NECTAR__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 NECTAR__*（双下划线表示嵌套键）
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
        config::Environment::with_prefix("NECTAR")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置（配置热更新：调用方决定是否用新配置重建组件）
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}
