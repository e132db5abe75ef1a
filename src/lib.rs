//! Nectar - Rust 自然语言查询流水线
//!
//! 模块划分：
//! - **cache**: 三级结果缓存（线程历史 / 精确 / 语义）
//! - **checkpoint**: 检查点存储（内存 / SQLite），支撑暂停-续跑
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 状态机协调器、守卫、错误恢复、查询规划与过程事件
//! - **exec**: 查询执行服务接口与批量刷新
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）+ 嵌入
//! - **observability**: tracing 初始化
//! - **schema**: schema/目录提供方接口
//! - **validation**: 校验与自动修复引擎（形态 / 安全 / 限额 / 标识符）

pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod core;
pub mod exec;
pub mod llm;
pub mod observability;
pub mod schema;
pub mod validation;

pub use crate::core::{Coordinator, CoordinatorConfig, ResumeRequest, TurnOutcome, TurnRequest};
