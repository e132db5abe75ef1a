//! Schema/目录提供方：数据源结构上下文
//!
//! 协调器把返回的 SchemaContext 当作不透明块用于提示词拼接与标识符白名单；
//! 真实实现可能由远端目录服务支撑，这里附带一个内存静态实现。

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Schema 查询错误
#[derive(Error, Debug, Clone)]
pub enum SchemaError {
    #[error("datasource not found: {0}")]
    NotFound(String),

    #[error("schema provider error: {0}")]
    Provider(String),
}

/// 列定义
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// 表定义
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnSchema>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }
}

/// 表间关系（外键级别）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub from_table: String,
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
}

/// 一次 schema 查询返回的结构上下文
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaContext {
    pub tables: Vec<TableSchema>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
    /// 业务值映射（如「华东」-> region_code = 'EC'），提示词拼接用
    #[serde(default)]
    pub value_mappings: HashMap<String, String>,
}

impl SchemaContext {
    pub fn new(tables: Vec<TableSchema>) -> Self {
        Self {
            tables,
            relationships: Vec::new(),
            value_mappings: HashMap::new(),
        }
    }

    /// 表名 -> 列名集合（全小写），供标识符校验
    pub fn column_whitelist(&self) -> HashMap<String, HashSet<String>> {
        self.tables
            .iter()
            .map(|t| {
                (
                    t.name.to_lowercase(),
                    t.columns.iter().map(|c| c.name.to_lowercase()).collect(),
                )
            })
            .collect()
    }

    /// 渲染为提示词中的 schema 块
    pub fn prompt_block(&self) -> String {
        let mut out = String::new();
        for t in &self.tables {
            let cols: Vec<String> = t
                .columns
                .iter()
                .map(|c| format!("{} {}", c.name, c.data_type))
                .collect();
            let _ = writeln!(out, "TABLE {} ({})", t.name, cols.join(", "));
        }
        for r in &self.relationships {
            let _ = writeln!(
                out,
                "REL {}.{} -> {}.{}",
                r.from_table, r.from_column, r.to_table, r.to_column
            );
        }
        for (k, v) in &self.value_mappings {
            let _ = writeln!(out, "VALUE {} = {}", k, v);
        }
        out
    }
}

/// Schema 提供方：数据源 ID + 自然语言文本 -> 结构上下文
#[async_trait]
pub trait SchemaProvider: Send + Sync {
    async fn schema_context(
        &self,
        datasource_id: &str,
        text: &str,
    ) -> Result<SchemaContext, SchemaError>;
}

/// 内存静态实现：数据源 ID -> 固定 SchemaContext
#[derive(Default)]
pub struct StaticSchemaProvider {
    map: HashMap<String, SchemaContext>,
}

impl StaticSchemaProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_datasource(mut self, datasource_id: impl Into<String>, ctx: SchemaContext) -> Self {
        self.map.insert(datasource_id.into(), ctx);
        self
    }
}

#[async_trait]
impl SchemaProvider for StaticSchemaProvider {
    async fn schema_context(
        &self,
        datasource_id: &str,
        _text: &str,
    ) -> Result<SchemaContext, SchemaError> {
        self.map
            .get(datasource_id)
            .cloned()
            .ok_or_else(|| SchemaError::NotFound(datasource_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> SchemaContext {
        SchemaContext::new(vec![TableSchema::new(
            "orders",
            vec![
                ColumnSchema::new("id", "bigint"),
                ColumnSchema::new("total_amount", "decimal"),
            ],
        )])
    }

    #[test]
    fn test_whitelist_lowercased() {
        let wl = ctx().column_whitelist();
        assert!(wl["orders"].contains("total_amount"));
    }

    #[test]
    fn test_prompt_block_lists_tables() {
        let block = ctx().prompt_block();
        assert!(block.contains("TABLE orders"));
        assert!(block.contains("total_amount decimal"));
    }

    #[tokio::test]
    async fn test_static_provider_not_found() {
        let p = StaticSchemaProvider::new().with_datasource("demo", ctx());
        assert!(p.schema_context("demo", "any").await.is_ok());
        assert!(matches!(
            p.schema_context("other", "any").await,
            Err(SchemaError::NotFound(_))
        ));
    }
}
