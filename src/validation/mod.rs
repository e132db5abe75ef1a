//! 校验与自动修复引擎
//!
//! 四层独立检查：语句形态 -> 写操作黑名单/多语句 -> 行限制 -> 标识符白名单。
//! 只有保语义的改写（行限制注入）会写入 fixed_query；需要语义修正的错误交给恢复引擎。

pub mod dialect;
pub mod identifier;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::schema::SchemaContext;

pub use dialect::Dialect;
pub use identifier::IdentifierIssue;

/// 允许的只读起始动词
const ALLOWED_VERBS: &[&str] = &["select", "with", "show", "describe", "desc", "explain"];

/// 写/DDL 动词黑名单；整词匹配，绝不做子串匹配
const DENY_VERBS: &[&str] = &[
    "insert", "update", "delete", "drop", "alter", "create", "truncate", "grant",
    "revoke", "merge", "replace", "exec", "execute", "call", "rename",
];

/// 校验结果；errors 与 warnings 均保持产生顺序
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// 仅保语义自动修复（当前只有行限制注入）时非空
    pub fixed_query: Option<String>,
}

impl ValidationResult {
    fn invalid(errors: Vec<String>) -> Self {
        Self {
            is_valid: false,
            errors,
            warnings: Vec::new(),
            fixed_query: None,
        }
    }
}

/// 校验引擎配置
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// 缺失行限制时注入的默认值
    pub default_row_limit: u64,
    /// 超过此值只告警，不改写
    pub max_row_limit: u64,
    /// 标识符建议的最低相似度
    pub min_suggest_score: f64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            default_row_limit: 1000,
            max_row_limit: 10_000,
            min_suggest_score: 0.5,
        }
    }
}

/// 规则校验引擎
pub struct Validator {
    cfg: ValidatorConfig,
    deny_re: Regex,
}

impl Validator {
    pub fn new(cfg: ValidatorConfig) -> Self {
        let pattern = format!(r"(?i)\b({})\b", DENY_VERBS.join("|"));
        Self {
            cfg,
            deny_re: Regex::new(&pattern).expect("static regex"),
        }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.cfg
    }

    /// 校验查询；schema 可用时附带标识符白名单检查
    pub fn validate(
        &self,
        query: &str,
        dialect: Dialect,
        schema: Option<&SchemaContext>,
    ) -> ValidationResult {
        // a) 形态：必须以只读动词开头。黑名单动词开头时直接给出安全错误
        let Some(first) = first_word(query) else {
            return ValidationResult::invalid(vec!["empty statement".to_string()]);
        };
        if !ALLOWED_VERBS.contains(&first.to_lowercase().as_str()) {
            let err = if DENY_VERBS.contains(&first.to_lowercase().as_str()) {
                format!("write operation not permitted: {}", first.to_uppercase())
            } else {
                format!("statement must start with a read-only verb (got: {})", first)
            };
            return ValidationResult::invalid(vec![err]);
        }

        // b) 安全：查询体内嵌的写动词与多语句
        let mut errors = Vec::new();
        if let Some(verb) = self.embedded_deny_verb(query) {
            errors.push(format!("write operation not permitted: {}", verb.to_uppercase()));
        }
        if has_multiple_statements(query) {
            errors.push("multiple statements are not permitted".to_string());
        }
        if !errors.is_empty() {
            return ValidationResult::invalid(errors);
        }

        let mut warnings = Vec::new();
        let mut fixed_query = None;

        // c) 资源限制：缺失则注入方言正确的默认值（告警级），超限只告警
        match dialect.existing_limit(query) {
            None => {
                let fixed = dialect.inject_limit(query, self.cfg.default_row_limit);
                warnings.push(format!("auto-added limit: {}", self.cfg.default_row_limit));
                fixed_query = Some(fixed);
            }
            Some(n) if n > self.cfg.max_row_limit => {
                warnings.push(format!(
                    "limit {} exceeds configured maximum {}",
                    n, self.cfg.max_row_limit
                ));
            }
            Some(_) => {}
        }

        // d) 标识符：schema 可用时解析限定列引用
        if let Some(schema) = schema {
            for issue in
                identifier::check_qualified_references(query, schema, self.cfg.min_suggest_score)
            {
                errors.push(issue.to_error());
            }
        }

        if errors.is_empty() {
            ValidationResult {
                is_valid: true,
                errors,
                warnings,
                fixed_query,
            }
        } else {
            ValidationResult {
                is_valid: false,
                errors,
                warnings,
                fixed_query: None,
            }
        }
    }

    /// 字符串字面量以外的黑名单动词；跳过首词（已在形态层处理）
    fn embedded_deny_verb(&self, query: &str) -> Option<String> {
        let stripped = mask_string_literals(query);
        for m in self.deny_re.find_iter(&stripped) {
            if m.start() == leading_ws(query) {
                continue;
            }
            return Some(m.as_str().to_string());
        }
        None
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(ValidatorConfig::default())
    }
}

fn first_word(query: &str) -> Option<&str> {
    query.split_whitespace().next()
}

fn leading_ws(query: &str) -> usize {
    query.len() - query.trim_start().len()
}

/// 把单/双引号字面量替换为等长空白，保持字节偏移不变
fn mask_string_literals(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    let mut quote: Option<char> = None;
    for c in query.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
                out.push(if c == '\n' { '\n' } else { ' ' });
            }
            None => {
                if c == '\'' || c == '"' {
                    quote = Some(c);
                    out.push(' ');
                } else {
                    out.push(c);
                }
            }
        }
    }
    out
}

/// 字面量以外是否存在分号分隔的第二条语句；允许尾部分号
fn has_multiple_statements(query: &str) -> bool {
    let masked = mask_string_literals(query);
    match masked.find(';') {
        Some(pos) => masked[pos + 1..].trim().len() > 0,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSchema, SchemaContext, TableSchema};

    fn validator() -> Validator {
        Validator::default()
    }

    #[test]
    fn test_missing_limit_auto_fixed_mysql() {
        let r = validator().validate("SELECT * FROM orders", Dialect::MySql, None);
        assert!(r.is_valid);
        assert_eq!(r.warnings.len(), 1);
        assert!(r.warnings[0].starts_with("auto-added limit"));
        assert_eq!(r.fixed_query.as_deref(), Some("SELECT * FROM orders LIMIT 1000"));
    }

    #[test]
    fn test_drop_table_rejected() {
        let r = validator().validate("DROP TABLE orders", Dialect::MySql, None);
        assert!(!r.is_valid);
        assert_eq!(r.errors, vec!["write operation not permitted: DROP".to_string()]);
        assert!(r.fixed_query.is_none());
    }

    #[test]
    fn test_fix_reaches_fixed_point() {
        let v = validator();
        let first = v.validate("SELECT * FROM orders", Dialect::MySql, None);
        let fixed = first.fixed_query.expect("fix expected");
        let second = v.validate(&fixed, Dialect::MySql, None);
        assert!(second.is_valid);
        assert!(second.fixed_query.is_none());
        assert!(second.warnings.iter().all(|w| !w.starts_with("auto-added limit")));
    }

    #[test]
    fn test_fix_per_dialect() {
        let v = validator();
        for dialect in [
            Dialect::MySql,
            Dialect::Postgres,
            Dialect::Sqlite,
            Dialect::SqlServer,
            Dialect::Oracle,
        ] {
            let r = v.validate("SELECT * FROM orders", dialect, None);
            let fixed = r.fixed_query.unwrap_or_else(|| panic!("no fix for {}", dialect));
            assert!(dialect.has_row_limit(&fixed), "{}: {}", dialect, fixed);
            let again = v.validate(&fixed, dialect, None);
            assert!(again.warnings.iter().all(|w| !w.starts_with("auto-added limit")));
        }
    }

    #[test]
    fn test_oversized_limit_warns_only() {
        let r = validator().validate("SELECT * FROM orders LIMIT 999999", Dialect::MySql, None);
        assert!(r.is_valid);
        assert!(r.fixed_query.is_none());
        assert!(r.warnings[0].contains("exceeds configured maximum"));
    }

    #[test]
    fn test_embedded_write_verb_whole_word_only() {
        // created_at 含 create 子串，但不是整词，不应命中
        let r = validator().validate(
            "SELECT created_at FROM orders LIMIT 10",
            Dialect::MySql,
            None,
        );
        assert!(r.is_valid, "{:?}", r.errors);

        let r = validator().validate(
            "SELECT id FROM orders WHERE id IN (DELETE FROM x) LIMIT 5",
            Dialect::MySql,
            None,
        );
        assert!(!r.is_valid);
        assert_eq!(r.errors[0], "write operation not permitted: DELETE");
    }

    #[test]
    fn test_deny_verb_inside_literal_ignored() {
        let r = validator().validate(
            "SELECT id FROM orders WHERE note = 'please drop me a line' LIMIT 5",
            Dialect::MySql,
            None,
        );
        assert!(r.is_valid, "{:?}", r.errors);
    }

    #[test]
    fn test_multiple_statements_rejected() {
        let r = validator().validate(
            "SELECT id FROM orders LIMIT 5; SELECT id FROM customers",
            Dialect::MySql,
            None,
        );
        assert!(!r.is_valid);
        assert!(r.errors[0].contains("multiple statements"));

        // 尾部分号合法
        let r = validator().validate("SELECT id FROM orders LIMIT 5;", Dialect::MySql, None);
        assert!(r.is_valid);
    }

    #[test]
    fn test_unknown_verb_rejected() {
        let r = validator().validate("VACUUM orders", Dialect::Postgres, None);
        assert!(!r.is_valid);
        assert!(r.errors[0].contains("read-only verb"));
    }

    #[test]
    fn test_identifier_check_with_schema() {
        let schema = SchemaContext::new(vec![TableSchema::new(
            "orders",
            vec![
                ColumnSchema::new("id", "bigint"),
                ColumnSchema::new("customer_id", "bigint"),
            ],
        )]);
        let r = validator().validate(
            "SELECT o.custmer_id FROM orders o LIMIT 10",
            Dialect::MySql,
            Some(&schema),
        );
        assert!(!r.is_valid);
        assert!(r.errors[0].contains("did you mean: orders.customer_id"));
    }
}
