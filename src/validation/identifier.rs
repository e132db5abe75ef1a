//! 标识符校验：限定列引用解析与近似建议
//!
//! 从 FROM/JOIN 子句收集表别名，把每个 `别名.列` 引用解析到 schema 白名单；
//! 解析失败时按「包含 > 前缀 > 字符重合率」给出最接近的合法列。

use std::collections::{HashMap, HashSet};

use regex::Regex;

use crate::schema::SchemaContext;

/// 常见 SQL 函数名；出现在限定引用左侧时不会被误判为表别名
const KNOWN_FUNCTIONS: &[&str] = &[
    "count", "sum", "avg", "min", "max", "abs", "round", "floor", "ceil", "coalesce",
    "nullif", "cast", "convert", "concat", "substring", "substr", "upper", "lower",
    "trim", "length", "replace", "now", "curdate", "date", "year", "month", "day",
    "date_format", "date_trunc", "extract", "datediff", "ifnull", "if", "greatest",
    "least", "row_number", "rank", "dense_rank", "lag", "lead",
];

/// 一次标识符检查发现的问题
#[derive(Debug, Clone)]
pub struct IdentifierIssue {
    /// 原始引用，如 `o.custmer_id`
    pub reference: String,
    /// 建议的合法列（带表名），相似度不足时为 None
    pub suggestion: Option<String>,
}

impl IdentifierIssue {
    /// 渲染为校验错误文本
    pub fn to_error(&self) -> String {
        match &self.suggestion {
            Some(s) => format!("unknown column: {} (did you mean: {})", self.reference, s),
            None => format!("unknown column: {}", self.reference),
        }
    }
}

/// 从 FROM/JOIN 子句收集 `别名 -> 表名` 映射；无别名的表映射到自身
pub fn collect_aliases(query: &str) -> HashMap<String, String> {
    let mut aliases = HashMap::new();
    let re = Regex::new(
        r"(?i)\b(?:from|join)\s+([A-Za-z_][A-Za-z0-9_]*)(?:\s+(?:as\s+)?([A-Za-z_][A-Za-z0-9_]*))?",
    )
    .expect("static regex");

    for caps in re.captures_iter(query) {
        let table = caps[1].to_lowercase();
        if let Some(alias) = caps.get(2) {
            let alias = alias.as_str().to_lowercase();
            // WHERE/GROUP 等关键字紧跟表名时会被捕获为「别名」，跳过
            if !is_clause_keyword(&alias) {
                aliases.insert(alias, table.clone());
            }
        }
        aliases.insert(table.clone(), table);
    }
    aliases
}

fn is_clause_keyword(word: &str) -> bool {
    matches!(
        word,
        "where" | "group" | "order" | "having" | "limit" | "on" | "inner" | "left" | "right"
            | "full" | "cross" | "join" | "union" | "fetch" | "offset" | "as" | "set"
    )
}

/// 校验查询中所有限定列引用；返回未能解析的引用列表
pub fn check_qualified_references(query: &str, schema: &SchemaContext, min_score: f64) -> Vec<IdentifierIssue> {
    let whitelist = schema.column_whitelist();
    let aliases = collect_aliases(query);
    let re = Regex::new(r"\b([A-Za-z_][A-Za-z0-9_]*)\.([A-Za-z_][A-Za-z0-9_]*)\b")
        .expect("static regex");

    let mut issues = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for caps in re.captures_iter(query) {
        let qualifier = caps[1].to_lowercase();
        let column = caps[2].to_lowercase();

        if KNOWN_FUNCTIONS.contains(&qualifier.as_str()) {
            continue;
        }
        // 别名未出现在 FROM/JOIN 中：可能是 schema 前缀（db.table），不在本层职责内
        let Some(table) = aliases.get(&qualifier) else {
            continue;
        };
        let Some(columns) = whitelist.get(table) else {
            continue;
        };
        if columns.contains(&column) {
            continue;
        }

        let reference = format!("{}.{}", &caps[1], &caps[2]);
        if !seen.insert(reference.clone()) {
            continue;
        }
        let suggestion = closest_column(&column, table, &whitelist, min_score);
        issues.push(IdentifierIssue { reference, suggestion });
    }
    issues
}

/// 在表的列集合中找最接近的列；返回 `表.列`
fn closest_column(
    target: &str,
    table: &str,
    whitelist: &HashMap<String, HashSet<String>>,
    min_score: f64,
) -> Option<String> {
    let columns = whitelist.get(table)?;
    let mut best: Option<(f64, &String)> = None;
    for cand in columns {
        let score = similarity(target, cand);
        if best.as_ref().map(|(s, _)| score > *s).unwrap_or(true) {
            best = Some((score, cand));
        }
    }
    match best {
        Some((score, cand)) if score >= min_score => Some(format!("{}.{}", table, cand)),
        _ => None,
    }
}

/// 相似度启发式：互相包含 > 公共前缀 > 字符重合率
fn similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    if a.contains(b) || b.contains(a) {
        let (short, long) = if a.len() < b.len() { (a, b) } else { (b, a) };
        return 0.5 + 0.4 * (short.len() as f64 / long.len() as f64);
    }
    let prefix = a
        .chars()
        .zip(b.chars())
        .take_while(|(x, y)| x == y)
        .count();
    if prefix >= 3 {
        return 0.6 + 0.3 * (prefix as f64 / a.len().max(b.len()) as f64);
    }
    char_overlap(a, b)
}

/// 字符重合率：交集大小 / 较长者长度
fn char_overlap(a: &str, b: &str) -> f64 {
    let sa: HashSet<char> = a.chars().collect();
    let sb: HashSet<char> = b.chars().collect();
    if sa.is_empty() || sb.is_empty() {
        return 0.0;
    }
    let inter = sa.intersection(&sb).count();
    inter as f64 / sa.len().max(sb.len()) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSchema, SchemaContext, TableSchema};

    fn orders_schema() -> SchemaContext {
        SchemaContext::new(vec![TableSchema::new(
            "orders",
            vec![
                ColumnSchema::new("id", "bigint"),
                ColumnSchema::new("customer_id", "bigint"),
                ColumnSchema::new("total_amount", "decimal"),
                ColumnSchema::new("created_at", "datetime"),
            ],
        )])
    }

    #[test]
    fn test_alias_collection() {
        let aliases = collect_aliases("SELECT o.id FROM orders o JOIN customers AS c ON c.id = o.customer_id");
        assert_eq!(aliases.get("o"), Some(&"orders".to_string()));
        assert_eq!(aliases.get("c"), Some(&"customers".to_string()));
        assert_eq!(aliases.get("orders"), Some(&"orders".to_string()));
    }

    #[test]
    fn test_bare_table_not_aliased_to_keyword() {
        let aliases = collect_aliases("SELECT id FROM orders WHERE id = 1");
        assert!(!aliases.contains_key("where"));
    }

    #[test]
    fn test_valid_reference_passes() {
        let schema = orders_schema();
        let issues =
            check_qualified_references("SELECT o.customer_id FROM orders o", &schema, 0.5);
        assert!(issues.is_empty());
    }

    #[test]
    fn test_typo_gets_suggestion() {
        let schema = orders_schema();
        let issues =
            check_qualified_references("SELECT o.custmer_id FROM orders o", &schema, 0.5);
        assert_eq!(issues.len(), 1);
        let err = issues[0].to_error();
        assert!(err.contains("unknown column: o.custmer_id"), "{}", err);
        assert!(err.contains("orders.customer_id"), "{}", err);
    }

    #[test]
    fn test_function_not_misread_as_alias() {
        let schema = orders_schema();
        let issues = check_qualified_references(
            "SELECT count.total FROM orders o WHERE count(o.id) > 1",
            &schema,
            0.5,
        );
        // count 是已知函数名，count.total 不应被当作表引用
        assert!(issues.is_empty());
    }

    #[test]
    fn test_no_suggestion_below_threshold() {
        let schema = orders_schema();
        let issues = check_qualified_references("SELECT o.zzz FROM orders o", &schema, 0.5);
        assert_eq!(issues.len(), 1);
        assert!(issues[0].suggestion.is_none());
    }
}
