//! SQL 方言：行限制子句的检测与注入
//!
//! 大多数方言用尾部 LIMIT；SQL Server 用 SELECT 后的 TOP 前缀；Oracle 用 FETCH FIRST 后缀。

use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// 目标数据源方言
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    MySql,
    Postgres,
    Sqlite,
    SqlServer,
    Oracle,
}

impl Default for Dialect {
    fn default() -> Self {
        Dialect::MySql
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Dialect::MySql => "mysql",
            Dialect::Postgres => "postgres",
            Dialect::Sqlite => "sqlite",
            Dialect::SqlServer => "sqlserver",
            Dialect::Oracle => "oracle",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for Dialect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(Dialect::MySql),
            "postgres" | "postgresql" | "pg" => Ok(Dialect::Postgres),
            "sqlite" => Ok(Dialect::Sqlite),
            "sqlserver" | "mssql" => Ok(Dialect::SqlServer),
            "oracle" => Ok(Dialect::Oracle),
            other => Err(format!("unknown dialect: {}", other)),
        }
    }
}

impl Dialect {
    /// 查询中已存在的行限制值（方言相关语法）
    pub fn existing_limit(&self, query: &str) -> Option<u64> {
        let re = match self {
            Dialect::MySql | Dialect::Postgres | Dialect::Sqlite => {
                Regex::new(r"(?i)\blimit\s+(\d+)").ok()?
            }
            Dialect::SqlServer => Regex::new(r"(?i)\bselect\s+(?:distinct\s+)?top\s+(\d+)").ok()?,
            Dialect::Oracle => {
                Regex::new(r"(?i)\bfetch\s+first\s+(\d+)\s+rows?\s+only").ok()?
            }
        };
        re.captures(query)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }

    /// 是否带行限制子句
    pub fn has_row_limit(&self, query: &str) -> bool {
        self.existing_limit(query).is_some()
    }

    /// 注入方言正确的默认行限制；调用方保证原查询没有限制子句
    pub fn inject_limit(&self, query: &str, limit: u64) -> String {
        let trimmed = query.trim_end().trim_end_matches(';').trim_end();
        match self {
            Dialect::MySql | Dialect::Postgres | Dialect::Sqlite => {
                format!("{} LIMIT {}", trimmed, limit)
            }
            Dialect::SqlServer => {
                // TOP 是 SELECT 后的前缀修饰符；DISTINCT 在 TOP 之前
                let re = Regex::new(r"(?i)^\s*select\s+(distinct\s+)?").expect("static regex");
                match re.find(trimmed) {
                    Some(m) => {
                        let (head, tail) = trimmed.split_at(m.end());
                        format!("{}TOP {} {}", head, limit, tail)
                    }
                    None => trimmed.to_string(),
                }
            }
            Dialect::Oracle => format!("{} FETCH FIRST {} ROWS ONLY", trimmed, limit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_limit_detected() {
        assert_eq!(
            Dialect::MySql.existing_limit("SELECT * FROM t LIMIT 50"),
            Some(50)
        );
        assert!(!Dialect::MySql.has_row_limit("SELECT * FROM t"));
    }

    #[test]
    fn test_inject_mysql() {
        let fixed = Dialect::MySql.inject_limit("SELECT * FROM orders;", 1000);
        assert_eq!(fixed, "SELECT * FROM orders LIMIT 1000");
        assert!(Dialect::MySql.has_row_limit(&fixed));
    }

    #[test]
    fn test_inject_sqlserver_top() {
        let fixed = Dialect::SqlServer.inject_limit("SELECT name FROM orders", 100);
        assert_eq!(fixed, "SELECT TOP 100 name FROM orders");
        assert_eq!(Dialect::SqlServer.existing_limit(&fixed), Some(100));
    }

    #[test]
    fn test_inject_sqlserver_distinct() {
        let fixed = Dialect::SqlServer.inject_limit("SELECT DISTINCT name FROM orders", 10);
        assert_eq!(fixed, "SELECT DISTINCT TOP 10 name FROM orders");
        assert!(Dialect::SqlServer.has_row_limit(&fixed));
    }

    #[test]
    fn test_inject_oracle_fetch_first() {
        let fixed = Dialect::Oracle.inject_limit("SELECT * FROM orders", 1000);
        assert_eq!(fixed, "SELECT * FROM orders FETCH FIRST 1000 ROWS ONLY");
        assert_eq!(Dialect::Oracle.existing_limit(&fixed), Some(1000));
    }

    #[test]
    fn test_from_str_aliases() {
        assert_eq!("postgresql".parse::<Dialect>().unwrap(), Dialect::Postgres);
        assert_eq!("mssql".parse::<Dialect>().unwrap(), Dialect::SqlServer);
        assert!("dbase".parse::<Dialect>().is_err());
    }
}
