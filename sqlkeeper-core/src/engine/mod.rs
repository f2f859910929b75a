//! 数据库引擎适配层
//!
//! 核心逻辑只通过 [`Engine`] 与 SQL Server 交互：`execute` 执行不返回结果集的语句，
//! `query` 返回按列名索引的结果行。生产实现是 [`SqlCmdEngine`]，测试使用内存替身。

pub mod sql;
mod sqlcmd;

pub use sqlcmd::SqlCmdEngine;

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::warn;

/// 结果集中的一行，列值为 `None` 表示 NULL
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    columns: HashMap<String, Option<String>>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// 构建测试数据时使用的链式写法
    pub fn with(mut self, column: &str, value: Option<&str>) -> Self {
        self.insert(column, value.map(str::to_string));
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: Option<String>) {
        self.columns.insert(column.into(), value);
    }

    /// 列不存在或值为 NULL 时都返回 None
    pub fn get(&self, column: &str) -> Option<&str> {
        self.columns.get(column).and_then(|v| v.as_deref())
    }

    #[cfg(test)]
    pub(crate) fn has_column(&self, column: &str) -> bool {
        self.columns.contains_key(column)
    }
}

#[async_trait]
pub trait Engine: Send + Sync {
    /// 执行语句，不关心结果集
    async fn execute(&self, sql: &str) -> Result<()>;

    /// 执行查询，返回第一个结果集
    async fn query(&self, sql: &str) -> Result<Vec<Row>>;
}

/// 拼接引擎侧路径；引擎运行在 Windows 上时根路径使用反斜杠
pub fn join_server_path(base: &str, segments: &[&str]) -> String {
    let separator = if base.contains('\\') && !base.contains('/') {
        '\\'
    } else {
        '/'
    };

    let mut path = base.trim_end_matches(['/', '\\']).to_string();
    for segment in segments {
        path.push(separator);
        path.push_str(segment.trim_matches(['/', '\\']));
    }
    path
}

/// 数据库是否存在
pub async fn database_exists(engine: &dyn Engine, database: &str) -> Result<bool> {
    let rows = engine.query(&sql::database_exists(database)).await?;
    Ok(!rows.is_empty())
}

/// 切换到单用户模式并立即回滚其他会话的事务
pub async fn set_single_user(engine: &dyn Engine, database: &str) -> Result<()> {
    engine.execute(&sql::set_single_user(database)).await
}

pub async fn set_multi_user(engine: &dyn Engine, database: &str) -> Result<()> {
    engine.execute(&sql::set_multi_user(database)).await
}

/// 删除数据库；存在时先尽力切换到单用户模式
pub async fn drop_database(engine: &dyn Engine, database: &str) -> Result<bool> {
    if !database_exists(engine, database).await? {
        return Ok(false);
    }

    if let Err(e) = set_single_user(engine, database).await {
        warn!("删除前切换数据库 {} 到单用户模式失败: {}", database, e);
    }
    engine.execute(&sql::drop_database(database)).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_null_and_missing_columns() {
        let row = Row::new()
            .with("FirstLSN", Some("100"))
            .with("DatabaseBackupLSN", None);

        assert_eq!(row.get("FirstLSN"), Some("100"));
        assert_eq!(row.get("DatabaseBackupLSN"), None);
        assert!(row.has_column("DatabaseBackupLSN"));
        assert_eq!(row.get("LastLSN"), None);
        assert!(!row.has_column("LastLSN"));
    }

    #[test]
    fn test_join_server_path() {
        assert_eq!(
            join_server_path("/mnt/sql_backups/", &["Sales", "Sales_20240101_000000.bak"]),
            "/mnt/sql_backups/Sales/Sales_20240101_000000.bak"
        );
        assert_eq!(
            join_server_path(r"\\nas\backups", &["Sales", "a.trn"]),
            r"\\nas\backups\Sales\a.trn"
        );
        assert_eq!(
            join_server_path(r"D:\Data\", &["Sales.mdf"]),
            r"D:\Data\Sales.mdf"
        );
    }
}
