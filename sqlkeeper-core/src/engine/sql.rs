//! T-SQL 语句构造
//!
//! 所有标识符经过 [`quote_ident`]，所有字符串经过 [`quote_literal`]，调用方不需要再做转义。

/// `[name]`，右方括号加倍
pub fn quote_ident(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// `N'value'`，单引号加倍
pub fn quote_literal(value: &str) -> String {
    format!("N'{}'", value.replace('\'', "''"))
}

/// 逻辑文件到物理路径的映射 (WITH MOVE)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMove {
    pub logical_name: String,
    pub physical_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreOptions {
    pub moves: Vec<FileMove>,
    pub replace: bool,
    /// 备份文件中包含多个备份集时的序号
    pub position: Option<u32>,
    /// true 时以 RECOVERY 结束，数据库上线
    pub recovery: bool,
}

impl RestoreOptions {
    fn with_clause(&self) -> String {
        let mut options: Vec<String> = self
            .moves
            .iter()
            .map(|m| {
                format!(
                    "MOVE {} TO {}",
                    quote_literal(&m.logical_name),
                    quote_literal(&m.physical_path)
                )
            })
            .collect();

        if self.replace {
            options.push("REPLACE".to_string());
        }
        if let Some(position) = self.position {
            options.push(format!("FILE = {position}"));
        }
        options.push(if self.recovery { "RECOVERY" } else { "NORECOVERY" }.to_string());
        options.push("STATS = 10".to_string());

        options.join(", ")
    }
}

pub fn header_only(disk_path: &str) -> String {
    format!("RESTORE HEADERONLY FROM DISK = {}", quote_literal(disk_path))
}

pub fn file_list_only(disk_path: &str) -> String {
    format!("RESTORE FILELISTONLY FROM DISK = {}", quote_literal(disk_path))
}

/// 完整或差异备份的还原
pub fn restore_database(database: &str, disk_path: &str, options: &RestoreOptions) -> String {
    format!(
        "RESTORE DATABASE {} FROM DISK = {} WITH {}",
        quote_ident(database),
        quote_literal(disk_path),
        options.with_clause()
    )
}

pub fn restore_log(database: &str, disk_path: &str, options: &RestoreOptions) -> String {
    format!(
        "RESTORE LOG {} FROM DISK = {} WITH {}",
        quote_ident(database),
        quote_literal(disk_path),
        options.with_clause()
    )
}

/// 完整备份，覆盖同名文件
pub fn backup_database(database: &str, disk_path: &str) -> String {
    format!(
        "BACKUP DATABASE {} TO DISK = {} WITH INIT, STATS = 10",
        quote_ident(database),
        quote_literal(disk_path)
    )
}

pub fn set_single_user(database: &str) -> String {
    format!(
        "ALTER DATABASE {} SET SINGLE_USER WITH ROLLBACK IMMEDIATE",
        quote_ident(database)
    )
}

pub fn set_multi_user(database: &str) -> String {
    format!("ALTER DATABASE {} SET MULTI_USER", quote_ident(database))
}

pub fn set_recovery_simple(database: &str) -> String {
    format!("ALTER DATABASE {} SET RECOVERY SIMPLE", quote_ident(database))
}

pub fn drop_database(database: &str) -> String {
    format!("DROP DATABASE {}", quote_ident(database))
}

pub fn database_exists(database: &str) -> String {
    format!(
        "SELECT name FROM sys.databases WHERE name = {}",
        quote_literal(database)
    )
}

/// 用户数据库（跳过 master/tempdb/model/msdb）
pub fn list_user_databases() -> String {
    "SELECT name, state_desc FROM sys.databases WHERE database_id > 4 ORDER BY name".to_string()
}

/// 正在执行的某类命令及其完成百分比；语句文本放在最后一列并去掉换行，便于按行解析
pub fn active_requests(command_prefix: &str) -> String {
    format!(
        "SELECT r.session_id, r.percent_complete, \
         REPLACE(REPLACE(t.text, CHAR(13), ' '), CHAR(10), ' ') AS text \
         FROM sys.dm_exec_requests r CROSS APPLY sys.dm_exec_sql_text(r.sql_handle) t \
         WHERE r.command LIKE {}",
        quote_literal(&format!("{command_prefix}%"))
    )
}
