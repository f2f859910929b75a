use crate::error::{KeeperError, Result};
use regex::Regex;
use std::sync::LazyLock;

static DATABASE_NAME_RE: LazyLock<std::result::Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]{0,127}$"));
static BACKUP_SET_NAME_RE: LazyLock<std::result::Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,255}$"));

fn matches(re: &std::result::Result<Regex, regex::Error>, value: &str) -> Result<bool> {
    let re = re
        .as_ref()
        .map_err(|e| KeeperError::validation(format!("正则表达式编译失败: {e}")))?;
    Ok(re.is_match(value))
}

/// 校验数据库名称：字母或下划线开头，最长 128 个字符
pub fn validate_database_name(name: &str) -> Result<()> {
    if !matches(&DATABASE_NAME_RE, name)? {
        return Err(KeeperError::validation(format!("无效的数据库名称: '{name}'")));
    }
    Ok(())
}

/// 校验备份集名称；名称同时是备份根目录下的子目录名，因此不允许路径分隔符
pub fn validate_backup_set_name(name: &str) -> Result<()> {
    if !matches(&BACKUP_SET_NAME_RE, name)? {
        return Err(KeeperError::validation(format!("无效的备份集名称: '{name}'")));
    }
    Ok(())
}
