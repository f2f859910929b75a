//! 备份元数据目录
//!
//! 每个备份集是备份根目录下的一个子目录，里面是 `.bak`/`.diff`/`.trn` 文件和一份
//! `backup_metadata.json` 索引。索引由备份头解析得到，以文件名为键合并，文件消失后对应记录被清除。

mod header;
mod index;

pub(crate) use header::parse_timestamp;

use crate::config::AppConfig;
use crate::constants::{backup, backup_type};
use crate::engine::{self, Engine, sql};
use crate::error::{KeeperError, Result};
use crate::validation::validate_backup_set_name;
use chrono::{DateTime, Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 备份粒度；序列化名称与引擎的 BackupTypeDescription 一致
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackupKind {
    #[serde(rename = "Database", alias = "FULL")]
    Full,
    #[serde(rename = "Database Differential", alias = "DIFF")]
    Diff,
    #[serde(rename = "Transaction Log", alias = "LOG", alias = "Log")]
    Log,
}

impl BackupKind {
    pub fn from_type_code(code: i64) -> Option<Self> {
        match code {
            backup_type::DATABASE => Some(Self::Full),
            backup_type::DATABASE_DIFFERENTIAL => Some(Self::Diff),
            backup_type::TRANSACTION_LOG => Some(Self::Log),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Full => "FULL",
            Self::Diff => "DIFF",
            Self::Log => "LOG",
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// 日志序列号。保留原始文本，比较时十进制数字串去掉前导零后先比长度再比字典序，等价于按数值比较
#[derive(Debug, Clone)]
pub struct Lsn(String);

impl Lsn {
    /// 空串表示缺失
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn key(&self) -> &str {
        if self.0.bytes().all(|b| b.is_ascii_digit()) {
            let trimmed = self.0.trim_start_matches('0');
            if trimmed.is_empty() { "0" } else { trimmed }
        } else {
            &self.0
        }
    }
}

impl PartialEq for Lsn {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Lsn {}

impl Hash for Lsn {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl Ord for Lsn {
    fn cmp(&self, other: &Self) -> Ordering {
        let (a, b) = (self.key(), other.key());
        a.len().cmp(&b.len()).then_with(|| a.cmp(b))
    }
}

impl PartialOrd for Lsn {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 索引中缺失的 LSN 写成空串
mod lsn_serde {
    use super::Lsn;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Lsn>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(value.as_ref().map(Lsn::as_str).unwrap_or(""))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Lsn>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().and_then(Lsn::parse))
    }
}

mod index_time {
    use crate::constants::backup::INDEX_TIME_FORMAT;
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.format(INDEX_TIME_FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_timestamp(&raw).map_err(D::Error::custom)
    }
}

fn default_position() -> u32 {
    1
}

/// 一个备份集（一份备份文件中的一个位置）的描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BackupRecord {
    pub file_name: String,
    #[serde(with = "index_time")]
    pub start: NaiveDateTime,
    #[serde(with = "index_time")]
    pub end: NaiveDateTime,
    #[serde(rename = "Type")]
    pub kind: BackupKind,
    #[serde(rename = "FirstLSN", with = "lsn_serde", default)]
    pub first_lsn: Option<Lsn>,
    /// 差异/日志备份所基于的完整备份
    #[serde(rename = "DatabaseBackupLSN", alias = "BaseLSN", with = "lsn_serde", default)]
    pub base_lsn: Option<Lsn>,
    #[serde(rename = "CheckpointLSN", with = "lsn_serde", default)]
    pub checkpoint_lsn: Option<Lsn>,
    #[serde(rename = "LastLSN", with = "lsn_serde", default)]
    pub last_lsn: Option<Lsn>,
    #[serde(default)]
    pub is_copy_only: bool,
    #[serde(default = "default_position")]
    pub position: u32,
    #[serde(default = "default_position")]
    pub backup_set_count: u32,
}

impl BackupRecord {
    /// 文件中有多个备份集时还原需要 FILE = n
    pub fn needs_position_qualifier(&self) -> bool {
        self.backup_set_count > 1 || self.position > 1
    }

    /// 仅复制备份不属于任何恢复链
    pub fn is_chain_candidate(&self) -> bool {
        !self.is_copy_only
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalFileKind {
    Data,
    Log,
}

/// FILELISTONLY 中的一个逻辑文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalFile {
    pub logical_name: String,
    pub kind: LogicalFileKind,
}

/// 备份目录：负责备份集目录、备份头解析和索引维护
#[derive(Clone)]
pub struct BackupCatalog {
    backup_root: PathBuf,
    engine_root: String,
    blacklist: Vec<String>,
    engine: Arc<dyn Engine>,
    /// 串行化索引文件的读改写
    index_lock: Arc<Mutex<()>>,
}

impl BackupCatalog {
    pub fn new(
        backup_root: impl Into<PathBuf>,
        engine_root: impl Into<String>,
        blacklist: Vec<String>,
        engine: Arc<dyn Engine>,
    ) -> Self {
        Self {
            backup_root: backup_root.into(),
            engine_root: engine_root.into(),
            blacklist,
            engine,
            index_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn from_config(config: &AppConfig, engine: Arc<dyn Engine>) -> Self {
        Self::new(
            config.get_backup_root(),
            config.get_engine_backup_root(),
            config.storage.backup_blacklist.clone(),
            engine,
        )
    }

    pub fn backup_root(&self) -> &Path {
        &self.backup_root
    }

    fn ensure_root(&self) -> Result<()> {
        if !self.backup_root.is_dir() {
            return Err(KeeperError::filesystem(format!(
                "备份根目录不可用: {}",
                self.backup_root.display()
            )));
        }
        Ok(())
    }

    /// 已存在的备份集目录
    pub fn backup_set_dir(&self, backup_set: &str) -> Result<PathBuf> {
        validate_backup_set_name(backup_set)?;
        self.ensure_root()?;

        let dir = self.backup_root.join(backup_set);
        if !dir.is_dir() {
            return Err(KeeperError::filesystem(format!(
                "备份集目录不存在: {}",
                dir.display()
            )));
        }
        Ok(dir)
    }

    /// 备份集目录，不存在时创建
    pub fn ensure_backup_set_dir(&self, backup_set: &str) -> Result<PathBuf> {
        validate_backup_set_name(backup_set)?;
        self.ensure_root()?;

        let dir = self.backup_root.join(backup_set);
        if !dir.exists() {
            std::fs::create_dir_all(&dir)?;
            info!("创建备份集目录: {}", dir.display());
        }
        Ok(dir)
    }

    /// 引擎看到的备份文件路径
    pub fn engine_path(&self, backup_set: &str, file_name: &str) -> String {
        engine::join_server_path(&self.engine_root, &[backup_set, file_name])
    }

    fn is_blacklisted(&self, name: &str) -> bool {
        self.blacklist
            .iter()
            .any(|pattern| !pattern.is_empty() && name.contains(pattern.as_str()))
    }

    /// 列出备份集，跳过黑名单和不合法的目录名
    pub fn list_backup_sets(&self) -> Result<Vec<String>> {
        self.ensure_root()?;

        let mut sets = Vec::new();
        for entry in std::fs::read_dir(&self.backup_root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if self.is_blacklisted(&name) || validate_backup_set_name(&name).is_err() {
                debug!("跳过备份集目录: {}", name);
                continue;
            }
            sets.push(name);
        }

        sets.sort();
        Ok(sets)
    }

    /// 解析一个备份文件的全部备份头。
    ///
    /// 未知类型代码被跳过；单行格式错误只记录警告，全部行都失败时返回第一个解析错误。
    /// 引擎调用失败直接返回。
    pub async fn parse_header(&self, backup_set: &str, file_name: &str) -> Result<Vec<BackupRecord>> {
        let path = self.engine_path(backup_set, file_name);
        let rows = self.engine.query(&sql::header_only(&path)).await?;
        let set_count = u32::try_from(rows.len()).unwrap_or(u32::MAX);

        let mut records = Vec::new();
        let mut first_error = None;
        for row in &rows {
            match header::record_from_row(file_name, row, set_count) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => warn!(
                    "跳过未知备份类型 {} 的备份头: {}",
                    row.get("BackupType").unwrap_or("NULL"),
                    file_name
                ),
                Err(e) => {
                    warn!("备份头解析失败 {}: {}", file_name, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) if records.is_empty() => Err(e),
            _ => Ok(records),
        }
    }

    /// 读取备份文件中的逻辑文件清单
    pub async fn read_file_list(&self, engine_path: &str) -> Result<Vec<LogicalFile>> {
        let rows = self.engine.query(&sql::file_list_only(engine_path)).await?;
        header::logical_files_from_rows(&rows)
    }

    fn index_path(dir: &Path) -> PathBuf {
        dir.join(backup::METADATA_FILE_NAME)
    }

    /// 读取备份集索引；索引尚未建立时返回文件系统错误
    pub async fn load_index(&self, backup_set: &str) -> Result<Vec<BackupRecord>> {
        let dir = self.backup_set_dir(backup_set)?;
        let path = Self::index_path(&dir);
        if !path.exists() {
            return Err(KeeperError::filesystem(format!(
                "元数据索引不存在: {}，请先重建索引",
                path.display()
            )));
        }

        let _guard = self.index_lock.lock().await;
        index::read_index(&path)
    }

    /// 扫描目录中的备份文件及其修改时间
    fn scan_backup_files(dir: &Path) -> Result<Vec<(String, NaiveDateTime)>> {
        let mut files = Vec::new();
        for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let is_backup = entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| {
                    backup::BACKUP_FILE_EXTENSIONS
                        .iter()
                        .any(|known| ext.eq_ignore_ascii_case(known))
                });
            if !is_backup {
                continue;
            }

            let modified = entry.metadata()?.modified()?;
            let modified = DateTime::<Local>::from(modified).naive_local();
            files.push((entry.file_name().to_string_lossy().to_string(), modified));
        }
        files.sort();
        Ok(files)
    }

    /// 重建备份集索引。
    ///
    /// 新文件和修改时间晚于已记录结束时间的文件会重新解析；单个文件失败只记录警告，
    /// 引擎不可用时整体中止且不改动索引。
    pub async fn rebuild_index(&self, backup_set: &str) -> Result<Vec<BackupRecord>> {
        let dir = self.backup_set_dir(backup_set)?;
        let path = Self::index_path(&dir);

        let _guard = self.index_lock.lock().await;
        let files = Self::scan_backup_files(&dir)?;

        let mut records = index::read_index(&path)?;
        let before = records.len();
        records.retain(|r| files.iter().any(|(name, _)| name == &r.file_name));
        if records.len() != before {
            info!("清除 {} 条文件已不存在的索引记录", before - records.len());
        }

        let mut parsed_files = 0;
        for (file_name, modified) in &files {
            let recorded_end = records
                .iter()
                .filter(|r| &r.file_name == file_name)
                .map(|r| r.end)
                .max();
            if recorded_end.is_some_and(|end| *modified <= end) {
                continue;
            }

            match self.parse_header(backup_set, file_name).await {
                Ok(parsed) => {
                    index::upsert(&mut records, file_name, parsed);
                    parsed_files += 1;
                }
                Err(e) if e.is_engine_unavailable() => return Err(e),
                Err(e) => warn!("跳过无法解析的备份文件 {}: {}", file_name, e),
            }
        }

        index::write_index(&path, &mut records)?;
        info!(
            "备份集 {} 索引已更新: 解析 {} 个文件，共 {} 条记录",
            backup_set,
            parsed_files,
            records.len()
        );
        Ok(records)
    }

    /// 把单个新备份文件合并进索引
    pub async fn record_backup(&self, backup_set: &str, file_name: &str) -> Result<Vec<BackupRecord>> {
        let dir = self.backup_set_dir(backup_set)?;
        let path = Self::index_path(&dir);

        let parsed = self.parse_header(backup_set, file_name).await?;
        if parsed.is_empty() {
            return Err(KeeperError::parse(format!("{file_name} 中没有可识别的备份头")));
        }

        let _guard = self.index_lock.lock().await;
        let mut records = index::read_index(&path)?;
        index::upsert(&mut records, file_name, parsed.clone());
        index::write_index(&path, &mut records)?;

        info!("备份 {} 已写入备份集 {} 的索引", file_name, backup_set);
        Ok(parsed)
    }
}
