//! 备份集目录下的 JSON 元数据索引

use super::BackupRecord;
use crate::error::Result;
use std::fs;
use std::path::Path;
use tracing::warn;

/// 读取索引；文件不存在时返回空列表，无法识别的条目记录警告后跳过
pub(crate) fn read_index(path: &Path) -> Result<Vec<BackupRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }

    let entries: Vec<serde_json::Value> = serde_json::from_str(&content)?;
    let mut records = Vec::with_capacity(entries.len());
    for entry in entries {
        match serde_json::from_value::<BackupRecord>(entry) {
            Ok(record) => records.push(record),
            Err(e) => warn!("跳过无法识别的索引条目 ({}): {}", path.display(), e),
        }
    }
    Ok(records)
}

/// 按时间排序后写入；先写临时文件再重命名，读者不会看到写了一半的索引
pub(crate) fn write_index(path: &Path, records: &mut [BackupRecord]) -> Result<()> {
    sort_records(records);

    let content = serde_json::to_string_pretty(records)?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, content)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

pub(crate) fn sort_records(records: &mut [BackupRecord]) {
    records.sort_by(|a, b| {
        (a.start, a.end, &a.file_name, a.position).cmp(&(b.start, b.end, &b.file_name, b.position))
    });
}

/// 以文件名为键合并：同一文件的旧记录整体被新记录替换
pub(crate) fn upsert(records: &mut Vec<BackupRecord>, file_name: &str, parsed: Vec<BackupRecord>) {
    records.retain(|r| r.file_name != file_name);
    records.extend(parsed);
}
