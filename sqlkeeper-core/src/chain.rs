//! 恢复链解析
//!
//! 给定备份集的全部记录和可选的目标时间，选出还原所需的最短备份序列：
//! 一个完整备份、可选的差异备份、以及按 LSN 首尾相接的日志备份。
//!
//! 规则：
//! - 只考虑结束时间不晚于目标时间的记录，仅复制备份一律排除；
//! - 差异备份和日志备份必须与选中的完整备份同一谱系 (`DatabaseBackupLSN == full.FirstLSN`)；
//! - 没有目标时间时只返回最新的完整/差异备份，不追加日志；
//! - 日志之间出现 LSN 缺口时直接失败，绝不跳过缺口继续还原。

use crate::catalog::{BackupCatalog, BackupKind, BackupRecord, Lsn};
use crate::error::{ChainError, Result};
use chrono::NaiveDateTime;
use tracing::debug;

fn lsn_text(lsn: &Option<Lsn>) -> String {
    lsn.as_ref().map(Lsn::to_string).unwrap_or_default()
}

fn same_lineage(record: &BackupRecord, full: &BackupRecord) -> bool {
    record.base_lsn.is_some() && record.base_lsn == full.first_lsn
}

/// 解析恢复链，返回顺序为 `[FULL, DIFF?, LOG...]`
pub fn resolve_chain(
    backup_set: &str,
    records: &[BackupRecord],
    target: Option<NaiveDateTime>,
) -> std::result::Result<Vec<BackupRecord>, ChainError> {
    let eligible: Vec<&BackupRecord> = records
        .iter()
        .filter(|r| r.is_chain_candidate())
        .filter(|r| target.is_none_or(|t| r.end <= t))
        .collect();

    // 结束时间相同的完整备份按文件名和位置决出，保证结果确定
    let full = eligible
        .iter()
        .filter(|r| r.kind == BackupKind::Full)
        .max_by(|a, b| (a.end, &a.file_name, a.position).cmp(&(b.end, &b.file_name, b.position)))
        .copied()
        .ok_or_else(|| ChainError::NoBaseBackup {
            backup_set: backup_set.to_string(),
        })?;

    let diff = eligible
        .iter()
        .filter(|r| r.kind == BackupKind::Diff && same_lineage(r, full) && r.end > full.end)
        .max_by(|a, b| (a.end, &a.file_name, a.position).cmp(&(b.end, &b.file_name, b.position)))
        .copied();

    let mut chain = vec![full.clone()];
    if let Some(diff) = diff {
        chain.push(diff.clone());
    }

    let Some(target) = target else {
        debug!("未指定目标时间，恢复链不包含日志备份");
        return Ok(chain);
    };

    let head = diff.unwrap_or(full);
    let Some(head_last) = head.last_lsn.as_ref() else {
        // 没有 LastLSN 的头部无法衔接任何日志
        return Ok(chain);
    };

    // 已被头部包含的日志 (LastLSN <= head.LastLSN) 直接忽略
    let mut logs: Vec<&BackupRecord> = eligible
        .iter()
        .filter(|r| r.kind == BackupKind::Log && same_lineage(r, full))
        .filter(|r| r.first_lsn.is_some() && r.last_lsn.as_ref().is_some_and(|l| l > head_last))
        .copied()
        .collect();
    logs.sort_by(|a, b| {
        (&a.first_lsn, &a.last_lsn, &a.file_name).cmp(&(&b.first_lsn, &b.last_lsn, &b.file_name))
    });

    if logs.is_empty() {
        return Ok(chain);
    }

    let Some(seed_idx) = logs
        .iter()
        .position(|r| r.first_lsn.as_ref().is_some_and(|f| f <= head_last))
    else {
        return Err(ChainError::NoLogCoverage {
            head: head.file_name.clone(),
            last_lsn: head_last.to_string(),
        });
    };

    let mut prev = logs[seed_idx];
    chain.push(prev.clone());

    for log in &logs[seed_idx + 1..] {
        if prev.end >= target {
            break;
        }
        // 同一区间的重复日志
        if log.last_lsn <= prev.last_lsn {
            continue;
        }
        if log.first_lsn != prev.last_lsn {
            return Err(ChainError::BrokenChain {
                file: log.file_name.clone(),
                first_lsn: lsn_text(&log.first_lsn),
                previous: prev.file_name.clone(),
                last_lsn: lsn_text(&prev.last_lsn),
            });
        }
        chain.push((*log).clone());
        prev = *log;
    }

    debug!(
        "备份集 {} 恢复链: {:?}",
        backup_set,
        chain.iter().map(|r| r.file_name.as_str()).collect::<Vec<_>>()
    );
    Ok(chain)
}

/// 从备份目录读取索引并解析恢复链
#[derive(Clone)]
pub struct ChainResolver {
    catalog: BackupCatalog,
}

impl ChainResolver {
    pub fn new(catalog: BackupCatalog) -> Self {
        Self { catalog }
    }

    pub async fn resolve(
        &self,
        backup_set: &str,
        target: Option<NaiveDateTime>,
    ) -> Result<Vec<BackupRecord>> {
        let records = self.catalog.load_index(backup_set).await?;
        Ok(resolve_chain(backup_set, &records, target)?)
    }
}
