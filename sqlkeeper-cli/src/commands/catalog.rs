use crate::app::CliApp;
use crate::cli::TARGET_TIME_FORMAT;
use chrono::NaiveDateTime;
use sqlkeeper_core::{catalog::BackupRecord, error::Result};
use tracing::info;

/// 一条备份记录的单行展示
pub(crate) fn format_record(record: &BackupRecord) -> String {
    let mut line = format!(
        "{:<4} {}  ~  {}  {}",
        record.kind.label(),
        record.start.format(TARGET_TIME_FORMAT),
        record.end.format(TARGET_TIME_FORMAT),
        record.file_name
    );
    if record.needs_position_qualifier() {
        line.push_str(&format!(" (FILE = {})", record.position));
    }
    if record.is_copy_only {
        line.push_str(" [仅复制]");
    }
    line
}

/// 列出备份集
pub fn run_list_sets(app: &CliApp) -> Result<()> {
    let sets = app.service.list_backup_sets()?;
    info!(
        "📁 备份根目录: {}",
        app.config.get_backup_root().display()
    );

    if sets.is_empty() {
        info!("📭 没有找到备份集");
        return Ok(());
    }

    info!("📋 共 {} 个备份集:", sets.len());
    for set in &sets {
        info!("   - {}", set);
    }
    Ok(())
}

/// 重建备份集索引
pub async fn run_rebuild_index(app: &CliApp, backup_set: &str) -> Result<()> {
    info!("🔍 扫描备份集 {} ...", backup_set);
    let records = app.service.rebuild_index(backup_set).await?;

    info!("✅ 索引已重建，共 {} 条备份记录", records.len());
    for record in &records {
        info!("   {}", format_record(record));
    }
    Ok(())
}

/// 显示恢复链
pub async fn run_plan(app: &CliApp, backup_set: &str, at: Option<NaiveDateTime>) -> Result<()> {
    let chain = app.service.plan_restore(backup_set, at).await?;

    match at {
        Some(target) => info!(
            "🧭 恢复到 {} 需要 {} 个步骤:",
            target.format(TARGET_TIME_FORMAT),
            chain.len()
        ),
        None => info!("🧭 恢复到最新的完整/差异备份需要 {} 个步骤:", chain.len()),
    }
    for (i, record) in chain.iter().enumerate() {
        info!("   {}. {}", i + 1, format_record(record));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::{ScriptedEngine, app_with_engine};
    use chrono::NaiveDate;
    use sqlkeeper_core::catalog::{BackupKind, Lsn};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn record(kind: BackupKind, position: u32, count: u32) -> BackupRecord {
        let at = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(2, 0, 0)
            .unwrap();
        BackupRecord {
            file_name: "Sales_full.bak".to_string(),
            start: at,
            end: at,
            kind,
            first_lsn: Lsn::parse("100"),
            base_lsn: None,
            checkpoint_lsn: None,
            last_lsn: Lsn::parse("200"),
            is_copy_only: false,
            position,
            backup_set_count: count,
        }
    }

    #[test]
    fn test_format_record() {
        assert_eq!(
            format_record(&record(BackupKind::Full, 1, 1)),
            "FULL 2024-01-01 02:00:00  ~  2024-01-01 02:00:00  Sales_full.bak"
        );
        assert!(format_record(&record(BackupKind::Log, 2, 2)).ends_with("(FILE = 2)"));
    }

    #[test]
    fn test_list_sets() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("Sales")).unwrap();
        let app = app_with_engine(dir.path(), Arc::new(ScriptedEngine::default()));

        assert!(run_list_sets(&app).is_ok());
    }

    #[tokio::test]
    async fn test_plan_without_index_fails() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("Sales")).unwrap();
        let app = app_with_engine(dir.path(), Arc::new(ScriptedEngine::default()));

        assert!(run_plan(&app, "Sales", None).await.is_err());
    }
}
