//! RESTORE HEADERONLY / FILELISTONLY 结果行到备份记录的映射

use super::{BackupKind, BackupRecord, LogicalFile, LogicalFileKind, Lsn};
use crate::engine::Row;
use crate::error::{KeeperError, Result};
use chrono::NaiveDateTime;
use tracing::debug;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// 解析引擎或索引中的时间，接受 `T`/空格分隔，小数秒被截断
pub(crate) fn parse_timestamp(raw: &str) -> Result<NaiveDateTime> {
    let normalized = raw.trim().replacen('T', " ", 1);
    let whole_seconds = normalized
        .split_once('.')
        .map(|(head, _)| head)
        .unwrap_or(&normalized);

    NaiveDateTime::parse_from_str(whole_seconds, TIMESTAMP_FORMAT)
        .map_err(|e| KeeperError::parse(format!("无法解析时间 '{raw}': {e}")))
}

fn required<'a>(row: &'a Row, column: &str) -> Result<&'a str> {
    row.get(column)
        .ok_or_else(|| KeeperError::parse(format!("缺少列 {column}")))
}

fn parse_flag(raw: Option<&str>) -> bool {
    matches!(
        raw.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("1") | Some("true")
    )
}

/// 映射一行备份头；类型代码不是完整/差异/日志时返回 None
pub(crate) fn record_from_row(
    file_name: &str,
    row: &Row,
    backup_set_count: u32,
) -> Result<Option<BackupRecord>> {
    let type_code = required(row, "BackupType")?;
    let type_code: i64 = type_code
        .trim()
        .parse()
        .map_err(|_| KeeperError::parse(format!("无效的 BackupType: '{type_code}'")))?;
    let Some(kind) = BackupKind::from_type_code(type_code) else {
        return Ok(None);
    };

    let end = parse_timestamp(required(row, "BackupFinishDate")?)?;
    let start = match row.get("BackupStartDate") {
        Some(raw) => parse_timestamp(raw)?,
        None => end,
    };

    let position = match row.get("Position") {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| KeeperError::parse(format!("无效的 Position: '{raw}'")))?,
        None => 1,
    };

    Ok(Some(BackupRecord {
        file_name: file_name.to_string(),
        start,
        end,
        kind,
        first_lsn: row.get("FirstLSN").and_then(Lsn::parse),
        base_lsn: row.get("DatabaseBackupLSN").and_then(Lsn::parse),
        checkpoint_lsn: row.get("CheckpointLSN").and_then(Lsn::parse),
        last_lsn: row.get("LastLSN").and_then(Lsn::parse),
        is_copy_only: parse_flag(row.get("IsCopyOnly")),
        position,
        backup_set_count: backup_set_count.max(1),
    }))
}

/// FILELISTONLY 的 Type 列：D 为数据文件，L 为日志文件；FILESTREAM(S)、全文目录(F) 等不做重定位
pub(crate) fn logical_files_from_rows(rows: &[Row]) -> Result<Vec<LogicalFile>> {
    let mut files = Vec::with_capacity(rows.len());
    for row in rows {
        let logical_name = required(row, "LogicalName")?;
        let kind = match required(row, "Type")?.trim() {
            "D" => LogicalFileKind::Data,
            "L" => LogicalFileKind::Log,
            other => {
                debug!("跳过类型为 {} 的逻辑文件 {}", other, logical_name);
                continue;
            }
        };
        files.push(LogicalFile {
            logical_name: logical_name.to_string(),
            kind,
        });
    }

    if files.is_empty() {
        return Err(KeeperError::parse("FILELISTONLY 没有返回任何数据或日志文件"));
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn header_row(code: &str) -> Row {
        Row::new()
            .with("BackupType", Some(code))
            .with("DatabaseName", Some("Sales"))
            .with("BackupStartDate", Some("2024-03-01 01:59:58.000"))
            .with("BackupFinishDate", Some("2024-03-01 02:00:05.997"))
            .with("Position", Some("1"))
            .with("FirstLSN", Some("00000000042000000001"))
            .with("LastLSN", Some("42000000009"))
            .with("CheckpointLSN", None)
            .with("DatabaseBackupLSN", None)
            .with("IsCopyOnly", Some("0"))
    }

    #[test]
    fn test_timestamp_precision_variants() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(2, 0, 5)
            .unwrap();

        assert_eq!(parse_timestamp("2024-03-01 02:00:05").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-03-01 02:00:05.997").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-03-01T02:00:05").unwrap(), expected);
        assert!(matches!(
            parse_timestamp("yesterday"),
            Err(KeeperError::Parse(_))
        ));
    }

    #[test]
    fn test_known_type_codes_map_to_kinds() {
        let full = record_from_row("a.bak", &header_row("1"), 1).unwrap().unwrap();
        assert_eq!(full.kind, BackupKind::Full);
        assert_eq!(full.first_lsn, Lsn::parse("42000000001"));
        assert_eq!(full.base_lsn, None);
        assert_eq!(full.checkpoint_lsn, None);
        assert!(!full.is_copy_only);
        assert_eq!(full.start.to_string(), "2024-03-01 01:59:58");

        let diff = record_from_row("a.diff", &header_row("5"), 1).unwrap().unwrap();
        assert_eq!(diff.kind, BackupKind::Diff);

        let log = record_from_row("a.trn", &header_row("2"), 1).unwrap().unwrap();
        assert_eq!(log.kind, BackupKind::Log);
    }

    #[test]
    fn test_unknown_type_code_is_skipped() {
        // 4 = 文件/文件组备份
        assert!(record_from_row("a.bak", &header_row("4"), 1).unwrap().is_none());
    }

    #[test]
    fn test_malformed_row_is_parse_error() {
        let row = header_row("1").with("BackupFinishDate", None);
        assert!(matches!(
            record_from_row("a.bak", &row, 1),
            Err(KeeperError::Parse(_))
        ));

        let row = header_row("full");
        assert!(matches!(
            record_from_row("a.bak", &row, 1),
            Err(KeeperError::Parse(_))
        ));
    }

    #[test]
    fn test_logical_files() {
        let rows = vec![
            Row::new().with("LogicalName", Some("Sales")).with("Type", Some("D")),
            Row::new().with("LogicalName", Some("Sales_log")).with("Type", Some("L")),
        ];
        let files = logical_files_from_rows(&rows).unwrap();
        assert_eq!(files[0].kind, LogicalFileKind::Data);
        assert_eq!(files[1].kind, LogicalFileKind::Log);

        assert!(logical_files_from_rows(&[]).is_err());
    }

    #[test]
    fn test_filestream_and_fulltext_files_are_skipped() {
        let rows = vec![
            Row::new().with("LogicalName", Some("Sales")).with("Type", Some("D")),
            Row::new().with("LogicalName", Some("Sales_fs")).with("Type", Some("S")),
            Row::new().with("LogicalName", Some("Sales_ft")).with("Type", Some("F")),
            Row::new().with("LogicalName", Some("Sales_log")).with("Type", Some("L")),
        ];
        let files = logical_files_from_rows(&rows).unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.logical_name.as_str()).collect();
        assert_eq!(names, vec!["Sales", "Sales_log"]);

        let only_filestream = vec![Row::new().with("LogicalName", Some("Sales_fs")).with("Type", Some("S"))];
        assert!(logical_files_from_rows(&only_filestream).is_err());
    }
}
