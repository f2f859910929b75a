//! 对外的操作入口
//!
//! 不同数据库名的操作完全并行。对同一个名称并发发起备份和还原属于调用方错误，这里不做互斥。

use crate::backup::{BackupExecutor, BackupOptions};
use crate::catalog::{BackupCatalog, BackupRecord};
use crate::chain::ChainResolver;
use crate::config::AppConfig;
use crate::engine::{self, Engine, SqlCmdEngine, sql};
use crate::error::{KeeperError, Result};
use crate::progress::{CancelOutcome, OperationKind, OperationProgress, ProgressRegistry};
use crate::restore::{RestoreExecutor, RestoreRequest};
use crate::validation::{validate_backup_set_name, validate_database_name};
use chrono::NaiveDateTime;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseState {
    Online,
    Restoring,
    Offline,
    Error,
    BackingUp,
}

impl DatabaseState {
    /// sys.databases.state_desc
    pub fn from_state_desc(state: &str) -> Self {
        match state.trim().to_ascii_uppercase().as_str() {
            "ONLINE" => Self::Online,
            "RESTORING" | "RECOVERING" => Self::Restoring,
            "OFFLINE" => Self::Offline,
            _ => Self::Error,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Restoring => "restoring",
            Self::Offline => "offline",
            Self::Error => "error",
            Self::BackingUp => "backing_up",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatabaseInfo {
    pub name: String,
    pub state: DatabaseState,
}

#[derive(Clone)]
pub struct KeeperService {
    engine: Arc<dyn Engine>,
    catalog: BackupCatalog,
    resolver: ChainResolver,
    registry: ProgressRegistry,
    restore: RestoreExecutor,
    backup: BackupExecutor,
}

impl KeeperService {
    /// 使用 sqlcmd 连接配置中的服务器
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let engine = Arc::new(SqlCmdEngine::from_config(&config.mssql)?);
        Ok(Self::new(config, engine, ProgressRegistry::new()))
    }

    pub fn new(config: &AppConfig, engine: Arc<dyn Engine>, registry: ProgressRegistry) -> Self {
        let catalog = BackupCatalog::from_config(config, engine.clone());
        let restore = RestoreExecutor::new(
            engine.clone(),
            catalog.clone(),
            registry.restores().clone(),
            config.mssql.restore_path.clone(),
        );
        let backup = BackupExecutor::new(
            engine.clone(),
            catalog.clone(),
            registry.backups().clone(),
            config.timing.clone(),
        );

        Self {
            engine,
            resolver: ChainResolver::new(catalog.clone()),
            catalog,
            registry,
            restore,
            backup,
        }
    }

    pub fn registry(&self) -> &ProgressRegistry {
        &self.registry
    }

    pub async fn start_restore(
        &self,
        backup_set: &str,
        target_database: &str,
        target_time: Option<NaiveDateTime>,
    ) -> Result<Uuid> {
        self.restore
            .start_restore(RestoreRequest {
                backup_set: backup_set.to_string(),
                target_database: target_database.to_string(),
                target_time,
            })
            .await
    }

    pub async fn start_backup(&self, database: &str) -> Result<Uuid> {
        self.backup.start_backup(database, BackupOptions::default()).await
    }

    pub async fn start_backup_with_options(
        &self,
        database: &str,
        options: BackupOptions,
    ) -> Result<Uuid> {
        self.backup.start_backup(database, options).await
    }

    pub fn get_progress(&self, kind: OperationKind, name: &str) -> Option<OperationProgress> {
        self.registry.get(kind, name)
    }

    /// 还原：进行中则请求取消，已结束则清理；备份：只能确认已结束的记录
    pub async fn cancel_operation(&self, kind: OperationKind, name: &str) -> Result<CancelOutcome> {
        match kind {
            OperationKind::Restore => self.restore.cancel(name).await,
            OperationKind::Backup => self.backup.acknowledge(name),
        }
    }

    /// 只解析恢复链，不执行
    pub async fn plan_restore(
        &self,
        backup_set: &str,
        target_time: Option<NaiveDateTime>,
    ) -> Result<Vec<BackupRecord>> {
        validate_backup_set_name(backup_set)?;
        self.resolver.resolve(backup_set, target_time).await
    }

    pub fn list_backup_sets(&self) -> Result<Vec<String>> {
        self.catalog.list_backup_sets()
    }

    pub async fn rebuild_index(&self, backup_set: &str) -> Result<Vec<BackupRecord>> {
        self.catalog.rebuild_index(backup_set).await
    }

    /// 把新备份登记进索引；以关闭后台更新的选项启动备份时由调用方等待
    pub async fn update_backup_catalog(&self, database: &str, file_name: &str) -> Result<()> {
        self.backup.update_catalog(database, file_name).await
    }

    /// 用户数据库及其状态；本进程正在还原或备份的库以登记表中的状态为准
    pub async fn list_databases(&self) -> Result<Vec<DatabaseInfo>> {
        let rows = self.engine.query(&sql::list_user_databases()).await?;

        let mut databases = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(name) = row.get("name") else {
                continue;
            };
            let mut state = DatabaseState::from_state_desc(row.get("state_desc").unwrap_or(""));

            let active = |kind| {
                self.registry
                    .get(kind, name)
                    .is_some_and(|p| p.status.is_active())
            };
            if active(OperationKind::Restore) {
                state = DatabaseState::Restoring;
            }
            if active(OperationKind::Backup) {
                state = DatabaseState::BackingUp;
            }

            databases.push(DatabaseInfo {
                name: name.to_string(),
                state,
            });
        }
        Ok(databases)
    }

    /// 删除数据库；有进行中的操作时拒绝
    pub async fn drop_database(&self, name: &str) -> Result<()> {
        validate_database_name(name)?;
        for kind in [OperationKind::Restore, OperationKind::Backup] {
            if self
                .registry
                .get(kind, name)
                .is_some_and(|p| p.status.is_active())
            {
                return Err(KeeperError::concurrency(format!(
                    "数据库 {name} 有进行中的操作，不能删除"
                )));
            }
        }

        if !engine::drop_database(self.engine.as_ref(), name).await? {
            return Err(KeeperError::validation(format!("数据库 {name} 不存在")));
        }
        info!("数据库 {} 已删除", name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{BackupKind, Lsn};
    use crate::constants::backup;
    use crate::engine::Row;
    use crate::progress::OperationStatus;
    use crate::testing::FakeEngine;
    use chrono::NaiveDate;
    use std::time::Duration;
    use tempfile::tempdir;

    fn at(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn record(file_name: &str, kind: BackupKind, hour: u32, base: Option<&str>, first: &str, last: &str) -> BackupRecord {
        BackupRecord {
            file_name: file_name.to_string(),
            start: at(hour),
            end: at(hour),
            kind,
            first_lsn: Lsn::parse(first),
            base_lsn: base.and_then(Lsn::parse),
            checkpoint_lsn: None,
            last_lsn: Lsn::parse(last),
            is_copy_only: false,
            position: 1,
            backup_set_count: 1,
        }
    }

    fn service() -> (tempfile::TempDir, Arc<FakeEngine>, KeeperService) {
        let root = tempdir().unwrap();
        let dir = root.path().join("Sales");
        std::fs::create_dir(&dir).unwrap();

        let records = vec![
            record("full.bak", BackupKind::Full, 0, None, "100", "110"),
            record("diff.diff", BackupKind::Diff, 1, Some("100"), "110", "130"),
            record("log1.trn", BackupKind::Log, 2, Some("100"), "130", "140"),
        ];
        std::fs::write(
            dir.join(backup::METADATA_FILE_NAME),
            serde_json::to_string_pretty(&records).unwrap(),
        )
        .unwrap();

        let mut config = AppConfig::default();
        config.storage.backup_root = root.path().to_path_buf();
        config.storage.engine_backup_root = Some("/srv/backups".to_string());
        config.timing = crate::config::TimingConfig::immediate();

        let engine = Arc::new(FakeEngine::new());
        engine.respond(
            "FILELISTONLY",
            vec![
                Row::new().with("LogicalName", Some("Sales")).with("Type", Some("D")),
                Row::new().with("LogicalName", Some("Sales_log")).with("Type", Some("L")),
            ],
        );
        let service = KeeperService::new(&config, engine.clone(), ProgressRegistry::new());
        (root, engine, service)
    }

    async fn wait_terminal(service: &KeeperService, kind: OperationKind, name: &str) -> OperationProgress {
        for _ in 0..200 {
            if let Some(p) = service.get_progress(kind, name) {
                if p.status.is_terminal() {
                    return p;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("操作 {name} 未在预期时间内结束");
    }

    #[tokio::test]
    async fn test_plan_restore_reads_index() {
        let (_root, _engine, service) = service();
        let plan = service.plan_restore("Sales", Some(at(2))).await.unwrap();
        let names: Vec<_> = plan.iter().map(|r| r.file_name.as_str()).collect();
        assert_eq!(names, vec!["full.bak", "diff.diff", "log1.trn"]);
    }

    #[tokio::test]
    async fn test_restore_end_to_end_then_acknowledge() {
        let (_root, engine, service) = service();

        service
            .start_restore("Sales", "SalesCopy", Some(at(2)))
            .await
            .unwrap();
        let progress = wait_terminal(&service, OperationKind::Restore, "SalesCopy").await;

        assert_eq!(progress.status, OperationStatus::Completed);
        assert_eq!(progress.total_items, 3);
        assert_eq!(
            engine.count("FROM DISK = N'/srv/backups/Sales/full.bak'"),
            2,
            "FILELISTONLY 与第一步还原都读取完整备份"
        );
        assert!(engine.count("MOVE N'Sales' TO N'/var/opt/mssql/data/SalesCopy.mdf'") == 1);

        assert_eq!(
            service
                .cancel_operation(OperationKind::Restore, "SalesCopy")
                .await
                .unwrap(),
            CancelOutcome::Removed
        );
        assert!(service.get_progress(OperationKind::Restore, "SalesCopy").is_none());
    }

    #[tokio::test]
    async fn test_restore_chain_error_is_synchronous() {
        let (_root, engine, service) = service();
        let err = service
            .start_restore("Sales", "SalesCopy", Some(at(0) - chrono::Duration::hours(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, KeeperError::Chain(_)));
        assert!(engine.statements().is_empty());
    }

    #[tokio::test]
    async fn test_list_databases_overrides_state_from_registry() {
        let (_root, engine, service) = service();
        engine.respond(
            "state_desc",
            vec![
                Row::new().with("name", Some("HR")).with("state_desc", Some("ONLINE")),
                Row::new().with("name", Some("Sales")).with("state_desc", Some("ONLINE")),
                Row::new().with("name", Some("Old")).with("state_desc", Some("SUSPECT")),
                Row::new().with("name", Some("Copy")).with("state_desc", Some("RESTORING")),
            ],
        );
        service
            .registry()
            .backups()
            .set("Sales", OperationProgress::pending("x.bak", 1, None));

        let databases = service.list_databases().await.unwrap();
        let states: Vec<_> = databases.iter().map(|d| (d.name.as_str(), d.state)).collect();
        assert_eq!(
            states,
            vec![
                ("HR", DatabaseState::Online),
                ("Sales", DatabaseState::BackingUp),
                ("Old", DatabaseState::Error),
                ("Copy", DatabaseState::Restoring),
            ]
        );
    }

    #[tokio::test]
    async fn test_drop_database_refuses_active_operation() {
        let (_root, engine, service) = service();
        service
            .registry()
            .restores()
            .set("Sales", OperationProgress::pending("初始化...", 1, None));

        assert!(matches!(
            service.drop_database("Sales").await,
            Err(KeeperError::Concurrency(_))
        ));

        assert!(matches!(
            service.drop_database("Missing").await,
            Err(KeeperError::Validation(_))
        ));

        engine.respond(
            "FROM sys.databases WHERE name",
            vec![Row::new().with("name", Some("HR"))],
        );
        service.drop_database("HR").await.unwrap();
        assert_eq!(engine.count("DROP DATABASE [HR]"), 1);
    }
}
