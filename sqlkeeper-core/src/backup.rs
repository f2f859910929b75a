use crate::catalog::BackupCatalog;
use crate::config::TimingConfig;
use crate::constants::backup;
use crate::engine::{self, Engine, sql};
use crate::error::{KeeperError, Result};
use crate::progress::{CancelOutcome, OperationProgress, OperationStatus, ProgressStore};
use crate::validation::validate_database_name;
use chrono::{Local, NaiveDateTime};
use std::sync::Arc;
use tokio::time::{Instant, interval_at, sleep};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 备份文件名: `{db}_{YYYYMMDD_HHMMSS}.bak`
pub fn backup_file_name(database: &str, at: NaiveDateTime) -> String {
    format!(
        "{database}_{}.{}",
        at.format(backup::FILE_TIMESTAMP_FORMAT),
        backup::FULL_BACKUP_EXTENSION
    )
}

/// 备份选项
#[derive(Debug, Clone)]
pub struct BackupOptions {
    /// 备份成功后由后台任务把新文件写入索引；调用方自行调用 `update_catalog` 时关闭
    pub background_catalog_update: bool,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            background_catalog_update: true,
        }
    }
}

/// 完整备份执行器。备份写入与数据库同名的备份集目录
#[derive(Clone)]
pub struct BackupExecutor {
    engine: Arc<dyn Engine>,
    catalog: BackupCatalog,
    progress: Arc<dyn ProgressStore>,
    timing: TimingConfig,
}

impl BackupExecutor {
    pub fn new(
        engine: Arc<dyn Engine>,
        catalog: BackupCatalog,
        progress: Arc<dyn ProgressStore>,
        timing: TimingConfig,
    ) -> Self {
        Self {
            engine,
            catalog,
            progress,
            timing,
        }
    }

    /// 切换单用户模式后在后台执行备份；切换失败时整个操作中止
    pub async fn start_backup(&self, database: &str, options: BackupOptions) -> Result<Uuid> {
        validate_database_name(database)?;
        self.catalog.ensure_backup_set_dir(database)?;

        engine::set_single_user(self.engine.as_ref(), database)
            .await
            .map_err(|e| {
                error!("备份前切换数据库 {} 到单用户模式失败: {}", database, e);
                e
            })?;

        let file_name = backup_file_name(database, Local::now().naive_local());
        let engine_path = self.catalog.engine_path(database, &file_name);

        let mut progress = OperationProgress::pending(file_name.clone(), 1, None);
        progress.backup_file_path = Some(engine_path.clone());
        let operation_id = progress.operation_id;
        self.progress.set(database, progress);
        info!("开始备份数据库 {} -> {}", database, engine_path);

        let executor = self.clone();
        let database = database.to_string();
        tokio::spawn(async move {
            executor
                .run_backup(&database, &file_name, &engine_path, operation_id, &options)
                .await;
        });

        Ok(operation_id)
    }

    fn update(&self, database: &str, operation_id: Uuid, mut apply: impl FnMut(&mut OperationProgress)) {
        if !self.progress.update(database, operation_id, &mut apply) {
            debug!("备份记录 {} 已被移除或替换，忽略进度更新", database);
        }
    }

    pub(crate) async fn run_backup(
        &self,
        database: &str,
        file_name: &str,
        engine_path: &str,
        operation_id: Uuid,
        options: &BackupOptions,
    ) -> OperationStatus {
        self.update(database, operation_id, |p| p.begin_step(0, file_name));

        let result = self.perform_backup(database, engine_path, operation_id).await;

        // 无论成败都尝试恢复多用户模式，失败只记录
        if let Err(e) = engine::set_multi_user(self.engine.as_ref(), database).await {
            warn!("备份后恢复数据库 {} 的多用户模式失败: {}", database, e);
        }

        let status = match &result {
            Ok(()) => {
                info!("数据库 {} 备份完成: {}", database, file_name);
                OperationStatus::Completed
            }
            Err(e) => {
                error!("数据库 {} 备份失败: {}", database, e);
                OperationStatus::Failed
            }
        };
        let message = result.as_ref().err().map(KeeperError::progress_message);
        self.update(database, operation_id, |p| p.finish(status, message.clone()));

        if result.is_ok() && options.background_catalog_update {
            let executor = self.clone();
            let database = database.to_string();
            let file_name = file_name.to_string();
            tokio::spawn(async move {
                let _ = executor.update_catalog(&database, &file_name).await;
            });
        }

        status
    }

    /// 执行备份语句，同时按固定间隔查询引擎中的完成百分比
    async fn perform_backup(&self, database: &str, engine_path: &str, operation_id: Uuid) -> Result<()> {
        let statement = sql::backup_database(database, engine_path);
        debug!("执行备份: {}", statement);

        let backup = self.engine.execute(&statement);
        tokio::pin!(backup);

        let first_poll = Instant::now() + self.timing.backup_poll_delay();
        let mut ticker = interval_at(first_poll, self.timing.backup_poll_interval());

        loop {
            tokio::select! {
                result = &mut backup => return result,
                _ = ticker.tick() => self.poll_progress(database, operation_id).await,
            }
        }
    }

    /// 查询一次备份进度；查不到对应请求时不做任何判断
    async fn poll_progress(&self, database: &str, operation_id: Uuid) {
        let rows = match self.engine.query(&sql::active_requests("BACKUP")).await {
            Ok(rows) => rows,
            Err(e) => {
                debug!("查询备份进度失败: {}", e);
                return;
            }
        };

        let marker = format!("DATABASE {}", sql::quote_ident(database));
        let Some(row) = rows
            .iter()
            .find(|r| r.get("text").is_some_and(|text| text.contains(&marker)))
        else {
            debug!("未在活动请求中找到数据库 {} 的备份", database);
            return;
        };

        let percent = row
            .get("percent_complete")
            .and_then(|v| v.trim().parse::<f64>().ok());
        let session_id = row
            .get("session_id")
            .and_then(|v| v.trim().parse::<i64>().ok());

        self.update(database, operation_id, |p| {
            if let Some(percent) = percent {
                // 100 只在确认完成后写入
                p.percentage = percent.clamp(0.0, 99.0) as u8;
            }
            if session_id.is_some() {
                p.session_id = session_id;
            }
        });
    }

    /// 把新备份写入索引；刚写完的文件可能暂时无法读取备份头，固定间隔重试
    pub async fn update_catalog(&self, database: &str, file_name: &str) -> Result<()> {
        sleep(self.timing.metadata_initial_delay()).await;

        let attempts = self.timing.metadata_max_retries.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.catalog.record_backup(database, file_name).await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    warn!(
                        "更新备份集 {} 索引失败 (第 {}/{} 次): {}",
                        database, attempt, attempts, e
                    );
                    last_error = Some(e);
                    if attempt < attempts {
                        sleep(self.timing.metadata_retry_delay()).await;
                    }
                }
            }
        }

        error!("放弃更新备份集 {} 的索引: {}", database, file_name);
        Err(last_error.unwrap_or_else(|| KeeperError::parse("索引更新失败")))
    }

    /// 确认已结束的备份记录；运行中的备份不能取消
    pub fn acknowledge(&self, database: &str) -> Result<CancelOutcome> {
        let Some(entry) = self.progress.get(database) else {
            return Err(KeeperError::concurrency(format!(
                "数据库 {database} 没有备份操作"
            )));
        };
        if entry.status.is_active() {
            return Err(KeeperError::concurrency(format!(
                "数据库 {database} 的备份正在进行，无法取消"
            )));
        }

        self.progress.remove(database);
        Ok(CancelOutcome::Removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Row;
    use crate::error::EngineError;
    use crate::progress::InMemoryProgressStore;
    use crate::testing::FakeEngine;
    use chrono::NaiveDate;
    use std::time::Duration;
    use tempfile::tempdir;

    struct Fixture {
        root: tempfile::TempDir,
        engine: Arc<FakeEngine>,
        store: Arc<InMemoryProgressStore>,
        executor: BackupExecutor,
    }

    fn fixture() -> Fixture {
        let root = tempdir().unwrap();
        let engine = Arc::new(FakeEngine::new());
        let store = Arc::new(InMemoryProgressStore::new());
        let catalog = BackupCatalog::new(root.path(), "/srv/backups", Vec::new(), engine.clone());
        let executor = BackupExecutor::new(engine.clone(), catalog, store.clone(), TimingConfig::immediate());
        Fixture {
            root,
            engine,
            store,
            executor,
        }
    }

    fn register(fx: &Fixture, database: &str) -> Uuid {
        let progress = OperationProgress::pending("Sales_20240101_000000.bak", 1, None);
        let id = progress.operation_id;
        fx.store.set(database, progress);
        id
    }

    #[test]
    fn test_backup_file_name() {
        let at = NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(14, 5, 7)
            .unwrap();
        assert_eq!(backup_file_name("Sales", at), "Sales_20240309_140507.bak");
    }

    #[tokio::test]
    async fn test_single_user_failure_aborts_backup() {
        let fx = fixture();
        fx.engine.fail_on(
            "SET SINGLE_USER",
            1,
            EngineError::Command("Msg 5064: Changes to the state of database 'Sales' cannot be made".into()),
        );

        let result = fx.executor.start_backup("Sales", BackupOptions::default()).await;
        assert!(matches!(result, Err(KeeperError::Engine(_))));
        assert_eq!(fx.engine.count("BACKUP DATABASE"), 0);
        assert!(fx.store.get("Sales").is_none());
    }

    #[tokio::test]
    async fn test_successful_backup_polls_and_restores_multi_user() {
        let fx = fixture();
        fx.engine.delay_on("BACKUP DATABASE [Sales]", Duration::from_millis(1500));
        fx.engine.respond(
            "sys.dm_exec_requests",
            vec![
                Row::new()
                    .with("session_id", Some("61"))
                    .with("percent_complete", Some("12.5"))
                    .with("text", Some("BACKUP DATABASE [Other] TO DISK = N'/x'")),
                Row::new()
                    .with("session_id", Some("57"))
                    .with("percent_complete", Some("42.7"))
                    .with("text", Some("SET NOCOUNT ON; BACKUP DATABASE [Sales] TO DISK = N'/srv/backups/Sales/x.bak'")),
            ],
        );
        let id = register(&fx, "Sales");

        let status = fx
            .executor
            .run_backup("Sales", "x.bak", "/srv/backups/Sales/x.bak", id, &BackupOptions::default())
            .await;

        assert_eq!(status, OperationStatus::Completed);
        assert!(fx.engine.count("sys.dm_exec_requests") >= 1);
        assert_eq!(fx.engine.count("SET MULTI_USER"), 1);

        let progress = fx.store.get("Sales").unwrap();
        assert_eq!(progress.status, OperationStatus::Completed);
        assert_eq!(progress.percentage, 100);
        assert_eq!(progress.session_id, Some(57));
    }

    /// 引擎仍在备份时查不到对应请求，只能说明这次查询没有结论
    async fn assert_unmatched_poll_keeps_in_progress(fx: &Fixture) {
        fx.engine.delay_on("BACKUP DATABASE [Sales]", Duration::from_millis(1500));
        let id = register(fx, "Sales");

        let opts = BackupOptions::default();
        let run = fx.executor.run_backup(
            "Sales",
            "x.bak",
            "/srv/backups/Sales/x.bak",
            id,
            &opts,
        );
        let mid_flight = async {
            tokio::time::sleep(Duration::from_millis(400)).await;
            (fx.engine.count("sys.dm_exec_requests"), fx.store.get("Sales").unwrap())
        };
        let (status, (polls, mid)) = tokio::join!(run, mid_flight);

        assert!(polls >= 1);
        assert_eq!(mid.status, OperationStatus::InProgress);
        assert_eq!(mid.percentage, 0);
        assert!(mid.session_id.is_none());
        assert!(mid.end_time.is_none());

        assert_eq!(status, OperationStatus::Completed);
        let done = fx.store.get("Sales").unwrap();
        assert_eq!(done.status, OperationStatus::Completed);
        assert_eq!(done.percentage, 100);
    }

    #[tokio::test]
    async fn test_poll_without_matching_request_is_not_completion() {
        let fx = fixture();
        fx.engine.respond(
            "sys.dm_exec_requests",
            vec![
                Row::new()
                    .with("session_id", Some("61"))
                    .with("percent_complete", Some("80"))
                    .with("text", Some("BACKUP DATABASE [Other] TO DISK = N'/x'")),
            ],
        );
        assert_unmatched_poll_keeps_in_progress(&fx).await;
    }

    #[tokio::test]
    async fn test_empty_poll_is_not_completion() {
        let fx = fixture();
        assert_unmatched_poll_keeps_in_progress(&fx).await;
    }

    #[tokio::test]
    async fn test_background_catalog_update_can_be_disabled() {
        let fx = fixture();
        std::fs::create_dir(fx.root.path().join("Sales")).unwrap();
        fx.engine.respond(
            "HEADERONLY",
            vec![
                Row::new()
                    .with("BackupType", Some("1"))
                    .with("BackupFinishDate", Some("2024-01-01 00:00:05"))
                    .with("FirstLSN", Some("100"))
                    .with("LastLSN", Some("110")),
            ],
        );

        let id = register(&fx, "Sales");
        let manual = BackupOptions {
            background_catalog_update: false,
        };
        let status = fx
            .executor
            .run_backup("Sales", "x.bak", "/srv/backups/Sales/x.bak", id, &manual)
            .await;
        assert_eq!(status, OperationStatus::Completed);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fx.engine.count("HEADERONLY"), 0);

        let id = register(&fx, "Sales");
        fx.executor
            .run_backup("Sales", "x.bak", "/srv/backups/Sales/x.bak", id, &BackupOptions::default())
            .await;
        for _ in 0..50 {
            if fx.engine.count("HEADERONLY") > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(fx.engine.count("HEADERONLY"), 1);
    }

    #[tokio::test]
    async fn test_failed_backup_still_restores_multi_user() {
        let fx = fixture();
        let message = "Msg 3201, Level 16: Cannot open backup device '/srv/backups/Sales/x.bak'.";
        fx.engine
            .fail_on("BACKUP DATABASE", 1, EngineError::Command(message.into()));
        let id = register(&fx, "Sales");

        let status = fx
            .executor
            .run_backup("Sales", "x.bak", "/srv/backups/Sales/x.bak", id, &BackupOptions::default())
            .await;

        assert_eq!(status, OperationStatus::Failed);
        assert_eq!(fx.engine.count("SET MULTI_USER"), 1);
        let progress = fx.store.get("Sales").unwrap();
        assert_eq!(progress.error_message.as_deref(), Some(message));
    }

    #[tokio::test]
    async fn test_multi_user_failure_is_not_fatal() {
        let fx = fixture();
        fx.engine
            .fail_on("SET MULTI_USER", 1, EngineError::Command("Msg 5070".into()));
        let id = register(&fx, "Sales");

        let status = fx
            .executor
            .run_backup("Sales", "x.bak", "/srv/backups/Sales/x.bak", id, &BackupOptions::default())
            .await;
        assert_eq!(status, OperationStatus::Completed);
    }

    #[tokio::test]
    async fn test_update_catalog_retries_until_header_readable() {
        let fx = fixture();
        std::fs::create_dir(fx.root.path().join("Sales")).unwrap();
        fx.engine.fail_on(
            "HEADERONLY",
            1,
            EngineError::Command("The volume on device is empty.".into()),
        );
        fx.engine.respond(
            "HEADERONLY",
            vec![
                Row::new()
                    .with("BackupType", Some("1"))
                    .with("BackupFinishDate", Some("2024-01-01 00:00:05"))
                    .with("FirstLSN", Some("100"))
                    .with("LastLSN", Some("110")),
            ],
        );

        fx.executor
            .update_catalog("Sales", "Sales_20240101_000000.bak")
            .await
            .unwrap();
        assert_eq!(fx.engine.count("HEADERONLY"), 2);
        assert!(fx.root.path().join("Sales").join(backup::METADATA_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn test_update_catalog_gives_up_after_max_retries() {
        let fx = fixture();
        std::fs::create_dir(fx.root.path().join("Sales")).unwrap();
        for nth in 1..=3 {
            fx.engine
                .fail_on("HEADERONLY", nth, EngineError::Command("not ready".into()));
        }

        let result = fx.executor.update_catalog("Sales", "x.bak").await;
        assert!(result.is_err());
        assert_eq!(fx.engine.count("HEADERONLY"), 3);
    }

    #[tokio::test]
    async fn test_acknowledge_only_terminal_backups() {
        let fx = fixture();
        assert!(matches!(
            fx.executor.acknowledge("Sales"),
            Err(KeeperError::Concurrency(_))
        ));

        register(&fx, "Sales");
        assert!(matches!(
            fx.executor.acknowledge("Sales"),
            Err(KeeperError::Concurrency(_))
        ));

        let mut done = OperationProgress::pending("x.bak", 1, None);
        done.finish(OperationStatus::Completed, None);
        fx.store.set("Sales", done);
        assert_eq!(fx.executor.acknowledge("Sales").unwrap(), CancelOutcome::Removed);
        assert!(fx.store.get("Sales").is_none());
    }
}
