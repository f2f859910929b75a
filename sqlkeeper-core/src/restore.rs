//! 还原执行器
//!
//! 状态机: pending -> in_progress -> {completed, failed, cancelled}。
//! 取消只在步骤之间检查；执行器本身不清理半还原的数据库，清理由显式的取消请求完成。

use crate::catalog::{BackupCatalog, BackupKind, BackupRecord, LogicalFile, LogicalFileKind};
use crate::chain::ChainResolver;
use crate::constants::relocation;
use crate::engine::sql::{self, FileMove, RestoreOptions};
use crate::engine::{self, Engine};
use crate::error::{KeeperError, Result};
use crate::progress::{CancelOutcome, OperationProgress, OperationStatus, ProgressStore};
use crate::validation::{validate_backup_set_name, validate_database_name};
use chrono::NaiveDateTime;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreRequest {
    pub backup_set: String,
    pub target_database: String,
    /// 缺省表示还原到最新的完整/差异备份
    pub target_time: Option<NaiveDateTime>,
}

/// 目标库的物理文件布局
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocationPlan {
    pub moves: Vec<FileMove>,
}

impl RelocationPlan {
    /// 第一个数据文件 `{db}.mdf`，其余 `{db}_{n}.ndf`；第一个日志文件 `{db}_log.ldf`，其余 `{db}_log{n}.ldf`
    pub fn for_database(database: &str, restore_path: &str, files: &[LogicalFile]) -> Self {
        let mut data_count = 0;
        let mut log_count = 0;

        let moves = files
            .iter()
            .map(|file| {
                let physical_name = match file.kind {
                    LogicalFileKind::Data => {
                        data_count += 1;
                        if data_count == 1 {
                            format!("{database}.{}", relocation::DATA_EXTENSION)
                        } else {
                            format!(
                                "{database}_{}.{}",
                                data_count - 1,
                                relocation::SECONDARY_DATA_EXTENSION
                            )
                        }
                    }
                    LogicalFileKind::Log => {
                        log_count += 1;
                        if log_count == 1 {
                            format!("{database}_log.{}", relocation::LOG_EXTENSION)
                        } else {
                            format!("{database}_log{}.{}", log_count - 1, relocation::LOG_EXTENSION)
                        }
                    }
                };

                FileMove {
                    logical_name: file.logical_name.clone(),
                    physical_path: engine::join_server_path(restore_path, &[physical_name.as_str()]),
                }
            })
            .collect();

        Self { moves }
    }
}

/// 生成链中第 index 步的还原语句
fn restore_statement(
    database: &str,
    disk_path: &str,
    record: &BackupRecord,
    index: usize,
    total: usize,
    plan: &RelocationPlan,
) -> String {
    let first = index == 0;
    let options = RestoreOptions {
        moves: if first { plan.moves.clone() } else { Vec::new() },
        replace: first,
        position: record.needs_position_qualifier().then_some(record.position),
        recovery: index + 1 == total,
    };

    match record.kind {
        BackupKind::Log => sql::restore_log(database, disk_path, &options),
        BackupKind::Full | BackupKind::Diff => sql::restore_database(database, disk_path, &options),
    }
}

#[derive(Clone)]
pub struct RestoreExecutor {
    engine: Arc<dyn Engine>,
    catalog: BackupCatalog,
    resolver: ChainResolver,
    progress: Arc<dyn ProgressStore>,
    restore_path: String,
}

impl RestoreExecutor {
    pub fn new(
        engine: Arc<dyn Engine>,
        catalog: BackupCatalog,
        progress: Arc<dyn ProgressStore>,
        restore_path: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            resolver: ChainResolver::new(catalog.clone()),
            catalog,
            progress,
            restore_path: restore_path.into(),
        }
    }

    /// 同步完成校验与恢复链解析，随后在后台任务中执行还原。
    ///
    /// 任何校验或解析失败都在触碰目标库之前返回。
    pub async fn start_restore(&self, request: RestoreRequest) -> Result<Uuid> {
        validate_backup_set_name(&request.backup_set)?;
        validate_database_name(&request.target_database)?;

        let chain = self
            .resolver
            .resolve(&request.backup_set, request.target_time)
            .await?;
        info!(
            "开始还原 {} -> {}，恢复链共 {} 个备份",
            request.backup_set,
            request.target_database,
            chain.len()
        );

        let database = request.target_database.clone();
        if engine::database_exists(self.engine.as_ref(), &database).await? {
            engine::set_single_user(self.engine.as_ref(), &database).await?;
        }

        let token = CancellationToken::new();
        let progress = OperationProgress::pending("初始化...", chain.len(), Some(token.clone()));
        let operation_id = progress.operation_id;
        self.progress.set(&database, progress);

        let executor = self.clone();
        tokio::spawn(async move {
            executor.run_restore(request, chain, operation_id, token).await;
        });

        Ok(operation_id)
    }

    fn update(&self, database: &str, operation_id: Uuid, mut apply: impl FnMut(&mut OperationProgress)) {
        if !self.progress.update(database, operation_id, &mut apply) {
            debug!("还原记录 {} 已被移除或替换，忽略进度更新", database);
        }
    }

    /// 执行整条恢复链并写入终态
    pub(crate) async fn run_restore(
        &self,
        request: RestoreRequest,
        chain: Vec<BackupRecord>,
        operation_id: Uuid,
        token: CancellationToken,
    ) -> OperationStatus {
        let database = request.target_database.as_str();
        self.update(database, operation_id, |p| {
            p.status = OperationStatus::InProgress
        });

        let mut touched = false;
        let outcome = self
            .apply_chain(&request, &chain, operation_id, &token, &mut touched)
            .await;
        let (status, message) = match outcome {
            Ok(false) => {
                warn!("还原 {} 已取消", database);
                (OperationStatus::Cancelled, Some("还原已被用户取消".to_string()))
            }
            Ok(true) => match self.finalize(database).await {
                Ok(()) => {
                    info!("数据库 {} 还原完成", database);
                    (OperationStatus::Completed, None)
                }
                Err(e) => {
                    error!("数据库 {} 数据已还原，但收尾失败: {}", database, e);
                    (OperationStatus::Failed, Some(e.progress_message()))
                }
            },
            Err(e) => {
                error!("还原 {} 失败: {}", database, e);
                (OperationStatus::Failed, Some(e.progress_message()))
            }
        };

        if status != OperationStatus::Completed && !touched {
            self.release_untouched(database).await;
        }

        self.update(database, operation_id, |p| p.finish(status, message.clone()));
        status
    }

    /// 还原语句发出前就结束：目标库内容未变，只撤销启动时的单用户模式
    async fn release_untouched(&self, database: &str) {
        match engine::database_exists(self.engine.as_ref(), database).await {
            Ok(true) => {
                if let Err(e) = engine::set_multi_user(self.engine.as_ref(), database).await {
                    warn!("恢复数据库 {} 的多用户模式失败: {}", database, e);
                }
            }
            Ok(false) => {}
            Err(e) => warn!("检查数据库 {} 是否存在失败: {}", database, e),
        }
    }

    /// 依次还原链中每个备份；返回 false 表示在步骤边界检测到取消
    async fn apply_chain(
        &self,
        request: &RestoreRequest,
        chain: &[BackupRecord],
        operation_id: Uuid,
        token: &CancellationToken,
        touched: &mut bool,
    ) -> Result<bool> {
        let database = request.target_database.as_str();
        let Some(first) = chain.first() else {
            return Err(KeeperError::validation("恢复链为空"));
        };

        let first_path = self.catalog.engine_path(&request.backup_set, &first.file_name);
        let files = self.catalog.read_file_list(&first_path).await?;
        let plan = RelocationPlan::for_database(database, &self.restore_path, &files);
        debug!("文件重定位: {:?}", plan.moves);

        let total = chain.len();
        for (index, record) in chain.iter().enumerate() {
            if token.is_cancelled() {
                self.update(database, operation_id, |p| p.set_completed(index));
                return Ok(false);
            }

            *touched = true;
            self.update(database, operation_id, |p| {
                p.begin_step(index, record.file_name.clone());
                p.target_touched = true;
            });

            let disk_path = self.catalog.engine_path(&request.backup_set, &record.file_name);
            let statement = restore_statement(database, &disk_path, record, index, total, &plan);
            debug!("还原步骤 {}/{}: {}", index + 1, total, statement);

            self.engine.execute(&statement).await?;
            info!("还原步骤 {}/{} 完成: {}", index + 1, total, record.file_name);
        }

        Ok(true)
    }

    /// 数据还原后切换到简单恢复模式和多用户模式，任一失败都视为整体失败
    async fn finalize(&self, database: &str) -> Result<()> {
        self.engine
            .execute(&sql::set_recovery_simple(database))
            .await
            .map_err(|e| KeeperError::engine_command(format!("切换简单恢复模式失败: {}", e.progress_message())))?;

        engine::set_multi_user(self.engine.as_ref(), database)
            .await
            .map_err(|e| KeeperError::engine_command(format!("切换多用户模式失败: {}", e.progress_message())))?;

        Ok(())
    }

    /// 取消或确认一次还原。
    ///
    /// 进行中：触发取消句柄。失败或已取消：删除半还原的目标库并移除记录，
    /// 但从未发出过还原语句时目标库保持原样。已完成：只移除记录。
    pub async fn cancel(&self, database: &str) -> Result<CancelOutcome> {
        let Some(entry) = self.progress.get(database) else {
            return Err(KeeperError::concurrency(format!(
                "数据库 {database} 没有还原操作"
            )));
        };

        if entry.status.is_active() {
            let Some(token) = entry.cancel_handle else {
                return Err(KeeperError::concurrency(format!(
                    "数据库 {database} 的还原没有可用的取消句柄"
                )));
            };
            token.cancel();
            info!("已请求取消数据库 {} 的还原", database);
            return Ok(CancelOutcome::CancelRequested);
        }

        if entry.status == OperationStatus::Completed {
            self.progress.remove(database);
            return Ok(CancelOutcome::Removed);
        }

        if !entry.target_touched {
            self.progress.remove(database);
            info!("数据库 {} 未执行过还原语句，保留原库", database);
            return Ok(CancelOutcome::Removed);
        }

        let dropped = engine::drop_database(self.engine.as_ref(), database).await?;
        self.progress.remove(database);
        if dropped {
            info!("已删除未完成还原的数据库 {}", database);
            Ok(CancelOutcome::RemovedAndDropped)
        } else {
            Ok(CancelOutcome::Removed)
        }
    }
}
