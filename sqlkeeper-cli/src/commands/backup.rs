use crate::app::CliApp;
use crate::commands::wait_for_operation;
use crate::utils::operation_progress_bar;
use sqlkeeper_core::{
    KeeperError,
    backup::BackupOptions,
    error::Result,
    progress::{OperationKind, OperationStatus},
};
use tracing::{info, warn};

/// 完整备份一个数据库，等待结束后把新文件登记进同名备份集的索引
pub async fn run_backup(app: &CliApp, database: &str, skip_index: bool) -> Result<()> {
    info!("💾 备份数据库 {}", database);

    // 进程退出后后台任务随之结束，索引更新放在前台完成
    let options = BackupOptions {
        background_catalog_update: false,
    };
    let operation_id = app
        .service
        .start_backup_with_options(database, options)
        .await?;

    let pb = operation_progress_bar("备份")?;
    let outcome = wait_for_operation(app, OperationKind::Backup, database, operation_id, &pb).await;

    let Some(progress) = outcome else {
        pb.abandon();
        warn!("⚠️  备份记录已被移除，无法获得最终状态");
        return Ok(());
    };

    // 终态记录只用于展示，读完即确认
    app.service
        .cancel_operation(OperationKind::Backup, database)
        .await?;

    if progress.status != OperationStatus::Completed {
        pb.abandon();
        return Err(KeeperError::engine_command(
            progress
                .error_message
                .unwrap_or_else(|| "未知错误".to_string()),
        ));
    }

    pb.finish_with_message("完成");
    info!(
        "✅ 备份完成: {}",
        progress
            .backup_file_path
            .as_deref()
            .unwrap_or(&progress.current_item)
    );

    if skip_index {
        info!("💡 已跳过索引更新，稍后可运行 'sqlkeeper rebuild-index {}'", database);
        return Ok(());
    }

    info!("📝 更新备份集 {} 的索引...", database);
    match app
        .service
        .update_backup_catalog(database, &progress.current_item)
        .await
    {
        Ok(()) => info!("✅ 索引已更新"),
        Err(e) => {
            warn!("⚠️  索引更新失败: {}", e);
            info!("💡 请稍后运行 'sqlkeeper rebuild-index {}'", database);
        }
    }
    Ok(())
}
