use crate::app::CliApp;
use crate::cli::TARGET_TIME_FORMAT;
use crate::commands::wait_for_operation;
use crate::utils::operation_progress_bar;
use chrono::NaiveDateTime;
use sqlkeeper_core::{
    KeeperError,
    error::Result,
    progress::{CancelOutcome, OperationKind, OperationStatus},
};
use tracing::{info, warn};

/// 执行时间点还原并等待结束；Ctrl-C 请求取消
pub async fn run_restore(
    app: &CliApp,
    backup_set: &str,
    target: &str,
    at: Option<NaiveDateTime>,
    keep_on_failure: bool,
) -> Result<()> {
    info!("♻️  还原备份集 {} -> 数据库 {}", backup_set, target);
    match at {
        Some(t) => info!("   目标时间: {}", t.format(TARGET_TIME_FORMAT)),
        None => info!("   目标时间: 最新的完整/差异备份"),
    }

    let operation_id = app.service.start_restore(backup_set, target, at).await?;

    let pb = operation_progress_bar("还原")?;
    let outcome = wait_for_operation(app, OperationKind::Restore, target, operation_id, &pb).await;

    let Some(progress) = outcome else {
        pb.abandon();
        warn!("⚠️  还原记录已被移除，无法获得最终状态");
        return Ok(());
    };

    match progress.status {
        OperationStatus::Completed => {
            pb.finish_with_message("完成");
            info!("✅ 数据库 {} 还原完成 ({} 个步骤)", target, progress.total_items);
            app.service.cancel_operation(OperationKind::Restore, target).await?;
            Ok(())
        }
        status => {
            pb.abandon();
            let message = progress
                .error_message
                .unwrap_or_else(|| "未知错误".to_string());

            if !progress.target_touched {
                info!("💡 还原语句尚未执行，数据库 {} 保持原样", target);
                app.service.cancel_operation(OperationKind::Restore, target).await?;
            } else if keep_on_failure {
                info!("💡 已保留未完成的数据库 {} 以便排查", target);
            } else if app.service.cancel_operation(OperationKind::Restore, target).await?
                == CancelOutcome::RemovedAndDropped
            {
                info!("🗑️  已删除未完成的数据库 {}", target);
            }

            if status == OperationStatus::Cancelled {
                warn!("⏹️  {}", message);
                Ok(())
            } else {
                Err(KeeperError::engine_command(format!(
                    "第 {}/{} 步失败 ({}): {}",
                    progress.completed_items + 1,
                    progress.total_items,
                    progress.current_item,
                    message
                )))
            }
        }
    }
}
