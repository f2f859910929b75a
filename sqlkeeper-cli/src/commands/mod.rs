mod backup;
mod catalog;
mod database;
mod restore;

// Catalog commands
pub use catalog::{run_list_sets, run_plan, run_rebuild_index};

// Database commands
pub use database::{run_drop_database, run_list_databases};

// Operation commands
pub use backup::run_backup;
pub use restore::run_restore;

use crate::app::CliApp;
use crate::utils::render_progress;
use indicatif::ProgressBar;
use sqlkeeper_core::progress::{OperationKind, OperationProgress};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

/// 进度刷新间隔
const PROGRESS_REFRESH_INTERVAL: Duration = Duration::from_millis(500);

/// 等待操作进入终态
///
/// 记录被移除或被同名新操作替换时返回 None。第一次 Ctrl-C 时对还原请求取消，
/// 备份不能中途取消，只给出提示。
pub(crate) async fn wait_for_operation(
    app: &CliApp,
    kind: OperationKind,
    name: &str,
    operation_id: Uuid,
    pb: &ProgressBar,
) -> Option<OperationProgress> {
    let mut ticker = tokio::time::interval(PROGRESS_REFRESH_INTERVAL);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let progress = app
                    .service
                    .get_progress(kind, name)
                    .filter(|p| p.operation_id == operation_id)?;
                render_progress(pb, &progress);
                if progress.status.is_terminal() {
                    return Some(progress);
                }
            }
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                match kind {
                    OperationKind::Restore => {
                        pb.set_message("正在取消...");
                        if let Err(e) = app.service.cancel_operation(kind, name).await {
                            warn!("取消还原 {} 失败: {}", name, e);
                        }
                    }
                    OperationKind::Backup => {
                        pb.println("⚠️  备份无法中途取消，等待引擎完成...");
                    }
                }
            }
        }
    }
}
