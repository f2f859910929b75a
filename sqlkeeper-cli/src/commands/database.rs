use crate::app::CliApp;
use sqlkeeper_core::error::Result;
use tracing::{info, warn};

/// 列出用户数据库
pub async fn run_list_databases(app: &CliApp) -> Result<()> {
    let databases = app.service.list_databases().await?;
    if databases.is_empty() {
        info!("📭 服务器上没有用户数据库");
        return Ok(());
    }

    info!("🗄️  共 {} 个用户数据库:", databases.len());
    for db in &databases {
        info!("   {:<40} {}", db.name, db.state.label());
    }
    Ok(())
}

/// 删除数据库，必须显式确认
pub async fn run_drop_database(app: &CliApp, name: &str, force: bool) -> Result<()> {
    if !force {
        warn!("⚠️  删除数据库 {} 不可恢复", name);
        info!("确认删除请使用 --force 参数");
        info!("示例: sqlkeeper drop-database {} --force", name);
        return Ok(());
    }

    app.service.drop_database(name).await?;
    info!("🗑️  数据库 {} 已删除", name);
    Ok(())
}
