use sqlkeeper_core::{config::AppConfig, constants::config, error::Result};
use std::path::Path;
use tracing::{info, warn};

/// 写入默认配置文件；已存在且未指定 force 时不做任何修改
pub fn run_init(config_path: &Path, force: bool) -> Result<()> {
    info!("🗄️  SQL Keeper 初始化");
    info!("======================");

    if config_path.exists() && !force {
        warn!("⚠️  检测到已存在的配置文件: {}", config_path.display());
        info!("如果您要重新初始化，请使用 --force 参数");
        info!("示例: sqlkeeper init --force");
        return Ok(());
    }

    let app_config = AppConfig::default();
    app_config.save_to_file(config_path)?;
    info!("   ✅ 创建配置文件: {}", config_path.display());

    let backup_root = app_config.get_backup_root();
    if !backup_root.is_dir() {
        warn!(
            "   ⚠️  备份根目录 {} 不存在，请挂载备份共享后修改 [storage] backup_root",
            backup_root.display()
        );
    }

    info!("🎉 初始化完成！");
    info!("");
    info!("📝 接下来的步骤:");
    info!(
        "   1️⃣  编辑 {} 填写 [mssql] 连接信息，密码也可通过环境变量 {} 提供",
        config_path.display(),
        config::PASSWORD_ENV
    );
    info!("   2️⃣  运行 'sqlkeeper list-sets' 查看备份集");
    info!("   3️⃣  运行 'sqlkeeper rebuild-index <备份集>' 建立索引");
    info!("   4️⃣  运行 'sqlkeeper restore <备份集> --at \"YYYY-MM-DD HH:MM:SS\"' 还原");

    Ok(())
}
