use sqlkeeper_core::{config::AppConfig, error::Result, service::KeeperService};
use std::path::Path;
use tracing::debug;

use crate::cli::Commands;
use crate::commands;

#[derive(Clone)]
pub struct CliApp {
    pub config: AppConfig,
    pub service: KeeperService,
}

impl CliApp {
    /// 优先使用指定的配置文件，不存在时按默认候选文件名查找
    pub fn new_with_config_path(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            AppConfig::load_from_file(path)?
        } else {
            debug!("配置文件 {} 不存在，尝试默认位置", path.display());
            AppConfig::find_and_load_config()?
        };
        Self::from_config(config)
    }

    pub fn from_config(config: AppConfig) -> Result<Self> {
        let service = KeeperService::from_config(&config)?;
        Ok(Self { config, service })
    }

    /// 运行应用命令
    pub async fn run(&self, command: Commands) -> Result<()> {
        match command {
            Commands::Init { .. } => unreachable!(), // 已经在 main.rs 中处理
            Commands::ListSets => commands::run_list_sets(self),
            Commands::ListDatabases => commands::run_list_databases(self).await,
            Commands::RebuildIndex { set } => commands::run_rebuild_index(self, &set).await,
            Commands::Plan { set, at } => commands::run_plan(self, &set, at).await,
            Commands::Restore {
                set,
                target,
                at,
                keep_on_failure,
            } => {
                let target = target.unwrap_or_else(|| set.clone());
                commands::run_restore(self, &set, &target, at, keep_on_failure).await
            }
            Commands::Backup {
                database,
                skip_index,
            } => commands::run_backup(self, &database, skip_index).await,
            Commands::DropDatabase { name, force } => {
                commands::run_drop_database(self, &name, force).await
            }
        }
    }
}
