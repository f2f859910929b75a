use chrono::NaiveDateTime;
use clap::{Parser, Subcommand};
use sqlkeeper_core::constants::config;
use std::path::PathBuf;

/// 目标时间的命令行格式
pub const TARGET_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// 解析 `--at` 参数，同时接受 `2024-01-01 12:00:00` 与 `2024-01-01T12:00:00`
pub fn parse_target_time(value: &str) -> Result<NaiveDateTime, String> {
    let normalized = value.trim().replacen('T', " ", 1);
    NaiveDateTime::parse_from_str(&normalized, TARGET_TIME_FORMAT)
        .map_err(|e| format!("无效的时间 '{value}'，格式应为 YYYY-MM-DD HH:MM:SS: {e}"))
}

#[derive(Parser)]
#[command(name = "sqlkeeper")]
#[command(about = "SQL Server 备份集管理与时间点恢复工具")]
#[command(version)]
pub struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = config::DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// 详细输出
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 创建默认配置文件
    Init {
        /// 如果配置文件已存在，强制覆盖
        #[arg(long)]
        force: bool,
    },
    /// 列出备份根目录下的备份集
    ListSets,
    /// 列出服务器上的用户数据库及状态
    ListDatabases,
    /// 扫描备份集目录并重建索引
    RebuildIndex {
        /// 备份集名称
        set: String,
    },
    /// 显示恢复到指定时间需要的备份文件，不执行还原
    Plan {
        /// 备份集名称
        set: String,
        /// 目标时间，省略时只用完整备份和差异备份
        #[arg(long, value_parser = parse_target_time, help = "目标时间，例如 '2024-01-01 12:00:00'")]
        at: Option<NaiveDateTime>,
    },
    /// 把备份集还原到指定时间
    Restore {
        /// 备份集名称
        set: String,
        /// 还原后的数据库名，默认与备份集同名
        #[arg(long)]
        target: Option<String>,
        /// 目标时间，省略时只用完整备份和差异备份
        #[arg(long, value_parser = parse_target_time, help = "目标时间，例如 '2024-01-01 12:00:00'")]
        at: Option<NaiveDateTime>,
        /// 失败或取消后保留未完成的数据库，便于排查
        #[arg(long)]
        keep_on_failure: bool,
    },
    /// 对数据库做一次完整备份，写入同名备份集
    Backup {
        /// 数据库名称
        database: String,
        /// 备份完成后不等待索引更新
        #[arg(long)]
        skip_index: bool,
    },
    /// 删除数据库
    DropDatabase {
        /// 数据库名称
        name: String,
        /// 确认删除
        #[arg(long)]
        force: bool,
    },
}
