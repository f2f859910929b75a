use crate::constants::{config, timing};
use crate::error::{KeeperError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use toml;

/// 应用配置结构
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AppConfig {
    pub mssql: MssqlConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub timing: TimingConfig,
}

/// SQL Server 连接配置
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MssqlConfig {
    pub server: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// 服务器上存放恢复后数据文件的目录
    pub restore_path: String,
    /// sqlcmd 可执行文件路径，缺省时从 PATH 中查找
    #[serde(default)]
    pub sqlcmd_path: Option<String>,
    #[serde(default)]
    pub trust_server_certificate: bool,
    #[serde(default = "default_login_timeout")]
    pub login_timeout_secs: u64,
}

/// 备份存储配置
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StorageConfig {
    /// 本机看到的备份根目录，每个备份集一个子目录
    pub backup_root: PathBuf,
    /// 数据库引擎看到的同一目录；引擎与本工具不在同一主机时配置
    #[serde(default)]
    pub engine_backup_root: Option<String>,
    /// 名称包含其中任一子串的备份集不会被列出
    #[serde(default)]
    pub backup_blacklist: Vec<String>,
}

/// 轮询与重试配置
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TimingConfig {
    pub backup_poll_delay_secs: u64,
    pub backup_poll_interval_secs: u64,
    pub metadata_initial_delay_secs: u64,
    pub metadata_retry_delay_secs: u64,
    pub metadata_max_retries: u32,
}

/// 生成带引号与转义的 TOML 字符串字面量
fn toml_str(value: &str) -> String {
    toml::Value::String(value.to_string()).to_string()
}

fn default_port() -> u16 {
    config::DEFAULT_MSSQL_PORT
}

fn default_login_timeout() -> u64 {
    config::DEFAULT_LOGIN_TIMEOUT_SECS
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            backup_poll_delay_secs: timing::DEFAULT_BACKUP_POLL_DELAY_SECS,
            backup_poll_interval_secs: timing::DEFAULT_BACKUP_POLL_INTERVAL_SECS,
            metadata_initial_delay_secs: timing::DEFAULT_METADATA_INITIAL_DELAY_SECS,
            metadata_retry_delay_secs: timing::DEFAULT_METADATA_RETRY_DELAY_SECS,
            metadata_max_retries: timing::DEFAULT_METADATA_MAX_RETRIES,
        }
    }
}

impl TimingConfig {
    /// 测试中使用，除轮询周期外不做任何等待
    pub fn immediate() -> Self {
        Self {
            backup_poll_delay_secs: 0,
            backup_poll_interval_secs: 1,
            metadata_initial_delay_secs: 0,
            metadata_retry_delay_secs: 0,
            metadata_max_retries: timing::DEFAULT_METADATA_MAX_RETRIES,
        }
    }

    pub fn backup_poll_delay(&self) -> Duration {
        Duration::from_secs(self.backup_poll_delay_secs)
    }

    pub fn backup_poll_interval(&self) -> Duration {
        // interval 不接受零周期
        Duration::from_secs(self.backup_poll_interval_secs.max(1))
    }

    pub fn metadata_initial_delay(&self) -> Duration {
        Duration::from_secs(self.metadata_initial_delay_secs)
    }

    pub fn metadata_retry_delay(&self) -> Duration {
        Duration::from_secs(self.metadata_retry_delay_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mssql: MssqlConfig {
                server: "127.0.0.1".to_string(),
                port: config::DEFAULT_MSSQL_PORT,
                user: "sa".to_string(),
                password: String::new(),
                restore_path: config::DEFAULT_RESTORE_PATH.to_string(),
                sqlcmd_path: None,
                trust_server_certificate: true,
                login_timeout_secs: config::DEFAULT_LOGIN_TIMEOUT_SECS,
            },
            storage: StorageConfig {
                backup_root: PathBuf::from(config::DEFAULT_BACKUP_ROOT),
                engine_backup_root: None,
                backup_blacklist: Vec::new(),
            },
            timing: TimingConfig::default(),
        }
    }
}

impl AppConfig {
    /// 智能查找并加载配置文件
    /// 按优先级查找：config.toml -> sqlkeeper.toml -> .sqlkeeper.toml
    pub fn find_and_load_config() -> Result<Self> {
        for config_file in config::CONFIG_FILE_CANDIDATES {
            if Path::new(config_file).exists() {
                tracing::info!("找到配置文件: {}", config_file);
                return Self::load_from_file(config_file);
            }
        }

        Err(KeeperError::ConfigNotFound)
    }

    /// 从指定文件加载配置，环境变量中的密码优先
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        if !path.as_ref().exists() {
            return Err(KeeperError::ConfigNotFound);
        }

        let content = fs::read_to_string(&path)?;
        let mut config: AppConfig = toml::from_str(&content)?;

        if let Ok(password) = std::env::var(config::PASSWORD_ENV) {
            config.mssql.password = password;
        }

        Ok(config)
    }

    /// 保存配置到文件
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = self.to_toml_with_comments();
        fs::write(&path, content)?;
        Ok(())
    }

    /// 生成带注释的TOML配置
    fn to_toml_with_comments(&self) -> String {
        const TEMPLATE: &str = include_str!("../templates/config.toml.template");

        // 黑名单是数组，交给 toml 负责转义
        let blacklist = toml::Value::Array(
            self.storage
                .backup_blacklist
                .iter()
                .map(|s| toml::Value::String(s.clone()))
                .collect(),
        )
        .to_string();

        TEMPLATE
            .replace("{server}", &toml_str(&self.mssql.server))
            .replace("{port}", &self.mssql.port.to_string())
            .replace("{user}", &toml_str(&self.mssql.user))
            .replace("{password}", &toml_str(&self.mssql.password))
            .replace("{restore_path}", &toml_str(&self.mssql.restore_path))
            .replace(
                "{trust_server_certificate}",
                &self.mssql.trust_server_certificate.to_string(),
            )
            .replace(
                "{login_timeout_secs}",
                &self.mssql.login_timeout_secs.to_string(),
            )
            .replace(
                "{backup_root}",
                &toml_str(&self.storage.backup_root.to_string_lossy()),
            )
            .replace("{backup_blacklist}", &blacklist)
            .replace(
                "{backup_poll_delay_secs}",
                &self.timing.backup_poll_delay_secs.to_string(),
            )
            .replace(
                "{backup_poll_interval_secs}",
                &self.timing.backup_poll_interval_secs.to_string(),
            )
            .replace(
                "{metadata_initial_delay_secs}",
                &self.timing.metadata_initial_delay_secs.to_string(),
            )
            .replace(
                "{metadata_retry_delay_secs}",
                &self.timing.metadata_retry_delay_secs.to_string(),
            )
            .replace(
                "{metadata_max_retries}",
                &self.timing.metadata_max_retries.to_string(),
            )
    }

    /// 获取备份根目录
    pub fn get_backup_root(&self) -> &Path {
        &self.storage.backup_root
    }

    /// 引擎侧的备份根目录
    pub fn get_engine_backup_root(&self) -> String {
        self.storage
            .engine_backup_root
            .clone()
            .unwrap_or_else(|| self.storage.backup_root.to_string_lossy().to_string())
    }
}
