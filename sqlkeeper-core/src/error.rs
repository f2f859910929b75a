use thiserror::Error;

pub type Result<T> = std::result::Result<T, KeeperError>;

#[derive(Error, Debug)]
pub enum KeeperError {
    #[error("参数校验失败: {0}")]
    Validation(String),

    #[error("恢复链解析失败: {0}")]
    Chain(#[from] ChainError),

    #[error("数据库引擎错误: {0}")]
    Engine(#[from] EngineError),

    #[error("文件系统错误: {0}")]
    Filesystem(String),

    #[error("并发操作错误: {0}")]
    Concurrency(String),

    #[error("备份头解析失败: {0}")]
    Parse(String),

    #[error("配置错误: {0}")]
    Config(#[from] toml::de::Error),

    #[error("配置文件未找到")]
    ConfigNotFound,

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("任务执行错误: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("目录遍历错误: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("进度条模板错误: {0}")]
    Template(String),
}

/// 恢复链解析错误，全部发生在触碰目标数据库之前
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("备份集 {backup_set} 中没有可用的完整备份")]
    NoBaseBackup { backup_set: String },

    #[error(
        "日志链断裂: {file} (FirstLSN={first_lsn}) 无法衔接上一个备份 {previous} (LastLSN={last_lsn})"
    )]
    BrokenChain {
        file: String,
        first_lsn: String,
        previous: String,
        last_lsn: String,
    },

    #[error("没有日志备份能够从 {head} (LastLSN={last_lsn}) 继续覆盖到目标时间")]
    NoLogCoverage { head: String, last_lsn: String },
}

/// 引擎错误；Unavailable 表示连接层面的失败，Command 保留引擎返回的原始信息
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("无法连接数据库引擎: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Command(String),
}

#[cfg(feature = "indicatif")]
impl From<indicatif::style::TemplateError> for KeeperError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        KeeperError::Template(err.to_string())
    }
}

impl KeeperError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn filesystem(msg: impl Into<String>) -> Self {
        Self::Filesystem(msg.into())
    }

    pub fn concurrency(msg: impl Into<String>) -> Self {
        Self::Concurrency(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// 引擎拒绝执行某条语句
    pub fn engine_command(msg: impl Into<String>) -> Self {
        Self::Engine(EngineError::Command(msg.into()))
    }

    pub fn engine_unavailable(msg: impl Into<String>) -> Self {
        Self::Engine(EngineError::Unavailable(msg.into()))
    }

    /// 连接层面的失败，重建索引时遇到它需要整体中止
    pub fn is_engine_unavailable(&self) -> bool {
        matches!(self, Self::Engine(EngineError::Unavailable(_)))
    }

    /// 写入进度记录的错误文本：引擎命令错误原样保留
    pub fn progress_message(&self) -> String {
        match self {
            Self::Engine(EngineError::Command(msg)) => msg.clone(),
            other => other.to_string(),
        }
    }
}
