/// 备份文件与索引相关常量
pub mod backup {
    /// 每个备份集目录下的元数据索引文件名
    pub const METADATA_FILE_NAME: &str = "backup_metadata.json";

    /// 参与索引的备份文件扩展名（不区分大小写）
    pub const BACKUP_FILE_EXTENSIONS: &[&str] = &["bak", "diff", "trn"];

    /// 新建完整备份使用的扩展名
    pub const FULL_BACKUP_EXTENSION: &str = "bak";

    /// 备份文件名中的时间戳格式：{db}_{YYYYMMDD_HHMMSS}
    pub const FILE_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

    /// 索引文件中的时间格式
    pub const INDEX_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
}

/// 引擎备份类型代码 (RESTORE HEADERONLY 的 BackupType 列)
pub mod backup_type {
    pub const DATABASE: i64 = 1;
    pub const TRANSACTION_LOG: i64 = 2;
    pub const DATABASE_DIFFERENTIAL: i64 = 5;
}

/// 物理文件重定位相关常量
pub mod relocation {
    pub const DATA_EXTENSION: &str = "mdf";
    pub const SECONDARY_DATA_EXTENSION: &str = "ndf";
    pub const LOG_EXTENSION: &str = "ldf";
}

/// sqlcmd 客户端相关常量
pub mod sqlcmd {
    /// 客户端可执行文件名
    pub const BINARY_NAME: &str = "sqlcmd";

    /// 通过环境变量传递密码，避免出现在进程参数中
    pub const PASSWORD_ENV: &str = "SQLCMDPASSWORD";

    /// 结果集列分隔符
    pub const COLUMN_SEPARATOR: &str = "|";

    /// 输出宽度，防止长行被折断
    pub const SCREEN_WIDTH: &str = "65535";

    /// 结果集中的空值
    pub const NULL_LITERAL: &str = "NULL";
}

/// 定时相关默认值
pub mod timing {
    /// 首次查询备份进度前的等待秒数
    pub const DEFAULT_BACKUP_POLL_DELAY_SECS: u64 = 2;

    /// 备份进度轮询间隔秒数
    pub const DEFAULT_BACKUP_POLL_INTERVAL_SECS: u64 = 2;

    /// 备份完成后首次更新元数据前的等待秒数
    pub const DEFAULT_METADATA_INITIAL_DELAY_SECS: u64 = 5;

    /// 元数据更新重试间隔秒数
    pub const DEFAULT_METADATA_RETRY_DELAY_SECS: u64 = 3;

    /// 元数据更新最大尝试次数
    pub const DEFAULT_METADATA_MAX_RETRIES: u32 = 3;
}

/// 配置文件相关常量
pub mod config {
    /// 按优先级查找的配置文件名
    pub const CONFIG_FILE_CANDIDATES: &[&str] = &["config.toml", "sqlkeeper.toml", ".sqlkeeper.toml"];

    /// 默认配置文件名
    pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

    /// 覆盖配置中密码的环境变量
    pub const PASSWORD_ENV: &str = "SQLKEEPER_MSSQL_PASSWORD";

    /// 默认 SQL Server 端口
    pub const DEFAULT_MSSQL_PORT: u16 = 1433;

    /// 默认的服务器数据文件目录
    pub const DEFAULT_RESTORE_PATH: &str = "/var/opt/mssql/data";

    /// 默认的备份根目录（网络共享挂载点）
    pub const DEFAULT_BACKUP_ROOT: &str = "/mnt/sql_backups";

    /// 默认登录超时秒数
    pub const DEFAULT_LOGIN_TIMEOUT_SECS: u64 = 15;
}

/// 日志相关常量
pub mod logging {
    /// 设置后日志写入该文件而不是终端
    pub const LOG_FILE_ENV: &str = "SQLKEEPER_LOG_FILE";
}
