use super::{Engine, Row};
use crate::config::MssqlConfig;
use crate::constants::sqlcmd;
use crate::error::{EngineError, KeeperError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// 这些输出说明根本没有连上服务器，而不是语句本身出错
const UNAVAILABLE_MARKERS: &[&str] = &[
    "Login timeout expired",
    "Login failed",
    "Unable to complete login process",
    "TCP Provider",
    "Named Pipes Provider",
    "SSL Provider",
    "Server is not found or not accessible",
    "A network-related or instance-specific error",
];

/// 通过 sqlcmd 客户端访问 SQL Server
#[derive(Debug, Clone)]
pub struct SqlCmdEngine {
    binary: PathBuf,
    server: String,
    port: u16,
    user: String,
    password: String,
    login_timeout_secs: u64,
    trust_server_certificate: bool,
}

impl SqlCmdEngine {
    pub fn from_config(config: &MssqlConfig) -> Result<Self> {
        let binary = match &config.sqlcmd_path {
            Some(path) => PathBuf::from(path),
            None => which::which(sqlcmd::BINARY_NAME).map_err(|e| {
                KeeperError::engine_unavailable(format!("sqlcmd 未安装或不在 PATH 中: {e}"))
            })?,
        };

        Ok(Self {
            binary,
            server: config.server.clone(),
            port: config.port,
            user: config.user.clone(),
            password: config.password.clone(),
            login_timeout_secs: config.login_timeout_secs,
            trust_server_certificate: config.trust_server_certificate,
        })
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-S".to_string(),
            format!("tcp:{},{}", self.server, self.port),
            "-U".to_string(),
            self.user.clone(),
            "-l".to_string(),
            self.login_timeout_secs.to_string(),
            // 出错时返回非零退出码
            "-b".to_string(),
            "-W".to_string(),
            "-w".to_string(),
            sqlcmd::SCREEN_WIDTH.to_string(),
            "-s".to_string(),
            sqlcmd::COLUMN_SEPARATOR.to_string(),
        ];
        if self.trust_server_certificate {
            args.push("-C".to_string());
        }
        args
    }

    /// 执行一条语句并返回标准输出
    async fn run(&self, sql: &str) -> Result<String> {
        debug!("执行 SQL: {}", sql);

        let output = Command::new(&self.binary)
            .args(self.base_args())
            .arg("-Q")
            .arg(format!("SET NOCOUNT ON; {sql}"))
            .env(sqlcmd::PASSWORD_ENV, &self.password)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                KeeperError::engine_unavailable(format!(
                    "无法启动 {}: {e}",
                    self.binary.display()
                ))
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if output.status.success() {
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = [stdout.trim(), stderr.trim()]
            .iter()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join("\n");
        Err(classify_failure(&message).into())
    }
}

#[async_trait]
impl Engine for SqlCmdEngine {
    async fn execute(&self, sql: &str) -> Result<()> {
        self.run(sql).await?;
        Ok(())
    }

    async fn query(&self, sql: &str) -> Result<Vec<Row>> {
        let output = self.run(sql).await?;
        Ok(parse_result_set(&output))
    }
}

/// 根据客户端输出区分连接失败与语句失败；语句失败保留原始输出
pub(crate) fn classify_failure(output: &str) -> EngineError {
    if UNAVAILABLE_MARKERS.iter().any(|m| output.contains(m)) {
        EngineError::Unavailable(output.to_string())
    } else {
        EngineError::Command(output.to_string())
    }
}

fn is_separator_line(line: &str) -> bool {
    !line.is_empty() && line.contains('-') && line.chars().all(|c| c == '-' || c == '|')
}

/// 解析 `-s "|" -W` 格式的第一个结果集：表头、分隔线、数据行，以空行结束
pub(crate) fn parse_result_set(output: &str) -> Vec<Row> {
    let lines: Vec<&str> = output.lines().map(|l| l.trim_end_matches('\r')).collect();

    let Some(header_idx) = lines
        .windows(2)
        .position(|pair| !pair[0].trim().is_empty() && is_separator_line(pair[1].trim()))
    else {
        return Vec::new();
    };

    let headers: Vec<&str> = lines[header_idx]
        .split(sqlcmd::COLUMN_SEPARATOR)
        .map(str::trim)
        .collect();

    let mut rows = Vec::new();
    for line in &lines[header_idx + 2..] {
        if line.trim().is_empty() {
            break;
        }

        // 最后一列可能包含分隔符本身
        let values: Vec<&str> = line
            .splitn(headers.len(), sqlcmd::COLUMN_SEPARATOR)
            .collect();
        if values.len() != headers.len() {
            debug!("跳过列数不匹配的结果行: {}", line);
            continue;
        }

        let mut row = Row::new();
        for (header, value) in headers.iter().zip(values) {
            let value = value.trim();
            let value = (value != sqlcmd::NULL_LITERAL).then(|| value.to_string());
            row.insert(*header, value);
        }
        rows.push(row);
    }

    rows
}
