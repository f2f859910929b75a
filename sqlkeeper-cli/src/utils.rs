use indicatif::{ProgressBar, ProgressStyle};
use sqlkeeper_core::{constants::logging, error::Result, progress::OperationProgress};

/// 设置日志记录系统
///
/// 库代码只使用 tracing 宏，输出行为在这里统一配置：
/// - 支持 RUST_LOG 环境变量控制日志级别
/// - 设置 SQLKEEPER_LOG_FILE 时以详细格式写入文件，否则以简洁格式输出到 stderr
pub fn setup_logging(verbose: bool) {
    use tracing_subscriber::{EnvFilter, fmt};

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let log_file = std::env::var(logging::LOG_FILE_ENV).ok().and_then(|path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| eprintln!("无法打开日志文件 {path}: {e}，改为输出到终端"))
            .ok()
    });

    if let Some(file) = log_file {
        fmt()
            .with_env_filter(env_filter)
            .with_writer(file)
            .with_target(true)
            .with_thread_names(true)
            .with_line_number(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_thread_names(false)
            .with_line_number(false)
            .without_time()
            .compact()
            .init();
    }
}

/// 百分比进度条
pub fn operation_progress_bar(prefix: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{prefix} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}")?
            .progress_chars("#>-"),
    );
    pb.set_prefix(prefix.to_string());
    Ok(pb)
}

/// 把一次进度快照同步到进度条
pub fn render_progress(pb: &ProgressBar, progress: &OperationProgress) {
    pb.set_position(u64::from(progress.percentage));
    if progress.total_items > 1 {
        pb.set_message(format!(
            "({}/{}) {}",
            progress.completed_items, progress.total_items, progress.current_item
        ));
    } else {
        pb.set_message(progress.current_item.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_progress_tracks_percentage() {
        let pb = ProgressBar::hidden();
        let mut progress = OperationProgress::pending("初始化", 4, None);
        progress.begin_step(2, "log1.trn");

        render_progress(&pb, &progress);
        assert_eq!(pb.position(), 50);
        assert_eq!(pb.message(), "(2/4) log1.trn");
    }

    #[test]
    fn test_progress_bar_template_is_valid() {
        assert!(operation_progress_bar("还原").is_ok());
    }
}
