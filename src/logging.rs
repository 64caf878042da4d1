use std::fs::File;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, Layer};

/// 初始化全局日志。
///
/// 指定 log_path 时日志写入文件（覆盖旧文件），否则输出到终端。
pub fn init_logging(verbose: bool, log_path: Option<&str>) -> anyhow::Result<()> {
    let level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    match log_path {
        Some(path) => {
            let file = File::create(path)?;
            let file_layer = fmt::layer()
                .with_writer(file)
                .with_ansi(false)
                .with_target(false)
                .with_filter(level);
            tracing_subscriber::registry().with(file_layer).init();
        }
        None => {
            let stdout_layer = fmt::layer()
                .with_writer(std::io::stdout)
                .with_ansi(true)
                .with_target(false)
                .with_filter(level);
            tracing_subscriber::registry().with(stdout_layer).init();
        }
    }

    Ok(())
}
