//! Telemetry - tracing 初始化

use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

/// 初始化全局 tracing subscriber
///
/// `RUST_LOG` 优先于配置中的级别；重复初始化返回 false
pub fn init_tracing(config: &LogConfig) -> bool {
    let log_filter = format!("{},voxroom={}", config.level, config.level);
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_filter));

    let result = if config.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };

    result.is_ok()
}
