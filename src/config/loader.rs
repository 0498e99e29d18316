//! Configuration Loader
//!
//! 实现多源配置加载与合并逻辑
//!
//! 优先级（从高到低）：
//! 1. 环境变量
//! 2. 配置文件（voxroom.toml）
//! 3. 默认值

use config::{Config, ConfigError as ConfigCrateError, Environment, File};
use std::path::Path;
use thiserror::Error;

use super::types::AppConfig;

/// 配置加载错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

impl From<ConfigCrateError> for ConfigError {
    fn from(err: ConfigCrateError) -> Self {
        ConfigError::LoadError(err.to_string())
    }
}

/// 配置文件搜索路径
const CONFIG_FILE_NAMES: &[&str] = &["voxroom", "voxroom.local"];

/// Opus 支持的采样率
const OPUS_SAMPLE_RATES: &[u32] = &[8_000, 12_000, 16_000, 24_000, 48_000];

/// 加载应用配置
///
/// 按优先级从高到低合并配置：
/// 1. 环境变量（前缀 `VOXROOM_`，层级分隔符 `__`）
/// 2. 配置文件（voxroom.toml 或 voxroom.local.toml）
/// 3. 默认值
///
/// # 环境变量示例
/// - `VOXROOM_CONNECTION__READY_TIMEOUT_MS=10000`
/// - `VOXROOM_CAPTURE__SILENCE_TIMEOUT_MS=1500`
/// - `VOXROOM_LOG__LEVEL=debug`
pub fn load_config() -> Result<AppConfig, ConfigError> {
    load_config_from_path(None)
}

/// 从指定路径加载配置
///
/// # 参数
/// - `config_path` - 可选的配置文件路径，如果为 None 则使用默认搜索路径
pub fn load_config_from_path(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder();

    // 1. 首先设置默认值（最低优先级）
    builder = builder
        .set_default("connection.ready_timeout_ms", 30_000)?
        .set_default("connection.reconnect_timeout_ms", 5_000)?
        .set_default("playback.start_timeout_ms", 5_000)?
        .set_default("playback.finish_timeout_ms", 60_000)?
        .set_default("capture.silence_timeout_ms", 2_000)?
        .set_default("capture.min_utterance_ms", 500)?
        .set_default("capture.sample_rate", 48_000)?
        .set_default("capture.channels", 2)?
        .set_default("capture.opus_bitrate", 64_000)?
        .set_default("capture.suppress_during_playback", true)?
        .set_default("log.level", "info")?
        .set_default("log.json", false)?;

    // 2. 添加配置文件（如果存在）
    if let Some(path) = config_path {
        builder = builder.add_source(File::from(path).required(true));
    } else {
        for name in CONFIG_FILE_NAMES {
            builder = builder.add_source(File::with_name(name).required(false));
        }
    }

    // 3. 添加环境变量（最高优先级）
    builder = builder.add_source(
        Environment::with_prefix("VOXROOM")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;

    let app_config: AppConfig = config.try_deserialize().map_err(|e| {
        ConfigError::ParseError(format!("Failed to deserialize config: {}", e))
    })?;

    validate_config(&app_config)?;

    Ok(app_config)
}

/// 验证配置有效性
fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    let timeouts = [
        ("connection.ready_timeout_ms", config.connection.ready_timeout_ms),
        ("connection.reconnect_timeout_ms", config.connection.reconnect_timeout_ms),
        ("playback.start_timeout_ms", config.playback.start_timeout_ms),
        ("playback.finish_timeout_ms", config.playback.finish_timeout_ms),
        ("capture.silence_timeout_ms", config.capture.silence_timeout_ms),
    ];
    for (name, value) in timeouts {
        if value == 0 {
            return Err(ConfigError::ValidationError(format!(
                "{} cannot be 0",
                name
            )));
        }
    }

    if !OPUS_SAMPLE_RATES.contains(&config.capture.sample_rate) {
        return Err(ConfigError::ValidationError(format!(
            "Unsupported sample rate for Opus: {}",
            config.capture.sample_rate
        )));
    }

    if !matches!(config.capture.channels, 1 | 2) {
        return Err(ConfigError::ValidationError(format!(
            "Channels must be 1 or 2, got {}",
            config.capture.channels
        )));
    }

    if config.capture.opus_bitrate == 0 {
        return Err(ConfigError::ValidationError(
            "Opus bitrate cannot be 0".to_string(),
        ));
    }

    Ok(())
}

/// 打印配置信息（用于启动时日志）
pub fn print_config(config: &AppConfig) {
    tracing::info!("=== Voice Configuration ===");
    tracing::info!("Ready Timeout: {}ms", config.connection.ready_timeout_ms);
    tracing::info!("Reconnect Window: {}ms", config.connection.reconnect_timeout_ms);
    tracing::info!("Playback Start Timeout: {}ms", config.playback.start_timeout_ms);
    tracing::info!("Playback Finish Timeout: {}ms", config.playback.finish_timeout_ms);
    tracing::info!("Silence Timeout: {}ms", config.capture.silence_timeout_ms);
    tracing::info!(
        "Min Utterance: {}ms ({} bytes)",
        config.capture.min_utterance_ms,
        config.capture.min_utterance_bytes()
    );
    tracing::info!(
        "PCM Format: {}Hz x {}ch",
        config.capture.sample_rate,
        config.capture.channels
    );
    tracing::info!("Suppress During Playback: {}", config.capture.suppress_during_playback);
    tracing::info!("Log Level: {}", config.log.level);
    tracing::info!("===========================");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_validation_passes_for_valid_config() {
        let config = AppConfig::default();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validation_error_for_zero_timeout() {
        let mut config = AppConfig::default();
        config.playback.start_timeout_ms = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validation_error_for_unsupported_sample_rate() {
        let mut config = AppConfig::default();
        config.capture.sample_rate = 44_100;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validation_error_for_channels() {
        let mut config = AppConfig::default();
        config.capture.channels = 6;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[capture]\nsilence_timeout_ms = 1500\nchannels = 1\n\n[log]\nlevel = \"debug\""
        )
        .unwrap();

        let config = load_config_from_path(Some(file.path())).unwrap();
        assert_eq!(config.capture.silence_timeout_ms, 1500);
        assert_eq!(config.capture.channels, 1);
        assert_eq!(config.log.level, "debug");
        // 未覆盖的字段保持默认值
        assert_eq!(config.connection.ready_timeout_ms, 30_000);
    }

    #[test]
    fn test_invalid_file_values_are_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[capture]\nsample_rate = 22050").unwrap();

        let result = load_config_from_path(Some(file.path()));
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }
}
