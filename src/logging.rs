use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

const LOG_FILE_PREFIX: &str = "certflow.log";

/// ログ設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// ログレベル (trace, debug, info, warn, error) またはEnvFilter式
    pub level: String,
    /// ログディレクトリ
    pub log_dir: PathBuf,
    /// ファイルローテーション設定
    pub rotation: LogRotation,
    /// 指定日数より古いログファイルを削除（未指定なら外部管理）
    pub retention_days: Option<u32>,
    /// コンソール（stderr）出力有効
    pub console_enabled: bool,
    /// ファイル出力有効
    pub file_enabled: bool,
    /// ファイル出力をJSON形式にする
    pub json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    /// 日次ローテーション
    Daily,
    /// 時間毎ローテーション
    Hourly,
    /// ローテーションなし
    Never,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: PathBuf::from("logs"),
            rotation: LogRotation::Daily,
            retention_days: None,
            console_enabled: true,
            file_enabled: false,
            json: false,
        }
    }
}

impl LogConfig {
    /// カスタムログディレクトリを設定
    pub fn with_log_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.log_dir = dir.into();
        self
    }

    /// ローテーション設定
    pub fn with_rotation(mut self, rotation: LogRotation) -> Self {
        self.rotation = rotation;
        self
    }

    /// コンソール出力制御
    pub fn with_console(mut self, enabled: bool) -> Self {
        self.console_enabled = enabled;
        self
    }

    /// ファイル出力制御
    pub fn with_file(mut self, enabled: bool) -> Self {
        self.file_enabled = enabled;
        self
    }
}

/// ログディレクトリを確保
fn ensure_log_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}

fn is_log_file(path: &Path) -> bool {
    path.is_file()
        && path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX))
}

/// ログシステムを初期化
///
/// ファイル出力が有効な場合、返される `WorkerGuard` はプロセス終了まで保持すること。
pub fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    // RUST_LOG が設定されていれば優先
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    let mut guard = None;

    if config.console_enabled {
        layers.push(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .boxed(),
        );
    }

    if config.file_enabled {
        ensure_log_dir(&config.log_dir)?;
        let appender = match config.rotation {
            LogRotation::Daily => rolling::daily(&config.log_dir, LOG_FILE_PREFIX),
            LogRotation::Hourly => rolling::hourly(&config.log_dir, LOG_FILE_PREFIX),
            LogRotation::Never => rolling::never(&config.log_dir, LOG_FILE_PREFIX),
        };
        let (writer, file_guard) = non_blocking(appender);
        guard = Some(file_guard);

        let layer = if config.json {
            fmt::layer().json().with_writer(writer).boxed()
        } else {
            fmt::layer().with_ansi(false).with_writer(writer).boxed()
        };
        layers.push(layer);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize logging: {}", e))?;

    tracing::debug!(
        level = %config.level,
        console = config.console_enabled,
        file = config.file_enabled,
        "Logging initialized"
    );

    if let Some(days) = config.retention_days {
        if config.file_enabled {
            if let Err(e) = cleanup_old_logs(&config.log_dir, days) {
                tracing::warn!("ログ保持ポリシー適用に失敗: {}", e);
            }
        }
    }

    Ok(guard)
}

/// 日数ベースでログファイルを削除
pub fn cleanup_old_logs(log_dir: &Path, max_days: u32) -> Result<usize> {
    use std::time::{Duration, SystemTime};

    let cutoff_time = SystemTime::now() - Duration::from_secs(u64::from(max_days) * 24 * 60 * 60);
    let mut removed_count = 0;

    if !log_dir.exists() {
        return Ok(0);
    }

    for entry in fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();

        if !is_log_file(&path) {
            continue;
        }
        let modified = entry.metadata().and_then(|m| m.modified());
        if let Ok(modified) = modified {
            if modified < cutoff_time {
                match fs::remove_file(&path) {
                    Ok(()) => {
                        removed_count += 1;
                        tracing::debug!("古いログファイル削除: {}", path.display());
                    }
                    Err(e) => tracing::warn!("ログファイル削除失敗: {} - {}", path.display(), e),
                }
            }
        }
    }

    if removed_count > 0 {
        tracing::info!("古いログファイル{}個削除（{}日より古い）", removed_count, max_days);
    }

    Ok(removed_count)
}
