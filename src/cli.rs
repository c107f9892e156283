// Command line and logging setup for the gossip binary
use clap::Parser;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

use crate::error::GossipError;

/// SIP コールフロー試験ドライバ
#[derive(Parser, Debug, PartialEq)]
#[command(name = "gossip", version)]
pub struct Cli {
    /// YAML設定ファイル。省略時は既定値で動作する
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,
    /// ログ出力先ファイル。省略時は標準エラー出力
    #[arg(short = 'l', long = "log")]
    pub log_file: Option<PathBuf>,
    /// シナリオファイルまたはディレクトリ
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,
}

/// tracing の fmt サブスクライバを設定する。
///
/// レベルは `RUST_LOG` があればそれに従い、なければ `info`。
pub fn init_logging(log_file: Option<&Path>) -> Result<(), GossipError> {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(value) => EnvFilter::new(value),
        Err(_) => EnvFilter::new("info"),
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match log_file {
        Some(path) => {
            let file = File::create(path).map_err(|e| {
                GossipError::ConfigError(format!(
                    "Failed to create log file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).try_init()
        }
        None => builder.with_writer(std::io::stderr).try_init(),
    };
    result.map_err(|e| GossipError::ConfigError(format!("logging already initialised: {}", e)))
}
