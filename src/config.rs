//! Room configuration.
//!
//! DESIGN
//! ======
//! All recognized options are read once at startup from environment
//! variables with compile-time defaults. The derived `DataMode` decides
//! which snapshot backend (if any) is active: a Redis host wins over a
//! data directory, and selecting the broker disables filesystem
//! persistence entirely.

use std::path::{Path, PathBuf};

use crate::protocol::{DistConfig, VersionInfo};

const DEFAULT_TITLE: &str = "PaintChat";
const DEFAULT_CANVAS_WIDTH: u32 = 1920;
const DEFAULT_CANVAS_HEIGHT: u32 = 1080;
const DEFAULT_LAYER_COUNT: usize = 3;
const DEFAULT_MAX_PAINT_LOG_COUNT: usize = 2000;
const DEFAULT_MAX_CHAT_LOG_COUNT: usize = 100;
const DEFAULT_REDIS_PORT: u16 = 6379;
const DEFAULT_PORT: u16 = 10133;

/// Which snapshot backend is active. Fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataMode {
    None,
    Fs,
    Broker,
}

/// How the remote address of a connection is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardedHeaderType {
    /// Use the socket peer address.
    None,
    /// Trust the first hop of `X-Forwarded-For`.
    Xff,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub title: String,
    pub canvas_width: u32,
    pub canvas_height: u32,
    pub layer_count: usize,
    /// Reserved: accepted but no operation log is persisted.
    pub max_paint_log_count: usize,
    /// Reserved: accepted but no chat log is persisted.
    pub max_chat_log_count: usize,
    pub data_dir: Option<PathBuf>,
    pub data_file_prefix: String,
    pub redis_host: Option<String>,
    pub redis_port: u16,
    pub redis_password: Option<String>,
    pub redis_key_prefix: String,
    pub client_dir: Option<PathBuf>,
    pub client_version: String,
    pub forwarded_header_type: ForwardedHeaderType,
    pub port: u16,
}

impl Config {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            title: env_string("TITLE").unwrap_or_else(|| DEFAULT_TITLE.into()),
            canvas_width: env_parse("CANVAS_WIDTH", DEFAULT_CANVAS_WIDTH),
            canvas_height: env_parse("CANVAS_HEIGHT", DEFAULT_CANVAS_HEIGHT),
            layer_count: env_parse("LAYER_COUNT", DEFAULT_LAYER_COUNT),
            max_paint_log_count: env_parse("MAX_PAINT_LOG_COUNT", DEFAULT_MAX_PAINT_LOG_COUNT),
            max_chat_log_count: env_parse("MAX_CHAT_LOG_COUNT", DEFAULT_MAX_CHAT_LOG_COUNT),
            data_dir: env_string("DATA_DIR").map(PathBuf::from),
            data_file_prefix: env_string("DATA_FILE_PREFIX").unwrap_or_default(),
            redis_host: env_string("REDIS_HOST"),
            redis_port: env_parse("REDIS_PORT", DEFAULT_REDIS_PORT),
            redis_password: env_string("REDIS_PASSWORD"),
            redis_key_prefix: env_string("REDIS_KEY_PREFIX").unwrap_or_default(),
            client_dir: env_string("CLIENT_DIR").map(PathBuf::from),
            client_version: env_string("CLIENT_VERSION")
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").into()),
            forwarded_header_type: match env_string("FORWARDED_HEADER_TYPE").as_deref() {
                Some("XFF") => ForwardedHeaderType::Xff,
                _ => ForwardedHeaderType::None,
            },
            port: env_parse("PORT", DEFAULT_PORT),
        }
    }

    /// The active snapshot backend. A Redis host disables filesystem
    /// persistence even when a data directory is also configured.
    #[must_use]
    pub fn data_mode(&self) -> DataMode {
        if self.redis_host.is_some() {
            return DataMode::Broker;
        }
        if self.fs_data_dir().is_some() {
            return DataMode::Fs;
        }
        DataMode::None
    }

    /// The filesystem persistence root, unless disabled by a null-ish value.
    #[must_use]
    pub fn fs_data_dir(&self) -> Option<&Path> {
        let dir = self.data_dir.as_deref()?;
        if dir.as_os_str().is_empty() || dir == Path::new("null") || dir == Path::new("/dev/null") {
            return None;
        }
        Some(dir)
    }

    /// Snapshot file path for layer `n` under the data directory.
    #[must_use]
    pub fn layer_file(&self, dir: &Path, n: usize) -> PathBuf {
        dir.join(format!("{}layer{n}.png", self.data_file_prefix))
    }

    /// Broker key holding the snapshot of layer `n`.
    #[must_use]
    pub fn layer_key(&self, n: usize) -> String {
        format!("{}layer:{n}", self.redis_key_prefix)
    }

    /// Broker pub/sub channel name for a frame kind.
    #[must_use]
    pub fn channel(&self, kind: &str) -> String {
        format!("{}{kind}", self.redis_key_prefix)
    }

    /// Public projection served at `/config`.
    #[must_use]
    pub fn distributable(&self) -> DistConfig {
        DistConfig {
            title: self.title.clone(),
            canvas_width: self.canvas_width,
            canvas_height: self.canvas_height,
            layer_count: self.layer_count,
            version: VersionInfo {
                server: env!("CARGO_PKG_VERSION").into(),
                client: self.client_version.clone(),
            },
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}
