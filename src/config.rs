// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

impl AppConfig {
    /// 从 TOML 文件加载配置
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .await
            .with_context(|| format!("读取配置文件失败: {:?}", path))?;

        let config: AppConfig =
            toml::from_str(&raw).with_context(|| format!("解析配置文件失败: {:?}", path))?;

        Ok(config)
    }

    /// 保存配置到 TOML 文件
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let raw = toml::to_string_pretty(self).context("序列化配置失败")?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        fs::write(path, raw)
            .await
            .with_context(|| format!("写入配置文件失败: {:?}", path))?;

        Ok(())
    }
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 临时分片目录
    #[serde(default = "default_chunks_dir")]
    pub chunks_dir: PathBuf,
    /// 最终资产目录
    #[serde(default = "default_assets_dir")]
    pub assets_dir: PathBuf,
    /// 分片大小（字节，默认 5MB）
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// 是否启用秒传（已完成资产的重复上传直接短路）
    #[serde(default)]
    pub second_pass: bool,
}

fn default_chunks_dir() -> PathBuf {
    PathBuf::from("tmp")
}

fn default_assets_dir() -> PathBuf {
    PathBuf::from("tmp")
}

fn default_chunk_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunks_dir: default_chunks_dir(),
            assets_dir: default_assets_dir(),
            chunk_size: default_chunk_size(),
            second_pass: false,
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 日志保留天数，过期的滚动文件在初始化时清理（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
}

fn default_log_enabled() -> bool {
    false
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_retention_days() -> u32 {
    7
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            level: default_log_level(),
            retention_days: default_log_retention_days(),
        }
    }
}
