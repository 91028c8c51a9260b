// 分片装配器
//
// 在完整性校验通过后，把分片按索引顺序拼接成最终资产。
// 并行模式下分片到达顺序与索引顺序无关，装配输出仍严格按索引排序。
//
// 原子性：先写 `{filename}.tmp` 再重命名，任何 IO 失败都会移除临时文件，
// 最终路径不会出现半成品。

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::ChunkBlobRepository;
use crate::error::UploadError;

/// 分片装配器
#[derive(Debug, Clone)]
pub struct ChunkAssembler {
    repo: ChunkBlobRepository,
    assets_dir: PathBuf,
}

impl ChunkAssembler {
    pub fn new(repo: ChunkBlobRepository, assets_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo,
            assets_dir: assets_dir.into(),
        }
    }

    /// 资产输出目录
    pub fn assets_dir(&self) -> &Path {
        &self.assets_dir
    }

    /// 校验 [0, total) 的每个分片是否都已就位
    ///
    /// 装配的前置门卫：任何一个分片缺失都返回 false，绝不部分装配。
    pub async fn validate_complete(&self, id: &str, total: usize) -> bool {
        for idx in 0..total {
            if !self.repo.exists(id, idx).await {
                debug!("完整性校验失败: id={}, 缺少分片 #{}", id, idx);
                return false;
            }
        }
        true
    }

    /// 按索引顺序拼接全部分片，写入最终资产
    ///
    /// 返回最终资产路径。调用方须先通过 `validate_complete`。
    pub async fn assemble(
        &self,
        id: &str,
        total: usize,
        filename: &str,
    ) -> Result<PathBuf, UploadError> {
        tokio::fs::create_dir_all(&self.assets_dir).await?;

        let target_path = self.assets_dir.join(filename);
        let temp_path = self.assets_dir.join(format!("{}.tmp", filename));

        match self.concat_to(id, total, &temp_path).await {
            Ok(bytes) => {
                tokio::fs::rename(&temp_path, &target_path).await?;
                info!(
                    "装配完成: id={}, 分片数={}, 大小={} bytes, 目标={:?}",
                    id, total, bytes, target_path
                );
                Ok(target_path)
            }
            Err(e) => {
                // 失败时移除临时文件，最终路径保持不可见
                if let Err(cleanup_err) = tokio::fs::remove_file(&temp_path).await {
                    if cleanup_err.kind() != std::io::ErrorKind::NotFound {
                        warn!("清理装配临时文件失败 {:?}: {}", temp_path, cleanup_err);
                    }
                }
                Err(e)
            }
        }
    }

    /// 把分片流式拼接到指定路径，返回写入字节数
    async fn concat_to(&self, id: &str, total: usize, path: &Path) -> Result<u64, UploadError> {
        let mut out = tokio::fs::File::create(path).await?;
        let mut written = 0u64;

        for idx in 0..total {
            let mut blob = tokio::fs::File::open(self.repo.blob_path(id, idx)).await?;
            written += tokio::io::copy(&mut blob, &mut out).await?;
        }

        out.flush().await?;
        Ok(written)
    }

    /// 清理会话的全部临时分片（尽力而为）
    pub async fn clear(&self, id: &str, total: usize) {
        self.repo.remove_all(id, total).await;
    }
}
