// 分片物理存储模块
//
// 每个分片按 (会话 id, 分片索引) 寻址为独立文件，互不竞争：
// 并发写入同一会话的不同分片落在不同文件上，无需加锁。

pub mod assembler;

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::UploadError;

pub use assembler::ChunkAssembler;

/// 分片物理存储仓库
///
/// 分片文件命名：`{chunks_dir}/{id}-{idx}`。
#[derive(Debug, Clone)]
pub struct ChunkBlobRepository {
    chunks_dir: PathBuf,
}

impl ChunkBlobRepository {
    pub fn new(chunks_dir: impl Into<PathBuf>) -> Self {
        Self {
            chunks_dir: chunks_dir.into(),
        }
    }

    /// 分片目录
    pub fn chunks_dir(&self) -> &Path {
        &self.chunks_dir
    }

    /// 分片文件路径
    pub fn blob_path(&self, id: &str, idx: usize) -> PathBuf {
        self.chunks_dir.join(format!("{}-{}", id, idx))
    }

    /// 确保分片目录存在
    pub async fn ensure_dir(&self) -> Result<(), UploadError> {
        tokio::fs::create_dir_all(&self.chunks_dir).await?;
        Ok(())
    }

    /// 写入分片数据
    pub async fn write(&self, id: &str, idx: usize, payload: &[u8]) -> Result<(), UploadError> {
        self.ensure_dir().await?;

        let path = self.blob_path(id, idx);
        tokio::fs::write(&path, payload).await?;

        debug!("分片已写入: id={}, idx={}, 大小={} bytes", id, idx, payload.len());
        Ok(())
    }

    /// 分片是否存在
    pub async fn exists(&self, id: &str, idx: usize) -> bool {
        tokio::fs::try_exists(self.blob_path(id, idx))
            .await
            .unwrap_or(false)
    }

    /// 读取分片数据
    pub async fn read(&self, id: &str, idx: usize) -> Result<Vec<u8>, UploadError> {
        Ok(tokio::fs::read(self.blob_path(id, idx)).await?)
    }

    /// 删除单个分片，返回是否确有删除
    pub async fn remove(&self, id: &str, idx: usize) -> Result<bool, UploadError> {
        let path = self.blob_path(id, idx);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// 删除会话的全部分片（尽力而为）
    ///
    /// 单个分片删除失败只记录日志，不阻塞调用方。
    pub async fn remove_all(&self, id: &str, total: usize) {
        let mut removed = 0;

        for idx in 0..total {
            match self.remove(id, idx).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => warn!("删除分片失败: id={}, idx={}, 错误: {}", id, idx, e),
            }
        }

        debug!("已清理会话分片: id={}, 删除 {}/{}", id, removed, total);
    }
}
