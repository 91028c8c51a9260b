// 上传协议操作与结果类型
//
// 这里定义传输无关的逻辑操作面：`UploadService` 是协议边界，
// 服务端状态机直接实现它，传输适配层把各操作映射到具体传输上。
// 客户端只依赖该 trait，不感知对端是进程内状态机还是网络适配器。

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::UploadError;
use crate::session::UploadMode;

/// 下一个分片提交目标
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkTarget {
    /// 上传标识
    pub id: String,
    /// 下一个分片索引
    pub idx: usize,
}

impl ChunkTarget {
    pub fn new(id: impl Into<String>, idx: usize) -> Self {
        Self { id: id.into(), idx }
    }

    /// 渲染为传输适配层可用的端点路径
    pub fn endpoint(&self, prefix: &str) -> String {
        format!("{}/upload/{}/{}", prefix, self.id, self.idx)
    }
}

/// Start 操作的会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartStatus {
    /// 会话已创建或可续传
    Started,
    /// 同名资产已完成上传（秒传命中）
    Exists,
}

/// Start 操作结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartOutcome {
    pub id: String,
    pub status: StartStatus,
    /// 秒传命中时为 None
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<ChunkTarget>,
}

/// AcceptChunk 操作的会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    /// 仍有分片待接收
    Pending,
    /// 全部分片已接收
    Done,
}

/// AcceptChunk 操作结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptOutcome {
    pub id: String,
    pub status: ChunkStatus,
    /// 串行模式下的下一个提交目标；并行模式或已完成时为 None
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<ChunkTarget>,
}

/// Status 操作结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusOutcome {
    pub id: String,
    pub status: ChunkStatus,
}

/// End 操作结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndOutcome {
    pub id: String,
    /// 装配完成的最终资产路径
    pub asset_path: PathBuf,
}

/// Abort 操作结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortOutcome {
    pub id: String,
    /// 会话条目是否确有删除
    pub aborted: bool,
}

/// 传输无关的上传协议边界
#[async_trait]
pub trait UploadService: Send + Sync {
    /// 查询会话当前状态
    async fn status(&self, id: &str) -> Result<StatusOutcome, UploadError>;

    /// 创建 / 续传 / 秒传短路一个上传会话
    async fn start(
        &self,
        id: &str,
        total: usize,
        filename: &str,
    ) -> Result<StartOutcome, UploadError>;

    /// 提交一个分片
    async fn accept_chunk(
        &self,
        id: &str,
        idx: usize,
        mode: UploadMode,
        payload: &[u8],
    ) -> Result<AcceptOutcome, UploadError>;

    /// 结束上传：校验完整性并装配最终资产
    async fn end(&self, id: &str) -> Result<EndOutcome, UploadError>;

    /// 中止上传：删除会话与全部临时分片
    async fn abort(&self, id: &str) -> Result<AbortOutcome, UploadError>;
}
