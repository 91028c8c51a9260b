// 可插拔会话元数据存储
//
// 契约只保证单次 get/set 的原子性，不保证跨调用方的读改写原子性——
// 按会话串行化修改是状态机的职责。

pub mod json;
pub mod memory;

use async_trait::async_trait;

use crate::error::UploadError;
use crate::session::UploadSession;

pub use json::JsonSessionStore;
pub use memory::MemorySessionStore;

/// 会话元数据存储契约
///
/// 实现可以由磁盘 IO 支撑，因此所有操作都是异步的。
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// 读取会话，不存在返回 None
    async fn get(&self, id: &str) -> Result<Option<UploadSession>, UploadError>;

    /// 写入会话（覆盖语义）
    async fn set(&self, id: &str, session: UploadSession) -> Result<(), UploadError>;

    /// 删除会话，返回条目是否存在
    async fn delete(&self, id: &str) -> Result<bool, UploadError>;

    /// 会话是否存在
    async fn exists(&self, id: &str) -> Result<bool, UploadError>;
}

/// 结构化校验任意存储值是否是合法会话
///
/// 防御存储层损坏：只要求关键进度字段（cur / total）在场，
/// 不在场的条目在 get 时报告为 conflict。
pub fn is_valid_session(value: &serde_json::Value) -> bool {
    value.get("cur").is_some() && value.get("total").is_some()
}
