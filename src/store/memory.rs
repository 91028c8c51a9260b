// 内存会话存储
//
// DashMap 支撑的进程内易失存储，适合测试与单实例部署。

use async_trait::async_trait;
use dashmap::DashMap;

use super::SessionStore;
use crate::error::UploadError;
use crate::session::UploadSession;

/// 进程内易失会话存储
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    entries: DashMap<String, UploadSession>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前会话数量
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, id: &str) -> Result<Option<UploadSession>, UploadError> {
        Ok(self.entries.get(id).map(|entry| entry.clone()))
    }

    async fn set(&self, id: &str, session: UploadSession) -> Result<(), UploadError> {
        self.entries.insert(id.to_string(), session);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, UploadError> {
        Ok(self.entries.remove(id).is_some())
    }

    async fn exists(&self, id: &str) -> Result<bool, UploadError> {
        Ok(self.entries.contains_key(id))
    }
}
