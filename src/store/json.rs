// 持久化单文件 JSON 会话存储
//
// 整个存储是一个 `id -> 原始 JSON 值` 的映射文件。每次写入先落到
// `<path>.tmp` 再原子重命名覆盖，写入中断不会损坏已有文件。
//
// 条目以原始 JSON 值持有，读取时才解码并做结构校验，
// 单个条目被外部破坏只影响该条目（get 报告 conflict），不拖垮整个存储。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{is_valid_session, SessionStore};
use crate::error::UploadError;
use crate::session::UploadSession;

/// 持久化 JSON 会话存储
pub struct JsonSessionStore {
    path: PathBuf,
    entries: RwLock<HashMap<String, serde_json::Value>>,
}

impl JsonSessionStore {
    /// 打开（或创建）存储文件
    ///
    /// 文件存在但整体无法解析时拒绝打开，避免悄悄吞掉既有进度。
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, UploadError> {
        let path = path.into();

        let entries = if tokio::fs::try_exists(&path).await? {
            let raw = tokio::fs::read_to_string(&path).await?;
            if raw.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str(&raw)
                    .map_err(|e| UploadError::Io(format!("会话存储文件解析失败 {:?}: {}", path, e)))?
            }
        } else {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            HashMap::new()
        };

        debug!("已打开会话存储: {:?}, 条目数={}", path, entries.len());

        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    /// 存储文件路径
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 将当前映射整体写回磁盘（tmp + 原子重命名）
    async fn persist(&self, entries: &HashMap<String, serde_json::Value>) -> Result<(), UploadError> {
        let payload = serde_json::to_string_pretty(entries)?;

        let temp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, payload).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;

        Ok(())
    }
}

#[async_trait]
impl SessionStore for JsonSessionStore {
    async fn get(&self, id: &str) -> Result<Option<UploadSession>, UploadError> {
        let entries = self.entries.read().await;

        let value = match entries.get(id) {
            Some(value) => value,
            None => return Ok(None),
        };

        if !is_valid_session(value) {
            warn!("会话存储条目结构无效: id={}", id);
            return Err(UploadError::Conflict(id.to_string()));
        }

        let session: UploadSession = serde_json::from_value(value.clone())
            .map_err(|_| UploadError::Conflict(id.to_string()))?;

        Ok(Some(session))
    }

    async fn set(&self, id: &str, session: UploadSession) -> Result<(), UploadError> {
        let mut entries = self.entries.write().await;
        entries.insert(id.to_string(), serde_json::to_value(&session)?);
        self.persist(&entries).await
    }

    async fn delete(&self, id: &str) -> Result<bool, UploadError> {
        let mut entries = self.entries.write().await;
        let removed = entries.remove(id).is_some();

        if removed {
            self.persist(&entries).await?;
        }

        Ok(removed)
    }

    async fn exists(&self, id: &str) -> Result<bool, UploadError> {
        Ok(self.entries.read().await.contains_key(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_set_persists_and_reloads() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sessions.json");

        {
            let store = JsonSessionStore::open(&path).await.unwrap();
            let mut session = UploadSession::new(4, "foo.txt");
            session.mark_received(0);
            store.set("foo", session).await.unwrap();
        }

        // 重新打开后进度仍在
        let store = JsonSessionStore::open(&path).await.unwrap();
        let session = store.get("foo").await.unwrap().unwrap();
        assert_eq!(session.total, 4);
        assert_eq!(session.cur, 1);
        assert!(session.received.contains(0));
    }

    #[tokio::test]
    async fn test_delete_persists() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sessions.json");

        let store = JsonSessionStore::open(&path).await.unwrap();
        store
            .set("foo", UploadSession::new(2, "foo.txt"))
            .await
            .unwrap();
        assert!(store.delete("foo").await.unwrap());
        assert!(!store.delete("foo").await.unwrap());
        drop(store);

        let store = JsonSessionStore::open(&path).await.unwrap();
        assert!(!store.exists("foo").await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_entry_reports_conflict() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sessions.json");

        // 直接写入一个缺少进度字段的条目
        tokio::fs::write(&path, r#"{ "broken": { "filename": "x" } }"#)
            .await
            .unwrap();

        let store = JsonSessionStore::open(&path).await.unwrap();
        assert!(matches!(
            store.get("broken").await,
            Err(UploadError::Conflict(_))
        ));

        // 其他条目不受影响
        store
            .set("ok", UploadSession::new(2, "ok.txt"))
            .await
            .unwrap();
        assert!(store.get("ok").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unparseable_file_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sessions.json");

        tokio::fs::write(&path, "not valid json").await.unwrap();

        assert!(JsonSessionStore::open(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_no_temp_file_left_behind() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sessions.json");

        let store = JsonSessionStore::open(&path).await.unwrap();
        store
            .set("foo", UploadSession::new(2, "foo.txt"))
            .await
            .unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }
}
