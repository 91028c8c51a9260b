// 上传客户端
//
// 把一段内容切片后按协议推送给 `UploadService`：串行模式逐片跟随
// 服务端返回的下一个目标，并行模式经有界并发队列整批派发。
// 单个客户端实例同一时刻只承载一次上传，重入直接快速失败。

pub mod hooks;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::error::UploadError;
use crate::protocol::{ChunkStatus, StartStatus, UploadService};
use crate::scheduler::TaskQueue;
use crate::session::UploadMode;

pub use hooks::{UploadObserver, UploadProgress};

/// 单次上传的选项
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// 上传标识，缺省时自动生成 UUID
    pub id: Option<String>,
    /// 上传前先中止同 id 的既有会话（显式覆盖重传）
    pub override_existing: bool,
    /// 并发上限：<= 1 走串行模式，> 1 走并行模式
    pub concurrency: usize,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            id: None,
            override_existing: false,
            concurrency: 1,
        }
    }
}

/// 上传结果报告
#[derive(Debug, Clone)]
pub struct UploadReport {
    /// 本次上传使用的标识
    pub id: String,
    /// 是否秒传命中
    pub second_pass: bool,
    /// 最终资产路径，秒传命中时为 None
    pub asset_path: Option<PathBuf>,
}

/// 上传客户端
pub struct UploadClient {
    service: Arc<dyn UploadService>,
    chunk_size: usize,
    observer: Option<Arc<dyn UploadObserver>>,
    uploading: AtomicBool,
}

impl UploadClient {
    /// 创建客户端，`chunk_size` 为切片大小（至少 1 字节）
    pub fn new(service: Arc<dyn UploadService>, chunk_size: usize) -> Self {
        Self {
            service,
            chunk_size: chunk_size.max(1),
            observer: None,
            uploading: AtomicBool::new(false),
        }
    }

    /// 注册生命周期观察者
    pub fn with_observer(mut self, observer: Arc<dyn UploadObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// 执行一次完整上传
    pub async fn upload(
        &self,
        content: &[u8],
        filename: &str,
        options: UploadOptions,
    ) -> Result<UploadReport, UploadError> {
        if content.is_empty() || filename.is_empty() {
            return Err(UploadError::MissingFields);
        }

        // 占用客户端：同一实例上的并发 upload 快速失败
        let _busy = BusyGuard::acquire(&self.uploading)?;

        let id = options
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let result = self.run(&id, content, filename, &options).await;

        if let Err(e) = &result {
            self.notify(|o| o.on_error(&id, e));
        }
        self.notify(|o| o.on_end(&id));

        result
    }

    async fn run(
        &self,
        id: &str,
        content: &[u8],
        filename: &str,
        options: &UploadOptions,
    ) -> Result<UploadReport, UploadError> {
        let total = count_chunks(content.len(), self.chunk_size);

        // 显式覆盖重传：先中止既有会话，无会话时静默继续
        if options.override_existing {
            match self.service.abort(id).await {
                Ok(_) | Err(UploadError::SessionNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let start = self.service.start(id, total, filename).await?;
        self.notify(|o| o.on_start(id, total, filename));

        if start.status == StartStatus::Exists {
            info!("秒传命中，跳过分片传输: id={}", id);
            self.notify(|o| o.on_second_pass(id));
            return Ok(UploadReport {
                id: id.to_string(),
                second_pass: true,
                asset_path: None,
            });
        }

        let resume_idx = start.target.map(|t| t.idx).unwrap_or(0);

        if options.concurrency > 1 {
            self.push_parallel(id, content, total, filename, options.concurrency)
                .await?
        } else {
            self.push_serial(id, content, total, filename, resume_idx)
                .await?
        }

        let end = self.service.end(id).await?;
        self.notify(|o| o.on_success(id, &end.asset_path));

        Ok(UploadReport {
            id: id.to_string(),
            second_pass: false,
            asset_path: Some(end.asset_path),
        })
    }

    /// 串行推送：从续传点起逐片提交，跟随服务端返回的下一个目标
    async fn push_serial(
        &self,
        id: &str,
        content: &[u8],
        total: usize,
        filename: &str,
        resume_idx: usize,
    ) -> Result<(), UploadError> {
        let mut next = resume_idx;
        debug!("串行上传: id={}, 从分片 #{} 起，共 {} 片", id, next, total);

        while next < total {
            let payload = chunk_at(content, next, self.chunk_size);
            let outcome = self
                .service
                .accept_chunk(id, next, UploadMode::Serial, payload)
                .await?;

            next += 1;
            self.notify(|o| {
                o.on_chunk_uploaded(&UploadProgress {
                    cur: next,
                    total,
                    filename: filename.to_string(),
                })
            });

            match outcome.status {
                ChunkStatus::Done => break,
                ChunkStatus::Pending => {
                    if let Some(target) = outcome.target {
                        next = target.idx;
                    }
                }
            }
        }

        Ok(())
    }

    /// 并行推送：整批切片入队，有界并发派发
    async fn push_parallel(
        &self,
        id: &str,
        content: &[u8],
        total: usize,
        filename: &str,
        concurrency: usize,
    ) -> Result<(), UploadError> {
        debug!("并行上传: id={}, 共 {} 片，并发 {}", id, total, concurrency);

        let queue = TaskQueue::new(concurrency);
        let confirmed = Arc::new(AtomicUsize::new(0));

        for idx in 0..total {
            let payload = chunk_at(content, idx, self.chunk_size).to_vec();
            let service = self.service.clone();
            let observer = self.observer.clone();
            let confirmed = confirmed.clone();
            let id = id.to_string();
            let filename = filename.to_string();

            queue
                .push(Box::pin(async move {
                    service
                        .accept_chunk(&id, idx, UploadMode::Parallel, &payload)
                        .await?;

                    let cur = confirmed.fetch_add(1, Ordering::SeqCst) + 1;
                    if let Some(observer) = &observer {
                        observer.on_chunk_uploaded(&UploadProgress {
                            cur,
                            total,
                            filename,
                        });
                    }
                    Ok(())
                }))
                .map_err(|e| UploadError::Io(e.to_string()))?;
        }

        queue.seal();
        queue.join().await.map_err(|e| {
            e.downcast::<UploadError>()
                .unwrap_or_else(|e| UploadError::Io(e.to_string()))
        })?;

        Ok(())
    }

    fn notify(&self, f: impl FnOnce(&dyn UploadObserver)) {
        if let Some(observer) = &self.observer {
            f(observer.as_ref());
        }
    }
}

/// 占用标记守卫，离开作用域时自动释放
struct BusyGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, UploadError> {
        if flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(UploadError::ClientBusy);
        }
        Ok(Self { flag })
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// 内容按 `chunk_size` 切片后的分片总数
fn count_chunks(len: usize, chunk_size: usize) -> usize {
    len.div_ceil(chunk_size)
}

/// 第 `idx` 个分片的内容切片（末片可短于 `chunk_size`）
fn chunk_at(content: &[u8], idx: usize, chunk_size: usize) -> &[u8] {
    let begin = idx * chunk_size;
    let end = (begin + chunk_size).min(content.len());
    &content[begin..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UploadConfig;
    use crate::machine::UploadStateMachine;
    use crate::protocol::{
        AbortOutcome, AcceptOutcome, EndOutcome, StartOutcome, StatusOutcome,
    };
    use crate::store::MemorySessionStore;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::time::Duration;
    use tempfile::TempDir;

    const CONTENT: &[u8] = b"chunk0chunk1chunk2!!";

    fn service(temp_dir: &TempDir, second_pass: bool) -> Arc<dyn UploadService> {
        let config = UploadConfig {
            chunks_dir: temp_dir.path().join("chunks"),
            assets_dir: temp_dir.path().join("assets"),
            chunk_size: 6,
            second_pass,
        };
        Arc::new(UploadStateMachine::new(
            Arc::new(MemorySessionStore::new()),
            &config,
        ))
    }

    /// 记录各阶段触发次数的观察者
    #[derive(Default)]
    struct RecordingObserver {
        starts: AtomicUsize,
        chunks: AtomicUsize,
        second_passes: AtomicUsize,
        successes: AtomicUsize,
        errors: AtomicUsize,
        ends: AtomicUsize,
        progress: Mutex<Vec<usize>>,
    }

    impl UploadObserver for RecordingObserver {
        fn on_start(&self, _id: &str, _total: usize, _filename: &str) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }
        fn on_chunk_uploaded(&self, progress: &UploadProgress) {
            self.chunks.fetch_add(1, Ordering::SeqCst);
            self.progress.lock().push(progress.cur);
        }
        fn on_second_pass(&self, _id: &str) {
            self.second_passes.fetch_add(1, Ordering::SeqCst);
        }
        fn on_success(&self, _id: &str, _asset_path: &std::path::Path) {
            self.successes.fetch_add(1, Ordering::SeqCst);
        }
        fn on_error(&self, _id: &str, _error: &UploadError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
        fn on_end(&self, _id: &str) {
            self.ends.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_serial_upload_end_to_end() {
        let temp_dir = TempDir::new().unwrap();
        let observer = Arc::new(RecordingObserver::default());
        let client =
            UploadClient::new(service(&temp_dir, false), 6).with_observer(observer.clone());

        let report = client
            .upload(CONTENT, "foo.txt", UploadOptions::default())
            .await
            .unwrap();

        assert!(!report.second_pass);
        let asset = report.asset_path.unwrap();
        assert_eq!(tokio::fs::read(&asset).await.unwrap(), CONTENT);

        // 20 字节按 6 字节切片 = 4 片
        assert_eq!(observer.starts.load(Ordering::SeqCst), 1);
        assert_eq!(observer.chunks.load(Ordering::SeqCst), 4);
        assert_eq!(observer.successes.load(Ordering::SeqCst), 1);
        assert_eq!(observer.errors.load(Ordering::SeqCst), 0);
        assert_eq!(observer.ends.load(Ordering::SeqCst), 1);

        // 串行进度严格递增
        assert_eq!(*observer.progress.lock(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_parallel_upload_end_to_end() {
        let temp_dir = TempDir::new().unwrap();
        let observer = Arc::new(RecordingObserver::default());
        let client =
            UploadClient::new(service(&temp_dir, false), 6).with_observer(observer.clone());

        let report = client
            .upload(
                CONTENT,
                "foo.txt",
                UploadOptions {
                    concurrency: 3,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let asset = report.asset_path.unwrap();
        assert_eq!(tokio::fs::read(&asset).await.unwrap(), CONTENT);

        assert_eq!(observer.chunks.load(Ordering::SeqCst), 4);
        assert_eq!(observer.successes.load(Ordering::SeqCst), 1);
        assert_eq!(observer.ends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_second_pass_skips_transfer() {
        let temp_dir = TempDir::new().unwrap();
        let svc = service(&temp_dir, true);

        let first = UploadClient::new(svc.clone(), 6);
        let report = first
            .upload(
                CONTENT,
                "foo.txt",
                UploadOptions {
                    id: Some("fixed".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!report.second_pass);

        let observer = Arc::new(RecordingObserver::default());
        let second = UploadClient::new(svc, 6).with_observer(observer.clone());
        let report = second
            .upload(
                CONTENT,
                "foo.txt",
                UploadOptions {
                    id: Some("fixed".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(report.second_pass);
        assert!(report.asset_path.is_none());
        assert_eq!(observer.second_passes.load(Ordering::SeqCst), 1);
        assert_eq!(observer.chunks.load(Ordering::SeqCst), 0);
        assert_eq!(observer.ends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_override_existing_forces_fresh_upload() {
        let temp_dir = TempDir::new().unwrap();
        let svc = service(&temp_dir, true);
        let options = UploadOptions {
            id: Some("fixed".to_string()),
            ..Default::default()
        };

        let client = UploadClient::new(svc, 6);
        client
            .upload(CONTENT, "foo.txt", options.clone())
            .await
            .unwrap();

        // 显式覆盖：既有完成标记被中止，不走秒传
        let report = client
            .upload(
                CONTENT,
                "foo.txt",
                UploadOptions {
                    override_existing: true,
                    ..options
                },
            )
            .await
            .unwrap();

        assert!(!report.second_pass);
        assert!(report.asset_path.is_some());
    }

    #[tokio::test]
    async fn test_empty_content_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let client = UploadClient::new(service(&temp_dir, false), 6);

        assert!(matches!(
            client.upload(b"", "foo.txt", UploadOptions::default()).await,
            Err(UploadError::MissingFields)
        ));
        assert!(matches!(
            client.upload(CONTENT, "", UploadOptions::default()).await,
            Err(UploadError::MissingFields)
        ));
    }

    /// 每次 accept_chunk 前睡眠，用于制造在途上传窗口
    struct SlowService {
        inner: Arc<dyn UploadService>,
    }

    #[async_trait::async_trait]
    impl UploadService for SlowService {
        async fn status(&self, id: &str) -> Result<StatusOutcome, UploadError> {
            self.inner.status(id).await
        }
        async fn start(
            &self,
            id: &str,
            total: usize,
            filename: &str,
        ) -> Result<StartOutcome, UploadError> {
            self.inner.start(id, total, filename).await
        }
        async fn accept_chunk(
            &self,
            id: &str,
            idx: usize,
            mode: UploadMode,
            payload: &[u8],
        ) -> Result<AcceptOutcome, UploadError> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.inner.accept_chunk(id, idx, mode, payload).await
        }
        async fn end(&self, id: &str) -> Result<EndOutcome, UploadError> {
            self.inner.end(id).await
        }
        async fn abort(&self, id: &str) -> Result<AbortOutcome, UploadError> {
            self.inner.abort(id).await
        }
    }

    #[tokio::test]
    async fn test_busy_client_fails_fast() {
        let temp_dir = TempDir::new().unwrap();
        let slow: Arc<dyn UploadService> = Arc::new(SlowService {
            inner: service(&temp_dir, false),
        });
        let client = Arc::new(UploadClient::new(slow, 6));

        let in_flight = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .upload(CONTENT, "foo.txt", UploadOptions::default())
                    .await
            })
        };

        // 等首个上传进入在途状态
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(
            client
                .upload(CONTENT, "bar.txt", UploadOptions::default())
                .await,
            Err(UploadError::ClientBusy)
        ));

        in_flight.await.unwrap().unwrap();

        // 在途上传结束后客户端重新可用
        client
            .upload(CONTENT, "bar.txt", UploadOptions::default())
            .await
            .unwrap();
    }

    /// accept_chunk 必然失败的服务，用于验证失败路径的通知
    struct FailingService;

    #[async_trait::async_trait]
    impl UploadService for FailingService {
        async fn status(&self, id: &str) -> Result<StatusOutcome, UploadError> {
            Err(UploadError::SessionNotFound(id.to_string()))
        }
        async fn start(
            &self,
            id: &str,
            _total: usize,
            _filename: &str,
        ) -> Result<StartOutcome, UploadError> {
            Ok(StartOutcome {
                id: id.to_string(),
                status: StartStatus::Started,
                target: Some(crate::protocol::ChunkTarget::new(id, 0)),
            })
        }
        async fn accept_chunk(
            &self,
            _id: &str,
            _idx: usize,
            _mode: UploadMode,
            _payload: &[u8],
        ) -> Result<AcceptOutcome, UploadError> {
            Err(UploadError::Io("磁盘写入失败".to_string()))
        }
        async fn end(&self, id: &str) -> Result<EndOutcome, UploadError> {
            Err(UploadError::Incomplete(id.to_string()))
        }
        async fn abort(&self, id: &str) -> Result<AbortOutcome, UploadError> {
            Ok(AbortOutcome {
                id: id.to_string(),
                aborted: false,
            })
        }
    }

    #[tokio::test]
    async fn test_failure_notifies_error_then_end() {
        let observer = Arc::new(RecordingObserver::default());
        let client =
            UploadClient::new(Arc::new(FailingService), 6).with_observer(observer.clone());

        let result = client
            .upload(CONTENT, "foo.txt", UploadOptions::default())
            .await;
        assert!(matches!(result, Err(UploadError::Io(_))));

        assert_eq!(observer.errors.load(Ordering::SeqCst), 1);
        assert_eq!(observer.successes.load(Ordering::SeqCst), 0);
        assert_eq!(observer.ends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_parallel_failure_surfaces_protocol_error() {
        let observer = Arc::new(RecordingObserver::default());
        let client =
            UploadClient::new(Arc::new(FailingService), 6).with_observer(observer.clone());

        let result = client
            .upload(
                CONTENT,
                "foo.txt",
                UploadOptions {
                    concurrency: 2,
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(UploadError::Io(_))));
        assert_eq!(observer.ends.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_count_chunks() {
        assert_eq!(count_chunks(0, 6), 0);
        assert_eq!(count_chunks(6, 6), 1);
        assert_eq!(count_chunks(7, 6), 2);
        assert_eq!(count_chunks(20, 6), 4);
    }

    proptest! {
        /// 切片拼回必须还原原始内容，且片数与 count_chunks 一致
        #[test]
        fn prop_chunk_slicing_roundtrip(
            content in proptest::collection::vec(any::<u8>(), 1..256),
            chunk_size in 1usize..32,
        ) {
            let total = count_chunks(content.len(), chunk_size);

            let mut rebuilt = Vec::new();
            for idx in 0..total {
                let piece = chunk_at(&content, idx, chunk_size);
                prop_assert!(!piece.is_empty());
                prop_assert!(piece.len() <= chunk_size);
                rebuilt.extend_from_slice(piece);
            }

            prop_assert_eq!(rebuilt, content);
        }
    }
}
