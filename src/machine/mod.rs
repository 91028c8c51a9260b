// 上传会话状态机
//
// 会话生命周期的唯一裁决者：创建 / 续传 / 秒传短路、分片接受的
// 串行与并行守卫、完成检测、装配与中止。
//
// 存储契约不保证跨调用方的读改写原子性，因此这里按会话 id 持锁，
// 把 get -> 修改 -> set 整段串行化，封死并发分片提交下 `cur` 的
// 丢失更新竞态。不同会话之间互不阻塞。

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::UploadConfig;
use crate::error::UploadError;
use crate::protocol::{
    AbortOutcome, AcceptOutcome, ChunkStatus, ChunkTarget, EndOutcome, StartOutcome, StartStatus,
    StatusOutcome, UploadService,
};
use crate::session::{UploadMode, UploadSession};
use crate::storage::{ChunkAssembler, ChunkBlobRepository};
use crate::store::SessionStore;

/// 资产装配完成通知回调
pub type OnUploaded = Arc<dyn Fn(&Path) + Send + Sync>;

/// 上传会话状态机
pub struct UploadStateMachine {
    store: Arc<dyn SessionStore>,
    repo: ChunkBlobRepository,
    assembler: ChunkAssembler,
    second_pass: bool,
    on_uploaded: Option<OnUploaded>,
    /// 按会话 id 的互斥锁注册表
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl UploadStateMachine {
    /// 创建状态机
    ///
    /// 存储实例显式注入，不使用任何进程级单例。
    pub fn new(store: Arc<dyn SessionStore>, config: &UploadConfig) -> Self {
        let repo = ChunkBlobRepository::new(&config.chunks_dir);
        let assembler = ChunkAssembler::new(repo.clone(), &config.assets_dir);

        Self {
            store,
            repo,
            assembler,
            second_pass: config.second_pass,
            on_uploaded: None,
            locks: DashMap::new(),
        }
    }

    /// 注册资产装配完成通知
    pub fn with_on_uploaded(mut self, hook: OnUploaded) -> Self {
        self.on_uploaded = Some(hook);
        self
    }

    /// 取出该会话的互斥锁
    fn session_lock(&self, id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// 查询会话状态
    pub async fn status(&self, id: &str) -> Result<StatusOutcome, UploadError> {
        let session = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| UploadError::SessionNotFound(id.to_string()))?;

        Ok(StatusOutcome {
            id: id.to_string(),
            status: if session.done {
                ChunkStatus::Done
            } else {
                ChunkStatus::Pending
            },
        })
    }

    /// 创建 / 续传 / 秒传短路一个上传会话
    pub async fn start(
        &self,
        id: &str,
        total: usize,
        filename: &str,
    ) -> Result<StartOutcome, UploadError> {
        if id.is_empty() || filename.is_empty() || total == 0 {
            return Err(UploadError::MissingFields);
        }

        let lock = self.session_lock(id);
        let _guard = lock.lock().await;

        match self.store.get(id).await? {
            // 秒传：已完成的会话不再产生任何分片工作
            Some(session) if session.done && self.second_pass => {
                info!("秒传命中: id={}, filename={}", id, session.filename);
                Ok(StartOutcome {
                    id: id.to_string(),
                    status: StartStatus::Exists,
                    target: None,
                })
            }
            // 已完成但未启用秒传：显式重新开始全新会话
            Some(session) if session.done => {
                debug!("会话已完成且未启用秒传，重新开始: id={}", id);
                self.store
                    .set(id, UploadSession::new(total, filename))
                    .await?;
                Ok(self.started(id, 0))
            }
            // 幂等续传：不触碰已有进度，返回与存储 cur 一致的目标
            Some(session) => {
                debug!("会话续传: id={}, cur={}/{}", id, session.cur, session.total);
                Ok(self.started(id, session.cur))
            }
            // 全新会话
            None => {
                self.store
                    .set(id, UploadSession::new(total, filename))
                    .await?;
                info!("会话创建: id={}, total={}, filename={}", id, total, filename);
                Ok(self.started(id, 0))
            }
        }
    }

    fn started(&self, id: &str, idx: usize) -> StartOutcome {
        StartOutcome {
            id: id.to_string(),
            status: StartStatus::Started,
            target: Some(ChunkTarget::new(id, idx)),
        }
    }

    /// 提交一个分片
    pub async fn accept_chunk(
        &self,
        id: &str,
        idx: usize,
        mode: UploadMode,
        payload: &[u8],
    ) -> Result<AcceptOutcome, UploadError> {
        let lock = self.session_lock(id);
        let _guard = lock.lock().await;

        let mut session = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| UploadError::SessionNotFound(id.to_string()))?;

        if idx > session.total {
            return Err(UploadError::OutOfRange {
                idx,
                total: session.total,
            });
        }

        // 会话模式由首个分片确定，之后不允许切换
        if let Some(expected) = session.mode {
            if expected != mode {
                return Err(UploadError::ModeConflict {
                    expected,
                    got: mode,
                });
            }
        }

        // 已饱和的会话不再接受写入
        if session.done {
            return Ok(AcceptOutcome {
                id: id.to_string(),
                status: ChunkStatus::Done,
                target: None,
            });
        }

        let write_idx = match mode {
            // 串行：只接受下一个期望索引
            UploadMode::Serial => {
                if idx < session.cur {
                    return Err(UploadError::Duplicated {
                        idx,
                        cur: session.cur,
                    });
                }
                if idx > session.cur {
                    return Err(UploadError::Inaccessible {
                        idx,
                        cur: session.cur,
                    });
                }
                session.cur
            }
            // 并行：按调用方给定索引落盘，到达顺序无约束，
            // 但索引必须是真实分片索引
            UploadMode::Parallel => {
                if idx >= session.total {
                    return Err(UploadError::OutOfRange {
                        idx,
                        total: session.total,
                    });
                }
                idx
            }
        };

        // 分片落盘失败时会话保持原样，客户端可重试同一分片
        self.repo.write(id, write_idx, payload).await?;

        session.mode = Some(mode);
        let is_new = session.mark_received(write_idx);
        self.store.set(id, session.clone()).await?;

        if !is_new {
            debug!("分片重复提交（并行幂等覆盖）: id={}, idx={}", id, write_idx);
        }

        debug!(
            "分片已接受: id={}, idx={}, 进度 {}/{}",
            id, write_idx, session.cur, session.total
        );

        if session.done {
            Ok(AcceptOutcome {
                id: id.to_string(),
                status: ChunkStatus::Done,
                target: None,
            })
        } else {
            // 串行模式返回下一个提交目标，并行模式由调用方自行派发
            let target = match mode {
                UploadMode::Serial => Some(ChunkTarget::new(id, session.cur)),
                UploadMode::Parallel => None,
            };
            Ok(AcceptOutcome {
                id: id.to_string(),
                status: ChunkStatus::Pending,
                target,
            })
        }
    }

    /// 结束上传：校验完整性、装配资产、清理分片
    ///
    /// 完整性校验失败时所有状态保持不动，客户端可以补传后重试。
    /// 成功后会话条目保留为完成标记，供后续秒传检测。
    pub async fn end(&self, id: &str) -> Result<EndOutcome, UploadError> {
        let lock = self.session_lock(id);
        let _guard = lock.lock().await;

        let mut session = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| UploadError::SessionNotFound(id.to_string()))?;

        if !self.assembler.validate_complete(id, session.total).await {
            return Err(UploadError::Incomplete(id.to_string()));
        }

        let asset_path = self
            .assembler
            .assemble(id, session.total, &session.filename)
            .await?;

        // 分片清理尽力而为，不阻塞完成响应
        self.assembler.clear(id, session.total).await;

        // 会话条目对齐为完成标记
        if !session.done {
            session.cur = session.total;
            session.done = true;
            session.touch();
            self.store.set(id, session.clone()).await?;
        }

        if let Some(hook) = &self.on_uploaded {
            hook(&asset_path);
        }

        info!("上传完成: id={}, 资产={:?}", id, asset_path);

        Ok(EndOutcome {
            id: id.to_string(),
            asset_path,
        })
    }

    /// 中止上传：删除会话条目与全部临时分片
    ///
    /// 锁条目不随会话删除：同一 id 的锁身份必须终身稳定，否则
    /// 正在等锁的提交会在会话重建后与新调用方各持一把锁，
    /// 按 id 串行化即告失效。每个 id 只留一个小 Arc，增长有界。
    pub async fn abort(&self, id: &str) -> Result<AbortOutcome, UploadError> {
        let lock = self.session_lock(id);
        let _guard = lock.lock().await;

        let session = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| UploadError::SessionNotFound(id.to_string()))?;

        let removed = self.store.delete(id).await?;
        if removed {
            self.assembler.clear(id, session.total).await;
            info!("会话已中止: id={}", id);
        }

        Ok(AbortOutcome {
            id: id.to_string(),
            aborted: removed,
        })
    }
}

#[async_trait::async_trait]
impl UploadService for UploadStateMachine {
    async fn status(&self, id: &str) -> Result<StatusOutcome, UploadError> {
        UploadStateMachine::status(self, id).await
    }

    async fn start(
        &self,
        id: &str,
        total: usize,
        filename: &str,
    ) -> Result<StartOutcome, UploadError> {
        UploadStateMachine::start(self, id, total, filename).await
    }

    async fn accept_chunk(
        &self,
        id: &str,
        idx: usize,
        mode: UploadMode,
        payload: &[u8],
    ) -> Result<AcceptOutcome, UploadError> {
        UploadStateMachine::accept_chunk(self, id, idx, mode, payload).await
    }

    async fn end(&self, id: &str) -> Result<EndOutcome, UploadError> {
        UploadStateMachine::end(self, id).await
    }

    async fn abort(&self, id: &str) -> Result<AbortOutcome, UploadError> {
        UploadStateMachine::abort(self, id).await
    }
}
