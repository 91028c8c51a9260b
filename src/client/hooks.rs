// 上传生命周期观察者
//
// 客户端在上传各阶段发出类型化通知。所有方法都有空默认实现，
// 实现方只需覆盖关心的阶段。
//
// 一次上传的触发约定：
//   - `on_start` 恰好一次（会话建立后）
//   - `on_chunk_uploaded` 每确认一个分片一次
//   - `on_second_pass` 秒传命中时恰好一次（此时不再有分片通知）
//   - `on_success` / `on_error` 二选一，至多一次
//   - `on_end` 无论成败恰好一次，且总在最后

use std::path::Path;

use crate::error::UploadError;

/// 上传进度快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadProgress {
    /// 已确认分片数
    pub cur: usize,
    /// 分片总数
    pub total: usize,
    /// 目标文件名
    pub filename: String,
}

impl UploadProgress {
    /// 进度比例，范围 [0.0, 1.0]
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.cur as f64 / self.total as f64
    }
}

/// 上传生命周期观察者
pub trait UploadObserver: Send + Sync {
    /// 会话已建立（含续传）
    fn on_start(&self, _id: &str, _total: usize, _filename: &str) {}

    /// 一个分片已被服务端确认
    fn on_chunk_uploaded(&self, _progress: &UploadProgress) {}

    /// 秒传命中，本次上传不产生分片传输
    fn on_second_pass(&self, _id: &str) {}

    /// 上传成功，最终资产已装配完成
    fn on_success(&self, _id: &str, _asset_path: &Path) {}

    /// 上传失败
    fn on_error(&self, _id: &str, _error: &UploadError) {}

    /// 上传结束（成功、失败或秒传）
    fn on_end(&self, _id: &str) {}
}
