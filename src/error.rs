// 上传协议错误类型
//
// 所有协议层错误都是可恢复的：映射为结构化错误响应，不产生未处理故障。
// 每个变体携带稳定的线上错误码（code），供传输适配层直接写入响应体。

use crate::session::UploadMode;

/// 上传协议错误
#[derive(Debug)]
pub enum UploadError {
    /// 缺少必填字段（id / total / filename）
    MissingFields,
    /// 会话不存在
    SessionNotFound(String),
    /// 存储条目结构校验失败（缺少 cur / total）
    Conflict(String),
    /// 分片索引越界
    OutOfRange { idx: usize, total: usize },
    /// 串行模式下重复提交已接收的分片
    Duplicated { idx: usize, cur: usize },
    /// 串行模式下提前提交尚不可达的分片
    Inaccessible { idx: usize, cur: usize },
    /// 无法识别的上传模式
    UnsupportedMode(String),
    /// 会话模式与首个分片确定的模式不一致
    ModeConflict {
        expected: UploadMode,
        got: UploadMode,
    },
    /// 分片不完整，无法装配
    Incomplete(String),
    /// 客户端已有上传任务进行中
    ClientBusy,
    /// 分片或元数据持久化失败
    Io(String),
}

impl UploadError {
    /// 稳定的线上错误码
    ///
    /// 传输适配层按此码构造错误响应，不依赖 Display 文案。
    pub fn code(&self) -> &'static str {
        match self {
            UploadError::MissingFields => "missing-fields",
            UploadError::SessionNotFound(_) => "unexist",
            UploadError::Conflict(_) => "conflict",
            UploadError::OutOfRange { .. } => "out-of-range",
            UploadError::Duplicated { .. } => "duplicated",
            UploadError::Inaccessible { .. } => "inaccessible",
            UploadError::UnsupportedMode(_) => "unsupported-mode",
            UploadError::ModeConflict { .. } => "mode-conflict",
            UploadError::Incomplete(_) => "incomplete",
            UploadError::ClientBusy => "busy",
            UploadError::Io(_) => "io",
        }
    }

    /// 错误是否应保留会话状态（客户端可重试）
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            UploadError::Incomplete(_)
                | UploadError::Io(_)
                | UploadError::Duplicated { .. }
                | UploadError::Inaccessible { .. }
        )
    }
}

impl std::fmt::Display for UploadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadError::MissingFields => write!(f, "缺少必填字段"),
            UploadError::SessionNotFound(id) => write!(f, "会话不存在: {}", id),
            UploadError::Conflict(id) => write!(f, "会话元数据结构无效: {}", id),
            UploadError::OutOfRange { idx, total } => {
                write!(f, "分片索引越界: idx={}, total={}", idx, total)
            }
            UploadError::Duplicated { idx, cur } => {
                write!(f, "分片重复提交: idx={}, cur={}", idx, cur)
            }
            UploadError::Inaccessible { idx, cur } => {
                write!(f, "分片尚不可提交: idx={}, cur={}", idx, cur)
            }
            UploadError::UnsupportedMode(mode) => write!(f, "不支持的上传模式: {}", mode),
            UploadError::ModeConflict { expected, got } => {
                write!(f, "会话模式冲突: 期望 {}, 收到 {}", expected, got)
            }
            UploadError::Incomplete(id) => write!(f, "分片不完整，无法装配: {}", id),
            UploadError::ClientBusy => write!(f, "已有上传任务进行中"),
            UploadError::Io(msg) => write!(f, "IO 错误: {}", msg),
        }
    }
}

impl std::error::Error for UploadError {}

impl From<std::io::Error> for UploadError {
    fn from(e: std::io::Error) -> Self {
        UploadError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for UploadError {
    fn from(e: serde_json::Error) -> Self {
        UploadError::Io(format!("序列化失败: {}", e))
    }
}
