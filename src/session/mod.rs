// 上传会话元数据
//
// 会话是某次上传在服务端的唯一进度记录，由 SessionStore 独占持有，
// 状态机在每次操作开始时取出快照、修改后显式写回。

use bit_set::BitSet;
use serde::{Deserialize, Serialize};

use crate::error::UploadError;

/// 上传模式
///
/// 由会话内首个被接受的分片确定，之后不允许切换。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UploadMode {
    /// 串行：分片必须按索引严格递增提交
    Serial,
    /// 并行：分片可乱序并发提交，按索引集合判定完成
    Parallel,
}

impl std::fmt::Display for UploadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadMode::Serial => write!(f, "serial"),
            UploadMode::Parallel => write!(f, "parallel"),
        }
    }
}

impl std::str::FromStr for UploadMode {
    type Err = UploadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "serial" => Ok(UploadMode::Serial),
            "parallel" => Ok(UploadMode::Parallel),
            other => Err(UploadError::UnsupportedMode(other.to_string())),
        }
    }
}

/// 上传会话元数据
///
/// 不变量：`0 <= cur <= total`；`done == (cur >= total)`。
/// 并行模式下 `cur` 由 `received` 的基数推导，重复提交不会虚增进度。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    /// 分片总数（创建时固定，>= 1）
    pub total: usize,
    /// 已接受的分片数；串行模式下同时是下一个期望索引
    pub cur: usize,
    /// 目标资产文件名（创建时固定）
    pub filename: String,
    /// 是否已全部接收
    pub done: bool,
    /// 上传模式，首个分片到达前为 None
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<UploadMode>,
    /// 已接收的分片索引集合
    #[serde(default, with = "bitset_indices")]
    pub received: BitSet,
    /// 创建时间 (Unix timestamp, ms)
    #[serde(default)]
    pub created_at: i64,
    /// 最近更新时间 (Unix timestamp, ms)
    #[serde(default)]
    pub updated_at: i64,
}

impl UploadSession {
    /// 创建全新会话
    pub fn new(total: usize, filename: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            total,
            cur: 0,
            filename: filename.into(),
            done: false,
            mode: None,
            received: BitSet::with_capacity(total),
            created_at: now,
            updated_at: now,
        }
    }

    /// 记录一个分片已接收
    ///
    /// 返回该索引是否为首次接收。`cur` 始终从集合基数推导，
    /// `done` 随之同步，保证不变量在任何提交序列下成立。
    pub fn mark_received(&mut self, idx: usize) -> bool {
        let is_new = self.received.insert(idx);
        self.cur = self.received.len().min(self.total);
        self.done = self.cur >= self.total;
        self.touch();
        is_new
    }

    /// 刷新更新时间戳
    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().timestamp_millis();
    }

    /// 上传进度（0.0 - 100.0）
    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.cur as f64 / self.total as f64) * 100.0
    }
}

/// BitSet 与有序索引列表之间的 serde 转换
mod bitset_indices {
    use bit_set::BitSet;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(set: &BitSet, serializer: S) -> Result<S::Ok, S::Error> {
        let indices: Vec<usize> = set.iter().collect();
        indices.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BitSet, D::Error> {
        let indices = Vec::<usize>::deserialize(deserializer)?;
        let mut set = BitSet::new();
        for idx in indices {
            set.insert(idx);
        }
        Ok(set)
    }
}
