// Chunkup Rust Library
// 断点续传分片上传协议核心库

// 错误类型模块
pub mod error;

// 配置管理模块
pub mod config;

// 日志系统模块
pub mod logging;

// 上传会话模块
pub mod session;

// 会话元数据存储模块
pub mod store;

// 分片物理存储模块
pub mod storage;

// 上传协议模块
pub mod protocol;

// 会话状态机模块
pub mod machine;

// 有界并发任务队列模块
pub mod scheduler;

// 上传客户端模块
pub mod client;

// 导出常用类型
pub use client::{UploadClient, UploadObserver, UploadOptions, UploadProgress, UploadReport};
pub use config::{AppConfig, LogConfig, UploadConfig};
pub use error::UploadError;
pub use logging::{init_logging, LogGuard};
pub use machine::UploadStateMachine;
pub use protocol::{
    AbortOutcome, AcceptOutcome, ChunkStatus, ChunkTarget, EndOutcome, StartOutcome, StartStatus,
    StatusOutcome, UploadService,
};
pub use scheduler::TaskQueue;
pub use session::{UploadMode, UploadSession};
pub use storage::{ChunkAssembler, ChunkBlobRepository};
pub use store::{JsonSessionStore, MemorySessionStore, SessionStore};
