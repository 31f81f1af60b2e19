//! 远端同步模块
//!
//! 追赶拉取与外发写入：HTTP API 层、错误分类与同步服务层。

pub mod api;
pub mod error;
pub mod service;

// 重新导出主要类型
pub use api::MessageLogApi;
pub use error::SyncError;
pub use service::{MessageSyncer, SyncerConfig};
