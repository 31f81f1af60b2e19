//! 会话模块
//!
//! 本地会话存储：领域模型、持久化 DAO 与带写透的内存存储服务。

pub mod dao;
pub mod models;
pub mod service;

// 重新导出主要类型
pub use dao::{MemoryThreadStorage, SqliteThreadStorage, ThreadStorage};
pub use models::{ConversationKey, ConversationTarget, DeliveryStatus, Message, ThreadSummary};
pub use service::ConversationStore;
