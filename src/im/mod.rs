pub mod client;
pub mod connection;
pub mod conversation;
pub mod feed;
pub mod listener;
pub mod reconcile;
pub mod serialization;
pub mod sync;
pub mod types;

// 重新导出同步引擎的核心入口
pub use client::{ClientConfig, SyncClient};
pub use conversation::{ConversationKey, ConversationStore, Message};
pub use sync::{MessageSyncer, SyncError};
