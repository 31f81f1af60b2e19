//! 变更订阅模块
//!
//! 面向当前会话的实时插入事件订阅：帧类型与订阅器。

pub mod subscriber;
pub mod types;

// 重新导出主要类型
pub use subscriber::{FeedConfig, FeedSubscriber};
pub use types::{decode_frame, FeedFrame, FeedStatus, SubscribeFrame};
