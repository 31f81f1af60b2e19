pub mod im;

// 重新导出常用类型，方便外部使用
pub use im::{
    client::{ClientConfig, SyncClient},
    connection::{ConnectionState, ErrorReason, ProbeOutcome},
    conversation::{
        ConversationKey, ConversationStore, ConversationTarget, DeliveryStatus, Message,
        ThreadSummary,
    },
    feed::FeedStatus,
    listener::{
        EmptyNotificationSink, EmptySyncListener, NotificationSink, NotifySeverity, SyncListener,
    },
    sync::SyncError,
};
