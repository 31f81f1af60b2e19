//! 同步引擎回调接口
//!
//! 引擎不直接渲染界面：线程变化、连接状态、发送失败都通过监听器回调
//! 通知上层，通知汇（NotificationSink）则承载面向操作员的提示条。
//! 回调参数统一为 JSON 字符串，便于跨 FFI/进程边界传递。

use async_trait::async_trait;
use serde::Serialize;

/// 通知严重级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotifySeverity {
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for NotifySeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotifySeverity::Info => write!(f, "INFO"),
            NotifySeverity::Warning => write!(f, "WARNING"),
            NotifySeverity::Error => write!(f, "ERROR"),
        }
    }
}

/// 面向操作员的通知汇（由上层注册，渲染不在本 crate 范围内）
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// 推送一条人类可读的通知
    async fn notify(&self, severity: NotifySeverity, message: String);
}

/// 空通知汇（默认实现）
pub struct EmptyNotificationSink;

#[async_trait]
impl NotificationSink for EmptyNotificationSink {
    async fn notify(&self, _severity: NotifySeverity, _message: String) {}
}

/// 同步监听器回调接口
#[async_trait]
pub trait SyncListener: Send + Sync {
    /// 连接状态变化
    ///
    /// 参数 `state` 是状态的 JSON 字符串表示，例如
    /// `{"state":"ERROR","reason":"NETWORK"}`
    async fn on_connection_state_changed(&self, state: String);

    /// 本地会话新增一条可见消息（乐观写入或远端到达）
    ///
    /// 参数 `message` 是消息的 JSON 字符串表示
    async fn on_new_message(&self, conversation_key: String, message: String);

    /// 会话文稿发生结构性变化（历史合并、临时消息被替换等）
    async fn on_transcript_changed(&self, conversation_key: String);

    /// 会话摘要变化（最新消息、未读数）
    ///
    /// 参数 `summary` 是摘要的 JSON 字符串表示
    async fn on_conversation_changed(&self, summary: String);

    /// 一条外发消息远端落库失败（本地乐观副本保留）
    ///
    /// 参数 `detail` 形如 `{"conversationKey":...,"tempID":...,"reason":...}`
    async fn on_send_failed(&self, detail: String);
}

/// 空监听器（默认实现）
pub struct EmptySyncListener;

#[async_trait]
impl SyncListener for EmptySyncListener {
    async fn on_connection_state_changed(&self, _state: String) {}
    async fn on_new_message(&self, _conversation_key: String, _message: String) {}
    async fn on_transcript_changed(&self, _conversation_key: String) {}
    async fn on_conversation_changed(&self, _summary: String) {}
    async fn on_send_failed(&self, _detail: String) {}
}
