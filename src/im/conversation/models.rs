//! 会话领域模型

use serde::{Deserialize, Serialize};

use crate::im::serialization::LOCAL_MSG_ID_PREFIX;

/// 会话键
///
/// 对同一线程的任何指称都必须折叠到同一个键上：
/// - 单聊：两个参与者 ID 排序后拼接，`si_{小}_{大}`，与方向无关；
/// - 广播频道：频道静态 ID，`ch_{频道ID}`。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationKey(String);

impl ConversationKey {
    /// 单聊会话键（参与者顺序无关）
    pub fn direct(a: &str, b: &str) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("si_{}_{}", lo, hi))
    }

    /// 广播频道会话键
    pub fn channel(channel_id: &str) -> Self {
        Self(format!("ch_{}", channel_id))
    }

    /// 从已持久化的键字符串还原
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 会话选择目标（由界面层传入，引擎折算为 [`ConversationKey`]）
#[derive(Debug, Clone)]
pub enum ConversationTarget {
    /// 与另一位员工的单聊
    Direct { peer_id: String },
    /// 广播频道（如全员通告）
    Channel { channel_id: String },
}

impl ConversationTarget {
    /// 结合当前操作员 ID 计算会话键
    pub fn key(&self, operator_id: &str) -> ConversationKey {
        match self {
            ConversationTarget::Direct { peer_id } => ConversationKey::direct(operator_id, peer_id),
            ConversationTarget::Channel { channel_id } => ConversationKey::channel(channel_id),
        }
    }
}

/// 投递状态（三态，允许且仅允许前向迁移 Sent → Delivered → Read）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
}

/// 消息
///
/// `id` 要么是远端分配的 UUID，要么是带 `local_` 前缀的临时 ID（乐观写入，
/// 等待远端确认后被替换）。远端落库后除投递状态外不可变。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    #[serde(rename = "senderID")]
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
    /// 创建时间（Unix 毫秒），线程内的排序键
    pub created_at: i64,
    pub status: DeliveryStatus,
}

impl Message {
    /// 是否为尚未获得远端确认的临时消息
    pub fn is_temporary(&self) -> bool {
        self.id.starts_with(LOCAL_MSG_ID_PREFIX)
    }
}

/// 会话摘要（会话列表一行：最新消息预览、未读数）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadSummary {
    pub conversation_key: String,
    /// 列表展示名（单聊取对端显示名，频道取频道 ID）
    pub show_name: String,
    /// 最新消息预览（截断）
    pub latest_msg: String,
    /// 最新消息时间（Unix 毫秒）
    pub latest_msg_send_time: i64,
    pub unread_count: i32,
}

impl ThreadSummary {
    pub fn new(conversation_key: &ConversationKey) -> Self {
        Self {
            conversation_key: conversation_key.to_string(),
            show_name: String::new(),
            latest_msg: String::new(),
            latest_msg_send_time: 0,
            unread_count: 0,
        }
    }
}
