//! 变更订阅帧类型
//!
//! 订阅通道上的帧都是 JSON 文本：上行一个订阅请求帧，下行状态帧与
//! 插入事件帧。不符合任一形态的帧在边界拒绝，由调用方丢弃并记录。

use serde::{Deserialize, Serialize};

use crate::im::sync::SyncError;
use crate::im::types::MessageRecord;

/// 订阅生命周期状态流
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStatus {
    /// 握手进行中
    Connecting,
    /// 服务器已确认订阅
    Subscribed,
    /// 频道错误（服务器上报或连接中断）
    ChannelError,
    /// 握手未在时限内确认
    TimedOut,
    /// 订阅关闭
    Closed,
}

impl std::fmt::Display for FeedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedStatus::Connecting => write!(f, "CONNECTING"),
            FeedStatus::Subscribed => write!(f, "SUBSCRIBED"),
            FeedStatus::ChannelError => write!(f, "CHANNEL_ERROR"),
            FeedStatus::TimedOut => write!(f, "TIMED_OUT"),
            FeedStatus::Closed => write!(f, "CLOSED"),
        }
    }
}

/// 上行订阅请求帧（按会话键过滤插入事件）
#[derive(Debug, Serialize)]
pub struct SubscribeFrame {
    pub action: String,
    #[serde(rename = "conversationKey")]
    pub conversation_key: String,
    #[serde(rename = "operationID")]
    pub operation_id: String,
}

impl SubscribeFrame {
    pub fn new(conversation_key: &str, operation_id: &str) -> Self {
        Self {
            action: "subscribe".to_string(),
            conversation_key: conversation_key.to_string(),
            operation_id: operation_id.to_string(),
        }
    }
}

/// 下行帧
#[derive(Debug)]
pub enum FeedFrame {
    /// 状态帧：`{"status":"subscribed"}` / `{"status":"error","reason":...}`
    Status { status: String, reason: String },
    /// 事件帧：`{"event":"insert","conversationKey":...,"record":{...}}`
    Event {
        event: String,
        conversation_key: String,
        record: MessageRecord,
    },
}

/// 解析一帧下行文本
pub fn decode_frame(text: &str) -> Result<FeedFrame, SyncError> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| SyncError::Decode(format!("订阅帧不是合法 JSON: {}", e)))?;

    if value.get("status").is_some() {
        #[derive(Deserialize)]
        struct StatusFrame {
            status: String,
            #[serde(default)]
            reason: String,
        }
        let frame: StatusFrame = serde_json::from_value(value)
            .map_err(|e| SyncError::Decode(format!("状态帧解析失败: {}", e)))?;
        return Ok(FeedFrame::Status {
            status: frame.status,
            reason: frame.reason,
        });
    }

    if value.get("event").is_some() {
        #[derive(Deserialize)]
        struct EventFrame {
            event: String,
            #[serde(rename = "conversationKey")]
            conversation_key: String,
            record: MessageRecord,
        }
        let frame: EventFrame = serde_json::from_value(value)
            .map_err(|e| SyncError::Decode(format!("事件帧解析失败: {}", e)))?;
        return Ok(FeedFrame::Event {
            event: frame.event,
            conversation_key: frame.conversation_key,
            record: frame.record,
        });
    }

    Err(SyncError::Decode(
        "订阅帧缺少 status/event 字段".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_status_frame() {
        let frame = decode_frame(r#"{"status":"subscribed"}"#).unwrap();
        match frame {
            FeedFrame::Status { status, reason } => {
                assert_eq!(status, "subscribed");
                assert!(reason.is_empty());
            }
            _ => panic!("应为状态帧"),
        }
    }

    #[test]
    fn decodes_event_frame() {
        let text = r#"{
            "event": "insert",
            "conversationKey": "ch_ops",
            "record": {
                "id": "m1",
                "senderID": "op_2002",
                "senderName": "后厨-老王",
                "text": "好的",
                "timestamp": 1754300000000,
                "status": "SENT"
            }
        }"#;
        match decode_frame(text).unwrap() {
            FeedFrame::Event {
                event,
                conversation_key,
                record,
            } => {
                assert_eq!(event, "insert");
                assert_eq!(conversation_key, "ch_ops");
                assert_eq!(record.id, "m1");
            }
            _ => panic!("应为事件帧"),
        }
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(decode_frame("not json").is_err());
        assert!(decode_frame(r#"{"hello":"world"}"#).is_err());
        // 事件帧里的记录形态不对也拒绝
        assert!(decode_frame(r#"{"event":"insert","conversationKey":"ch_ops","record":{}}"#).is_err());
    }
}
