//! 传输边界类型
//!
//! 远端日志与变更订阅使用同一种消息记录形态。所有来自传输层的动态载荷
//! 在本模块转换为经过校验的领域消息，不合法的载荷在边界即被拒绝。

use serde::{Deserialize, Serialize};

use crate::im::conversation::{DeliveryStatus, Message};
use crate::im::sync::SyncError;

/// 远端日志存储未开通时服务器返回的业务错误码
pub const ERR_CODE_LOG_NOT_PROVISIONED: i32 = 1004;

/// 统一的 API 响应包装结构体（包含 errCode、errMsg、data）
/// data 字段可能为 null 或缺失，因此使用 Option<T>
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    #[serde(rename = "errCode")]
    pub err_code: i32,
    #[serde(rename = "errMsg")]
    pub err_msg: String,
    pub data: Option<T>,
}

/// 远端消息记录（服务器与变更订阅共用的记录形态）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    /// 消息 ID（远端分配的 UUID）
    pub id: String,
    /// 发送者 ID
    #[serde(rename = "senderID")]
    pub sender_id: String,
    /// 发送者显示名
    pub sender_name: String,
    /// 正文
    pub text: String,
    /// 创建时间（Unix 毫秒）
    pub timestamp: i64,
    /// 投递状态
    pub status: DeliveryStatus,
}

impl MessageRecord {
    /// 校验并转换为领域消息
    ///
    /// 缺失关键字段的记录视为解析失败，调用方按 DECODE 处理（丢弃并记录），
    /// 不会以半成品形态进入本地会话。
    pub fn try_into_message(self) -> Result<Message, SyncError> {
        if self.id.is_empty() {
            return Err(SyncError::Decode("消息记录缺少 id".to_string()));
        }
        if self.sender_id.is_empty() {
            return Err(SyncError::Decode(format!(
                "消息记录缺少 senderID: id={}",
                self.id
            )));
        }
        if self.timestamp <= 0 {
            return Err(SyncError::Decode(format!(
                "消息记录时间戳非法: id={}, timestamp={}",
                self.id, self.timestamp
            )));
        }
        Ok(Message {
            id: self.id,
            sender_id: self.sender_id,
            sender_name: self.sender_name,
            text: self.text,
            created_at: self.timestamp,
            status: self.status,
        })
    }

    /// 从领域消息构造发送用的记录
    pub fn from_message(msg: &Message) -> Self {
        Self {
            id: msg.id.clone(),
            sender_id: msg.sender_id.clone(),
            sender_name: msg.sender_name.clone(),
            text: msg.text.clone(),
            timestamp: msg.created_at,
            status: msg.status,
        }
    }
}

/// 通用 HTTP 响应处理：读取 body、检查 HTTP 状态与业务错误码，再反序列化
///
/// 失败分类：
/// - HTTP 404 或业务错误码 [`ERR_CODE_LOG_NOT_PROVISIONED`] → 配置错误（远端日志未开通，重试无意义）
/// - 其他非 2xx / 非零错误码 → 网络/服务端瞬时错误（可手动重试）
/// - body 无法按预期结构解析 → 解析错误
pub async fn handle_http_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    operation_name: &str,
) -> Result<ApiResponse<T>, SyncError> {
    use tracing::{debug, error};

    let status = response.status();

    // 读取 body bytes（只能读取一次）
    let body_bytes = response
        .bytes()
        .await
        .map_err(|e| SyncError::Network(format!("{}读取响应失败: {}", operation_name, e)))?;
    let body_str = String::from_utf8_lossy(&body_bytes);

    if status == reqwest::StatusCode::NOT_FOUND {
        error!(
            "[HTTP] {}目标资源不存在（日志存储未开通？），HTTP状态: {}",
            operation_name, status
        );
        return Err(SyncError::Configuration(format!(
            "{}目标资源不存在: HTTP {}",
            operation_name, status
        )));
    }
    if !status.is_success() {
        error!(
            "[HTTP] {}请求失败，HTTP状态: {}, 响应: {}",
            operation_name, status, body_str
        );
        return Err(SyncError::Network(format!(
            "{}HTTP 错误 {}: {}",
            operation_name, status, body_str
        )));
    }
    debug!("[HTTP] {}请求成功，HTTP状态: {}", operation_name, status);

    // 从 bytes 反序列化（body 已经被消费）
    let api_resp: ApiResponse<T> = serde_json::from_slice(&body_bytes).map_err(|e| {
        error!(
            "[HTTP] {}反序列化失败: {:?}, 原始响应: {}",
            operation_name, e, body_str
        );
        SyncError::Decode(format!("{}响应反序列化失败: {}", operation_name, e))
    })?;

    // 检查业务错误码
    if api_resp.err_code == ERR_CODE_LOG_NOT_PROVISIONED {
        error!(
            "[HTTP] {}远端日志存储未开通，错误码: {}, 错误信息: {}",
            operation_name, api_resp.err_code, api_resp.err_msg
        );
        return Err(SyncError::Configuration(format!(
            "{}远端日志存储未开通: {}",
            operation_name, api_resp.err_msg
        )));
    }
    if api_resp.err_code != 0 {
        error!(
            "[HTTP] {}服务器错误，错误码: {}, 错误信息: {}",
            operation_name, api_resp.err_code, api_resp.err_msg
        );
        return Err(SyncError::Network(format!(
            "{}服务器错误 {}: {}",
            operation_name, api_resp.err_code, api_resp.err_msg
        )));
    }

    Ok(api_resp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_decodes_from_camel_case_wire_shape() {
        let json = r#"{
            "id": "9b2d7c1e-6f3a-4f6e-9a5d-1f2e3d4c5b6a",
            "senderID": "op_1001",
            "senderName": "前台-小李",
            "text": "3 号桌加一份套餐",
            "timestamp": 1754300000000,
            "status": "SENT"
        }"#;
        let record: MessageRecord = serde_json::from_str(json).expect("应能解析");
        let msg = record.try_into_message().expect("应能转换");
        assert_eq!(msg.sender_id, "op_1001");
        assert_eq!(msg.status, DeliveryStatus::Sent);
        assert_eq!(msg.created_at, 1754300000000);
    }

    #[test]
    fn record_missing_fields_is_rejected_as_decode_error() {
        let record = MessageRecord {
            id: String::new(),
            sender_id: "op_1001".to_string(),
            sender_name: String::new(),
            text: "hello".to_string(),
            timestamp: 1,
            status: DeliveryStatus::Sent,
        };
        let err = record.try_into_message().unwrap_err();
        assert!(matches!(err, SyncError::Decode(_)));

        let record = MessageRecord {
            id: "m1".to_string(),
            sender_id: "op_1001".to_string(),
            sender_name: String::new(),
            text: "hello".to_string(),
            timestamp: 0,
            status: DeliveryStatus::Sent,
        };
        let err = record.try_into_message().unwrap_err();
        assert!(matches!(err, SyncError::Decode(_)));
    }

    #[test]
    fn unknown_status_fails_deserialization() {
        let json = r#"{
            "id": "m1",
            "senderID": "op_1001",
            "senderName": "",
            "text": "hello",
            "timestamp": 1,
            "status": "EXPLODED"
        }"#;
        assert!(serde_json::from_str::<MessageRecord>(json).is_err());
    }
}
