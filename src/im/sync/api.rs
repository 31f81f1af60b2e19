//! 远端消息日志 HTTP API 客户端
//!
//! 负责所有与远端日志的 HTTP 请求：按会话键的有界历史拉取、单条记录
//! 写入，以及诊断用的可达性探测。

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::im::connection::ProbeOutcome;
use crate::im::conversation::ConversationKey;
use crate::im::sync::error::SyncError;
use crate::im::types::{handle_http_response, MessageRecord};

/// 消息日志 API 客户端
#[derive(Clone)]
pub struct MessageLogApi {
    client: reqwest::Client,
    api_base_url: String,
    operator_id: String,
}

impl MessageLogApi {
    /// 创建新的 API 客户端
    ///
    /// `client` 在外部构建，同一进程内共享连接池
    pub fn new(client: reqwest::Client, api_base_url: String, operator_id: String) -> Self {
        Self {
            client,
            api_base_url,
            operator_id,
        }
    }

    /// 拉取指定会话最近的至多 `limit` 条记录（按时间戳升序返回）
    pub async fn pull_messages(
        &self,
        key: &ConversationKey,
        limit: u32,
    ) -> Result<Vec<MessageRecord>, SyncError> {
        let operation_id = Uuid::new_v4().to_string();
        let url = format!("{}/msg/pull_messages", self.api_base_url);

        info!(
            "[SyncAPI] 📡 请求历史拉取: conversationKey={}, limit={}",
            key, limit
        );
        debug!(
            "[SyncAPI]   请求URL: {}, 操作ID: {}",
            url, operation_id
        );

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("operationID", &operation_id)
            .json(&serde_json::json!({
                "conversationKey": key.as_str(),
                "limit": limit,
                "operatorID": self.operator_id,
            }))
            .send()
            .await
            .map_err(classify_transport_error)?;

        #[derive(Deserialize)]
        struct PullMessagesData {
            messages: Vec<MessageRecord>,
        }

        let api_resp = handle_http_response::<PullMessagesData>(response, "历史拉取").await?;
        let data = api_resp
            .data
            .ok_or_else(|| SyncError::Decode("历史拉取响应缺少 data 字段".to_string()))?;

        info!(
            "[SyncAPI] ✅ 历史拉取响应，记录数: {}",
            data.messages.len()
        );
        Ok(data.messages)
    }

    /// 写入一条记录（调用侧视角 fire-and-forget，结果异步上报）
    ///
    /// 成功时返回远端分配的消息 ID。
    pub async fn insert_message(
        &self,
        key: &ConversationKey,
        record: &MessageRecord,
    ) -> Result<String, SyncError> {
        let operation_id = Uuid::new_v4().to_string();
        let url = format!("{}/msg/send_message", self.api_base_url);

        debug!(
            "[SyncAPI] 📡 写入消息: conversationKey={}, tempID={}, 操作ID: {}",
            key, record.id, operation_id
        );

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("operationID", &operation_id)
            .json(&serde_json::json!({
                "conversationKey": key.as_str(),
                "record": record,
            }))
            .send()
            .await
            .map_err(classify_transport_error)?;

        #[derive(Deserialize)]
        struct SendMessageData {
            #[serde(rename = "serverMsgID")]
            server_msg_id: String,
        }

        let api_resp = handle_http_response::<SendMessageData>(response, "消息写入").await?;
        let data = api_resp
            .data
            .ok_or_else(|| SyncError::Decode("消息写入响应缺少 data 字段".to_string()))?;

        debug!(
            "[SyncAPI] ✅ 消息写入成功: tempID={}, serverMsgID={}",
            record.id, data.server_msg_id
        );
        Ok(data.server_msg_id)
    }

    /// 可达性探测（诊断用，独立于订阅）
    ///
    /// 任何 HTTP 响应（包括 5xx）都证明端点可达；超时或传输错误视为被
    /// 阻断。本方法只做分类，不改变连接状态。
    pub async fn probe(&self, timeout: Duration) -> ProbeOutcome {
        let url = format!("{}/healthz", self.api_base_url);
        info!("[SyncAPI] 🩺 可达性探测: {}", url);

        match self.client.get(&url).timeout(timeout).send().await {
            Ok(resp) => {
                debug!("[SyncAPI] 探测收到响应，HTTP状态: {}", resp.status());
                ProbeOutcome::Reachable
            }
            Err(e) => {
                warn!("[SyncAPI] 探测失败: {}", e);
                ProbeOutcome::Blocked
            }
        }
    }
}

/// reqwest 传输层错误分类
fn classify_transport_error(e: reqwest::Error) -> SyncError {
    if e.is_timeout() {
        SyncError::Timeout(format!("请求超时: {}", e))
    } else {
        error!("[SyncAPI] 传输错误: {}", e);
        SyncError::Network(format!("请求失败: {}", e))
    }
}
