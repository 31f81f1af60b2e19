//! 同步服务层
//!
//! 把追赶拉取、乐观发送、订阅事件三条路径收敛到同一个存储与对账入口，
//! 并把每一步的结果翻译成连接状态迁移、诊断日志与操作员通知。

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::im::connection::{ConnectionMonitor, ConnectionState, ErrorReason};
use crate::im::conversation::{ConversationKey, ConversationStore, DeliveryStatus, Message};
use crate::im::feed::FeedStatus;
use crate::im::listener::{NotificationSink, NotifySeverity, SyncListener};
use crate::im::reconcile::{MergeOutcome, SyncEvent};
use crate::im::serialization::{generate_local_msg_id, now_ms};
use crate::im::sync::api::MessageLogApi;
use crate::im::sync::error::SyncError;
use crate::im::types::MessageRecord;

/// 同步服务配置
#[derive(Clone, Debug)]
pub struct SyncerConfig {
    /// 当前操作员 ID
    pub operator_id: String,
    /// 当前操作员显示名
    pub operator_name: String,
    /// 追赶拉取的最大条数
    pub history_limit: u32,
    /// 追赶拉取超时（毫秒）
    pub fetch_timeout_ms: u64,
}

/// 消息同步器
pub struct MessageSyncer {
    config: SyncerConfig,
    /// 未配置远端时为 None（纯本地模式）
    api: Option<MessageLogApi>,
    store: Arc<ConversationStore>,
    monitor: Arc<ConnectionMonitor>,
    listener: Arc<dyn SyncListener>,
    sink: Arc<dyn NotificationSink>,
}

impl MessageSyncer {
    pub fn new(
        config: SyncerConfig,
        api: Option<MessageLogApi>,
        store: Arc<ConversationStore>,
        monitor: Arc<ConnectionMonitor>,
        listener: Arc<dyn SyncListener>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            config,
            api,
            store,
            monitor,
            listener,
            sink,
        }
    }

    pub fn has_remote(&self) -> bool {
        self.api.is_some()
    }

    /// 追赶拉取：取回当前会话最近的历史并合并进本地线程
    ///
    /// 超时按 TIMEOUT 处理而不是无限挂起；成功会解除此前与拉取相关的
    /// ERROR 状态（迁回 CONNECTING，等待订阅确认转 LIVE）。
    pub async fn catch_up(&self, key: &ConversationKey) -> Result<(), SyncError> {
        let Some(api) = &self.api else {
            debug!("[Syncer] 未配置远端，跳过追赶拉取");
            return Ok(());
        };

        info!("[Syncer] 🔄 开始追赶拉取: conversationKey={}", key);
        let fetch = api.pull_messages(key, self.config.history_limit);
        let result = match tokio::time::timeout(
            Duration::from_millis(self.config.fetch_timeout_ms),
            fetch,
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(format!(
                "历史拉取超时（{} 毫秒）: conversationKey={}",
                self.config.fetch_timeout_ms, key
            ))),
        };

        match result {
            Ok(records) => {
                self.record_fetch_success(key, records).await;
                Ok(())
            }
            Err(e) => {
                self.record_fetch_failure(key, &e).await;
                Err(e)
            }
        }
    }

    /// 拉取成功：边界校验 → 对账合并 → 解除拉取相关 ERROR
    async fn record_fetch_success(&self, key: &ConversationKey, records: Vec<MessageRecord>) {
        let total = records.len();
        let mut messages = Vec::with_capacity(total);
        for record in records {
            match record.try_into_message() {
                Ok(m) => messages.push(m),
                Err(e) => {
                    // 半成品记录在边界拒绝，不进入本地会话
                    warn!("[Syncer] ⚠️ 历史记录解析失败，已丢弃: {}", e);
                    self.monitor.note(format!("历史记录解析失败，已丢弃: {}", e));
                }
            }
        }

        self.monitor.set_fetch_ok(true);
        let outcomes = self
            .store
            .apply_event(key, SyncEvent::RemoteHistoryFetched { messages })
            .await;

        let inserted = outcomes
            .iter()
            .filter(|o| matches!(o, MergeOutcome::Inserted))
            .count();
        let replaced = outcomes
            .iter()
            .filter(|o| matches!(o, MergeOutcome::ReplacedTemp { .. }))
            .count();
        info!(
            "[Syncer] ✅ 追赶拉取完成: conversationKey={}, 记录数={}, 新增={}, 替换={}, 重复={}",
            key,
            total,
            inserted,
            replaced,
            outcomes.len() - inserted - replaced
        );

        // 拉取成功解除既往 ERROR（订阅确认后再转 LIVE）
        if matches!(self.monitor.state(), ConnectionState::Error(_)) {
            self.monitor
                .transition(ConnectionState::Connecting, "历史拉取成功，错误状态解除");
        }

        self.listener.on_transcript_changed(key.to_string()).await;
    }

    /// 拉取失败：状态迁移 + 通知，配置性失败与瞬时失败必须可区分
    async fn record_fetch_failure(&self, key: &ConversationKey, e: &SyncError) {
        self.monitor.set_fetch_ok(false);
        self.monitor.transition(
            ConnectionState::Error(e.reason()),
            &format!("历史拉取失败: conversationKey={}, {}", key, e),
        );

        let advice = match e.reason() {
            ErrorReason::Configuration => {
                "远端消息日志未开通，需要运维处理，重试无效".to_string()
            }
            ErrorReason::Timeout => "历史拉取超时，可先诊断连通性再手动重试".to_string(),
            _ => "历史拉取失败，可先诊断连通性再手动重试".to_string(),
        };
        self.sink
            .notify(NotifySeverity::Error, format!("{}（{}）", advice, e))
            .await;
    }

    /// 发送文本消息：乐观写入在前，远端写入 fire-and-forget
    ///
    /// 返回乐观写入的临时消息。远端失败只通知不回滚，不自动重试——
    /// "本地先可见"优先于"保证送达"，由操作员决定是否再试。
    pub async fn send_text(&self, key: &ConversationKey, text: String) -> Message {
        let message = Message {
            id: generate_local_msg_id(&self.config.operator_id),
            sender_id: self.config.operator_id.clone(),
            sender_name: self.config.operator_name.clone(),
            text,
            created_at: now_ms(),
            status: DeliveryStatus::Sent,
        };

        // 1. 乐观写入：界面路径不等网络
        self.store
            .apply_event(
                key,
                SyncEvent::LocalSendRequested {
                    message: message.clone(),
                },
            )
            .await;
        let message_json =
            serde_json::to_string(&message).unwrap_or_else(|_| "{}".to_string());
        self.listener
            .on_new_message(key.to_string(), message_json)
            .await;

        // 2. 远端写入（相对调用方 fire-and-forget）
        if let Some(api) = self.api.clone() {
            let store = self.store.clone();
            let monitor = self.monitor.clone();
            let listener = self.listener.clone();
            let sink = self.sink.clone();
            let key = key.clone();
            let temp = message.clone();
            tokio::spawn(async move {
                let record = MessageRecord::from_message(&temp);
                match api.insert_message(&key, &record).await {
                    Ok(server_msg_id) => {
                        debug!(
                            "[Syncer] ✅ 消息远端落库: tempID={}, serverMsgID={}",
                            temp.id, server_msg_id
                        );
                        let mut confirmed = temp.clone();
                        confirmed.id = server_msg_id;
                        store
                            .apply_event(
                                &key,
                                SyncEvent::SendAcked {
                                    temp_id: temp.id.clone(),
                                    confirmed,
                                },
                            )
                            .await;
                        listener.on_transcript_changed(key.to_string()).await;
                    }
                    Err(e) => {
                        Self::report_send_failure(
                            &monitor, &*sink, &*listener, &key, &temp.id, &e,
                        )
                        .await;
                    }
                }
            });
        }

        message
    }

    /// 发送失败上报：日志 + 通知 + 回调，不触碰连接状态与本地副本
    async fn report_send_failure(
        monitor: &ConnectionMonitor,
        sink: &dyn NotificationSink,
        listener: &dyn SyncListener,
        key: &ConversationKey,
        temp_id: &str,
        e: &SyncError,
    ) {
        error!(
            "[Syncer] ❌ 消息发送失败（本地副本保留）: conversationKey={}, tempID={}, {}",
            key, temp_id, e
        );
        monitor.note(format!(
            "消息发送失败（本地副本保留，可手动重试）: tempID={}, {}",
            temp_id, e
        ));
        sink.notify(
            NotifySeverity::Error,
            format!("消息未能发送到远端，已保留在本地，可手动重试（{}）", e),
        )
        .await;
        let detail = serde_json::json!({
            "conversationKey": key.as_str(),
            "tempID": temp_id,
            "reason": e.to_string(),
        })
        .to_string();
        listener.on_send_failed(detail).await;
    }

    /// 订阅送达一条插入事件：边界校验后经对账合并
    pub async fn on_feed_event(&self, key: &ConversationKey, record: MessageRecord) {
        let message = match record.try_into_message() {
            Ok(m) => m,
            Err(e) => {
                warn!("[Syncer] ⚠️ 订阅载荷解析失败，已丢弃: {}", e);
                self.monitor
                    .note(format!("订阅载荷解析失败，已丢弃: {}", e));
                return;
            }
        };

        let message_json =
            serde_json::to_string(&message).unwrap_or_else(|_| "{}".to_string());
        let outcomes = self
            .store
            .apply_event(key, SyncEvent::FeedEventReceived { message })
            .await;

        match outcomes.first() {
            Some(MergeOutcome::Inserted) => {
                self.listener
                    .on_new_message(key.to_string(), message_json)
                    .await;
            }
            Some(MergeOutcome::ReplacedTemp { temp_id }) => {
                debug!(
                    "[Syncer] 订阅 echo 替换临时消息: tempID={}",
                    temp_id
                );
                self.listener.on_transcript_changed(key.to_string()).await;
            }
            Some(MergeOutcome::Duplicate { status_upgraded }) => {
                if *status_upgraded {
                    self.listener.on_transcript_changed(key.to_string()).await;
                } else {
                    debug!("[Syncer] 订阅重复投递，已丢弃");
                }
            }
            None => {}
        }
    }

    /// 订阅帧无法解析：丢弃并留痕，不进入任何合并路径
    pub async fn on_feed_decode_error(&self, detail: &str) {
        warn!("[Syncer] ⚠️ 订阅帧解析失败，已丢弃: {}", detail);
        self.monitor
            .note(format!("订阅帧解析失败，已丢弃: {}", detail));
    }

    /// 订阅状态流：确认转 LIVE；失败按"拉取是否成功过"裁决硬错误或降级
    pub async fn on_feed_status(&self, status: FeedStatus, detail: &str) {
        match status {
            FeedStatus::Connecting => {
                self.monitor.note(format!("订阅握手开始: {}", detail));
            }
            FeedStatus::Subscribed => {
                self.monitor
                    .transition(ConnectionState::Live, "订阅确认，进入实时同步");
            }
            FeedStatus::ChannelError => {
                self.feed_failure(ErrorReason::Network, detail).await;
            }
            FeedStatus::TimedOut => {
                self.feed_failure(ErrorReason::Timeout, detail).await;
            }
            FeedStatus::Closed => {
                self.monitor.note(format!("订阅已关闭: {}", detail));
            }
        }
    }

    async fn feed_failure(&self, reason: ErrorReason, detail: &str) {
        let hard = self.monitor.on_feed_failure(reason, detail);
        if hard {
            self.sink
                .notify(
                    NotifySeverity::Error,
                    format!("实时订阅失败且无可用快照：{}", detail),
                )
                .await;
        } else {
            self.sink
                .notify(
                    NotifySeverity::Warning,
                    format!("实时订阅暂不可用，正在以快照模式展示会话（{}）", detail),
                )
                .await;
        }
    }
}
