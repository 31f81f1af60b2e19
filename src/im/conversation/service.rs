//! 本地会话存储服务
//!
//! 内存中的会话键 → 有序消息序列映射，每次变更后同步写透到注入的
//! [`ThreadStorage`]。写失败只记录日志，不回滚内存：持久化尽力而为，
//! 正确性由远端日志兜底。同时维护供会话列表使用的摘要行。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::im::conversation::dao::ThreadStorage;
use crate::im::conversation::models::{ConversationKey, DeliveryStatus, Message, ThreadSummary};
use crate::im::listener::SyncListener;
use crate::im::reconcile::{self, MergeOutcome, ReconcileConfig, SyncEvent};

/// 会话列表预览的最大字符数
const LATEST_MSG_PREVIEW_CHARS: usize = 30;

/// 本地会话存储
pub struct ConversationStore {
    operator_id: String,
    storage: Arc<dyn ThreadStorage>,
    listener: Arc<dyn SyncListener>,
    reconcile: ReconcileConfig,
    threads: Mutex<HashMap<String, Vec<Message>>>,
    summaries: Mutex<HashMap<String, ThreadSummary>>,
}

impl ConversationStore {
    pub fn new(
        operator_id: String,
        storage: Arc<dyn ThreadStorage>,
        listener: Arc<dyn SyncListener>,
        reconcile: ReconcileConfig,
    ) -> Self {
        Self {
            operator_id,
            storage,
            listener,
            reconcile,
            threads: Mutex::new(HashMap::new()),
            summaries: Mutex::new(HashMap::new()),
        }
    }

    /// 启动时全量预热：把持久化的线程与摘要载入内存
    pub async fn bootstrap(&self) -> anyhow::Result<()> {
        let threads = self.storage.load_all_threads().await?;
        let summaries = self.storage.load_summaries().await?;
        info!(
            "[Store] 📋 预热完成，线程数: {}, 摘要数: {}",
            threads.len(),
            summaries.len()
        );
        *self.threads.lock().await = threads;
        *self.summaries.lock().await = summaries
            .into_iter()
            .map(|s| (s.conversation_key.clone(), s))
            .collect();
        Ok(())
    }

    /// 读取会话文稿（未知会话返回空序列，永不失败）
    pub async fn get(&self, key: &ConversationKey) -> Vec<Message> {
        self.threads
            .lock()
            .await
            .get(key.as_str())
            .cloned()
            .unwrap_or_default()
    }

    /// 追加一条消息，返回是否为新插入（`false` 表示按 ID 去重丢弃）
    pub async fn append(&self, key: &ConversationKey, message: Message) -> bool {
        let outcomes = self
            .apply_event(key, SyncEvent::LocalSendRequested { message })
            .await;
        matches!(outcomes.first(), Some(MergeOutcome::Inserted))
    }

    /// 用确认消息替换临时条目，返回是否发生了替换
    ///
    /// 临时条目不存在时退化为普通合并（按 ID 去重兜底），不会追加第二份。
    pub async fn replace(
        &self,
        key: &ConversationKey,
        temp_id: &str,
        confirmed: Message,
    ) -> bool {
        let outcomes = self
            .apply_event(
                key,
                SyncEvent::SendAcked {
                    temp_id: temp_id.to_string(),
                    confirmed,
                },
            )
            .await;
        matches!(outcomes.first(), Some(MergeOutcome::ReplacedTemp { .. }))
    }

    /// 消费一个同步事件，经对账策略合并进线程并写透
    ///
    /// 订阅投递是串行的，本方法在一次锁区间内完成"合并 + 落盘"，同一
    /// 消息重复进入只会得到 `Duplicate`，线程形态不变。
    pub async fn apply_event(
        &self,
        key: &ConversationKey,
        event: SyncEvent,
    ) -> Vec<MergeOutcome> {
        // 摘要更新需要事件内消息的发送者信息，先抄一份
        let event_messages: Vec<Message> = match &event {
            SyncEvent::LocalSendRequested { message }
            | SyncEvent::FeedEventReceived { message } => vec![message.clone()],
            SyncEvent::RemoteHistoryFetched { messages } => messages.clone(),
            SyncEvent::SendAcked { confirmed, .. } => vec![confirmed.clone()],
            SyncEvent::SendFailed { .. } => Vec::new(),
        };

        let mut threads = self.threads.lock().await;
        let thread = threads.entry(key.to_string()).or_default();
        let outcomes = reconcile::apply_event(thread, event, &self.reconcile);

        let changed = outcomes.iter().any(|o| {
            !matches!(
                o,
                MergeOutcome::Duplicate {
                    status_upgraded: false
                }
            )
        });
        if !changed {
            debug!(
                "[Store] 事件未改变线程: conversationKey={}, 结果数={}",
                key,
                outcomes.len()
            );
            return outcomes;
        }

        self.persist_thread(key.as_str(), thread).await;
        let latest = thread.last().cloned();
        drop(threads);

        // 新插入且非本操作员发出的消息计入未读
        let unread_inc = outcomes
            .iter()
            .zip(event_messages.iter())
            .filter(|(o, m)| {
                matches!(o, MergeOutcome::Inserted) && m.sender_id != self.operator_id
            })
            .count() as i32;
        if let Some(latest) = latest {
            self.update_summary(key, &latest, unread_inc).await;
        }

        outcomes
    }

    /// 将对端消息标记为已读（前向迁移到 Read），返回受影响条数
    pub async fn mark_read(&self, key: &ConversationKey, reader_id: &str) -> usize {
        let mut threads = self.threads.lock().await;
        let Some(thread) = threads.get_mut(key.as_str()) else {
            return 0;
        };
        let mut updated = 0;
        for msg in thread.iter_mut() {
            if msg.sender_id != reader_id && msg.status < DeliveryStatus::Read {
                msg.status = DeliveryStatus::Read;
                updated += 1;
            }
        }
        if updated > 0 {
            self.persist_thread(key.as_str(), thread).await;
        }
        drop(threads);

        // 已读后未读数归零（即使没有状态变化也要清，摘要可能落后）
        let snapshot = {
            let mut summaries = self.summaries.lock().await;
            match summaries.get_mut(key.as_str()) {
                Some(summary) if summary.unread_count != 0 => {
                    summary.unread_count = 0;
                    Some(summary.clone())
                }
                _ => None,
            }
        };
        if let Some(snapshot) = snapshot {
            self.persist_summary(&snapshot).await;
            self.notify_summary(&snapshot).await;
        }
        updated
    }

    /// 会话列表（按最新消息时间降序）
    pub async fn conversation_list(&self) -> Vec<ThreadSummary> {
        let mut list: Vec<ThreadSummary> =
            self.summaries.lock().await.values().cloned().collect();
        list.retain(|s| s.latest_msg_send_time > 0);
        list.sort_by(|a, b| b.latest_msg_send_time.cmp(&a.latest_msg_send_time));
        list
    }

    /// 当前内存中的会话键集合
    pub async fn known_keys(&self) -> Vec<String> {
        self.threads.lock().await.keys().cloned().collect()
    }

    async fn update_summary(&self, key: &ConversationKey, latest: &Message, unread_inc: i32) {
        let snapshot = {
            let mut summaries = self.summaries.lock().await;
            let summary = summaries
                .entry(key.to_string())
                .or_insert_with(|| ThreadSummary::new(key));

            summary.latest_msg = latest.text.chars().take(LATEST_MSG_PREVIEW_CHARS).collect();
            summary.latest_msg_send_time = latest.created_at;
            summary.unread_count += unread_inc;
            // 展示名：频道用频道 ID，单聊用对端显示名
            if let Some(channel) = key.as_str().strip_prefix("ch_") {
                summary.show_name = channel.to_string();
            } else if latest.sender_id != self.operator_id && !latest.sender_name.is_empty() {
                summary.show_name = latest.sender_name.clone();
            }
            summary.clone()
        };

        self.persist_summary(&snapshot).await;
        self.notify_summary(&snapshot).await;
    }

    async fn persist_thread(&self, key: &str, thread: &[Message]) {
        if let Err(e) = self.storage.save_thread(key, thread).await {
            // 落盘失败不回滚内存，远端日志仍是已确认消息的权威来源
            error!(
                "[Store] ⚠️ 线程落盘失败（内存状态保留）: conversationKey={}, 错误: {}",
                key, e
            );
        }
    }

    async fn persist_summary(&self, summary: &ThreadSummary) {
        if let Err(e) = self.storage.save_summary(summary).await {
            error!(
                "[Store] ⚠️ 摘要落盘失败（内存状态保留）: conversationKey={}, 错误: {}",
                summary.conversation_key, e
            );
        }
    }

    async fn notify_summary(&self, summary: &ThreadSummary) {
        let json = serde_json::to_string(summary).unwrap_or_else(|_| "{}".to_string());
        self.listener.on_conversation_changed(json).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::conversation::dao::MemoryThreadStorage;
    use crate::im::listener::EmptySyncListener;

    fn msg(id: &str, sender: &str, text: &str, ts: i64) -> Message {
        Message {
            id: id.to_string(),
            sender_id: sender.to_string(),
            sender_name: format!("员工-{}", sender),
            text: text.to_string(),
            created_at: ts,
            status: DeliveryStatus::Sent,
        }
    }

    fn store_with(storage: Arc<MemoryThreadStorage>) -> ConversationStore {
        ConversationStore::new(
            "op_1001".to_string(),
            storage,
            Arc::new(EmptySyncListener),
            ReconcileConfig::default(),
        )
    }

    #[tokio::test]
    async fn append_orders_and_writes_through() {
        let storage = Arc::new(MemoryThreadStorage::new());
        let store = store_with(storage.clone());
        let key = ConversationKey::channel("ops");

        assert!(store.append(&key, msg("m2", "op_2002", "二", 200)).await);
        assert!(store.append(&key, msg("m1", "op_2002", "一", 100)).await);

        let thread = store.get(&key).await;
        assert_eq!(
            thread.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
            vec!["m1", "m2"]
        );
        // 写透：持久层与内存一致
        assert_eq!(storage.persisted_thread(key.as_str()).unwrap(), thread);
    }

    #[tokio::test]
    async fn duplicate_append_is_noop() {
        let storage = Arc::new(MemoryThreadStorage::new());
        let store = store_with(storage);
        let key = ConversationKey::channel("ops");

        assert!(store.append(&key, msg("m1", "op_2002", "一", 100)).await);
        assert!(!store.append(&key, msg("m1", "op_2002", "一", 100)).await);
        assert_eq!(store.get(&key).await.len(), 1);
    }

    #[tokio::test]
    async fn get_unknown_key_returns_empty() {
        let store = store_with(Arc::new(MemoryThreadStorage::new()));
        assert!(store.get(&ConversationKey::channel("nowhere")).await.is_empty());
    }

    #[tokio::test]
    async fn replace_swaps_temp_entry() {
        let storage = Arc::new(MemoryThreadStorage::new());
        let store = store_with(storage);
        let key = ConversationKey::direct("op_1001", "op_2002");

        store
            .append(&key, msg("local_op_1001_1", "op_1001", "催单", 1000))
            .await;
        let replaced = store
            .replace(&key, "local_op_1001_1", msg("srv-uuid-1", "op_1001", "催单", 1000))
            .await;
        assert!(replaced);

        let thread = store.get(&key).await;
        assert_eq!(thread.len(), 1);
        assert_eq!(thread[0].id, "srv-uuid-1");
    }

    #[tokio::test]
    async fn storage_failure_keeps_in_memory_state() {
        let storage = Arc::new(MemoryThreadStorage::new());
        let store = store_with(storage.clone());
        let key = ConversationKey::channel("ops");

        storage.set_fail_writes(true);
        assert!(store.append(&key, msg("m1", "op_2002", "一", 100)).await);

        // 内存保留，持久层没有
        assert_eq!(store.get(&key).await.len(), 1);
        assert!(storage.persisted_thread(key.as_str()).is_none());
    }

    #[tokio::test]
    async fn bootstrap_loads_persisted_threads() {
        let storage = Arc::new(MemoryThreadStorage::new());
        storage.preload_thread(
            "ch_ops",
            vec![msg("m1", "op_2002", "一", 100), msg("m2", "op_2002", "二", 200)],
        );

        let store = store_with(storage);
        store.bootstrap().await.unwrap();
        assert_eq!(store.get(&ConversationKey::channel("ops")).await.len(), 2);
    }

    #[tokio::test]
    async fn summary_counts_peer_messages_only() {
        let store = store_with(Arc::new(MemoryThreadStorage::new()));
        let key = ConversationKey::direct("op_1001", "op_2002");

        // 自己发的不计未读，对端发的计未读
        store.append(&key, msg("m1", "op_1001", "收到", 100)).await;
        store.append(&key, msg("m2", "op_2002", "好的", 200)).await;
        store.append(&key, msg("m3", "op_2002", "马上", 300)).await;

        let list = store.conversation_list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].unread_count, 2);
        assert_eq!(list[0].latest_msg, "马上");
        assert_eq!(list[0].show_name, "员工-op_2002");
    }

    #[tokio::test]
    async fn mark_read_upgrades_peer_messages_and_clears_unread() {
        let store = store_with(Arc::new(MemoryThreadStorage::new()));
        let key = ConversationKey::direct("op_1001", "op_2002");

        store.append(&key, msg("m1", "op_1001", "收到", 100)).await;
        store.append(&key, msg("m2", "op_2002", "好的", 200)).await;

        let updated = store.mark_read(&key, "op_1001").await;
        assert_eq!(updated, 1);

        let thread = store.get(&key).await;
        assert_eq!(thread[0].status, DeliveryStatus::Sent); // 自己发的不动
        assert_eq!(thread[1].status, DeliveryStatus::Read);

        let list = store.conversation_list().await;
        assert_eq!(list[0].unread_count, 0);
    }

    #[tokio::test]
    async fn conversation_list_sorts_by_latest_time_desc() {
        let store = store_with(Arc::new(MemoryThreadStorage::new()));
        let busy = ConversationKey::channel("ops");
        let quiet = ConversationKey::channel("kitchen");

        store.append(&quiet, msg("m1", "op_2002", "早", 100)).await;
        store.append(&busy, msg("m2", "op_3003", "晚", 900)).await;

        let list = store.conversation_list().await;
        assert_eq!(list[0].conversation_key, "ch_ops");
        assert_eq!(list[1].conversation_key, "ch_kitchen");
    }
}
