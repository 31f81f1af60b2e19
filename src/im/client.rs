//! 同步引擎客户端
//!
//! 单一逻辑客户端的编排层：选择会话 → 追赶拉取 → 订阅实时变更，
//! 外加操作员显式触发的重试与诊断。任何时刻只有一个活动会话视图。

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::info;

use crate::im::connection::{ConnectionMonitor, ConnectionState, ProbeOutcome};
use crate::im::conversation::{
    ConversationKey, ConversationStore, ConversationTarget, Message, SqliteThreadStorage,
    ThreadSummary,
};
use crate::im::feed::{FeedConfig, FeedSubscriber};
use crate::im::listener::{
    EmptyNotificationSink, EmptySyncListener, NotificationSink, NotifySeverity, SyncListener,
};
use crate::im::reconcile::ReconcileConfig;
use crate::im::sync::{MessageLogApi, MessageSyncer, SyncerConfig};

/// 诊断探测时限
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// 客户端配置
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// 当前操作员 ID
    pub operator_id: String,
    /// 当前操作员显示名
    pub operator_name: String,
    /// 远端日志 HTTP 基础地址；None 表示未配置远端（纯本地模式）
    pub api_base_url: Option<String>,
    /// 变更订阅 WebSocket 地址
    pub feed_ws_url: String,
    /// 本地 SQLite 数据库 URL
    ///
    /// 例如：`sqlite://dinetalk.db?mode=rwc`
    pub db_url: String,
    /// 追赶拉取的最大条数
    pub history_limit: u32,
    /// 临时消息与远端 echo 的匹配容差（毫秒）
    pub echo_tolerance_ms: i64,
    /// 追赶拉取超时（毫秒）
    pub fetch_timeout_ms: u64,
    /// 订阅建连 + 确认时限（毫秒）
    pub handshake_timeout_ms: u64,
    /// 诊断日志环容量
    pub diag_capacity: usize,
}

impl ClientConfig {
    /// 创建默认配置（本地开发端点）
    pub fn new(operator_id: String, operator_name: String) -> Self {
        Self {
            operator_id,
            operator_name,
            api_base_url: Some("http://localhost:8090".to_string()),
            feed_ws_url: "ws://localhost:8091/feed".to_string(),
            db_url: "sqlite://dinetalk.db?mode=rwc".to_string(),
            history_limit: 50,
            echo_tolerance_ms: 5000,
            fetch_timeout_ms: 10_000,
            handshake_timeout_ms: 10_000,
            diag_capacity: 200,
        }
    }

    /// 纯本地模式（未配置远端，消息只进本地存储）
    pub fn local(operator_id: String, operator_name: String) -> Self {
        Self {
            api_base_url: None,
            ..Self::new(operator_id, operator_name)
        }
    }
}

/// 同步引擎客户端
pub struct SyncClient {
    config: ClientConfig,
    listener: Arc<dyn SyncListener>,
    sink: Arc<dyn NotificationSink>,
    api: Option<MessageLogApi>,
    store: Option<Arc<ConversationStore>>,
    monitor: Option<Arc<ConnectionMonitor>>,
    syncer: Option<Arc<MessageSyncer>>,
    feed: Option<Arc<FeedSubscriber>>,
    active: Mutex<Option<ConversationKey>>,
}

impl SyncClient {
    /// 创建新的客户端（监听器与通知汇需在 `open` 之前注册）
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            listener: Arc::new(EmptySyncListener),
            sink: Arc::new(EmptyNotificationSink),
            api: None,
            store: None,
            monitor: None,
            syncer: None,
            feed: None,
            active: Mutex::new(None),
        }
    }

    /// 注册同步监听器
    pub fn set_sync_listener(&mut self, listener: Arc<dyn SyncListener>) {
        self.listener = listener;
    }

    /// 注册通知汇
    pub fn set_notification_sink(&mut self, sink: Arc<dyn NotificationSink>) {
        self.sink = sink;
    }

    /// 打开客户端：连接本地数据库、预热存储、装配各组件
    pub async fn open(&mut self) -> Result<()> {
        info!(
            "[Client] 🚀 打开同步客户端 (operator={}, remote={})",
            self.config.operator_id,
            self.config.api_base_url.as_deref().unwrap_or("无")
        );

        // 1. 本地存储
        let storage = SqliteThreadStorage::connect(&self.config.db_url).await?;
        let store = Arc::new(ConversationStore::new(
            self.config.operator_id.clone(),
            Arc::new(storage),
            self.listener.clone(),
            ReconcileConfig {
                echo_tolerance_ms: self.config.echo_tolerance_ms,
            },
        ));
        store.bootstrap().await?;

        // 2. 连接监控：未配置远端时恒为 LOCAL
        let initial = if self.config.api_base_url.is_some() {
            ConnectionState::Connecting
        } else {
            ConnectionState::Local
        };
        let monitor = Arc::new(ConnectionMonitor::new(
            self.config.diag_capacity,
            initial,
            self.listener.clone(),
        ));

        // 3. 远端 API（可选）
        let api = match &self.config.api_base_url {
            Some(base) => {
                let http = reqwest::ClientBuilder::new()
                    .build()
                    .context("创建 HTTP 客户端失败")?;
                Some(MessageLogApi::new(
                    http,
                    base.clone(),
                    self.config.operator_id.clone(),
                ))
            }
            None => {
                monitor.note("未配置远端端点，运行在纯本地模式");
                None
            }
        };

        // 4. 同步服务与订阅器
        let syncer = Arc::new(MessageSyncer::new(
            SyncerConfig {
                operator_id: self.config.operator_id.clone(),
                operator_name: self.config.operator_name.clone(),
                history_limit: self.config.history_limit,
                fetch_timeout_ms: self.config.fetch_timeout_ms,
            },
            api.clone(),
            store.clone(),
            monitor.clone(),
            self.listener.clone(),
            self.sink.clone(),
        ));
        let feed = api.is_some().then(|| {
            Arc::new(FeedSubscriber::new(FeedConfig {
                ws_url: self.config.feed_ws_url.clone(),
                operator_id: self.config.operator_id.clone(),
                handshake_timeout_ms: self.config.handshake_timeout_ms,
            }))
        });

        self.api = api;
        self.store = Some(store);
        self.monitor = Some(monitor);
        self.syncer = Some(syncer);
        self.feed = feed;
        info!("[Client] ✅ 客户端就绪");
        Ok(())
    }

    /// 选择活动会话
    ///
    /// 计算会话键 → 拆除旧订阅 → 追赶拉取 → 成功后建立新订阅。
    /// 同步失败不向调用方抛出：状态、诊断日志与通知已经承载了结果。
    pub async fn select_conversation(
        &self,
        target: &ConversationTarget,
    ) -> Result<ConversationKey> {
        let monitor = self.monitor_ref()?;
        let syncer = self.syncer_ref()?;
        let key = target.key(&self.config.operator_id);
        info!("[Client] 📂 选择会话: {}", key);
        *self.active.lock().await = Some(key.clone());

        if !syncer.has_remote() {
            monitor.note(format!("选择会话（本地模式）: {}", key));
            self.listener.on_transcript_changed(key.to_string()).await;
            return Ok(key);
        }

        // 切换会话也是对 ERROR 状态的显式重试入口
        monitor.transition(
            ConnectionState::Connecting,
            &format!("选择会话: {}", key),
        );
        self.run_sync_flow(&key).await;
        Ok(key)
    }

    /// 操作员显式重试当前会话的同步（绝不自动循环）
    pub async fn retry(&self) -> Result<()> {
        let monitor = self.monitor_ref()?;
        let syncer = self.syncer_ref()?;
        let key = self
            .active
            .lock()
            .await
            .clone()
            .context("未选择会话，无法重试")?;

        if !syncer.has_remote() {
            monitor.note("本地模式无需重试");
            return Ok(());
        }
        monitor.transition(ConnectionState::Connecting, "操作员手动重试");
        self.run_sync_flow(&key).await;
        Ok(())
    }

    /// 追赶拉取 + 订阅。拉取失败不建订阅（状态已迁移，等待操作员处理）。
    async fn run_sync_flow(&self, key: &ConversationKey) {
        let Ok(syncer) = self.syncer_ref() else {
            return;
        };
        let Some(feed) = &self.feed else {
            return;
        };

        // 旧会话的订阅在拉取前就拆掉，避免拉取失败时残留
        feed.teardown("会话同步流程重启").await;

        if syncer.catch_up(key).await.is_ok() {
            // 订阅失败路径已在状态流里裁决（硬错误或降级），这里无需再处理
            let _ = feed.subscribe(key.clone(), syncer.clone()).await;
        }
    }

    /// 连通性诊断（独立于订阅，不改变连接状态）
    ///
    /// 返回 `None` 表示未配置远端。随后是否重试由操作员决定。
    pub async fn diagnose(&self) -> Result<Option<ProbeOutcome>> {
        let monitor = self.monitor_ref()?;
        let Some(api) = &self.api else {
            monitor.note("诊断：未配置远端端点，无可探测目标");
            return Ok(None);
        };

        let outcome = api.probe(PROBE_TIMEOUT).await;
        match outcome {
            ProbeOutcome::Reachable => {
                monitor.note("诊断：远端端点可达；若状态仍为 ERROR，可手动重试重新握手");
                self.sink
                    .notify(
                        NotifySeverity::Info,
                        "远端端点可达，可尝试手动重试".to_string(),
                    )
                    .await;
            }
            ProbeOutcome::Blocked => {
                monitor.note(
                    "诊断：远端端点不可达；可能原因：网络被过滤、端点地址配置错误、服务未启动",
                );
                self.sink
                    .notify(
                        NotifySeverity::Warning,
                        "远端端点不可达，请检查网络或端点配置".to_string(),
                    )
                    .await;
            }
        }
        Ok(Some(outcome))
    }

    /// 发送文本消息（乐观写入，远端结果异步上报）
    pub async fn send_text(&self, text: String) -> Result<Message> {
        let syncer = self.syncer_ref()?;
        let key = self
            .active
            .lock()
            .await
            .clone()
            .context("未选择会话，无法发送")?;
        Ok(syncer.send_text(&key, text).await)
    }

    /// 将当前会话的对端消息标记为已读
    pub async fn mark_read(&self) -> Result<usize> {
        let store = self.store_ref()?;
        let key = self
            .active
            .lock()
            .await
            .clone()
            .context("未选择会话")?;
        Ok(store.mark_read(&key, &self.config.operator_id).await)
    }

    /// 当前会话的文稿
    pub async fn transcript(&self) -> Result<Vec<Message>> {
        let store = self.store_ref()?;
        let key = self
            .active
            .lock()
            .await
            .clone()
            .context("未选择会话")?;
        Ok(store.get(&key).await)
    }

    /// 指定会话的文稿
    pub async fn transcript_of(&self, key: &ConversationKey) -> Result<Vec<Message>> {
        Ok(self.store_ref()?.get(key).await)
    }

    /// 会话列表（按最新消息时间降序）
    pub async fn conversation_list(&self) -> Result<Vec<ThreadSummary>> {
        Ok(self.store_ref()?.conversation_list().await)
    }

    /// 当前连接状态
    pub fn connection_state(&self) -> Result<ConnectionState> {
        Ok(self.monitor_ref()?.state())
    }

    /// 诊断日志快照（旧 → 新）
    pub fn diagnostics(&self) -> Result<Vec<String>> {
        Ok(self.monitor_ref()?.diagnostics())
    }

    /// 当前活动会话键
    pub async fn active_conversation(&self) -> Option<ConversationKey> {
        self.active.lock().await.clone()
    }

    /// 关闭客户端（拆除订阅；本地数据已随每次变更落盘）
    pub async fn shutdown(&self) {
        if let Some(feed) = &self.feed {
            feed.teardown("客户端关闭").await;
        }
        info!("[Client] 👋 客户端关闭");
    }

    fn store_ref(&self) -> Result<&Arc<ConversationStore>> {
        self.store
            .as_ref()
            .context("客户端未打开（先调用 open）")
    }

    fn monitor_ref(&self) -> Result<&Arc<ConnectionMonitor>> {
        self.monitor
            .as_ref()
            .context("客户端未打开（先调用 open）")
    }

    fn syncer_ref(&self) -> Result<&Arc<MessageSyncer>> {
        self.syncer
            .as_ref()
            .context("客户端未打开（先调用 open）")
    }
}
