//! 变更订阅器
//!
//! 同一时刻至多持有一个活动订阅：切换会话先拆除旧订阅再发起新握手，
//! 订阅句柄由本模块独占。事件由单一读取任务按到达顺序串行合并。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::interval;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::im::conversation::ConversationKey;
use crate::im::feed::types::{decode_frame, FeedFrame, FeedStatus, SubscribeFrame};
use crate::im::sync::error::SyncError;
use crate::im::sync::service::MessageSyncer;

/// WebSocket 写入端类型别名
pub type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// WebSocket 读取端类型别名
pub type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// 心跳间隔（秒）
const HEARTBEAT_INTERVAL_SECS: u64 = 25;

/// 订阅器配置
#[derive(Clone, Debug)]
pub struct FeedConfig {
    /// 变更订阅 WebSocket 地址
    pub ws_url: String,
    /// 当前操作员 ID
    pub operator_id: String,
    /// 建连 + 订阅确认的时限（毫秒）
    pub handshake_timeout_ms: u64,
}

/// 活动订阅句柄
struct ActiveSubscription {
    conversation_key: ConversationKey,
    writer: Arc<Mutex<WsWriter>>,
    reader_task: tokio::task::JoinHandle<()>,
    heartbeat_task: tokio::task::JoinHandle<()>,
}

/// 变更订阅器
pub struct FeedSubscriber {
    config: FeedConfig,
    active: Mutex<Option<ActiveSubscription>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl FeedSubscriber {
    pub fn new(config: FeedConfig) -> Self {
        Self {
            config,
            active: Mutex::new(None),
            opened: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        }
    }

    /// 当前订阅的会话键
    pub async fn active_key(&self) -> Option<ConversationKey> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|a| a.conversation_key.clone())
    }

    /// 历史累计建立的订阅数（诊断/测试用）
    pub fn subscriptions_opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// 历史累计拆除的订阅数（诊断/测试用）
    pub fn subscriptions_closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// 建立面向 `key` 的订阅
    ///
    /// 先拆除已有订阅（任何时刻至多一个），随后建连、发订阅帧并在时限内
    /// 等待确认。确认后由 `syncer` 收到 `Subscribed` 转入 LIVE；失败路径
    /// 全部经 [`MessageSyncer::on_feed_status`] 裁决（硬错误或降级）。
    pub async fn subscribe(
        &self,
        key: ConversationKey,
        syncer: Arc<MessageSyncer>,
    ) -> Result<(), SyncError> {
        // 1. 拆除旧订阅
        self.teardown("切换会话").await;
        syncer
            .on_feed_status(FeedStatus::Connecting, key.as_str())
            .await;

        let operation_id = Uuid::new_v4().to_string();
        let url = format!(
            "{}/?operatorID={}&operationID={}",
            self.config.ws_url, self.config.operator_id, operation_id
        );
        let handshake_timeout = Duration::from_millis(self.config.handshake_timeout_ms);

        info!(
            "[Feed] 🔗 发起订阅: conversationKey={}, 操作ID: {}",
            key, operation_id
        );

        // 2. 建连（限时）
        let (ws_stream, response) =
            match tokio::time::timeout(handshake_timeout, connect_async(&url)).await {
                Err(_) => {
                    let detail = format!("订阅建连超时: conversationKey={}", key);
                    syncer.on_feed_status(FeedStatus::TimedOut, &detail).await;
                    return Err(SyncError::Timeout(detail));
                }
                Ok(Err(e)) => {
                    let detail = format!("订阅建连失败: {}", e);
                    syncer
                        .on_feed_status(FeedStatus::ChannelError, &detail)
                        .await;
                    return Err(SyncError::Network(detail));
                }
                Ok(Ok(pair)) => pair,
            };
        debug!("[Feed] WebSocket 建连成功, 状态: {}", response.status());

        let (write, mut read) = ws_stream.split();
        let writer = Arc::new(Mutex::new(write));

        // 3. 发送订阅帧
        let frame = SubscribeFrame::new(key.as_str(), &operation_id);
        let frame_json = serde_json::to_string(&frame)
            .map_err(|e| SyncError::Decode(format!("订阅帧序列化失败: {}", e)))?;
        if let Err(e) = writer.lock().await.send(WsMessage::Text(frame_json)).await {
            let detail = format!("订阅帧发送失败: {}", e);
            syncer
                .on_feed_status(FeedStatus::ChannelError, &detail)
                .await;
            return Err(SyncError::Network(detail));
        }

        // 4. 等待订阅确认（限时）
        let ack = tokio::time::timeout(handshake_timeout, Self::wait_for_ack(&mut read)).await;
        match ack {
            Err(_) => {
                let detail = format!("订阅确认超时: conversationKey={}", key);
                syncer.on_feed_status(FeedStatus::TimedOut, &detail).await;
                return Err(SyncError::Timeout(detail));
            }
            Ok(None) => {
                let detail = "订阅确认前连接关闭".to_string();
                syncer
                    .on_feed_status(FeedStatus::ChannelError, &detail)
                    .await;
                return Err(SyncError::Network(detail));
            }
            Ok(Some((status, reason))) => {
                if status != "subscribed" {
                    let detail = format!("订阅被拒绝: status={}, reason={}", status, reason);
                    syncer
                        .on_feed_status(FeedStatus::ChannelError, &detail)
                        .await;
                    return Err(SyncError::Network(detail));
                }
            }
        }
        info!("[Feed] ✅ 订阅确认: conversationKey={}", key);
        syncer
            .on_feed_status(FeedStatus::Subscribed, key.as_str())
            .await;

        // 5. 心跳保活
        let heartbeat_writer = writer.clone();
        let heartbeat_task = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
            loop {
                ticker.tick().await;
                let mut w = heartbeat_writer.lock().await;
                if w.send(WsMessage::Ping(vec![])).await.is_err() {
                    break;
                }
            }
        });

        // 6. 读取任务：事件按到达顺序串行合并
        let reader_key = key.clone();
        let reader_syncer = syncer.clone();
        let reader_task = tokio::spawn(async move {
            Self::run_read_loop(read, reader_key, reader_syncer).await;
        });

        *self.active.lock().await = Some(ActiveSubscription {
            conversation_key: key,
            writer,
            reader_task,
            heartbeat_task,
        });
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// 确认等待：返回第一帧状态，连接中断返回 None
    async fn wait_for_ack(read: &mut WsReader) -> Option<(String, String)> {
        while let Some(frame) = read.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => match decode_frame(&text) {
                    Ok(FeedFrame::Status { status, reason }) => return Some((status, reason)),
                    Ok(FeedFrame::Event { .. }) => {
                        // 确认前到达的事件帧忽略（确认后会由历史拉取补齐）
                        debug!("[Feed] 确认前收到事件帧，忽略");
                    }
                    Err(e) => warn!("[Feed] ⚠️ 确认等待期间帧解析失败: {}", e),
                },
                Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => {}
                Ok(WsMessage::Close(_)) | Err(_) => return None,
                _ => {}
            }
        }
        None
    }

    /// 订阅读取循环
    async fn run_read_loop(mut read: WsReader, key: ConversationKey, syncer: Arc<MessageSyncer>) {
        while let Some(frame) = read.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => match decode_frame(&text) {
                    Ok(FeedFrame::Event {
                        event,
                        conversation_key,
                        record,
                    }) => {
                        if event != "insert" {
                            debug!("[Feed] 非插入事件，忽略: event={}", event);
                            continue;
                        }
                        if conversation_key != key.as_str() {
                            // 服务端按键过滤，这里只是兜底
                            debug!(
                                "[Feed] 非当前会话的事件，忽略: conversationKey={}",
                                conversation_key
                            );
                            continue;
                        }
                        syncer.on_feed_event(&key, record).await;
                    }
                    Ok(FeedFrame::Status { status, reason }) => {
                        if status == "error" {
                            syncer
                                .on_feed_status(FeedStatus::ChannelError, &reason)
                                .await;
                        } else {
                            debug!("[Feed] 状态帧: status={}", status);
                        }
                    }
                    Err(e) => {
                        syncer.on_feed_decode_error(&e.to_string()).await;
                    }
                },
                Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => {}
                Ok(WsMessage::Close(frame)) => {
                    syncer
                        .on_feed_status(FeedStatus::Closed, &format!("服务端关闭: {:?}", frame))
                        .await;
                    break;
                }
                Err(e) => {
                    syncer
                        .on_feed_status(FeedStatus::ChannelError, &format!("连接错误: {}", e))
                        .await;
                    break;
                }
                _ => {}
            }
        }
        debug!("[Feed] 读取循环退出: conversationKey={}", key);
    }

    /// 拆除当前订阅（没有活动订阅时为 no-op），返回是否发生了拆除
    pub async fn teardown(&self, why: &str) -> bool {
        let Some(active) = self.active.lock().await.take() else {
            return false;
        };
        info!(
            "[Feed] 🔌 拆除订阅: conversationKey={}, 原因: {}",
            active.conversation_key, why
        );
        active.heartbeat_task.abort();
        // 尽力通知服务端关闭
        {
            let mut w = active.writer.lock().await;
            let _ = w.send(WsMessage::Close(None)).await;
        }
        active.reader_task.abort();
        self.closed.fetch_add(1, Ordering::SeqCst);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::connection::{ConnectionMonitor, ConnectionState, ErrorReason};
    use crate::im::conversation::dao::MemoryThreadStorage;
    use crate::im::conversation::ConversationStore;
    use crate::im::listener::{EmptyNotificationSink, EmptySyncListener, SyncListener};
    use crate::im::reconcile::ReconcileConfig;
    use crate::im::sync::service::SyncerConfig;
    use tokio::net::TcpListener;

    struct Fixture {
        syncer: Arc<MessageSyncer>,
        store: Arc<ConversationStore>,
        monitor: Arc<ConnectionMonitor>,
    }

    fn fixture() -> Fixture {
        let listener: Arc<dyn SyncListener> = Arc::new(EmptySyncListener);
        let store = Arc::new(ConversationStore::new(
            "op_1001".to_string(),
            Arc::new(MemoryThreadStorage::new()),
            listener.clone(),
            ReconcileConfig::default(),
        ));
        let monitor = Arc::new(ConnectionMonitor::new(
            200,
            ConnectionState::Connecting,
            listener.clone(),
        ));
        let syncer = Arc::new(MessageSyncer::new(
            SyncerConfig {
                operator_id: "op_1001".to_string(),
                operator_name: "前台-小李".to_string(),
                history_limit: 50,
                fetch_timeout_ms: 10_000,
            },
            None,
            store.clone(),
            monitor.clone(),
            listener,
            Arc::new(EmptyNotificationSink),
        ));
        Fixture {
            syncer,
            store,
            monitor,
        }
    }

    /// 本地订阅服务器：确认订阅帧并回发一条该会话的插入事件
    async fn spawn_feed_server(
        live: Arc<AtomicUsize>,
    ) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let live = live.clone();
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    live.fetch_add(1, Ordering::SeqCst);
                    while let Some(Ok(msg)) = ws.next().await {
                        match msg {
                            WsMessage::Text(text) => {
                                let value: serde_json::Value =
                                    serde_json::from_str(&text).unwrap_or_default();
                                if value.get("action").and_then(|v| v.as_str())
                                    == Some("subscribe")
                                {
                                    let key = value
                                        .get("conversationKey")
                                        .and_then(|v| v.as_str())
                                        .unwrap_or_default()
                                        .to_string();
                                    let ack = r#"{"status":"subscribed"}"#.to_string();
                                    if ws.send(WsMessage::Text(ack)).await.is_err() {
                                        break;
                                    }
                                    let event = serde_json::json!({
                                        "event": "insert",
                                        "conversationKey": key,
                                        "record": {
                                            "id": format!("srv-{}", key),
                                            "senderID": "op_2002",
                                            "senderName": "后厨-老王",
                                            "text": "好的",
                                            "timestamp": 1754300000000_i64,
                                            "status": "SENT"
                                        }
                                    })
                                    .to_string();
                                    if ws.send(WsMessage::Text(event)).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            WsMessage::Close(_) => break,
                            _ => {}
                        }
                    }
                    live.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });
        format!("ws://{}", addr)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn subscribe_acks_and_delivers_events() {
        let live = Arc::new(AtomicUsize::new(0));
        let url = spawn_feed_server(live.clone()).await;
        let f = fixture();
        let subscriber = FeedSubscriber::new(FeedConfig {
            ws_url: url,
            operator_id: "op_1001".to_string(),
            handshake_timeout_ms: 5_000,
        });

        let key = ConversationKey::channel("ops");
        subscriber
            .subscribe(key.clone(), f.syncer.clone())
            .await
            .expect("订阅应成功");
        assert_eq!(f.monitor.state(), ConnectionState::Live);

        // 确认后服务器立刻回发一条事件，应串行合并进线程
        for _ in 0..100 {
            if !f.store.get(&key).await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let thread = f.store.get(&key).await;
        assert_eq!(thread.len(), 1);
        assert_eq!(thread[0].id, "srv-ch_ops");

        subscriber.teardown("测试结束").await;
    }

    #[tokio::test]
    async fn switching_conversations_keeps_single_subscription() {
        let live = Arc::new(AtomicUsize::new(0));
        let url = spawn_feed_server(live.clone()).await;
        let f = fixture();
        let subscriber = FeedSubscriber::new(FeedConfig {
            ws_url: url,
            operator_id: "op_1001".to_string(),
            handshake_timeout_ms: 5_000,
        });

        subscriber
            .subscribe(ConversationKey::channel("ops"), f.syncer.clone())
            .await
            .expect("首次订阅应成功");
        assert_eq!(subscriber.subscriptions_opened(), 1);
        assert_eq!(subscriber.subscriptions_closed(), 0);

        // 切换会话：恰好拆一个、建一个
        subscriber
            .subscribe(ConversationKey::channel("kitchen"), f.syncer.clone())
            .await
            .expect("切换订阅应成功");
        assert_eq!(subscriber.subscriptions_opened(), 2);
        assert_eq!(subscriber.subscriptions_closed(), 1);
        assert_eq!(
            subscriber.active_key().await,
            Some(ConversationKey::channel("kitchen"))
        );

        // 服务器侧最终只剩一条活动连接
        let live_probe = live.clone();
        wait_until(move || live_probe.load(Ordering::SeqCst) == 1).await;
        assert_eq!(live.load(Ordering::SeqCst), 1);

        subscriber.teardown("测试结束").await;
    }

    #[tokio::test]
    async fn handshake_timeout_maps_to_timed_out_status() {
        // 只接受 TCP、从不完成 WebSocket 握手的服务器
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                // 挂住连接
                tokio::spawn(async move {
                    let _hold = stream;
                    tokio::time::sleep(Duration::from_secs(60)).await;
                });
            }
        });

        let f = fixture();
        // 拉取未成功过：订阅失败应升级为硬错误
        f.monitor.set_fetch_ok(false);
        let subscriber = FeedSubscriber::new(FeedConfig {
            ws_url: format!("ws://{}", addr),
            operator_id: "op_1001".to_string(),
            handshake_timeout_ms: 200,
        });

        let result = subscriber
            .subscribe(ConversationKey::channel("ops"), f.syncer.clone())
            .await;
        assert!(matches!(result, Err(SyncError::Timeout(_))));
        assert_eq!(
            f.monitor.state(),
            ConnectionState::Error(ErrorReason::Timeout)
        );
    }
}
