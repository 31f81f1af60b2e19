//! 对账策略
//!
//! 本地乐观写入、历史拉取与变更订阅三路消息在这里合并为一个一致的线程。
//! 订阅天然会乱序、重复投递，合并必须幂等且对重复抑制可交换：同一条消息
//! 无论以什么顺序、重复多少次进入，线程的最终形态都相同。
//!
//! 所有入口都是纯函数，作用在 `Vec<Message>` 上，不触网，便于单测。

use crate::im::conversation::models::Message;

/// 消息来源（决定是否参与临时消息的 echo 匹配）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOrigin {
    /// 本客户端乐观写入
    Local,
    /// 历史拉取或变更订阅送达
    Remote,
}

/// 对账配置
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// 临时消息与远端 echo 的匹配容差（毫秒）
    ///
    /// 启发式匹配：同一发送者在容差窗口内发出内容完全相同的多条消息时
    /// 可能错配（错配只影响哪条临时消息被替换，不会丢消息、不会出现
    /// 重复条目）。窗口可调，不保证精确配对。
    pub echo_tolerance_ms: i64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            echo_tolerance_ms: 5000,
        }
    }
}

/// 单条消息的合并结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// 新条目，已按时间序插入
    Inserted,
    /// ID 已存在，丢弃（可能顺带前向迁移了投递状态）
    Duplicate { status_upgraded: bool },
    /// 命中本地临时条目，已原位替换
    ReplacedTemp { temp_id: String },
}

/// 同步事件
///
/// 乐观写入、拉取完成、订阅到达、发送回执/失败统一收敛为事件，由同一个
/// 合并入口消费，使合并逻辑可以脱离网络独立验证。
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// 操作员请求发送（乐观写入，消息携带临时 ID）
    LocalSendRequested { message: Message },
    /// 历史拉取完成（权威记录，升序与否均可）
    RemoteHistoryFetched { messages: Vec<Message> },
    /// 变更订阅送达一条插入事件
    FeedEventReceived { message: Message },
    /// 远端写入回执：临时消息获得确认身份
    SendAcked { temp_id: String, confirmed: Message },
    /// 远端写入失败：乐观副本保留，不回滚
    SendFailed { temp_id: String, reason: String },
}

/// 消费一个同步事件，返回与事件内消息一一对应的合并结果
///
/// `SendFailed` 不改变线程（乐观副本保留），返回空结果。
pub fn apply_event(
    thread: &mut Vec<Message>,
    event: SyncEvent,
    cfg: &ReconcileConfig,
) -> Vec<MergeOutcome> {
    match event {
        SyncEvent::LocalSendRequested { message } => {
            vec![merge_message(thread, message, MessageOrigin::Local, cfg)]
        }
        SyncEvent::RemoteHistoryFetched { messages } => messages
            .into_iter()
            .map(|m| merge_message(thread, m, MessageOrigin::Remote, cfg))
            .collect(),
        SyncEvent::FeedEventReceived { message } => {
            vec![merge_message(thread, message, MessageOrigin::Remote, cfg)]
        }
        SyncEvent::SendAcked { temp_id, confirmed } => {
            vec![replace_temp(thread, &temp_id, confirmed, cfg)]
        }
        SyncEvent::SendFailed { .. } => Vec::new(),
    }
}

/// 合并一条消息
///
/// 规则（按顺序短路）：
/// 1. ID 已存在 → 丢弃（订阅重复投递属于常态）；重复若携带更靠后的
///    投递状态则就地前向迁移，线程长度不变；
/// 2. 远端来源且存在"同发送者、同正文、时间戳落在容差窗口内"的临时
///    条目 → 用远端身份替换临时条目（乐观写入与其持久化副本对账）；
/// 3. 其余情况按时间序插入，时间相同保持到达顺序。
pub fn merge_message(
    thread: &mut Vec<Message>,
    incoming: Message,
    origin: MessageOrigin,
    cfg: &ReconcileConfig,
) -> MergeOutcome {
    // 1. ID 去重
    if let Some(existing) = thread.iter_mut().find(|m| m.id == incoming.id) {
        let mut status_upgraded = false;
        if incoming.status > existing.status {
            existing.status = incoming.status;
            status_upgraded = true;
        }
        return MergeOutcome::Duplicate { status_upgraded };
    }

    // 2. 临时条目 echo 匹配
    if origin == MessageOrigin::Remote && !incoming.is_temporary() {
        let matched = thread.iter().position(|m| {
            m.is_temporary()
                && m.sender_id == incoming.sender_id
                && m.text == incoming.text
                && (m.created_at - incoming.created_at).abs() <= cfg.echo_tolerance_ms
        });
        if let Some(pos) = matched {
            let temp = thread.remove(pos);
            let mut confirmed = incoming;
            confirmed.status = confirmed.status.max(temp.status);
            insert_ordered(thread, confirmed);
            return MergeOutcome::ReplacedTemp { temp_id: temp.id };
        }
    }

    // 3. 按时间序插入
    insert_ordered(thread, incoming);
    MergeOutcome::Inserted
}

/// 按临时 ID 替换（发送回执路径）
///
/// 临时条目不存在时（例如 echo 先于回执到达、已被规则 2 替换）退化为
/// 普通远端合并，由 ID 去重兜底，绝不产生第二份副本。
pub fn replace_temp(
    thread: &mut Vec<Message>,
    temp_id: &str,
    confirmed: Message,
    cfg: &ReconcileConfig,
) -> MergeOutcome {
    if let Some(pos) = thread.iter().position(|m| m.id == temp_id) {
        let temp = thread.remove(pos);
        let mut confirmed = confirmed;
        confirmed.status = confirmed.status.max(temp.status);
        insert_ordered(thread, confirmed);
        return MergeOutcome::ReplacedTemp {
            temp_id: temp_id.to_string(),
        };
    }
    merge_message(thread, confirmed, MessageOrigin::Remote, cfg)
}

/// 按创建时间插入，时间相同的排在已有条目之后（保持到达顺序）
fn insert_ordered(thread: &mut Vec<Message>, msg: Message) {
    let pos = thread.partition_point(|m| m.created_at <= msg.created_at);
    thread.insert(pos, msg);
}
