//! 连接健康监控
//!
//! 维护四态连接状态与一个有界的诊断日志环。诊断日志只面向操作员排障，
//! 绝不参与控制流。状态迁移由其他组件上报，每次迁移追加一条日志。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::json;
use tracing::{info, warn};

use crate::im::listener::SyncListener;
use crate::im::serialization::now_ms;

/// 错误原因码
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorReason {
    /// 远端日志存储未开通（致命，需要运维处理，自动重试无意义）
    Configuration,
    /// 端点不可达（可诊断 + 手动重试）
    Network,
    /// 拉取或订阅握手超时（可手动重试）
    Timeout,
    /// 单条外发消息远端落库失败（仅通知，不改变连接状态）
    SendFailure,
    /// 传输层载荷无法解析
    Decode,
}

impl std::fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorReason::Configuration => write!(f, "CONFIGURATION"),
            ErrorReason::Network => write!(f, "NETWORK"),
            ErrorReason::Timeout => write!(f, "TIMEOUT"),
            ErrorReason::SendFailure => write!(f, "SEND_FAILURE"),
            ErrorReason::Decode => write!(f, "DECODE"),
        }
    }
}

/// 连接状态
///
/// 生命周期：未配置远端时恒为 `Local`；否则 `Connecting` → `Live`（订阅
/// 确认），`Connecting`/`Live` → `Error`（失败），`Error` → `Connecting`
/// （操作员显式重试或切换会话）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Local,
    Connecting,
    Live,
    Error(ErrorReason),
}

impl ConnectionState {
    /// 监听器回调用的 JSON 形态
    pub fn to_payload(&self) -> String {
        let value = match self {
            ConnectionState::Error(reason) => json!({ "state": "ERROR", "reason": reason }),
            other => json!({ "state": other.to_string() }),
        };
        value.to_string()
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Local => write!(f, "LOCAL"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Live => write!(f, "LIVE"),
            ConnectionState::Error(reason) => write!(f, "ERROR({})", reason),
        }
    }
}

/// 可达性探测结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Reachable,
    Blocked,
}

/// 诊断日志环（固定容量，满则淘汰最旧一条）
pub struct DiagnosticLog {
    capacity: usize,
    lines: VecDeque<(i64, String)>,
}

impl DiagnosticLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            lines: VecDeque::new(),
        }
    }

    pub fn push(&mut self, line: String) {
        while self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back((now_ms(), line));
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// 渲染为带时间戳的文本行（旧 → 新）
    pub fn snapshot(&self) -> Vec<String> {
        self.lines
            .iter()
            .map(|(at_ms, line)| {
                let ts = chrono::DateTime::from_timestamp_millis(*at_ms)
                    .map(|dt| dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
                    .unwrap_or_else(|| at_ms.to_string());
                format!("{} {}", ts, line)
            })
            .collect()
    }
}

/// 连接健康监控器
pub struct ConnectionMonitor {
    state: Mutex<ConnectionState>,
    log: Mutex<DiagnosticLog>,
    /// 最近一次历史拉取是否成功（决定订阅失败按硬错误还是降级处理）
    last_fetch_ok: AtomicBool,
    listener: Arc<dyn SyncListener>,
}

impl ConnectionMonitor {
    pub fn new(
        capacity: usize,
        initial: ConnectionState,
        listener: Arc<dyn SyncListener>,
    ) -> Self {
        let mut log = DiagnosticLog::new(capacity);
        log.push(format!("监控启动，初始状态 {}", initial));
        Self {
            state: Mutex::new(initial),
            log: Mutex::new(log),
            last_fetch_ok: AtomicBool::new(false),
            listener,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.lock().unwrap().clone()
    }

    /// 状态迁移（同态调用为 no-op），每次实际迁移追加一条诊断日志
    pub fn transition(&self, next: ConnectionState, note: &str) -> bool {
        let payload = {
            let mut state = self.state.lock().unwrap();
            if *state == next {
                return false;
            }
            let line = format!("连接状态 {} -> {}: {}", state, next, note);
            info!("[Conn] 🔄 {}", line);
            self.log.lock().unwrap().push(line);
            *state = next;
            state.to_payload()
        };

        // 回调在独立任务中派发，不阻塞调用方
        let listener = self.listener.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                listener.on_connection_state_changed(payload).await;
            });
        }
        true
    }

    /// 追加一条不改变状态的诊断日志
    pub fn note(&self, line: impl Into<String>) {
        let line = line.into();
        info!("[Conn] 📝 {}", line);
        self.log.lock().unwrap().push(line);
    }

    pub fn set_fetch_ok(&self, ok: bool) {
        self.last_fetch_ok.store(ok, Ordering::SeqCst);
    }

    pub fn fetch_ok(&self) -> bool {
        self.last_fetch_ok.load(Ordering::SeqCst)
    }

    /// 订阅失败的裁决：仅当此前的历史拉取也失败时才升级为硬错误
    ///
    /// 拉取成功过则会话仍可从快照读取，按"降级但可用"记录，返回 `false`。
    pub fn on_feed_failure(&self, reason: ErrorReason, detail: &str) -> bool {
        if self.fetch_ok() {
            warn!("[Conn] ⚠️ 订阅异常但快照可读，降级运行: {}", detail);
            self.note(format!("订阅异常（降级运行，快照仍可读）: {}", detail));
            false
        } else {
            self.transition(ConnectionState::Error(reason), detail);
            true
        }
    }

    /// 诊断日志快照（旧 → 新）
    pub fn diagnostics(&self) -> Vec<String> {
        self.log.lock().unwrap().snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::listener::EmptySyncListener;

    fn monitor() -> ConnectionMonitor {
        ConnectionMonitor::new(
            200,
            ConnectionState::Connecting,
            Arc::new(EmptySyncListener),
        )
    }

    #[test]
    fn ring_buffer_evicts_oldest() {
        let mut log = DiagnosticLog::new(3);
        for i in 0..5 {
            log.push(format!("第 {} 条", i));
        }
        let lines = log.snapshot();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("第 2 条"));
        assert!(lines[2].ends_with("第 4 条"));
    }

    #[test]
    fn transition_logs_once_and_noops_on_same_state() {
        let m = monitor();
        let before = m.diagnostics().len();

        assert!(m.transition(ConnectionState::Live, "订阅确认"));
        assert_eq!(m.state(), ConnectionState::Live);
        assert_eq!(m.diagnostics().len(), before + 1);

        // 同态迁移不产生日志
        assert!(!m.transition(ConnectionState::Live, "再次确认"));
        assert_eq!(m.diagnostics().len(), before + 1);
    }

    #[test]
    fn configuration_error_clears_through_connecting_to_live() {
        let m = monitor();
        m.transition(
            ConnectionState::Error(ErrorReason::Configuration),
            "远端日志存储未开通",
        );
        assert_eq!(
            m.state(),
            ConnectionState::Error(ErrorReason::Configuration)
        );

        // 运维修复后：显式重试 → CONNECTING → LIVE
        m.transition(ConnectionState::Connecting, "操作员手动重试");
        m.transition(ConnectionState::Live, "订阅确认");
        assert_eq!(m.state(), ConnectionState::Live);

        let rendered = m.diagnostics().join("\n");
        assert!(rendered.contains("ERROR(CONFIGURATION)"));
        assert!(rendered.contains("LIVE"));
    }

    #[test]
    fn feed_failure_is_hard_error_only_without_snapshot() {
        // 拉取失败在前：订阅失败升级为硬错误
        let m = monitor();
        m.set_fetch_ok(false);
        assert!(m.on_feed_failure(ErrorReason::Timeout, "订阅握手超时"));
        assert_eq!(m.state(), ConnectionState::Error(ErrorReason::Timeout));

        // 拉取成功在前：订阅失败只降级
        let m = monitor();
        m.set_fetch_ok(true);
        m.transition(ConnectionState::Live, "订阅确认");
        assert!(!m.on_feed_failure(ErrorReason::Network, "频道错误"));
        assert_eq!(m.state(), ConnectionState::Live);
        assert!(m.diagnostics().join("\n").contains("降级"));
    }

    #[test]
    fn state_payload_carries_reason_for_errors() {
        assert_eq!(ConnectionState::Live.to_payload(), r#"{"state":"LIVE"}"#);
        let payload = ConnectionState::Error(ErrorReason::Network).to_payload();
        assert!(payload.contains("ERROR"));
        assert!(payload.contains("NETWORK"));
    }
}
