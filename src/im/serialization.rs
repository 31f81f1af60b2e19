//! 标识与时间工具

/// 临时消息 ID 前缀
///
/// 乐观写入的本地消息使用该前缀，直到远端确认（echo 或发送回执）到达后
/// 才会被替换为远端分配的 UUID。
pub const LOCAL_MSG_ID_PREFIX: &str = "local_";

/// 生成临时消息 ID（操作员 ID + 纳秒时间戳）
pub fn generate_local_msg_id(operator_id: &str) -> String {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{}{}_{}", LOCAL_MSG_ID_PREFIX, operator_id, nanos)
}

/// 当前 Unix 毫秒时间戳
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_msg_id_has_prefix_and_is_unique() {
        let a = generate_local_msg_id("op_1001");
        let b = generate_local_msg_id("op_1001");
        assert!(a.starts_with(LOCAL_MSG_ID_PREFIX));
        assert!(a.contains("op_1001"));
        assert_ne!(a, b);
    }
}
