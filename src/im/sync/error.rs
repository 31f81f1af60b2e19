//! 同步错误分类
//!
//! 远端交互的失败必须可区分：配置性失败（日志存储未开通）重试无意义，
//! 需要运维介入；网络/超时失败由操作员诊断后手动重试。组件对外不抛出
//! 原始传输错误，调用方看到的是这里的分类加连接状态与诊断日志。

use thiserror::Error;

use crate::im::connection::ErrorReason;

#[derive(Debug, Error)]
pub enum SyncError {
    /// 远端日志存储未开通或端点配置错误（致命，不可自动重试）
    #[error("远端日志配置错误: {0}")]
    Configuration(String),

    /// 端点不可达或服务端瞬时错误（可重试）
    #[error("网络错误: {0}")]
    Network(String),

    /// 拉取或订阅握手超时（可重试）
    #[error("操作超时: {0}")]
    Timeout(String),

    /// 单条外发消息远端落库失败（本地乐观副本保留）
    #[error("消息发送失败: {0}")]
    SendFailure(String),

    /// 传输层载荷不符合记录形态
    #[error("载荷解析失败: {0}")]
    Decode(String),
}

impl SyncError {
    /// 映射到连接状态使用的原因码
    pub fn reason(&self) -> ErrorReason {
        match self {
            SyncError::Configuration(_) => ErrorReason::Configuration,
            SyncError::Network(_) => ErrorReason::Network,
            SyncError::Timeout(_) => ErrorReason::Timeout,
            SyncError::SendFailure(_) => ErrorReason::SendFailure,
            SyncError::Decode(_) => ErrorReason::Decode,
        }
    }
}
