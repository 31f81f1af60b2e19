//! DineTalk CLI 客户端（联调版）
//!
//! 非交互式 CLI，用于联调和观察同步引擎行为：启动时通过命令行参数指定
//! 操作员与会话，自动打开客户端并选择会话，持续输出收到的消息与事件。

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use dinetalk_sync_core::im::client::{ClientConfig, SyncClient};
use dinetalk_sync_core::im::conversation::ConversationTarget;
use dinetalk_sync_core::im::listener::{NotificationSink, NotifySeverity, SyncListener};
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

/// DineTalk CLI 客户端
#[derive(Parser, Debug)]
#[command(name = "dinetalk-cli")]
#[command(about = "DineTalk CLI 客户端 - 用于联调消息同步引擎", long_about = None)]
struct Args {
    /// 操作员 ID
    #[arg(short, long, default_value = "op_1001")]
    operator: String,

    /// 操作员显示名
    #[arg(short, long, default_value = "前台-小李")]
    name: String,

    /// 单聊对端 ID（与 --channel 二选一）
    #[arg(long)]
    peer: Option<String>,

    /// 广播频道 ID（默认 ops）
    #[arg(long, default_value = "ops")]
    channel: String,

    /// 远端日志 HTTP 地址
    #[arg(long, default_value = "http://localhost:8090")]
    api_url: String,

    /// 变更订阅 WebSocket 地址
    #[arg(long, default_value = "ws://localhost:8091/feed")]
    ws_url: String,

    /// 本地 SQLite 数据库 URL
    #[arg(long, default_value = "sqlite://dinetalk.db?mode=rwc")]
    db_url: String,

    /// 纯本地模式（不连远端）
    #[arg(long)]
    local: bool,

    /// 启动后发送一条消息（可选）
    #[arg(long)]
    send: Option<String>,

    /// 运行时长（秒），0 表示持续运行
    #[arg(short, long, default_value = "0")]
    duration: u64,

    /// 日志级别（默认: info,dinetalk_sync_core=debug）
    #[arg(long, default_value = "info,dinetalk_sync_core=debug")]
    log_level: String,
}

/// 初始化日志（同时输出到 stdout 和文件）
fn init_logger(log_level: &str) {
    use std::fs::OpenOptions;
    use std::io;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    // 优先使用环境变量 RUST_LOG（如果设置了），否则使用命令行参数
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    // 创建日志文件（追加模式）
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open("debug.log")
        .expect("无法创建日志文件 debug.log");

    // 输出到 stdout（控制台），保留 ANSI 颜色代码用于终端显示
    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(true);

    // 输出到文件，禁用 ANSI 颜色代码
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    info!("[CLI] 📝 日志已同时输出到控制台和文件: debug.log");
}

/// 设置监听器（输出所有接收到的信息）
fn setup_listeners(client: &mut SyncClient) {
    struct CliSyncListener;
    #[async_trait]
    impl SyncListener for CliSyncListener {
        async fn on_connection_state_changed(&self, state: String) {
            info!("[CLI/Conn] 🔄 连接状态变化: {}", state);
        }

        async fn on_new_message(&self, conversation_key: String, message: String) {
            info!("[CLI/Msg] 📨 新消息: key={}, {}", conversation_key, message);
        }

        async fn on_transcript_changed(&self, conversation_key: String) {
            info!("[CLI/Msg] 🔄 文稿变化: key={}", conversation_key);
        }

        async fn on_conversation_changed(&self, summary: String) {
            info!("[CLI/Conv] 📋 会话摘要变化: {}", summary);
        }

        async fn on_send_failed(&self, detail: String) {
            error!("[CLI/Msg] ❌ 发送失败: {}", detail);
        }
    }
    client.set_sync_listener(Arc::new(CliSyncListener));

    struct CliNotificationSink;
    #[async_trait]
    impl NotificationSink for CliNotificationSink {
        async fn notify(&self, severity: NotifySeverity, message: String) {
            match severity {
                NotifySeverity::Info => info!("[CLI/Notify] ℹ️ {}", message),
                NotifySeverity::Warning => warn!("[CLI/Notify] ⚠️ {}", message),
                NotifySeverity::Error => error!("[CLI/Notify] ❌ {}", message),
            }
        }
    }
    client.set_notification_sink(Arc::new(CliNotificationSink));
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logger(&args.log_level);

    info!("[CLI] 🚀 DineTalk CLI 客户端");
    info!("[CLI] 👤 操作员: {} ({})", args.operator, args.name);
    info!("[CLI] ⏱️  运行时长: {} 秒（0=持续运行）", args.duration);

    // 组装配置
    let mut config = if args.local {
        info!("[CLI] 💾 纯本地模式");
        ClientConfig::local(args.operator.clone(), args.name.clone())
    } else {
        let mut c = ClientConfig::new(args.operator.clone(), args.name.clone());
        c.api_base_url = Some(args.api_url.clone());
        c.feed_ws_url = args.ws_url.clone();
        c
    };
    config.db_url = args.db_url.clone();

    let mut client = SyncClient::new(config);
    setup_listeners(&mut client);

    info!("[CLI] 🔗 正在打开客户端...");
    client.open().await.map_err(|e| anyhow::anyhow!("打开失败: {}", e))?;
    info!("[CLI] ✅ 客户端就绪");

    // 选择会话：给了 --peer 就单聊，否则进频道
    let target = match &args.peer {
        Some(peer) => ConversationTarget::Direct {
            peer_id: peer.clone(),
        },
        None => ConversationTarget::Channel {
            channel_id: args.channel.clone(),
        },
    };
    let key = client.select_conversation(&target).await?;
    info!("[CLI] 📂 已选择会话: {}", key);
    info!("[CLI] 🔌 连接状态: {}", client.connection_state()?);

    // 可选：启动即发送一条
    if let Some(text) = &args.send {
        let sent = client.send_text(text.clone()).await?;
        info!("[CLI] 📤 已发送（乐观写入）: id={}", sent.id);
    }

    // 展示当前文稿
    let transcript = client.transcript().await?;
    info!("[CLI] 📋 当前文稿（共 {} 条）:", transcript.len());
    for msg in transcript.iter().rev().take(5).rev() {
        info!(
            "[CLI]   - [{}] {}: {}",
            msg.created_at, msg.sender_name, msg.text
        );
    }

    info!("[CLI] 📥 开始监听消息...");
    if args.duration > 0 {
        info!("[CLI] ⏰ {} 秒后自动退出", args.duration);
        sleep(Duration::from_secs(args.duration)).await;
    } else {
        info!("[CLI] ⏰ 持续运行中，按 Ctrl+C 退出");
        tokio::signal::ctrl_c().await?;
    }

    // 退出前输出诊断日志
    info!("[CLI] 🩺 诊断日志:");
    for line in client.diagnostics()? {
        info!("[CLI]   {}", line);
    }
    client.shutdown().await;
    info!("[CLI] 👋 程序退出");

    Ok(())
}
