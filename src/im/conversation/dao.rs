//! 会话数据访问层（DAO）
//!
//! 持久化形态是键值式的：每个会话键对应一行，整段消息序列序列化为 JSON
//! 文本落库。存储通过 [`ThreadStorage`] 注入，测试可替换为内存实现。

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info};

use crate::im::conversation::models::{Message, ThreadSummary};

/// 线程持久化接口
///
/// 约定：`load_*` 仅在进程启动时调用一次（全量预热），`save_*` 在每次内存
/// 变更后同步调用。写失败由调用方记录日志，不回滚内存状态。
#[async_trait]
pub trait ThreadStorage: Send + Sync {
    /// 读取全部会话线程（会话键 → 有序消息序列）
    async fn load_all_threads(&self) -> Result<HashMap<String, Vec<Message>>>;

    /// 写入单个会话的完整消息序列
    async fn save_thread(&self, conversation_key: &str, messages: &[Message]) -> Result<()>;

    /// 读取全部会话摘要
    async fn load_summaries(&self) -> Result<Vec<ThreadSummary>>;

    /// 写入单个会话摘要
    async fn save_summary(&self, summary: &ThreadSummary) -> Result<()>;
}

/// 基于 sqlx / SQLite 的线程存储
pub struct SqliteThreadStorage {
    db: Pool<Sqlite>,
}

impl SqliteThreadStorage {
    /// 连接数据库并初始化表结构
    ///
    /// `db_url` 形如 `sqlite://dinetalk.db?mode=rwc`
    pub async fn connect(db_url: &str) -> Result<Self> {
        info!("[ThreadDAO] 连接本地数据库: {}", db_url);
        let db = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await
            .context(format!("连接 SQLite 数据库失败: {}", db_url))?;
        let storage = Self { db };
        storage.init_db().await?;
        Ok(storage)
    }

    /// 初始化数据库表结构
    pub async fn init_db(&self) -> Result<()> {
        info!("[ThreadDAO] 初始化线程数据库表结构");

        let sql1 = r#"
            CREATE TABLE IF NOT EXISTS local_threads (
                conversation_key TEXT PRIMARY KEY,
                messages TEXT NOT NULL DEFAULT '[]'
            )
        "#;
        sqlx::query(sql1)
            .execute(&self.db)
            .await
            .context("创建线程表失败")?;

        let sql2 = r#"
            CREATE TABLE IF NOT EXISTS local_thread_summaries (
                conversation_key TEXT PRIMARY KEY,
                show_name TEXT NOT NULL DEFAULT '',
                latest_msg TEXT NOT NULL DEFAULT '',
                latest_msg_send_time INTEGER NOT NULL DEFAULT 0,
                unread_count INTEGER NOT NULL DEFAULT 0
            )
        "#;
        sqlx::query(sql2)
            .execute(&self.db)
            .await
            .context("创建会话摘要表失败")?;

        info!("[ThreadDAO] 数据库表初始化完成");
        Ok(())
    }
}

#[async_trait]
impl ThreadStorage for SqliteThreadStorage {
    async fn load_all_threads(&self) -> Result<HashMap<String, Vec<Message>>> {
        let rows = sqlx::query("SELECT conversation_key, messages FROM local_threads")
            .fetch_all(&self.db)
            .await
            .context("查询线程表失败")?;

        let mut threads = HashMap::new();
        for row in rows {
            let key: String = row.get("conversation_key");
            let raw: String = row.get("messages");
            let messages: Vec<Message> = serde_json::from_str(&raw)
                .context(format!("线程反序列化失败: conversationKey={}", key))?;
            threads.insert(key, messages);
        }
        debug!("[ThreadDAO] 已加载 {} 个会话线程", threads.len());
        Ok(threads)
    }

    async fn save_thread(&self, conversation_key: &str, messages: &[Message]) -> Result<()> {
        let raw = serde_json::to_string(messages).context("线程序列化失败")?;
        sqlx::query(
            "INSERT OR REPLACE INTO local_threads (conversation_key, messages) VALUES (?, ?)",
        )
        .bind(conversation_key)
        .bind(raw)
        .execute(&self.db)
        .await
        .context(format!("写入线程失败: conversationKey={}", conversation_key))?;
        Ok(())
    }

    async fn load_summaries(&self) -> Result<Vec<ThreadSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT conversation_key, show_name, latest_msg, latest_msg_send_time, unread_count
            FROM local_thread_summaries
            "#,
        )
        .fetch_all(&self.db)
        .await
        .context("查询会话摘要表失败")?;

        let summaries = rows
            .into_iter()
            .map(|row| ThreadSummary {
                conversation_key: row.get("conversation_key"),
                show_name: row.get("show_name"),
                latest_msg: row.get("latest_msg"),
                latest_msg_send_time: row.get("latest_msg_send_time"),
                unread_count: row.get("unread_count"),
            })
            .collect();
        Ok(summaries)
    }

    async fn save_summary(&self, summary: &ThreadSummary) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO local_thread_summaries
                (conversation_key, show_name, latest_msg, latest_msg_send_time, unread_count)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&summary.conversation_key)
        .bind(&summary.show_name)
        .bind(&summary.latest_msg)
        .bind(summary.latest_msg_send_time)
        .bind(summary.unread_count)
        .execute(&self.db)
        .await
        .context(format!(
            "写入会话摘要失败: conversationKey={}",
            summary.conversation_key
        ))?;
        Ok(())
    }
}

/// 内存线程存储（测试替身，也是无持久化需求场景的兜底）
#[derive(Default)]
pub struct MemoryThreadStorage {
    threads: std::sync::Mutex<HashMap<String, Vec<Message>>>,
    summaries: std::sync::Mutex<HashMap<String, ThreadSummary>>,
    fail_writes: std::sync::atomic::AtomicBool,
}

impl MemoryThreadStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置一个线程（模拟"上次运行留下的"持久化内容）
    pub fn preload_thread(&self, conversation_key: &str, messages: Vec<Message>) {
        self.threads
            .lock()
            .unwrap()
            .insert(conversation_key.to_string(), messages);
    }

    /// 让后续写入全部失败（验证写失败不回滚内存状态）
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    /// 读取当前落库的线程内容（测试断言用）
    pub fn persisted_thread(&self, conversation_key: &str) -> Option<Vec<Message>> {
        self.threads.lock().unwrap().get(conversation_key).cloned()
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            anyhow::bail!("存储写入被注入失败");
        }
        Ok(())
    }
}

#[async_trait]
impl ThreadStorage for MemoryThreadStorage {
    async fn load_all_threads(&self) -> Result<HashMap<String, Vec<Message>>> {
        Ok(self.threads.lock().unwrap().clone())
    }

    async fn save_thread(&self, conversation_key: &str, messages: &[Message]) -> Result<()> {
        self.check_writable()?;
        self.threads
            .lock()
            .unwrap()
            .insert(conversation_key.to_string(), messages.to_vec());
        Ok(())
    }

    async fn load_summaries(&self) -> Result<Vec<ThreadSummary>> {
        Ok(self.summaries.lock().unwrap().values().cloned().collect())
    }

    async fn save_summary(&self, summary: &ThreadSummary) -> Result<()> {
        self.check_writable()?;
        self.summaries
            .lock()
            .unwrap()
            .insert(summary.conversation_key.clone(), summary.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::conversation::models::DeliveryStatus;

    fn sample_message(id: &str, ts: i64) -> Message {
        Message {
            id: id.to_string(),
            sender_id: "op_1001".to_string(),
            sender_name: "前台-小李".to_string(),
            text: "3 号桌加一份套餐".to_string(),
            created_at: ts,
            status: DeliveryStatus::Sent,
        }
    }

    fn temp_db_url(tag: &str) -> String {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let path = std::env::temp_dir().join(format!("dinetalk_{}_{}.db", tag, nanos));
        format!("sqlite://{}?mode=rwc", path.display())
    }

    #[tokio::test]
    async fn sqlite_thread_round_trip() {
        let storage = SqliteThreadStorage::connect(&temp_db_url("thread"))
            .await
            .expect("应能建库");

        let messages = vec![sample_message("m1", 100), sample_message("m2", 200)];
        storage.save_thread("ch_ops", &messages).await.unwrap();

        let all = storage.load_all_threads().await.unwrap();
        assert_eq!(all.get("ch_ops").unwrap(), &messages);

        // 覆盖写入后读到的是新序列
        let shorter = vec![sample_message("m1", 100)];
        storage.save_thread("ch_ops", &shorter).await.unwrap();
        let all = storage.load_all_threads().await.unwrap();
        assert_eq!(all.get("ch_ops").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sqlite_summary_round_trip() {
        let storage = SqliteThreadStorage::connect(&temp_db_url("summary"))
            .await
            .expect("应能建库");

        let summary = ThreadSummary {
            conversation_key: "ch_ops".to_string(),
            show_name: "ops".to_string(),
            latest_msg: "3 号桌加一份套餐".to_string(),
            latest_msg_send_time: 200,
            unread_count: 2,
        };
        storage.save_summary(&summary).await.unwrap();

        let loaded = storage.load_summaries().await.unwrap();
        assert_eq!(loaded, vec![summary]);
    }
}
