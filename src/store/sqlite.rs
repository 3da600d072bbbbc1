use super::{
    AutoDeliveryConfig, AutoReplyRule, CredentialStore, DeliveryRecord, DeliveryState,
    DeliveryStore, GoodsConfigStore, InsertOutcome, MatchType, MessageStore, ReplyLog,
    ReplyRecord, StoredToken, WILDCARD_GOODS_ID,
};
use crate::codec::DecryptedMessage;
use crate::config::AccountConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

/// SQLite-backed implementation of every store trait.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data directory: {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open store DB: {}", path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().context("Failed to open in-memory store")?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             CREATE TABLE IF NOT EXISTS accounts (
                id          TEXT PRIMARY KEY,
                cookie      TEXT NOT NULL,
                device_id   TEXT,
                updated_at  TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS tokens (
                account_id     TEXT PRIMARY KEY,
                credential     TEXT NOT NULL,
                expires_at_ms  INTEGER NOT NULL,
                updated_at     TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS goods_delivery (
                account_id    TEXT NOT NULL,
                goods_id      TEXT NOT NULL,
                enabled       INTEGER NOT NULL DEFAULT 0,
                content       TEXT NOT NULL DEFAULT '',
                auto_confirm  INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (account_id, goods_id)
             );
             CREATE TABLE IF NOT EXISTS reply_rules (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id  TEXT NOT NULL,
                goods_id    TEXT NOT NULL,
                position    INTEGER NOT NULL,
                keyword     TEXT NOT NULL,
                match_type  TEXT NOT NULL,
                reply       TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_reply_rules_goods ON reply_rules(account_id, goods_id, position);
             CREATE TABLE IF NOT EXISTS messages (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id      TEXT NOT NULL,
                pnm_id          TEXT NOT NULL,
                s_id            TEXT NOT NULL,
                content_type    INTEGER NOT NULL,
                msg_content     TEXT NOT NULL,
                sender_user_id  TEXT NOT NULL,
                sender_name     TEXT NOT NULL,
                goods_id        TEXT,
                order_id        TEXT,
                message_time    INTEGER NOT NULL,
                direction       TEXT NOT NULL,
                created_at      TEXT NOT NULL,
                UNIQUE (account_id, pnm_id)
             );
             CREATE TABLE IF NOT EXISTS deliveries (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id      TEXT NOT NULL,
                goods_id        TEXT NOT NULL,
                pnm_id          TEXT NOT NULL,
                buyer_user_id   TEXT NOT NULL,
                buyer_name      TEXT NOT NULL,
                content         TEXT,
                state           TEXT NOT NULL,
                order_id        TEXT,
                failure_reason  TEXT,
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL,
                UNIQUE (account_id, pnm_id)
             );
             CREATE TABLE IF NOT EXISTS replies (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id       TEXT NOT NULL,
                goods_id         TEXT,
                buyer_user_id    TEXT NOT NULL,
                message          TEXT NOT NULL,
                matched_keyword  TEXT NOT NULL,
                reply            TEXT NOT NULL,
                success          INTEGER NOT NULL,
                created_at       TEXT NOT NULL
             );",
        )
        .context("Failed to initialize store schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Mirror `[[accounts]]` from the config file: cookies, delivery settings and
    /// keyword rules. Rules for a configured goods id are replaced wholesale.
    pub fn sync_accounts(&self, accounts: &[AccountConfig]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        for account in accounts {
            if !account.cookie.trim().is_empty() {
                tx.execute(
                    "INSERT INTO accounts (id, cookie, device_id, updated_at) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(id) DO UPDATE SET cookie = excluded.cookie,
                        device_id = COALESCE(excluded.device_id, accounts.device_id),
                        updated_at = excluded.updated_at",
                    params![account.id, account.cookie.trim(), account.device_id, now],
                )?;
            }
            for goods in &account.goods {
                tx.execute(
                    "INSERT INTO goods_delivery (account_id, goods_id, enabled, content, auto_confirm)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(account_id, goods_id) DO UPDATE SET enabled = excluded.enabled,
                        content = excluded.content, auto_confirm = excluded.auto_confirm",
                    params![
                        account.id,
                        goods.goods_id,
                        goods.delivery.enabled,
                        goods.delivery.content,
                        goods.delivery.auto_confirm_shipment
                    ],
                )?;
                tx.execute(
                    "DELETE FROM reply_rules WHERE account_id = ?1 AND goods_id = ?2",
                    params![account.id, goods.goods_id],
                )?;
                for (position, rule) in goods.replies.iter().enumerate() {
                    tx.execute(
                        "INSERT INTO reply_rules (account_id, goods_id, position, keyword, match_type, reply)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![
                            account.id,
                            goods.goods_id,
                            i64::try_from(position).unwrap_or(i64::MAX),
                            rule.keyword,
                            rule.match_type.as_str(),
                            rule.reply
                        ],
                    )?;
                }
            }
        }
        tx.commit().context("Failed to sync accounts from config")?;
        Ok(())
    }

    pub fn device_id(&self, account_id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let id = conn
            .query_row(
                "SELECT device_id FROM accounts WHERE id = ?1",
                params![account_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten();
        Ok(id)
    }

    pub fn set_device_id(&self, account_id: &str, device_id: &str) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE accounts SET device_id = ?2 WHERE id = ?1",
            params![account_id, device_id],
        )?;
        Ok(())
    }

    pub fn delivery_count(&self, account_id: &str) -> Result<usize> {
        let count: i64 = self.conn.lock().query_row(
            "SELECT COUNT(*) FROM deliveries WHERE account_id = ?1",
            params![account_id],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    pub fn replies(&self, account_id: &str) -> Result<Vec<ReplyRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT account_id, goods_id, buyer_user_id, message, matched_keyword, reply, success
             FROM replies WHERE account_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![account_id], |row| {
            Ok(ReplyRecord {
                account_id: row.get(0)?,
                xy_goods_id: row.get(1)?,
                buyer_user_id: row.get(2)?,
                message: row.get(3)?,
                matched_keyword: row.get(4)?,
                reply: row.get(5)?,
                success: row.get(6)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    fn delivery_config_for(&self, account_id: &str, goods_id: &str) -> Result<Option<AutoDeliveryConfig>> {
        let conn = self.conn.lock();
        let config = conn
            .query_row(
                "SELECT enabled, content, auto_confirm FROM goods_delivery
                 WHERE account_id = ?1 AND goods_id = ?2",
                params![account_id, goods_id],
                |row| {
                    Ok(AutoDeliveryConfig {
                        enabled: row.get(0)?,
                        content: row.get(1)?,
                        auto_confirm_shipment: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(config)
    }

    fn reply_rules_for(&self, account_id: &str, goods_id: &str) -> Result<Vec<AutoReplyRule>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT keyword, match_type, reply FROM reply_rules
             WHERE account_id = ?1 AND goods_id = ?2 ORDER BY position, id",
        )?;
        let rows = stmt.query_map(params![account_id, goods_id], |row| {
            let match_type: String = row.get(1)?;
            Ok(AutoReplyRule {
                keyword: row.get(0)?,
                match_type: MatchType::parse(&match_type).unwrap_or_default(),
                reply: row.get(2)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }
}

#[async_trait]
impl CredentialStore for SqliteStore {
    async fn get_cookie(&self, account_id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let cookie = conn
            .query_row(
                "SELECT cookie FROM accounts WHERE id = ?1",
                params![account_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(cookie.filter(|c| !c.trim().is_empty()))
    }

    async fn update_cookie(&self, account_id: &str, cookie: &str) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO accounts (id, cookie, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET cookie = excluded.cookie, updated_at = excluded.updated_at",
            params![account_id, cookie, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    async fn load_token(&self, account_id: &str) -> Result<Option<StoredToken>> {
        let conn = self.conn.lock();
        let token = conn
            .query_row(
                "SELECT credential, expires_at_ms FROM tokens WHERE account_id = ?1",
                params![account_id],
                |row| {
                    Ok(StoredToken {
                        credential: row.get(0)?,
                        expires_at_ms: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(token)
    }

    async fn save_token(&self, account_id: &str, token: &StoredToken) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO tokens (account_id, credential, expires_at_ms, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(account_id) DO UPDATE SET credential = excluded.credential,
                expires_at_ms = excluded.expires_at_ms, updated_at = excluded.updated_at",
            params![account_id, token.credential, token.expires_at_ms, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

#[async_trait]
impl GoodsConfigStore for SqliteStore {
    async fn auto_delivery_config(
        &self,
        account_id: &str,
        goods_id: &str,
    ) -> Result<Option<AutoDeliveryConfig>> {
        if let Some(config) = self.delivery_config_for(account_id, goods_id)? {
            return Ok(Some(config));
        }
        self.delivery_config_for(account_id, WILDCARD_GOODS_ID)
    }

    async fn auto_reply_config(&self, account_id: &str, goods_id: &str) -> Result<Vec<AutoReplyRule>> {
        let rules = self.reply_rules_for(account_id, goods_id)?;
        if !rules.is_empty() || goods_id == WILDCARD_GOODS_ID {
            return Ok(rules);
        }
        self.reply_rules_for(account_id, WILDCARD_GOODS_ID)
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn append(&self, account_id: &str, message: &DecryptedMessage) -> Result<bool> {
        let changed = self.conn.lock().execute(
            "INSERT INTO messages (account_id, pnm_id, s_id, content_type, msg_content, sender_user_id,
                sender_name, goods_id, order_id, message_time, direction, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(account_id, pnm_id) DO NOTHING",
            params![
                account_id,
                message.pnm_id,
                message.s_id,
                message.content_type,
                message.msg_content,
                message.sender_user_id,
                message.sender_name,
                message.xy_goods_id,
                message.order_id,
                message.message_time,
                message.direction.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(changed > 0)
    }
}

#[async_trait]
impl DeliveryStore for SqliteStore {
    async fn insert_pending(&self, record: &DeliveryRecord) -> Result<InsertOutcome> {
        let now = Utc::now().to_rfc3339();
        let changed = self.conn.lock().execute(
            "INSERT INTO deliveries (account_id, goods_id, pnm_id, buyer_user_id, buyer_name, content,
                state, order_id, failure_reason, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, NULL, ?8, ?8)
             ON CONFLICT(account_id, pnm_id) DO NOTHING",
            params![
                record.account_id,
                record.xy_goods_id,
                record.pnm_id,
                record.buyer_user_id,
                record.buyer_name,
                record.content,
                record.order_id,
                now,
            ],
        )?;
        Ok(if changed == 0 {
            InsertOutcome::Duplicate
        } else {
            InsertOutcome::Inserted
        })
    }

    async fn finish(
        &self,
        account_id: &str,
        pnm_id: &str,
        state: DeliveryState,
        content: Option<&str>,
        failure_reason: Option<&str>,
    ) -> Result<()> {
        let changed = self.conn.lock().execute(
            "UPDATE deliveries SET state = ?3, content = COALESCE(?4, content), failure_reason = ?5,
                updated_at = ?6
             WHERE account_id = ?1 AND pnm_id = ?2 AND state = 'pending'",
            params![
                account_id,
                pnm_id,
                state.as_str(),
                content,
                failure_reason,
                Utc::now().to_rfc3339()
            ],
        )?;
        if changed == 0 {
            tracing::warn!("Store: delivery {account_id}/{pnm_id} was not pending; state unchanged");
        }
        Ok(())
    }

    async fn get(&self, account_id: &str, pnm_id: &str) -> Result<Option<DeliveryRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                "SELECT account_id, goods_id, pnm_id, buyer_user_id, buyer_name, content, state,
                    order_id, failure_reason
                 FROM deliveries WHERE account_id = ?1 AND pnm_id = ?2",
                params![account_id, pnm_id],
                |row| {
                    let state: String = row.get(6)?;
                    Ok(DeliveryRecord {
                        account_id: row.get(0)?,
                        xy_goods_id: row.get(1)?,
                        pnm_id: row.get(2)?,
                        buyer_user_id: row.get(3)?,
                        buyer_name: row.get(4)?,
                        content: row.get(5)?,
                        state: DeliveryState::parse(&state).unwrap_or(DeliveryState::Failed),
                        order_id: row.get(7)?,
                        failure_reason: row.get(8)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }
}

#[async_trait]
impl ReplyLog for SqliteStore {
    async fn record_reply(&self, record: &ReplyRecord) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO replies (account_id, goods_id, buyer_user_id, message, matched_keyword, reply,
                success, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.account_id,
                record.xy_goods_id,
                record.buyer_user_id,
                record.message,
                record.matched_keyword,
                record.reply,
                record.success,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}
