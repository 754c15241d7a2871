use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::OptionalExtension;
use thiserror::Error;

use super::channel::{Ability, Channel, ChannelStatus};
use super::store::{ConsumeLog, RelayStore, Token, TokenStatus, User};
use crate::RelayError;

#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

#[derive(Debug, Error)]
pub enum SqliteStoreError {
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0} not found")]
    NotFound(String),
    #[error("insufficient quota: needed={needed} remaining={remaining}")]
    InsufficientQuota { needed: i64, remaining: i64 },
}

impl From<SqliteStoreError> for RelayError {
    fn from(err: SqliteStoreError) -> Self {
        match err {
            SqliteStoreError::NotFound(what) => Self::Unauthorized(format!("{what} not found")),
            SqliteStoreError::InsufficientQuota { needed, remaining } => {
                Self::InsufficientQuota { needed, remaining }
            }
            other => Self::Storage(other.to_string()),
        }
    }
}

type StoreResult<T> = Result<T, SqliteStoreError>;

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> StoreResult<()> {
        self.with_connection(|_| Ok(())).await
    }

    async fn with_connection<T, F>(&self, op: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> StoreResult<T> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> StoreResult<T> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            op(&mut conn)
        })
        .await?
    }
}

const CHANNEL_COLUMNS: &str = "c.value_json, c.status, c.used_quota";

fn channel_from_parts(value_json: &str, status: i64, used_quota: i64) -> StoreResult<Channel> {
    let mut channel: Channel = serde_json::from_str(value_json)?;
    channel.status = ChannelStatus::from_u8(u8::try_from(status).unwrap_or(0));
    channel.used_quota = used_quota;
    Ok(channel)
}

fn ability_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Ability> {
    Ok(Ability {
        group: row.get(0)?,
        model: row.get(1)?,
        channel_id: row.get(2)?,
        enabled: row.get::<_, i64>(3)? != 0,
        priority: row.get(4)?,
        weight: u32::try_from(row.get::<_, i64>(5)?).unwrap_or(0),
    })
}

fn token_from_parts(
    value_json: &str,
    status: &str,
    remain_quota: i64,
    used_quota: i64,
) -> StoreResult<Token> {
    let mut token: Token = serde_json::from_str(value_json)?;
    token.status = TokenStatus::parse(status);
    token.remain_quota = remain_quota;
    token.used_quota = used_quota;
    Ok(token)
}

fn user_from_parts(
    value_json: &str,
    quota: i64,
    used_quota: i64,
    request_count: i64,
) -> StoreResult<User> {
    let mut user: User = serde_json::from_str(value_json)?;
    user.quota = quota;
    user.used_quota = used_quota;
    user.request_count = request_count;
    Ok(user)
}

#[async_trait]
impl RelayStore for SqliteStore {
    async fn load_channels(&self) -> crate::Result<Vec<Channel>> {
        Ok(self
            .with_connection(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {CHANNEL_COLUMNS} FROM channels c ORDER BY c.id"
                ))?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })?;
                let mut channels = Vec::new();
                for row in rows {
                    let (value_json, status, used_quota) = row?;
                    channels.push(channel_from_parts(&value_json, status, used_quota)?);
                }
                Ok(channels)
            })
            .await?)
    }

    async fn load_abilities(&self) -> crate::Result<Vec<Ability>> {
        Ok(self
            .with_connection(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT group_name, model, channel_id, enabled, priority, weight
                     FROM abilities ORDER BY channel_id, group_name, model",
                )?;
                let rows = stmt.query_map([], ability_from_row)?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?)
    }

    async fn find_channels(&self, group: &str, model: &str) -> crate::Result<Vec<(Ability, Channel)>> {
        let group = group.to_string();
        let model = model.to_string();
        Ok(self
            .with_connection(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT a.group_name, a.model, a.channel_id, a.enabled, a.priority, a.weight,
                            {CHANNEL_COLUMNS}
                     FROM abilities a JOIN channels c ON c.id = a.channel_id
                     WHERE a.group_name = ?1 AND a.model = ?2 AND a.enabled = 1 AND c.status = ?3
                     ORDER BY a.priority DESC, a.channel_id"
                ))?;
                let enabled = i64::from(ChannelStatus::Enabled.as_u8());
                let rows = stmt.query_map(rusqlite::params![group, model, enabled], |row| {
                    Ok((
                        ability_from_row(row)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, i64>(8)?,
                    ))
                })?;
                let mut out = Vec::new();
                for row in rows {
                    let (ability, value_json, status, used_quota) = row?;
                    out.push((ability, channel_from_parts(&value_json, status, used_quota)?));
                }
                Ok(out)
            })
            .await?)
    }

    async fn get_channel(&self, id: i64) -> crate::Result<Option<Channel>> {
        Ok(self
            .with_connection(move |conn| {
                let row = conn
                    .query_row(
                        &format!("SELECT {CHANNEL_COLUMNS} FROM channels c WHERE c.id = ?1"),
                        rusqlite::params![id],
                        |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, i64>(1)?,
                                row.get::<_, i64>(2)?,
                            ))
                        },
                    )
                    .optional()?;
                row.map(|(value_json, status, used_quota)| {
                    channel_from_parts(&value_json, status, used_quota)
                })
                .transpose()
            })
            .await?)
    }

    async fn upsert_channel(&self, channel: &Channel) -> crate::Result<()> {
        let value_json = serde_json::to_string(channel)?;
        let id = channel.id;
        let status = i64::from(channel.status.as_u8());
        let used_quota = channel.used_quota;
        let abilities = channel.abilities();
        Ok(self
            .with_connection(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO channels (id, value_json, status, used_quota) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(id) DO UPDATE SET value_json = excluded.value_json,
                         status = excluded.status, used_quota = excluded.used_quota",
                    rusqlite::params![id, value_json, status, used_quota],
                )?;
                tx.execute(
                    "DELETE FROM abilities WHERE channel_id = ?1",
                    rusqlite::params![id],
                )?;
                for ability in abilities {
                    tx.execute(
                        "INSERT OR REPLACE INTO abilities
                         (group_name, model, channel_id, enabled, priority, weight)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        rusqlite::params![
                            ability.group,
                            ability.model,
                            ability.channel_id,
                            i64::from(ability.enabled),
                            ability.priority,
                            i64::from(ability.weight),
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?)
    }

    async fn update_channel_status(&self, id: i64, status: ChannelStatus) -> crate::Result<bool> {
        Ok(self
            .with_connection(move |conn| {
                let tx = conn.transaction()?;
                let changed = tx.execute(
                    "UPDATE channels SET status = ?2 WHERE id = ?1",
                    rusqlite::params![id, i64::from(status.as_u8())],
                )?;
                tx.execute(
                    "UPDATE abilities SET enabled = ?2 WHERE channel_id = ?1",
                    rusqlite::params![id, i64::from(status.is_enabled())],
                )?;
                tx.commit()?;
                Ok(changed > 0)
            })
            .await?)
    }

    async fn add_channel_used_quota(&self, id: i64, quota: i64) -> crate::Result<()> {
        Ok(self
            .with_connection(move |conn| {
                conn.execute(
                    "UPDATE channels SET used_quota = used_quota + ?2 WHERE id = ?1",
                    rusqlite::params![id, quota],
                )?;
                Ok(())
            })
            .await?)
    }

    async fn find_token(&self, key: &str) -> crate::Result<Option<Token>> {
        let key = key.to_string();
        Ok(self
            .with_connection(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT value_json, status, remain_quota, used_quota FROM tokens WHERE key = ?1",
                        rusqlite::params![key],
                        |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, String>(1)?,
                                row.get::<_, i64>(2)?,
                                row.get::<_, i64>(3)?,
                            ))
                        },
                    )
                    .optional()?;
                row.map(|(value_json, status, remain, used)| {
                    token_from_parts(&value_json, &status, remain, used)
                })
                .transpose()
            })
            .await?)
    }

    async fn upsert_token(&self, token: &Token) -> crate::Result<()> {
        let value_json = serde_json::to_string(token)?;
        let token = token.clone();
        Ok(self
            .with_connection(move |conn| {
                conn.execute(
                    "INSERT INTO tokens (id, key, user_id, value_json, status, remain_quota, used_quota)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(id) DO UPDATE SET key = excluded.key, user_id = excluded.user_id,
                         value_json = excluded.value_json, status = excluded.status,
                         remain_quota = excluded.remain_quota, used_quota = excluded.used_quota",
                    rusqlite::params![
                        token.id,
                        token.key,
                        token.user_id,
                        value_json,
                        token.status.as_str(),
                        token.remain_quota,
                        token.used_quota,
                    ],
                )?;
                Ok(())
            })
            .await?)
    }

    async fn get_user(&self, id: i64) -> crate::Result<Option<User>> {
        Ok(self
            .with_connection(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT value_json, quota, used_quota, request_count FROM users WHERE id = ?1",
                        rusqlite::params![id],
                        |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, i64>(1)?,
                                row.get::<_, i64>(2)?,
                                row.get::<_, i64>(3)?,
                            ))
                        },
                    )
                    .optional()?;
                row.map(|(value_json, quota, used, count)| {
                    user_from_parts(&value_json, quota, used, count)
                })
                .transpose()
            })
            .await?)
    }

    async fn upsert_user(&self, user: &User) -> crate::Result<()> {
        let value_json = serde_json::to_string(user)?;
        let (id, quota, used_quota, request_count) =
            (user.id, user.quota, user.used_quota, user.request_count);
        Ok(self
            .with_connection(move |conn| {
                conn.execute(
                    "INSERT INTO users (id, value_json, quota, used_quota, request_count)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(id) DO UPDATE SET value_json = excluded.value_json,
                         quota = excluded.quota, used_quota = excluded.used_quota,
                         request_count = excluded.request_count",
                    rusqlite::params![id, value_json, quota, used_quota, request_count],
                )?;
                Ok(())
            })
            .await?)
    }

    async fn reserve_quota(
        &self,
        token_id: i64,
        user_id: i64,
        amount: i64,
        unlimited: bool,
    ) -> crate::Result<()> {
        Ok(self
            .with_connection(move |conn| {
                let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
                let user_quota: i64 = tx
                    .query_row(
                        "SELECT quota FROM users WHERE id = ?1",
                        rusqlite::params![user_id],
                        |row| row.get(0),
                    )
                    .optional()?
                    .ok_or_else(|| SqliteStoreError::NotFound(format!("user {user_id}")))?;
                let token_quota: i64 = tx
                    .query_row(
                        "SELECT remain_quota FROM tokens WHERE id = ?1",
                        rusqlite::params![token_id],
                        |row| row.get(0),
                    )
                    .optional()?
                    .ok_or_else(|| SqliteStoreError::NotFound(format!("token {token_id}")))?;

                if user_quota < amount {
                    return Err(SqliteStoreError::InsufficientQuota {
                        needed: amount,
                        remaining: user_quota,
                    });
                }
                if !unlimited && token_quota < amount {
                    return Err(SqliteStoreError::InsufficientQuota {
                        needed: amount,
                        remaining: token_quota,
                    });
                }

                apply_delta(&tx, token_id, user_id, amount)?;
                tx.commit()?;
                Ok(())
            })
            .await?)
    }

    async fn adjust_quota(&self, token_id: i64, user_id: i64, delta: i64) -> crate::Result<()> {
        Ok(self
            .with_connection(move |conn| {
                let tx = conn.transaction()?;
                apply_delta(&tx, token_id, user_id, delta)?;
                tx.commit()?;
                Ok(())
            })
            .await?)
    }

    async fn record_consume(&self, log: ConsumeLog) -> crate::Result<()> {
        Ok(self
            .with_connection(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO consume_logs
                     (created_at, user_id, token_id, token_name, channel_id, model, prompt_tokens,
                      completion_tokens, quota, elapsed_ms, is_stream, content)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    rusqlite::params![
                        log.created_at,
                        log.user_id,
                        log.token_id,
                        log.token_name,
                        log.channel_id,
                        log.model,
                        u64_to_i64(log.prompt_tokens),
                        u64_to_i64(log.completion_tokens),
                        log.quota,
                        u64_to_i64(log.elapsed_ms),
                        i64::from(log.is_stream),
                        log.content,
                    ],
                )?;
                tx.execute(
                    "UPDATE users SET used_quota = used_quota + ?2, request_count = request_count + 1
                     WHERE id = ?1",
                    rusqlite::params![log.user_id, log.quota],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await?)
    }

    async fn list_consume_logs(
        &self,
        user_id: Option<i64>,
        limit: usize,
    ) -> crate::Result<Vec<ConsumeLog>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        Ok(self
            .with_connection(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, created_at, user_id, token_id, token_name, channel_id, model,
                            prompt_tokens, completion_tokens, quota, elapsed_ms, is_stream, content
                     FROM consume_logs
                     WHERE ?1 IS NULL OR user_id = ?1
                     ORDER BY id DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(rusqlite::params![user_id, limit], |row| {
                    Ok(ConsumeLog {
                        id: row.get(0)?,
                        created_at: row.get(1)?,
                        user_id: row.get(2)?,
                        token_id: row.get(3)?,
                        token_name: row.get(4)?,
                        channel_id: row.get(5)?,
                        model: row.get(6)?,
                        prompt_tokens: i64_to_u64(row.get(7)?),
                        completion_tokens: i64_to_u64(row.get(8)?),
                        quota: row.get(9)?,
                        elapsed_ms: i64_to_u64(row.get(10)?),
                        is_stream: row.get::<_, i64>(11)? != 0,
                        content: row.get(12)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?)
    }
}

fn apply_delta(
    tx: &rusqlite::Transaction<'_>,
    token_id: i64,
    user_id: i64,
    delta: i64,
) -> Result<(), rusqlite::Error> {
    tx.execute(
        "UPDATE users SET quota = quota - ?2 WHERE id = ?1",
        rusqlite::params![user_id, delta],
    )?;
    tx.execute(
        "UPDATE tokens SET remain_quota = remain_quota - ?2, used_quota = used_quota + ?2
         WHERE id = ?1",
        rusqlite::params![token_id, delta],
    )?;
    Ok(())
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS channels (
            id INTEGER PRIMARY KEY NOT NULL,
            value_json TEXT NOT NULL,
            status INTEGER NOT NULL,
            used_quota INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS abilities (
            group_name TEXT NOT NULL,
            model TEXT NOT NULL,
            channel_id INTEGER NOT NULL,
            enabled INTEGER NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            weight INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (group_name, model, channel_id)
        );
        CREATE INDEX IF NOT EXISTS idx_abilities_channel_id ON abilities(channel_id);

        CREATE TABLE IF NOT EXISTS tokens (
            id INTEGER PRIMARY KEY NOT NULL,
            key TEXT NOT NULL UNIQUE,
            user_id INTEGER NOT NULL,
            value_json TEXT NOT NULL,
            status TEXT NOT NULL,
            remain_quota INTEGER NOT NULL DEFAULT 0,
            used_quota INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY NOT NULL,
            value_json TEXT NOT NULL,
            quota INTEGER NOT NULL DEFAULT 0,
            used_quota INTEGER NOT NULL DEFAULT 0,
            request_count INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS consume_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at INTEGER NOT NULL,
            user_id INTEGER NOT NULL,
            token_id INTEGER NOT NULL,
            token_name TEXT NOT NULL,
            channel_id INTEGER NOT NULL,
            model TEXT NOT NULL,
            prompt_tokens INTEGER NOT NULL,
            completion_tokens INTEGER NOT NULL,
            quota INTEGER NOT NULL,
            elapsed_ms INTEGER NOT NULL,
            is_stream INTEGER NOT NULL,
            content TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_consume_logs_user_id ON consume_logs(user_id);",
    )
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn u64_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 { 0 } else { value as u64 }
}
