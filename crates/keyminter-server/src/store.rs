use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use keyminter_config::Config;
use keyminter_contracts::KeyRecord;
use reqwest::{Client, StatusCode};
use rusqlite::{ffi, params, Connection};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store transport error: {0}")]
    Transport(String),
    #[error("store returned HTTP {0}")]
    Status(u16),
    #[error("store response could not be decoded: {0}")]
    Decode(String),
    #[error("owner already holds an active key")]
    Conflict,
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Persistence for issued keys.
///
/// `insert` must report [`StoreError::Conflict`] when the backend rejects a
/// second unused key for the same owner. Backends without such a constraint
/// simply never return it.
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn find_active(&self, owner_id: &str) -> Result<bool, StoreError>;
    async fn insert(&self, record: &KeyRecord) -> Result<(), StoreError>;
}

pub fn store_from_config(cfg: &Config) -> Result<Arc<dyn KeyStore>, String> {
    let store: Arc<dyn KeyStore> = match cfg.store.kind.as_str() {
        "rest" => {
            let base_url = cfg
                .store
                .base_url
                .as_deref()
                .ok_or_else(|| "store.base_url is required for rest store".to_string())?;
            let api_key = cfg
                .store
                .api_key
                .as_deref()
                .ok_or_else(|| "store.api_key is required for rest store".to_string())?;
            Arc::new(RestKeyStore::new(
                base_url,
                &cfg.store.table,
                api_key,
                Duration::from_millis(cfg.store.timeout_ms),
            )?)
        }
        "sqlite" => {
            let sqlite_path = cfg
                .store
                .sqlite_path
                .as_deref()
                .ok_or_else(|| "store.sqlite_path is required for sqlite store".to_string())?;
            Arc::new(SqliteKeyStore::new(sqlite_path, &cfg.store.table)?)
        }
        "memory" => Arc::new(MemoryKeyStore::default()),
        other => return Err(format!("unsupported store type: {other}")),
    };
    Ok(store)
}

/// PostgREST-style table endpoint (`{base_url}/rest/v1/{table}`).
pub struct RestKeyStore {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl RestKeyStore {
    pub fn new(
        base_url: &str,
        table: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            client,
            endpoint: format!("{}/rest/v1/{}", base_url.trim_end_matches('/'), table),
            api_key: api_key.to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }
}

#[async_trait]
impl KeyStore for RestKeyStore {
    async fn find_active(&self, owner_id: &str) -> Result<bool, StoreError> {
        let response = self
            .authorized(self.client.get(&self.endpoint))
            .query(&[
                ("user_id", format!("eq.{owner_id}")),
                ("used", "eq.false".to_string()),
            ])
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(StoreError::Status(response.status().as_u16()));
        }
        let rows: Vec<Value> = response
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(!rows.is_empty())
    }

    async fn insert(&self, record: &KeyRecord) -> Result<(), StoreError> {
        let response = self
            .authorized(self.client.post(&self.endpoint))
            .header("Prefer", "return=minimal")
            .json(record)
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::CONFLICT => Err(StoreError::Conflict),
            s => Err(StoreError::Status(s.as_u16())),
        }
    }
}

/// In-process store; check and insert run under one lock, so the
/// one-active-key rule holds even for concurrent requests.
#[derive(Default)]
pub struct MemoryKeyStore {
    keys: Mutex<Vec<KeyRecord>>,
}

impl MemoryKeyStore {
    pub fn with_records(records: Vec<KeyRecord>) -> Self {
        Self {
            keys: Mutex::new(records),
        }
    }

    pub async fn records(&self) -> Vec<KeyRecord> {
        self.keys.lock().await.clone()
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn find_active(&self, owner_id: &str) -> Result<bool, StoreError> {
        let keys = self.keys.lock().await;
        Ok(keys
            .iter()
            .any(|k| k.user_id == owner_id && !k.used))
    }

    async fn insert(&self, record: &KeyRecord) -> Result<(), StoreError> {
        let mut keys = self.keys.lock().await;
        let owner_active = !record.used
            && keys
                .iter()
                .any(|k| k.user_id == record.user_id && !k.used);
        if owner_active {
            return Err(StoreError::Conflict);
        }
        keys.push(record.clone());
        Ok(())
    }
}

/// Local sqlite table with a partial unique index on unused keys per owner.
pub struct SqliteKeyStore {
    conn: Mutex<Connection>,
    table: String,
}

impl SqliteKeyStore {
    pub fn new(path: &str, table: &str) -> Result<Self, String> {
        if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(format!("invalid sqlite table name: {table}"));
        }
        let conn = Connection::open(path).map_err(|e| e.to_string())?;
        conn.execute_batch(&format!(
            "
            CREATE TABLE IF NOT EXISTS {table} (
                key TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                used INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS {table}_one_active_per_user
                ON {table} (user_id) WHERE used = 0;
            "
        ))
        .map_err(|e| e.to_string())?;
        Ok(Self {
            conn: Mutex::new(conn),
            table: table.to_string(),
        })
    }
}

#[async_trait]
impl KeyStore for SqliteKeyStore {
    async fn find_active(&self, owner_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE user_id = ?1 AND used = 0)",
            self.table
        );
        let exists: i64 = conn
            .query_row(&sql, params![owner_id], |row| row.get(0))
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(exists != 0)
    }

    async fn insert(&self, record: &KeyRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "INSERT INTO {} (key, user_id, used, created_at) VALUES (?1, ?2, ?3, ?4)",
            self.table
        );
        conn.execute(
            &sql,
            params![
                record.key,
                record.user_id,
                record.used,
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(|e| self.insert_error(e))?;
        Ok(())
    }
}

impl SqliteKeyStore {
    /// Only the per-owner partial index means "owner already has a key"; a
    /// primary-key collision on `key` is a plain backend failure.
    fn insert_error(&self, err: rusqlite::Error) -> StoreError {
        if let rusqlite::Error::SqliteFailure(failure, Some(message)) = &err {
            let owner_column = format!("{}.user_id", self.table);
            if failure.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
                && message.contains(&owner_column)
            {
                return StoreError::Conflict;
            }
        }
        StoreError::Backend(err.to_string())
    }
}
