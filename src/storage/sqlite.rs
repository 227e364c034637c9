//! Durable state store on SQLite.
//!
//! A single key/value table keeps the engine swap-friendly: the rest of the
//! service only ever sees the [`StateStore`] contract.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use super::{mac_key, switch_key, DeviceState, StateStore, SwitchMacTable, KEY_LIVENESS};
use crate::error::Result;

/// State store backed by a SQLite database file.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (or creates) the database at `path` and prepares the schema.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS discovery_state (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn get_raw(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM discovery_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set_raw(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO discovery_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete_raw(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM discovery_state WHERE key = ?1", params![key])?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn get_switch_state(&self, name: &str) -> Result<Option<SwitchMacTable>> {
        match self.get_raw(&switch_key(name))? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set_switch_state(&self, name: &str, state: &SwitchMacTable) -> Result<()> {
        self.set_raw(&switch_key(name), &serde_json::to_string(state)?)
    }

    async fn get_mac_state(&self, mac: &str) -> Result<Option<DeviceState>> {
        match self.get_raw(&mac_key(mac))? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set_mac_state(&self, mac: &str, state: &DeviceState) -> Result<()> {
        self.set_raw(&mac_key(mac), &serde_json::to_string(state)?)
    }

    async fn clear_mac_state(&self, mac: &str) -> Result<()> {
        self.delete_raw(&mac_key(mac))
    }

    // Write/read/delete roundtrip so the probe exercises the full path.
    async fn check_liveness(&self) -> bool {
        let probe = "ok";
        if let Err(e) = self.set_raw(KEY_LIVENESS, probe) {
            warn!("Unable to store liveness key: {e}");
            return false;
        }
        match self.get_raw(KEY_LIVENESS) {
            Ok(Some(v)) if v == probe => {}
            other => {
                warn!("Unable to read liveness key back: {other:?}");
                return false;
            }
        }
        if let Err(e) = self.delete_raw(KEY_LIVENESS) {
            warn!("Unable to delete liveness key: {e}");
            return false;
        }
        true
    }
}
