use anyhow::Result;
use async_trait::async_trait;
use rusqlite::params;

use super::Store;
use crate::core::reconciliation::SettingsStore;

#[derive(Debug, Clone, serde::Serialize)]
pub struct SettingRecord {
    pub key: String,
    pub value: String,
    pub updated_at: String,
}

impl Store {
    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, CURRENT_TIMESTAMP)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
            params![key, value],
        )?;
        Ok(())
    }

    pub async fn remove_setting(&self, key: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let rows_deleted = db.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(rows_deleted > 0)
    }

    pub async fn list_settings(&self, prefix: Option<&str>) -> Result<Vec<SettingRecord>> {
        let db = self.db.lock().await;
        let pattern = format!("{}%", prefix.unwrap_or(""));
        let mut stmt = db.prepare(
            "SELECT key, value, updated_at FROM settings WHERE key LIKE ?1 ORDER BY key ASC",
        )?;

        let rows = stmt.query_map(params![pattern], |row| {
            Ok(SettingRecord {
                key: row.get(0)?,
                value: row.get(1)?,
                updated_at: row.get(2)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}

#[async_trait]
impl SettingsStore for Store {
    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare("SELECT value FROM settings WHERE key = ?1")?;
        let mut rows = stmt.query(params![key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }
}
