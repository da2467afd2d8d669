//! Settings repository.

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::models::Config;

/// Repository for persisted settings.
pub struct ConfigRepo;

impl ConfigRepo {
    /// Get a setting.
    pub fn get(conn: &Connection, key: &str) -> Result<Option<Config>> {
        let mut stmt = conn.prepare("SELECT key, value FROM config WHERE key = ?1")?;

        let raw: Option<(String, String)> = stmt
            .query_row([key], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?;

        match raw {
            Some((key, value)) => Ok(Some(Config {
                key,
                value: serde_json::from_str(&value)?,
            })),
            None => Ok(None),
        }
    }

    /// Insert or overwrite a setting.
    pub fn set(conn: &Connection, key: &str, value: &serde_json::Value) -> Result<()> {
        let value_json = serde_json::to_string(value)?;

        conn.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value_json],
        )?;

        Ok(())
    }

    /// Remove a setting. Returns whether it existed.
    pub fn delete(conn: &Connection, key: &str) -> Result<bool> {
        let deleted = conn.execute("DELETE FROM config WHERE key = ?1", [key])?;
        Ok(deleted > 0)
    }

    /// All settings ordered by key.
    pub fn get_all(conn: &Connection) -> Result<Vec<Config>> {
        let mut stmt = conn.prepare("SELECT key, value FROM config ORDER BY key")?;

        let raws: Vec<(String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<_, _>>()?;

        raws.into_iter()
            .map(|(key, value)| -> Result<Config> {
                Ok(Config {
                    key,
                    value: serde_json::from_str(&value)?,
                })
            })
            .collect()
    }

    /// Typed setting, falling back to `default` when missing or of the wrong shape.
    pub fn get_or<T: serde::de::DeserializeOwned>(
        conn: &Connection,
        key: &str,
        default: T,
    ) -> Result<T> {
        match Self::get(conn, key)? {
            Some(config) => match serde_json::from_value(config.value) {
                Ok(value) => Ok(value),
                Err(e) => {
                    tracing::warn!("Ignoring setting {}: {}", key, e);
                    Ok(default)
                }
            },
            None => Ok(default),
        }
    }
}
