//! SQLite database implementation for persistent storage

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::core::{AppId, Settings};

const SETTINGS_KEY: &str = "app_settings";
const CATALOG_REFRESHED_KEY: &str = "app_catalog_refreshed";

/// Database wrapper for SQLite operations
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database file at `db_path`
    pub fn open(db_path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)
            .context(format!("Failed to open database at {:?}", db_path))?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        info!("Database opened at {:?}", db_path);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open the database in the default data directory
    pub fn open_default() -> Result<Self> {
        Self::open(&Settings::default().get_database_path())
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Initialize database schema
    pub fn initialize(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            -- Settings and small key/value state
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            -- Platform app names, refreshed periodically
            CREATE TABLE IF NOT EXISTS app_catalog (
                appid INTEGER PRIMARY KEY,
                name TEXT NOT NULL
            );
            "#,
        )?;

        info!("Database schema initialized");
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    fn get_value(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT value FROM settings WHERE key = ?1")?;
        Ok(stmt.query_row(params![key], |row| row.get(0)).optional()?)
    }

    // === Settings ===

    /// Load settings from database
    pub fn load_settings(&self) -> Result<Option<Settings>> {
        match self.get_value(SETTINGS_KEY)? {
            Some(json) => {
                let mut settings: Settings =
                    serde_json::from_str(&json).context("Failed to deserialize settings")?;
                // Validate and fix any invalid values after deserialization
                settings.validate();
                Ok(Some(settings))
            }
            None => Ok(None),
        }
    }

    /// Save settings to database
    pub fn save_settings(&self, settings: &Settings) -> Result<()> {
        let conn = self.lock()?;
        let json = serde_json::to_string(settings)?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![SETTINGS_KEY, json],
        )?;
        debug!("Settings saved");
        Ok(())
    }

    // === App catalog ===

    /// Every cached app name
    pub fn load_app_catalog(&self) -> Result<HashMap<AppId, String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT appid, name FROM app_catalog")?;
        let rows = stmt.query_map([], |row| {
            Ok((AppId(row.get::<_, u32>(0)?), row.get::<_, String>(1)?))
        })?;

        let mut catalog = HashMap::new();
        for row in rows {
            let (appid, name) = row?;
            catalog.insert(appid, name);
        }
        Ok(catalog)
    }

    /// Replace the cached catalog and stamp the refresh time
    pub fn save_app_catalog(&self, apps: &HashMap<AppId, String>, at: DateTime<Utc>) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM app_catalog", [])?;
        {
            let mut insert =
                tx.prepare("INSERT OR REPLACE INTO app_catalog (appid, name) VALUES (?1, ?2)")?;
            for (appid, name) in apps {
                insert.execute(params![appid.0, name])?;
            }
        }
        tx.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![CATALOG_REFRESHED_KEY, at.to_rfc3339()],
        )?;
        tx.commit()?;

        debug!("Saved {} catalog entries", apps.len());
        Ok(())
    }

    /// When the catalog was last refreshed, if ever
    pub fn app_catalog_refreshed_at(&self) -> Result<Option<DateTime<Utc>>> {
        let Some(stamp) = self.get_value(CATALOG_REFRESHED_KEY)? else {
            return Ok(None);
        };
        let at = DateTime::parse_from_rfc3339(&stamp)
            .context("Invalid catalog refresh timestamp")?
            .with_timezone(&Utc);
        Ok(Some(at))
    }
}
