use crate::config::Config;
use anyhow::Context as AnyhowContext;
use rusqlite::{Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

pub const GLOBAL_SCOPE: &str = "global";

pub fn guild_scope(guild_id: u64) -> String {
    guild_id.to_string()
}

/// A JSON record whose shape is versioned. Older bodies are upgraded one
/// version at a time through [`Versioned::migrate`] when loaded.
pub trait Versioned: Serialize + DeserializeOwned + Default {
    const VERSION: u32;

    /// Turn a body stored at `from_version` into the `from_version + 1` shape.
    fn migrate(from_version: u32, body: Value) -> anyhow::Result<Value> {
        let _ = from_version;
        Ok(body)
    }
}

/// A versioned record with a fixed key inside its scope.
pub trait Document: Versioned {
    const KEY: &'static str;
}

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        Self::open(&config.database_url)
    }

    pub fn open(path: &str) -> anyhow::Result<Self> {
        if path != ":memory:" {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("Failed to create database directory {}", parent.display())
                    })?;
                }
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> anyhow::Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("Database connection mutex poisoned"))
    }

    /// Run synchronous database work off the async runtime.
    pub async fn run_blocking<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| anyhow::anyhow!("Database task failed: {}", e))?
    }

    pub fn execute_init(&self) -> anyhow::Result<()> {
        info!("Database: Initializing schema...");
        let sql = "
            CREATE TABLE IF NOT EXISTS documents (
                scope TEXT NOT NULL,
                key TEXT NOT NULL,
                version INTEGER NOT NULL,
                body TEXT NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (scope, key)
            );
            CREATE INDEX IF NOT EXISTS idx_documents_key ON documents (key);

            CREATE TABLE IF NOT EXISTS steam_ids (
                user_id TEXT PRIMARY KEY,
                steam_id TEXT NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );
        ";
        let conn = self.lock()?;
        conn.execute_batch(sql)?;
        debug!("Database: Schema initialized successfully");
        Ok(())
    }

    // --- Documents ---

    /// Load a record, upgrading older bodies. Missing records yield the default.
    pub fn load_versioned<T: Versioned>(&self, scope: &str, key: &str) -> anyhow::Result<T> {
        let row: Option<(u32, String)> = {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT version, body FROM documents WHERE scope = ?1 AND key = ?2",
                (scope, key),
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
        };

        let Some((version, body)) = row else {
            return Ok(T::default());
        };
        if version > T::VERSION {
            anyhow::bail!(
                "Document {}/{} has version {}, newer than supported version {}",
                scope,
                key,
                version,
                T::VERSION
            );
        }

        let mut value: Value = serde_json::from_str(&body)
            .with_context(|| format!("Document {}/{} is not valid JSON", scope, key))?;
        for from in version..T::VERSION {
            debug!("Database: Migrating {}/{} from v{}", scope, key, from);
            value = T::migrate(from, value)?;
        }
        serde_json::from_value(value)
            .with_context(|| format!("Document {}/{} has an unexpected shape", scope, key))
    }

    /// Replace a record as a whole.
    pub fn save_versioned<T: Versioned>(
        &self,
        scope: &str,
        key: &str,
        value: &T,
    ) -> anyhow::Result<()> {
        let body = serde_json::to_string(value)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO documents (scope, key, version, body, updated_at)
             VALUES (?1, ?2, ?3, ?4, CURRENT_TIMESTAMP)
             ON CONFLICT(scope, key) DO UPDATE SET version = ?3, body = ?4, updated_at = CURRENT_TIMESTAMP",
            (scope, key, T::VERSION, body),
        )?;
        Ok(())
    }

    pub fn load_document<T: Document>(&self, scope: &str) -> anyhow::Result<T> {
        self.load_versioned(scope, T::KEY)
    }

    pub fn save_document<T: Document>(&self, scope: &str, value: &T) -> anyhow::Result<()> {
        self.save_versioned(scope, T::KEY, value)
    }

    pub fn delete_document(&self, scope: &str, key: &str) -> anyhow::Result<usize> {
        let conn = self.lock()?;
        Ok(conn.execute(
            "DELETE FROM documents WHERE scope = ?1 AND key = ?2",
            (scope, key),
        )?)
    }

    /// Every scope holding a record under `key`.
    pub fn scopes_with_key(&self, key: &str) -> anyhow::Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT scope FROM documents WHERE key = ?1 ORDER BY scope")?;
        let rows = stmt.query_map([key], |row| row.get(0))?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    // --- Steam IDs ---

    pub fn set_steam_id(&self, user_id: u64, steam_id: &str) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO steam_ids (user_id, steam_id, updated_at)
             VALUES (?1, ?2, CURRENT_TIMESTAMP)
             ON CONFLICT(user_id) DO UPDATE SET steam_id = ?2, updated_at = CURRENT_TIMESTAMP",
            (user_id.to_string(), steam_id),
        )?;
        Ok(())
    }

    pub fn get_steam_id(&self, user_id: u64) -> anyhow::Result<Option<String>> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT steam_id FROM steam_ids WHERE user_id = ?1",
                [user_id.to_string()],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn delete_steam_id(&self, user_id: u64) -> anyhow::Result<bool> {
        let conn = self.lock()?;
        let count = conn.execute(
            "DELETE FROM steam_ids WHERE user_id = ?1",
            [user_id.to_string()],
        )?;
        Ok(count > 0)
    }

    pub fn all_steam_ids(&self) -> anyhow::Result<HashMap<u64, String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT user_id, steam_id FROM steam_ids")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut results = HashMap::new();
        for row in rows {
            let (user_id, steam_id) = row?;
            let user_id: u64 = user_id
                .parse()
                .with_context(|| format!("Invalid steam_ids user_id '{}'", user_id))?;
            results.insert(user_id, steam_id);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    fn test_db() -> Database {
        let db = Database::open(":memory:").unwrap();
        db.execute_init().unwrap();
        db
    }

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Counter {
        count: u32,
        label: String,
    }

    impl Versioned for Counter {
        const VERSION: u32 = 2;

        fn migrate(from_version: u32, body: Value) -> anyhow::Result<Value> {
            match from_version {
                1 => Ok(serde_json::json!({ "count": body, "label": "migrated" })),
                _ => Ok(body),
            }
        }
    }

    impl Document for Counter {
        const KEY: &'static str = "counter";
    }

    #[test]
    fn test_missing_document_is_default() {
        let db = test_db();
        let loaded: Counter = db.load_document("1").unwrap();
        assert_eq!(loaded, Counter::default());
    }

    #[test]
    fn test_document_round_trip_and_scopes() {
        let db = test_db();
        let value = Counter {
            count: 3,
            label: "a".to_string(),
        };
        db.save_document("1", &value).unwrap();
        db.save_document("2", &Counter::default()).unwrap();
        db.save_document(GLOBAL_SCOPE, &Counter::default()).unwrap();

        let loaded: Counter = db.load_document("1").unwrap();
        assert_eq!(loaded, value);
        assert_eq!(
            db.scopes_with_key("counter").unwrap(),
            vec!["1", "2", GLOBAL_SCOPE]
        );

        assert_eq!(db.delete_document("2", "counter").unwrap(), 1);
        assert_eq!(db.scopes_with_key("counter").unwrap().len(), 2);
    }

    #[test]
    fn test_old_version_is_migrated() {
        let db = test_db();
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO documents (scope, key, version, body) VALUES ('1', 'counter', 1, '7')",
                [],
            )
            .unwrap();
        }
        let loaded: Counter = db.load_document("1").unwrap();
        assert_eq!(loaded.count, 7);
        assert_eq!(loaded.label, "migrated");
    }

    #[test]
    fn test_newer_version_is_rejected() {
        let db = test_db();
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO documents (scope, key, version, body) VALUES ('1', 'counter', 9, '{}')",
                [],
            )
            .unwrap();
        }
        assert!(db.load_document::<Counter>("1").is_err());
    }

    #[test]
    fn test_steam_ids() {
        let db = test_db();
        assert_eq!(db.get_steam_id(5).unwrap(), None);

        db.set_steam_id(5, "76561198000000000").unwrap();
        db.set_steam_id(5, "76561198000000001").unwrap();
        db.set_steam_id(6, "76561198000000002").unwrap();
        assert_eq!(
            db.get_steam_id(5).unwrap().as_deref(),
            Some("76561198000000001")
        );
        assert_eq!(db.all_steam_ids().unwrap().len(), 2);

        assert!(db.delete_steam_id(5).unwrap());
        assert!(!db.delete_steam_id(5).unwrap());
    }

    #[tokio::test]
    async fn test_run_blocking() {
        let db = test_db();
        db.run_blocking(|db| db.set_steam_id(1, "76561198000000000"))
            .await
            .unwrap();
        let id = db.run_blocking(|db| db.get_steam_id(1)).await.unwrap();
        assert_eq!(id.as_deref(), Some("76561198000000000"));
    }
}
