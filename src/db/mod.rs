use anyhow::Result;
use rusqlite::Connection;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

mod schema;
mod tags;

pub use schema::SCHEMA_VERSION;
pub(crate) use tags::is_unique_violation;

pub struct Database {
    conn: Connection,
    savepoint_seq: AtomicU64,
}

impl Database {
    /// Open database, creating if needed, running migrations
    pub fn open() -> Result<Self> {
        let path = Self::default_path()?;
        Self::open_at(path)
    }

    pub fn open_at(path: PathBuf) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let db = Self::from_conn(conn);
        db.migrate()?;
        Ok(db)
    }

    /// Open in-memory database for testing
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let db = Self::from_conn(conn);
        db.migrate()?;
        Ok(db)
    }

    fn from_conn(conn: Connection) -> Self {
        Self {
            conn,
            savepoint_seq: AtomicU64::new(0),
        }
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    fn default_path() -> Result<PathBuf> {
        let config_dir =
            dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join("tagstore").join("tags.db"))
    }

    /// Run `f` inside one transaction: every change commits or none does.
    /// Multi-step tag protocols (split, tenant removal sweep) go through
    /// here so partial application is never observable.
    pub fn with_transaction<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(self) {
            Ok(value) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Run `f` inside a named savepoint. On failure only the savepoint is
    /// rolled back; the surrounding transaction keeps its earlier work.
    /// This is the nested scope the slug allocation retry loop leans on.
    pub fn with_savepoint<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        let name = format!("sp_{}", self.savepoint_seq.fetch_add(1, Ordering::Relaxed));
        self.conn.execute_batch(&format!("SAVEPOINT {}", name))?;
        match f(self) {
            Ok(value) => {
                self.conn.execute_batch(&format!("RELEASE {}", name))?;
                Ok(value)
            }
            Err(e) => {
                let _ = self
                    .conn
                    .execute_batch(&format!("ROLLBACK TO {}; RELEASE {}", name, name));
                Err(e)
            }
        }
    }

    fn migrate(&self) -> Result<()> {
        let version = self.get_schema_version()?;

        if version == 0 {
            // Run migration in a transaction for atomicity
            self.conn
                .execute_batch(&format!("BEGIN TRANSACTION; {} COMMIT;", schema::SCHEMA_V1))?;
            self.set_schema_version(1)?;
        }

        Ok(())
    }

    fn get_schema_version(&self) -> Result<i32> {
        let result: Result<i32, _> =
            self.conn
                .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                    row.get(0)
                });

        match result {
            Ok(v) => Ok(v),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
            Err(rusqlite::Error::SqliteFailure(err, msg)) => {
                // "no such table" is error code 1 (SQLITE_ERROR)
                if err.code == rusqlite::ErrorCode::Unknown
                    && msg.as_ref().map_or(false, |m| m.contains("no such table"))
                {
                    Ok(0)
                } else {
                    Err(rusqlite::Error::SqliteFailure(err, msg).into())
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    fn set_schema_version(&self, version: i32) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?)",
            [version],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_memory() {
        let db = Database::open_memory().unwrap();
        assert_eq!(db.get_schema_version().unwrap(), 1);
    }

    #[test]
    fn test_open_at() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(dir.path().join("tags.db")).unwrap();
        assert_eq!(db.get_schema_version().unwrap(), 1);
    }

    #[test]
    fn test_tables_exist() {
        let db = Database::open_memory().unwrap();

        let tables: Vec<String> = db
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        assert!(tables.contains(&"tags".to_string()));
        assert!(tables.contains(&"tag_tenants".to_string()));
        assert!(tables.contains(&"associations".to_string()));
    }

    #[test]
    fn test_savepoint_rolls_back_only_inner_work() {
        let db = Database::open_memory().unwrap();

        db.with_transaction(|db| {
            db.conn()
                .execute("INSERT INTO schema_version (id, version) VALUES (2, 9)", [])?;

            let inner: Result<()> = db.with_savepoint(|db| {
                db.conn()
                    .execute("INSERT INTO schema_version (id, version) VALUES (3, 9)", [])?;
                anyhow::bail!("abort inner");
            });
            assert!(inner.is_err());
            Ok(())
        })
        .unwrap();

        let count: i32 = db
            .conn
            .query_row("SELECT COUNT(*) FROM schema_version WHERE version = 9", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(count, 1);
    }
}
