//! 会话持久化后端
//!
//! 有序键值存储抽象：SqliteBackend（rusqlite，重启后仍在）与 MemoryBackend（BTreeMap）。
//! 后端本身不加锁语义，读改写的原子性由 SessionStore 的会话锁保证。

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::core::Result;
use crate::retry::Metadata;
use crate::session::types::Session;

pub trait SessionBackend: Send + Sync {
    fn load(&self, id: &str) -> Result<Option<Session>>;

    /// 插入或覆盖
    fn store(&self, session: &Session) -> Result<()>;

    /// 返回是否确实删除了记录
    fn remove(&self, id: &str) -> Result<bool>;

    /// 按 id 升序
    fn ids(&self) -> Result<Vec<String>>;

    /// `expires_at <= now` 的会话 id
    fn expired(&self, now: i64) -> Result<Vec<String>>;
}

pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    crate::core::WorkflowError::Storage(format!("create {}: {e}", parent.display()))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "session database opened");
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id          TEXT PRIMARY KEY,
                metadata    TEXT NOT NULL,
                created_at  INTEGER NOT NULL,
                updated_at  INTEGER NOT NULL,
                expires_at  INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_expires ON sessions(expires_at);
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SessionBackend for SqliteBackend {
    fn load(&self, id: &str) -> Result<Option<Session>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT id, metadata, created_at, updated_at, expires_at FROM sessions WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, metadata, created_at, updated_at, expires_at)) = row else {
            return Ok(None);
        };
        let metadata: Metadata = serde_json::from_str(&metadata)?;
        Ok(Some(Session {
            id,
            metadata,
            created_at,
            updated_at,
            expires_at,
        }))
    }

    fn store(&self, session: &Session) -> Result<()> {
        let metadata = serde_json::to_string(&session.metadata)?;
        self.conn().execute(
            r#"INSERT INTO sessions (id, metadata, created_at, updated_at, expires_at)
               VALUES (?1, ?2, ?3, ?4, ?5)
               ON CONFLICT(id) DO UPDATE SET
                   metadata = excluded.metadata,
                   created_at = excluded.created_at,
                   updated_at = excluded.updated_at,
                   expires_at = excluded.expires_at"#,
            params![
                session.id,
                metadata,
                session.created_at,
                session.updated_at,
                session.expires_at
            ],
        )?;
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<bool> {
        let n = self
            .conn()
            .execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    fn ids(&self) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id FROM sessions ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    fn expired(&self, now: i64) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id FROM sessions WHERE expires_at <= ?1 ORDER BY id")?;
        let ids = stmt
            .query_map(params![now], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    sessions: Mutex<BTreeMap<String, Session>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SessionBackend for MemoryBackend {
    fn load(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.map().get(id).cloned())
    }

    fn store(&self, session: &Session) -> Result<()> {
        self.map().insert(session.id.clone(), session.clone());
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<bool> {
        Ok(self.map().remove(id).is_some())
    }

    fn ids(&self) -> Result<Vec<String>> {
        Ok(self.map().keys().cloned().collect())
    }

    fn expired(&self, now: i64) -> Result<Vec<String>> {
        Ok(self
            .map()
            .values()
            .filter(|s| s.is_expired_at(now))
            .map(|s| s.id.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn exercise(backend: &dyn SessionBackend) {
        let mut a = Session::new("b-session", 1_000_000_000);
        a.metadata.insert("k".into(), json!({"n": 1}));
        let b = Session::new("a-session", -1);
        backend.store(&a).unwrap();
        backend.store(&b).unwrap();

        assert_eq!(backend.load("b-session").unwrap(), Some(a.clone()));
        assert_eq!(backend.ids().unwrap(), vec!["a-session", "b-session"]);
        assert_eq!(backend.expired(b.created_at).unwrap(), vec!["a-session"]);

        a.touch();
        backend.store(&a).unwrap();
        assert_eq!(backend.load("b-session").unwrap().unwrap().version(), a.version());

        assert!(backend.remove("a-session").unwrap());
        assert!(!backend.remove("a-session").unwrap());
        assert!(backend.load("a-session").unwrap().is_none());
    }

    #[test]
    fn test_memory_backend() {
        exercise(&MemoryBackend::new());
    }

    #[test]
    fn test_sqlite_backend() {
        exercise(&SqliteBackend::in_memory().unwrap());
    }

    #[test]
    fn test_sqlite_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.db");
        {
            let backend = SqliteBackend::open(&path).unwrap();
            let mut s = Session::new("job-1", 60_000_000);
            s.metadata.insert("workflow_state".into(), json!({"current_step": 2}));
            backend.store(&s).unwrap();
        }
        let backend = SqliteBackend::open(&path).unwrap();
        let s = backend.load("job-1").unwrap().unwrap();
        assert_eq!(s.metadata["workflow_state"]["current_step"], json!(2));
    }
}
