// SQLite-backed document store.

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::{Access, DocId, Document, DocumentStore, Grant, StoreError, User, UserId};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY,
    username TEXT NOT NULL UNIQUE,
    secret TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS documents (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    owner INTEGER NOT NULL REFERENCES users(id),
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS contents (
    doc INTEGER PRIMARY KEY REFERENCES documents(id),
    content TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS access (
    doc INTEGER NOT NULL REFERENCES documents(id),
    user INTEGER NOT NULL REFERENCES users(id),
    can_read INTEGER NOT NULL DEFAULT 0,
    can_write INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (doc, user)
);
"#;

/// [`DocumentStore`] over a single SQLite connection.
///
/// One connection behind one mutex: the server's write path is already
/// serialized per document, and reads are short.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }
}

fn row_to_document(row: &rusqlite::Row<'_>) -> rusqlite::Result<Document> {
    Ok(Document {
        id: row.get(0)?,
        name: row.get(1)?,
        owner: row.get(2)?,
        owner_name: row.get(3)?,
        created_at: row.get(4)?,
    })
}

const DOCUMENT_COLS: &str =
    "d.id, d.name, d.owner, u.username, d.created_at FROM documents d JOIN users u ON u.id = d.owner";

impl DocumentStore for SqliteStore {
    fn add_user(&self, username: &str, secret: &str) -> Result<User, StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO users (username, secret, created_at) VALUES (?1, ?2, ?3)",
            params![username, secret, Utc::now().to_rfc3339()],
        )?;
        let id = conn.last_insert_rowid();
        log::info!("user {username:?} registered (id {id})");
        Ok(User {
            id,
            username: username.to_string(),
        })
    }

    fn verify_credentials(
        &self,
        username: &str,
        secret: &str,
    ) -> Result<Option<User>, StoreError> {
        let conn = self.lock();
        let user = conn
            .query_row(
                "SELECT id FROM users WHERE username = ?1 AND secret = ?2",
                params![username, secret],
                |row| row.get::<_, UserId>(0),
            )
            .optional()?
            .map(|id| User {
                id,
                username: username.to_string(),
            });
        Ok(user)
    }

    fn resolve_user(&self, username: &str) -> Result<Option<User>, StoreError> {
        let conn = self.lock();
        let user = conn
            .query_row(
                "SELECT id FROM users WHERE username = ?1",
                params![username],
                |row| row.get::<_, UserId>(0),
            )
            .optional()?
            .map(|id| User {
                id,
                username: username.to_string(),
            });
        Ok(user)
    }

    fn document(&self, doc: DocId) -> Result<Option<Document>, StoreError> {
        let conn = self.lock();
        let document = conn
            .query_row(
                &format!("SELECT {DOCUMENT_COLS} WHERE d.id = ?1"),
                params![doc],
                row_to_document,
            )
            .optional()?;
        Ok(document)
    }

    fn list_documents(&self, user: UserId) -> Result<Vec<Document>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {DOCUMENT_COLS}
             LEFT JOIN access a ON a.doc = d.id AND a.user = ?1
             WHERE d.owner = ?1 OR a.can_read = 1
             ORDER BY d.id"
        ))?;
        let docs = stmt
            .query_map(params![user], row_to_document)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(docs)
    }

    fn create_document(&self, name: &str, owner: UserId) -> Result<Document, StoreError> {
        let conn = self.lock();
        let created_at = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO documents (name, owner, created_at) VALUES (?1, ?2, ?3)",
            params![name, owner, created_at],
        )?;
        let id = conn.last_insert_rowid();
        conn.execute("INSERT INTO contents (doc, content) VALUES (?1, '')", params![id])?;
        let owner_name: String = conn.query_row(
            "SELECT username FROM users WHERE id = ?1",
            params![owner],
            |row| row.get(0),
        )?;
        log::info!("document {name:?} created (id {id}, owner {owner_name})");
        Ok(Document {
            id,
            name: name.to_string(),
            owner,
            owner_name,
            created_at,
        })
    }

    fn rename_document(&self, doc: DocId, name: &str) -> Result<(), StoreError> {
        let changed = self.lock().execute(
            "UPDATE documents SET name = ?1 WHERE id = ?2",
            params![name, doc],
        )?;
        if changed == 0 {
            return Err(StoreError::Conflict(format!("no document with id {doc}")));
        }
        Ok(())
    }

    fn delete_document(&self, doc: DocId) -> Result<(), StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM access WHERE doc = ?1", params![doc])?;
        tx.execute("DELETE FROM contents WHERE doc = ?1", params![doc])?;
        let changed = tx.execute("DELETE FROM documents WHERE id = ?1", params![doc])?;
        tx.commit()?;
        if changed == 0 {
            return Err(StoreError::Conflict(format!("no document with id {doc}")));
        }
        log::info!("document {doc} deleted");
        Ok(())
    }

    fn get_content(&self, doc: DocId) -> Result<Option<String>, StoreError> {
        let conn = self.lock();
        let content = conn
            .query_row(
                "SELECT content FROM contents WHERE doc = ?1",
                params![doc],
                |row| row.get(0),
            )
            .optional()?;
        Ok(content)
    }

    fn save_content(&self, doc: DocId, content: &str) -> Result<(), StoreError> {
        let changed = self.lock().execute(
            "UPDATE contents SET content = ?1 WHERE doc = ?2",
            params![content, doc],
        )?;
        if changed == 0 {
            return Err(StoreError::Conflict(format!("no document with id {doc}")));
        }
        Ok(())
    }

    fn access_for(&self, doc: DocId, user: UserId) -> Result<Option<Access>, StoreError> {
        let conn = self.lock();
        let access = conn
            .query_row(
                "SELECT can_read, can_write FROM access WHERE doc = ?1 AND user = ?2",
                params![doc, user],
                |row| {
                    Ok(Access {
                        can_read: row.get(0)?,
                        can_write: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(access)
    }

    fn set_access(&self, doc: DocId, user: UserId, access: Access) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT INTO access (doc, user, can_read, can_write) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (doc, user) DO UPDATE SET can_read = ?3, can_write = ?4",
            params![doc, user, access.can_read, access.can_write],
        )?;
        Ok(())
    }

    fn grants_for(&self, doc: DocId) -> Result<Vec<Grant>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT u.username, a.can_read, a.can_write
             FROM access a JOIN users u ON u.id = a.user
             WHERE a.doc = ?1 ORDER BY u.username",
        )?;
        let grants = stmt
            .query_map(params![doc], |row| {
                Ok(Grant {
                    username: row.get(0)?,
                    access: Access {
                        can_read: row.get(1)?,
                        can_write: row.get(2)?,
                    },
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(grants)
    }
}
