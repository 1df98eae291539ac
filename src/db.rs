use crate::config::Config;
use crate::model::{Book, Role, User};
use anyhow::Result;
use libsql::{Builder, Connection, Database as LibsqlDatabase};
use std::path::Path;
use std::time::Duration;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

const SYSTEM_MIGRATIONS: &[(&str, &str)] =
    &[("system/000_migrations_table.sql", include_str!("migrations/system/000_migrations_table.sql"))];

const MIGRATIONS: &[(&str, &str)] = &[("001_catalog.sql", include_str!("migrations/001_catalog.sql"))];

pub struct Database {
    db: LibsqlDatabase,
    conn: Connection,
    tx_lock: RwLock<()>,
    turso_url: Option<String>,
    turso_auth_token: Option<String>,
}

impl Database {
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn is_replica(turso_url: &Option<String>, turso_auth_token: &Option<String>) -> bool {
        turso_url.is_some() && turso_auth_token.is_some()
    }

    pub async fn sync(&self) -> Result<()> {
        if Self::is_replica(&self.turso_url, &self.turso_auth_token) {
            self.db
                .sync()
                .await
                .map_err(|e| anyhow::anyhow!("sync failed: {}", e))?;
        }
        Ok(())
    }

    /// Serialises every write on the shared connection. Hold the guard for the
    /// whole `BEGIN`..`COMMIT` span.
    pub async fn write_lock(&self) -> RwLockWriteGuard<'_, ()> {
        self.tx_lock.write().await
    }

    /// Keeps reads out of open transactions on the shared connection.
    pub async fn read_lock(&self) -> RwLockReadGuard<'_, ()> {
        self.tx_lock.read().await
    }

    async fn is_migration_applied(conn: &Connection, name: &str) -> Result<bool> {
        let query = "SELECT 1 FROM _migrations WHERE name = ?";
        match conn.query(query, libsql::params![name]).await {
            Ok(mut rows) => Ok(rows.next().await?.is_some()),
            Err(e) => {
                if e.to_string().contains("no such table") {
                    Ok(false)
                } else {
                    Err(e.into())
                }
            }
        }
    }

    async fn record_migration(conn: &Connection, name: &str) -> Result<()> {
        let query = r#"
            INSERT INTO _migrations (name, applied_at)
            VALUES (?, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        "#;
        conn.execute(query, libsql::params![name]).await?;
        Ok(())
    }

    async fn run_migration(conn: &Connection, name: &str, sql: &str) -> Result<()> {
        if Self::is_migration_applied(conn, name).await? {
            tracing::debug!("migration {} already applied, skipping", name);
            return Ok(());
        }

        tracing::info!("applying migration: {}", name);
        conn.execute_batch(sql)
            .await
            .map_err(|e| anyhow::anyhow!("failed to execute migration {name}: {e}"))?;

        Self::record_migration(conn, name).await?;
        Ok(())
    }

    pub async fn new(cfg: &Config, data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(cfg.app.get_db());
        let turso_url = cfg.app.turso_url.clone();
        let turso_auth_token = cfg.app.turso_auth_token.clone();

        let db = match (&turso_url, &turso_auth_token) {
            (Some(url), Some(token)) => {
                tracing::info!("[db] running in synced database mode (offline writes)");
                let sync_interval = Duration::from_secs(cfg.app.sync_interval_seconds);
                Builder::new_synced_database(&path, url.clone(), token.clone())
                    .sync_interval(sync_interval)
                    .build()
                    .await?
            }
            _ => Builder::new_local(&path).build().await?,
        };

        Self::setup(db, turso_url, turso_auth_token).await
    }

    /// Opens a plain local database, `":memory:"` included.
    pub async fn open_local(path: impl AsRef<Path>) -> Result<Self> {
        let db = Builder::new_local(path.as_ref()).build().await?;
        Self::setup(db, None, None).await
    }

    async fn setup(db: LibsqlDatabase, turso_url: Option<String>, turso_auth_token: Option<String>) -> Result<Self> {
        let conn = db.connect()?;
        conn.query("SELECT 1", ()).await?;

        for (filename, sql) in SYSTEM_MIGRATIONS {
            Self::run_migration(&conn, filename, sql).await?;
        }

        for (filename, sql) in MIGRATIONS {
            Self::run_migration(&conn, filename, sql).await?;
        }

        for (filename, sql) in crate::borrow::migrations() {
            Self::run_migration(&conn, filename, sql).await?;
        }

        Ok(Database {
            db,
            conn,
            tx_lock: RwLock::new(()),
            turso_url,
            turso_auth_token,
        })
    }

    fn row_to_book(row: &libsql::Row) -> Result<Book> {
        Ok(Book {
            id: row.get(0)?,
            title: row.get(1)?,
            author: row.get(2)?,
            availability: row.get::<i64>(3)? != 0,
        })
    }

    fn row_to_user(row: &libsql::Row) -> Result<User> {
        let role: String = row.get(3)?;
        Ok(User {
            id: row.get(0)?,
            name: row.get(1)?,
            email: row.get(2)?,
            role: Role::from_str(&role).ok_or_else(|| anyhow::anyhow!("unknown role in users table: {role}"))?,
        })
    }

    pub async fn get_book(&self, book_id: i64) -> Result<Option<Book>> {
        let _guard = self.read_lock().await;
        let query = "SELECT id, title, author, availability FROM books WHERE id = ?";
        let mut rows = self.conn.query(query, libsql::params![book_id]).await?;

        if let Some(row) = rows.next().await? {
            Ok(Some(Self::row_to_book(&row)?))
        } else {
            Ok(None)
        }
    }

    pub async fn create_book(&self, title: &str, author: &str) -> Result<Book> {
        let _guard = self.write_lock().await;

        let query = r#"
            INSERT INTO books (title, author)
            VALUES (?, ?)
            RETURNING id, title, author, availability
        "#;
        let mut rows = self.conn.query(query, libsql::params![title, author]).await?;

        if let Some(row) = rows.next().await? {
            Self::row_to_book(&row)
        } else {
            anyhow::bail!("Failed to create book")
        }
    }

    /// Flips availability only when it currently equals `expected`. Returns
    /// whether the row changed. Callers must hold [`Database::write_lock`].
    pub async fn swap_availability(&self, book_id: i64, expected: bool, next: bool) -> Result<bool> {
        let affected = self
            .conn
            .execute(
                "UPDATE books SET availability = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') WHERE id = ? AND availability = ?",
                libsql::params![i64::from(next), book_id, i64::from(expected)],
            )
            .await?;
        Ok(affected == 1)
    }

    pub async fn get_user(&self, user_id: i64) -> Result<Option<User>> {
        let _guard = self.read_lock().await;
        let query = "SELECT id, name, email, role FROM users WHERE id = ?";
        let mut rows = self.conn.query(query, libsql::params![user_id]).await?;

        if let Some(row) = rows.next().await? {
            Ok(Some(Self::row_to_user(&row)?))
        } else {
            Ok(None)
        }
    }

    pub async fn create_user(&self, name: &str, email: &str, role: Role) -> Result<User> {
        let _guard = self.write_lock().await;

        let query = r#"
            INSERT INTO users (name, email, role)
            VALUES (?, ?, ?)
            RETURNING id, name, email, role
        "#;
        let mut rows = self
            .conn
            .query(query, libsql::params![name, email, role.as_str()])
            .await?;

        if let Some(row) = rows.next().await? {
            Self::row_to_user(&row)
        } else {
            anyhow::bail!("Failed to create user")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let db = Database::open_local(":memory:").await.unwrap();
        for (filename, sql) in crate::borrow::migrations() {
            Database::run_migration(db.connection(), filename, sql).await.unwrap();
        }
        let mut rows = db
            .connection()
            .query("SELECT COUNT(*) FROM _migrations", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        let applied: i64 = row.get(0).unwrap();
        assert_eq!(applied as usize, SYSTEM_MIGRATIONS.len() + MIGRATIONS.len() + crate::borrow::migrations().len());
    }

    #[tokio::test]
    async fn test_swap_availability_is_conditional() {
        let db = Database::open_local(":memory:").await.unwrap();
        let book = db.create_book("Dune", "Frank Herbert").await.unwrap();
        assert!(book.availability);

        {
            let _guard = db.write_lock().await;
            assert!(db.swap_availability(book.id, true, false).await.unwrap());
            assert!(!db.swap_availability(book.id, true, false).await.unwrap());
        }
        assert!(!db.get_book(book.id).await.unwrap().unwrap().availability);
    }

    #[tokio::test]
    async fn test_user_roundtrip() {
        let db = Database::open_local(":memory:").await.unwrap();
        let user = db.create_user("Ada", "ada@example.com", Role::Librarian).await.unwrap();
        let loaded = db.get_user(user.id).await.unwrap().unwrap();
        assert_eq!(loaded.email, "ada@example.com");
        assert_eq!(loaded.role, Role::Librarian);
        assert!(db.get_user(user.id + 1).await.unwrap().is_none());
    }
}
