//! SQLite-backed document `Store`: one table per logical collection
//! (resources, identifiers, subscriptions, statistics, app data), each row a
//! JSON blob plus the indexed columns queries need (`pi`, `ty`, `et`).
//! Grounded in `Storage.py`'s `TinyDBBinding`, which
//! keeps the same five-collection layout over a different embedded engine;
//! `rusqlite`'s `bundled` feature keeps the backend self-contained the way
//! `cdk-sqlite` ships its own SQLite build.
//!
//! `rusqlite::Connection` is synchronous; the connection is held behind a
//! `tokio::sync::Mutex` and every call locks it for the duration of one
//! query. This is simpler than a `spawn_blocking`-per-call pool and correct
//! for the CSE's expected load (a single embedded/edge deployment), at the
//! cost of serializing all Store access through one mutex.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use onem2m_common::{Error, Resource, ResourceType, SubscriptionRecord};
use onem2m_core::store::Store;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum DocumentStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Cse(#[from] Error),
}

impl From<DocumentStoreError> for Error {
    fn from(err: DocumentStoreError) -> Error {
        match err {
            DocumentStoreError::Sqlite(e) => Error::Storage(e.to_string()),
            DocumentStoreError::Cse(e) => e,
        }
    }
}

/// The SQLite-backed Store. One file (or `:memory:`) holds all five tables.
pub struct DocumentStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore").finish_non_exhaustive()
    }
}

impl DocumentStore {
    /// Open (creating if necessary) the database at `path`, or an
    /// in-memory database when `path` is `:memory:`.
    pub fn open(path: &str) -> Result<Self, DocumentStoreError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS resources (
                ri TEXT PRIMARY KEY,
                pi TEXT,
                ty TEXT NOT NULL,
                et INTEGER,
                doc TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_resources_pi ON resources(pi);
            CREATE INDEX IF NOT EXISTS idx_resources_et ON resources(et);

            CREATE TABLE IF NOT EXISTS identifiers (
                srn TEXT PRIMARY KEY,
                ri TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS subscriptions (
                ri TEXT PRIMARY KEY,
                pi TEXT NOT NULL,
                doc TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_subscriptions_pi ON subscriptions(pi);

            CREATE TABLE IF NOT EXISTS statistics (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS app_data (
                key TEXT PRIMARY KEY,
                doc TEXT NOT NULL
            );
            ",
        )?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Drop every row from every table, per `reset_at_startup`.
    pub async fn reset(&self) -> Result<(), DocumentStoreError> {
        let conn = self.conn.lock().await;
        conn.execute_batch(
            "DELETE FROM resources; DELETE FROM identifiers; DELETE FROM subscriptions;
             DELETE FROM statistics; DELETE FROM app_data;",
        )?;
        Ok(())
    }
}

fn to_doc<T: serde::Serialize>(value: &T) -> Result<String, DocumentStoreError> {
    serde_json::to_string(value).map_err(|e| Error::Storage(e.to_string()).into())
}

fn from_doc<T: serde::de::DeserializeOwned>(doc: &str) -> Result<T, DocumentStoreError> {
    serde_json::from_str(doc).map_err(|e| Error::Storage(e.to_string()).into())
}

#[async_trait]
impl Store for DocumentStore {
    type Err = DocumentStoreError;

    async fn put_resource(&self, resource: Resource) -> Result<(), Self::Err> {
        let conn = self.conn.lock().await;
        let exists: Option<String> = conn
            .query_row("SELECT ri FROM resources WHERE ri = ?1", params![resource.ri], |r| r.get(0))
            .optional()?;
        if exists.is_some() {
            return Err(Error::AlreadyExists(resource.ri).into());
        }
        let et = resource.et.map(|t| t.timestamp());
        let doc = to_doc(&resource)?;
        conn.execute(
            "INSERT INTO resources (ri, pi, ty, et, doc) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![resource.ri, resource.pi, resource.ty.to_string(), et, doc],
        )?;
        Ok(())
    }

    async fn get_resource(&self, ri: &str) -> Result<Option<Resource>, Self::Err> {
        let conn = self.conn.lock().await;
        let doc: Option<String> = conn
            .query_row("SELECT doc FROM resources WHERE ri = ?1", params![ri], |r| r.get(0))
            .optional()?;
        doc.map(|d| from_doc(&d)).transpose()
    }

    async fn update_resource(&self, resource: Resource) -> Result<(), Self::Err> {
        let conn = self.conn.lock().await;
        let et = resource.et.map(|t| t.timestamp());
        let doc = to_doc(&resource)?;
        conn.execute(
            "INSERT INTO resources (ri, pi, ty, et, doc) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(ri) DO UPDATE SET pi = excluded.pi, ty = excluded.ty, et = excluded.et, doc = excluded.doc",
            params![resource.ri, resource.pi, resource.ty.to_string(), et, doc],
        )?;
        Ok(())
    }

    async fn delete_resource(&self, ri: &str) -> Result<(), Self::Err> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM resources WHERE ri = ?1", params![ri])?;
        Ok(())
    }

    async fn direct_children(&self, pi: &str) -> Result<Vec<Resource>, Self::Err> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT doc FROM resources WHERE pi = ?1")?;
        let rows = stmt.query_map(params![pi], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(from_doc::<Resource>(&row?)?);
        }
        out.sort_by_key(|r| r.ct);
        Ok(out)
    }

    async fn direct_children_of_type(
        &self,
        pi: &str,
        ty: ResourceType,
    ) -> Result<Vec<Resource>, Self::Err> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT doc FROM resources WHERE pi = ?1 AND ty = ?2")?;
        let rows = stmt.query_map(params![pi, ty.to_string()], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(from_doc::<Resource>(&row?)?);
        }
        out.sort_by_key(|r| r.ct);
        Ok(out)
    }

    async fn resources_expiring_before(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<Resource>, Self::Err> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT doc FROM resources WHERE et IS NOT NULL AND et <= ?1")?;
        let rows = stmt.query_map(params![before.timestamp()], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(from_doc::<Resource>(&row?)?);
        }
        Ok(out)
    }

    async fn resources_announced_to(&self, peer_cse_id: &str) -> Result<Vec<Resource>, Self::Err> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT doc FROM resources")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            let resource: Resource = from_doc(&row?)?;
            let matches = resource.at.as_ref().is_some_and(|at| at.iter().any(|p| p == peer_cse_id))
                || resource.announced_to.iter().any(|(p, _)| p == peer_cse_id);
            if matches {
                out.push(resource);
            }
        }
        Ok(out)
    }

    async fn put_identifier(&self, ri: &str, srn: &str) -> Result<(), Self::Err> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO identifiers (srn, ri) VALUES (?1, ?2)
             ON CONFLICT(srn) DO UPDATE SET ri = excluded.ri",
            params![srn, ri],
        )?;
        Ok(())
    }

    async fn resolve_srn(&self, srn: &str) -> Result<Option<String>, Self::Err> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row("SELECT ri FROM identifiers WHERE srn = ?1", params![srn], |r| r.get(0))
            .optional()?)
    }

    async fn delete_identifier(&self, ri: &str) -> Result<(), Self::Err> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM identifiers WHERE ri = ?1", params![ri])?;
        Ok(())
    }

    async fn put_subscription(&self, sub: SubscriptionRecord) -> Result<(), Self::Err> {
        let conn = self.conn.lock().await;
        let doc = to_doc(&sub)?;
        conn.execute(
            "INSERT INTO subscriptions (ri, pi, doc) VALUES (?1, ?2, ?3)
             ON CONFLICT(ri) DO UPDATE SET pi = excluded.pi, doc = excluded.doc",
            params![sub.ri, sub.pi, doc],
        )?;
        Ok(())
    }

    async fn get_subscription(&self, ri: &str) -> Result<Option<SubscriptionRecord>, Self::Err> {
        let conn = self.conn.lock().await;
        let doc: Option<String> = conn
            .query_row("SELECT doc FROM subscriptions WHERE ri = ?1", params![ri], |r| r.get(0))
            .optional()?;
        doc.map(|d| from_doc(&d)).transpose()
    }

    async fn delete_subscription(&self, ri: &str) -> Result<(), Self::Err> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM subscriptions WHERE ri = ?1", params![ri])?;
        Ok(())
    }

    async fn subscriptions_for_parent(&self, pi: &str) -> Result<Vec<SubscriptionRecord>, Self::Err> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT doc FROM subscriptions WHERE pi = ?1")?;
        let rows = stmt.query_map(params![pi], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(from_doc::<SubscriptionRecord>(&row?)?);
        }
        Ok(out)
    }

    async fn increment_stat(&self, key: &str, delta: i64) -> Result<i64, Self::Err> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO statistics (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = value + excluded.value",
            params![key, delta],
        )?;
        let value: i64 = conn.query_row("SELECT value FROM statistics WHERE key = ?1", params![key], |r| r.get(0))?;
        Ok(value)
    }

    async fn get_stat(&self, key: &str) -> Result<i64, Self::Err> {
        let conn = self.conn.lock().await;
        let value: Option<i64> = conn
            .query_row("SELECT value FROM statistics WHERE key = ?1", params![key], |r| r.get(0))
            .optional()?;
        Ok(value.unwrap_or(0))
    }

    async fn put_app_data(&self, key: &str, value: serde_json::Value) -> Result<(), Self::Err> {
        let conn = self.conn.lock().await;
        let doc = to_doc(&value)?;
        conn.execute(
            "INSERT INTO app_data (key, doc) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET doc = excluded.doc",
            params![key, doc],
        )?;
        Ok(())
    }

    async fn get_app_data(&self, key: &str) -> Result<Option<serde_json::Value>, Self::Err> {
        let conn = self.conn.lock().await;
        let doc: Option<String> = conn
            .query_row("SELECT doc FROM app_data WHERE key = ?1", params![key], |r| r.get(0))
            .optional()?;
        doc.map(|d| from_doc(&d)).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn cse_base() -> Resource {
        Resource {
            ri: "cse-ri".into(),
            pi: None,
            rn: "cse-in".into(),
            ty: ResourceType::CseBase,
            srn: "cse-in".into(),
            ct: Utc::now(),
            lt: Utc::now(),
            et: None,
            acpi: None,
            cstn: None,
            at: None,
            announced_to: vec![],
            attrs: Map::new(),
        }
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = DocumentStore::open(":memory:").unwrap();
        store.put_resource(cse_base()).await.unwrap();
        let fetched = store.get_resource("cse-ri").await.unwrap();
        assert_eq!(fetched.unwrap().rn, "cse-in");
    }

    #[tokio::test]
    async fn duplicate_put_is_already_exists() {
        let store = DocumentStore::open(":memory:").unwrap();
        store.put_resource(cse_base()).await.unwrap();
        let err = store.put_resource(cse_base()).await.unwrap_err();
        let err: Error = err.into();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn identifier_round_trips_through_srn() {
        let store = DocumentStore::open(":memory:").unwrap();
        store.put_identifier("cse-ri", "cse-in").await.unwrap();
        assert_eq!(store.resolve_srn("cse-in").await.unwrap(), Some("cse-ri".to_string()));
    }

    #[tokio::test]
    async fn reset_clears_all_tables() {
        let store = DocumentStore::open(":memory:").unwrap();
        store.put_resource(cse_base()).await.unwrap();
        store.reset().await.unwrap();
        assert!(store.get_resource("cse-ri").await.unwrap().is_none());
    }
}
