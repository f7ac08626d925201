//! In-memory `Store` backend: five `RwLock<HashMap<...>>` tables, one per
//! logical collection. No persistence across restarts; intended for
//! tests and ephemeral/edge deployments, the way `cdk`'s in-memory mint
//! database backs its own test suite.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use onem2m_common::{Error, Resource, ResourceType, SubscriptionRecord};
use onem2m_core::store::Store;
use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error as ThisError;

/// The in-memory backend's error type. Every fallible operation here is
/// either "not found" (handled by returning `Ok(None)`, never an error) or
/// the caller-supplied `Error` itself re-wrapped, so this exists mainly to
/// satisfy the `Store::Err` contract.
#[derive(Debug, ThisError)]
#[error(transparent)]
pub struct MemoryStoreError(#[from] Error);

impl From<MemoryStoreError> for Error {
    fn from(err: MemoryStoreError) -> Error {
        err.0
    }
}

#[derive(Default)]
struct Tables {
    resources: HashMap<String, Resource>,
    identifiers: HashMap<String, String>,
    subscriptions: HashMap<String, SubscriptionRecord>,
    stats: HashMap<String, i64>,
    app_data: HashMap<String, Value>,
}

/// The in-memory Store. Cheap to construct; clone the `Arc` to share.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.read();
        f.debug_struct("MemoryStore")
            .field("resources", &tables.resources.len())
            .field("identifiers", &tables.identifiers.len())
            .field("subscriptions", &tables.subscriptions.len())
            .finish()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Err = MemoryStoreError;

    async fn put_resource(&self, resource: Resource) -> Result<(), Self::Err> {
        let mut tables = self.tables.write();
        if tables.resources.contains_key(&resource.ri) {
            return Err(Error::AlreadyExists(resource.ri).into());
        }
        tables.resources.insert(resource.ri.clone(), resource);
        Ok(())
    }

    async fn get_resource(&self, ri: &str) -> Result<Option<Resource>, Self::Err> {
        Ok(self.tables.read().resources.get(ri).cloned())
    }

    async fn update_resource(&self, resource: Resource) -> Result<(), Self::Err> {
        self.tables.write().resources.insert(resource.ri.clone(), resource);
        Ok(())
    }

    async fn delete_resource(&self, ri: &str) -> Result<(), Self::Err> {
        self.tables.write().resources.remove(ri);
        Ok(())
    }

    async fn direct_children(&self, pi: &str) -> Result<Vec<Resource>, Self::Err> {
        let tables = self.tables.read();
        let mut children: Vec<Resource> = tables
            .resources
            .values()
            .filter(|r| r.pi.as_deref() == Some(pi))
            .cloned()
            .collect();
        children.sort_by_key(|r| r.ct);
        Ok(children)
    }

    async fn direct_children_of_type(
        &self,
        pi: &str,
        ty: ResourceType,
    ) -> Result<Vec<Resource>, Self::Err> {
        let tables = self.tables.read();
        let mut children: Vec<Resource> = tables
            .resources
            .values()
            .filter(|r| r.pi.as_deref() == Some(pi) && r.ty == ty)
            .cloned()
            .collect();
        children.sort_by_key(|r| r.ct);
        Ok(children)
    }

    async fn resources_expiring_before(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<Resource>, Self::Err> {
        let tables = self.tables.read();
        Ok(tables
            .resources
            .values()
            .filter(|r| r.et.is_some_and(|et| et <= before))
            .cloned()
            .collect())
    }

    async fn resources_announced_to(&self, peer_cse_id: &str) -> Result<Vec<Resource>, Self::Err> {
        let tables = self.tables.read();
        Ok(tables
            .resources
            .values()
            .filter(|r| {
                r.at.as_ref().is_some_and(|at| at.iter().any(|p| p == peer_cse_id))
                    || r.announced_to.iter().any(|(p, _)| p == peer_cse_id)
            })
            .cloned()
            .collect())
    }

    async fn put_identifier(&self, ri: &str, srn: &str) -> Result<(), Self::Err> {
        self.tables.write().identifiers.insert(srn.to_string(), ri.to_string());
        Ok(())
    }

    async fn resolve_srn(&self, srn: &str) -> Result<Option<String>, Self::Err> {
        Ok(self.tables.read().identifiers.get(srn).cloned())
    }

    async fn delete_identifier(&self, ri: &str) -> Result<(), Self::Err> {
        self.tables.write().identifiers.retain(|_, v| v != ri);
        Ok(())
    }

    async fn put_subscription(&self, sub: SubscriptionRecord) -> Result<(), Self::Err> {
        self.tables.write().subscriptions.insert(sub.ri.clone(), sub);
        Ok(())
    }

    async fn get_subscription(&self, ri: &str) -> Result<Option<SubscriptionRecord>, Self::Err> {
        Ok(self.tables.read().subscriptions.get(ri).cloned())
    }

    async fn delete_subscription(&self, ri: &str) -> Result<(), Self::Err> {
        self.tables.write().subscriptions.remove(ri);
        Ok(())
    }

    async fn subscriptions_for_parent(&self, pi: &str) -> Result<Vec<SubscriptionRecord>, Self::Err> {
        Ok(self
            .tables
            .read()
            .subscriptions
            .values()
            .filter(|s| s.pi == pi)
            .cloned()
            .collect())
    }

    async fn increment_stat(&self, key: &str, delta: i64) -> Result<i64, Self::Err> {
        let mut tables = self.tables.write();
        let entry = tables.stats.entry(key.to_string()).or_insert(0);
        *entry += delta;
        Ok(*entry)
    }

    async fn get_stat(&self, key: &str) -> Result<i64, Self::Err> {
        Ok(*self.tables.read().stats.get(key).unwrap_or(&0))
    }

    async fn put_app_data(&self, key: &str, value: Value) -> Result<(), Self::Err> {
        self.tables.write().app_data.insert(key.to_string(), value);
        Ok(())
    }

    async fn get_app_data(&self, key: &str) -> Result<Option<Value>, Self::Err> {
        Ok(self.tables.read().app_data.get(key).cloned())
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
        let store = MemoryStore::new();
        store.put_resource(cse_base()).await.unwrap();
        let fetched = store.get_resource("cse-ri").await.unwrap();
        assert_eq!(fetched.unwrap().rn, "cse-in");
    }

    #[tokio::test]
    async fn duplicate_put_is_already_exists() {
        let store = MemoryStore::new();
        store.put_resource(cse_base()).await.unwrap();
        let err = store.put_resource(cse_base()).await.unwrap_err();
        let err: Error = err.into();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn direct_children_are_returned_in_creation_order() {
        let store = MemoryStore::new();
        let mut a = cse_base();
        a.ri = "a".into();
        a.pi = Some("root".into());
        a.ct = Utc::now();
        let mut b = cse_base();
        b.ri = "b".into();
        b.pi = Some("root".into());
        b.ct = Utc::now() + chrono::Duration::seconds(1);

        store.put_resource(b).await.unwrap();
        store.put_resource(a).await.unwrap();

        let children = store.direct_children("root").await.unwrap();
        assert_eq!(children.iter().map(|r| r.ri.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn increment_stat_accumulates() {
        let store = MemoryStore::new();
        assert_eq!(store.increment_stat("requests", 1).await.unwrap(), 1);
        assert_eq!(store.increment_stat("requests", 2).await.unwrap(), 3);
    }
}
