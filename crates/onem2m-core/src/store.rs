//! The `Store` trait: the persistence seam every backend crate implements.
//!
//! Mirrors `cdk_common::database::mint::Database`: one async-trait per
//! logical table, an associated `Err` that converts to/from the workspace
//! error type, and no backend-specific types leaking into the signature.
//! The five tables follow `Storage.py`'s layout (`resources`, `identifiers`,
//! `subscriptions`, `statistics`, `appdata`), one JSON document collection
//! each.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use onem2m_common::{Error, Resource, ResourceType, SubscriptionRecord};
use serde_json::Value;

/// Persistence seam implemented by `onem2m-storage-memory` and
/// `onem2m-storage-document`.
#[async_trait]
pub trait Store: Send + Sync {
    /// Backend-specific error, always convertible to the workspace [`Error`].
    type Err: Into<Error> + From<Error> + Send + Sync + std::fmt::Debug;

    // -- resources table --------------------------------------------------
    /// Insert a brand-new resource. Fails with `AlreadyExists` if `ri` is taken.
    async fn put_resource(&self, resource: Resource) -> Result<(), Self::Err>;
    /// Fetch a resource by its primary identifier.
    async fn get_resource(&self, ri: &str) -> Result<Option<Resource>, Self::Err>;
    /// Overwrite an existing resource in place.
    async fn update_resource(&self, resource: Resource) -> Result<(), Self::Err>;
    /// Remove a resource. Does not cascade; the Dispatcher walks children itself.
    async fn delete_resource(&self, ri: &str) -> Result<(), Self::Err>;
    /// Direct children of `pi`, in creation order.
    async fn direct_children(&self, pi: &str) -> Result<Vec<Resource>, Self::Err>;
    /// Direct children of `pi` restricted to one type, in creation order.
    async fn direct_children_of_type(
        &self,
        pi: &str,
        ty: ResourceType,
    ) -> Result<Vec<Resource>, Self::Err>;
    /// All resources with `et <= before`, for the expiration sweep.
    async fn resources_expiring_before(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<Resource>, Self::Err>;
    /// Resources whose `at` attribute references `peer_cse_id`, for the
    /// Announcement Manager's registration/deregistration sweep.
    async fn resources_announced_to(&self, peer_cse_id: &str) -> Result<Vec<Resource>, Self::Err>;

    // -- identifiers table --------------------------------------------------
    /// Record the `srn -> ri` mapping for a newly created resource.
    async fn put_identifier(&self, ri: &str, srn: &str) -> Result<(), Self::Err>;
    /// Resolve a structured resource name to its primary identifier.
    async fn resolve_srn(&self, srn: &str) -> Result<Option<String>, Self::Err>;
    /// Drop the `srn -> ri` mapping for a deleted resource.
    async fn delete_identifier(&self, ri: &str) -> Result<(), Self::Err>;

    // -- subscriptions table --------------------------------------------------
    /// Upsert the flattened hot-path view of a `<sub>` resource.
    async fn put_subscription(&self, sub: SubscriptionRecord) -> Result<(), Self::Err>;
    /// Fetch a subscription record by its `<sub>`'s `ri`.
    async fn get_subscription(&self, ri: &str) -> Result<Option<SubscriptionRecord>, Self::Err>;
    /// Remove a subscription record.
    async fn delete_subscription(&self, ri: &str) -> Result<(), Self::Err>;
    /// All subscription records whose `pi` is the given resource, used by the
    /// Notification Manager to fan an event out to interested subscribers.
    async fn subscriptions_for_parent(&self, pi: &str) -> Result<Vec<SubscriptionRecord>, Self::Err>;

    // -- statistics table --------------------------------------------------
    /// Atomically add `delta` to a named counter and return the new value.
    async fn increment_stat(&self, key: &str, delta: i64) -> Result<i64, Self::Err>;
    /// Read a named counter, defaulting to zero.
    async fn get_stat(&self, key: &str) -> Result<i64, Self::Err>;

    // -- appdata table --------------------------------------------------
    /// Opaque scratch storage, keyed by caller-chosen string (announcement
    /// bookkeeping, worker-pool persisted cursors).
    async fn put_app_data(&self, key: &str, value: Value) -> Result<(), Self::Err>;
    /// Read opaque scratch storage.
    async fn get_app_data(&self, key: &str) -> Result<Option<Value>, Self::Err>;
}
