//! The Dispatcher: the request state machine tying Store, Access-Control
//! Engine, Resource Model hooks, Event Bus and Notification Manager
//! together. One entry point per operation.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use onem2m_common::{
    BlockingMode, CseConfig, Error, FilterCriteria, NotificationEventType, Permission, Resource,
    ResourceType, SubscriptionRecord,
};
use tracing::instrument;
use uuid::Uuid;

use crate::access_control::AccessControlEngine;
use crate::events::{CseEvent, EventBus};
use crate::notification::NotificationManager;
use crate::resource_model::handler_for;
use crate::store::Store;

/// Everything a Dispatcher operation needs beyond the target/payload: who is
/// asking, for CREATE what type of child they want, and for RETRIEVE an
/// optional `maxAge` that skips a blocking-retrieve notification when the
/// resource is already fresh enough.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub originator: String,
    pub create_type: Option<ResourceType>,
    pub max_age: Option<Duration>,
}

/// The Dispatcher itself, generic over the `Store` backend.
pub struct Dispatcher<S: Store> {
    store: Arc<S>,
    config: CseConfig,
    acl: AccessControlEngine<S>,
    events: Arc<EventBus>,
    notifications: Arc<NotificationManager<S>>,
}

impl<S: Store> std::fmt::Debug for Dispatcher<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

impl<S: Store + 'static> Dispatcher<S> {
    pub fn new(
        store: Arc<S>,
        config: CseConfig,
        events: Arc<EventBus>,
        notifications: Arc<NotificationManager<S>>,
    ) -> Self {
        let acl = AccessControlEngine::new(store.clone(), config.clone());
        Self {
            store,
            config,
            acl,
            events,
            notifications,
        }
    }

    /// Resolve a target address (`ri`, CSE-relative `srn`, or an `/la`/`/ol`
    /// virtual child suffix) to a concrete resource, or `NOT_FOUND`.
    #[instrument(skip(self))]
    pub async fn resolve(&self, target: &str) -> Result<Resource, Error> {
        if let Some((parent_srn, "la")) = split_virtual_suffix(target) {
            return self.resolve_virtual(parent_srn, true).await;
        }
        if let Some((parent_srn, "ol")) = split_virtual_suffix(target) {
            return self.resolve_virtual(parent_srn, false).await;
        }

        let ri = if target.contains('/') {
            self.store
                .resolve_srn(target)
                .await
                .map_err(Into::into)?
                .ok_or_else(|| Error::NotFound(target.to_string()))?
        } else {
            target.to_string()
        };

        self.store
            .get_resource(&ri)
            .await
            .map_err(Into::into)?
            .ok_or_else(|| Error::NotFound(target.to_string()))
    }

    async fn resolve_virtual(&self, parent_srn: &str, latest: bool) -> Result<Resource, Error> {
        let parent_ri = self
            .store
            .resolve_srn(parent_srn)
            .await
            .map_err(Into::into)?
            .ok_or_else(|| Error::NotFound(parent_srn.to_string()))?;
        let mut children = self
            .store
            .direct_children(&parent_ri)
            .await
            .map_err(Into::into)?;
        children.retain(|c| matches!(c.ty, ResourceType::ContentInstance | ResourceType::TimeSeriesInstance));
        children.sort_by_key(|c| c.ct);
        let picked = if latest {
            children.into_iter().last()
        } else {
            children.into_iter().next()
        };
        picked.ok_or_else(|| Error::NotFound(format!("{parent_srn}/{}", if latest { "la" } else { "ol" })))
    }

    /// CREATE a new resource of `ctx.create_type` under `target`.
    #[instrument(skip(self, attrs, ctx))]
    pub async fn create(
        &self,
        target: &str,
        rn: String,
        mut attrs: serde_json::Map<String, serde_json::Value>,
        ctx: &RequestContext,
    ) -> Result<Resource, Error> {
        let ty = ctx
            .create_type
            .ok_or_else(|| Error::BadRequest("CREATE requires a resource type".into()))?;

        let parent = self.resolve(target).await?;
        if parent.ty.is_virtual() {
            return Err(Error::OperationNotAllowed(target.to_string()));
        }

        if !handler_for(parent.ty).allowed_children().contains(&ty) {
            return Err(Error::InvalidChildResourceType(
                ty.to_string(),
                parent.ty.to_string(),
            ));
        }

        if !self
            .acl
            .has_access(&ctx.originator, &parent, Permission::CREATE, Some(ty), None)
            .await?
        {
            return Err(Error::OriginatorHasNoPrivilege(ctx.originator.clone()));
        }

        let ri = Uuid::new_v4().to_string();
        let srn = format!("{}/{}", parent.srn, rn);
        attrs.entry("cr").or_insert(serde_json::json!(ctx.originator));
        self.apply_expiration_defaults(&mut attrs);
        if ty == ResourceType::Subscription {
            self.apply_default_expiration_counter(&mut attrs);
        }

        let mut resource = Resource {
            ri: ri.clone(),
            pi: Some(parent.ri.clone()),
            rn,
            ty,
            srn: srn.clone(),
            ct: Utc::now(),
            lt: Utc::now(),
            et: None,
            acpi: None,
            cstn: None,
            at: None,
            announced_to: Vec::new(),
            attrs,
        };
        resource.sync_typed_fields_from_attrs();

        let handler = handler_for(ty);
        handler.validate(&resource, true)?;
        handler.child_will_be_added(&parent, &resource)?;

        self.store.put_resource(resource.clone()).await.map_err(Into::into)?;
        self.store.put_identifier(&ri, &srn).await.map_err(Into::into)?;

        handler.activate(&mut resource)?;

        let mut parent_after = parent.clone();
        let siblings = self
            .store
            .direct_children_of_type(&parent.ri, ty)
            .await
            .map_err(Into::into)?;
        let evicted = handler_for(parent.ty).child_added(&mut parent_after, &resource, &siblings);
        self.store.update_resource(parent_after).await.map_err(Into::into)?;

        for victim_ri in &evicted {
            if let Some(victim) = self.store.get_resource(victim_ri).await.map_err(Into::into)? {
                self.store.delete_resource(victim_ri).await.map_err(Into::into)?;
                self.store.delete_identifier(victim_ri).await.map_err(Into::into)?;
                self.events
                    .fire(CseEvent::DeleteDirectChild {
                        parent_ri: parent.ri.clone(),
                        child_ri: victim.ri.clone(),
                        child_ty: victim.ty,
                    })
                    .await;
            }
        }

        if ty == ResourceType::Subscription {
            let sub = subscription_record_from(&resource)?;
            self.notifications
                .create_subscription(sub, &ctx.originator)
                .await?;
        }

        if ty == ResourceType::TimeSeries {
            if let Some(pei) = resource.attrs.get("pei").and_then(|v| v.as_u64()) {
                let mdt = resource
                    .attrs
                    .get("mdt")
                    .and_then(|v| v.as_u64())
                    .map(Duration::from_millis)
                    .unwrap_or_default();
                self.notifications
                    .monitor_time_series(&ri, Duration::from_millis(pei), mdt);
            }
        }

        self.store.update_resource(resource.clone()).await.map_err(Into::into)?;

        self.events
            .fire(CseEvent::CreateLocalResource { ri: ri.clone() })
            .await;
        self.events
            .fire(CseEvent::CreateDirectChild {
                parent_ri: parent.ri.clone(),
                child_ri: ri.clone(),
                child_ty: ty,
            })
            .await;

        if ty == ResourceType::Csr {
            if let Some(peer_cse_id) = resource.attrs.get("csi").and_then(|v| v.as_str()) {
                self.events
                    .fire(CseEvent::RegisterRemoteCse {
                        csr_ri: ri,
                        peer_cse_id: peer_cse_id.to_string(),
                    })
                    .await;
            }
        }

        Ok(resource)
    }

    /// RETRIEVE a single resource.
    #[instrument(skip(self, ctx))]
    pub async fn retrieve(&self, target: &str, ctx: &RequestContext) -> Result<Resource, Error> {
        let resource = self.resolve(target).await?;
        if !self
            .acl
            .has_access(&ctx.originator, &resource, Permission::RETRIEVE, None, None)
            .await?
        {
            return Err(Error::OriginatorHasNoPrivilege(ctx.originator.clone()));
        }

        let fresh_enough = ctx
            .max_age
            .is_some_and(|max_age| Utc::now() - resource.lt <= chrono::Duration::from_std(max_age).unwrap_or_default());
        if !fresh_enough {
            self.notifications
                .notify_blocking(&resource, BlockingMode::BlockingRetrieve, NotificationEventType::RetrieveCnt)
                .await?;
        }

        Ok(resource)
    }

    /// UPDATE an existing resource's attributes.
    #[instrument(skip(self, patch, ctx))]
    pub async fn update(
        &self,
        target: &str,
        patch: serde_json::Map<String, serde_json::Value>,
        ctx: &RequestContext,
    ) -> Result<Resource, Error> {
        let mut resource = self.resolve(target).await?;
        if resource.ty.is_virtual() {
            return Err(Error::OperationNotAllowed(target.to_string()));
        }

        if patch.contains_key("acpi") {
            let attr_names: Vec<String> = patch.keys().cloned().collect();
            self.acl
                .can_update_acpi(&ctx.originator, &resource, &attr_names)
                .await?;
        } else if !self
            .acl
            .has_access(&ctx.originator, &resource, Permission::UPDATE, None, None)
            .await?
        {
            return Err(Error::OriginatorHasNoPrivilege(ctx.originator.clone()));
        }

        let handler = handler_for(resource.ty);
        let changed = handler.update(&mut resource, patch)?;
        self.store.update_resource(resource.clone()).await.map_err(Into::into)?;

        if resource.ty == ResourceType::Subscription {
            let sub = subscription_record_from(&resource)?;
            self.notifications
                .update_subscription(sub, &ctx.originator)
                .await?;
        }

        self.notifications
            .notify_blocking(&resource, BlockingMode::BlockingUpdate, NotificationEventType::UpdateResource)
            .await?;

        self.events
            .fire(CseEvent::UpdateLocalResource {
                ri: resource.ri.clone(),
                changed_attrs: changed,
            })
            .await;

        Ok(resource)
    }

    /// DELETE a resource, cascading to children bottom-up.
    #[instrument(skip(self, ctx))]
    pub async fn delete(&self, target: &str, ctx: &RequestContext) -> Result<(), Error> {
        let resource = self.resolve(target).await?;
        if resource.ty.is_virtual() {
            return Err(Error::OperationNotAllowed(target.to_string()));
        }
        if !self
            .acl
            .has_access(&ctx.originator, &resource, Permission::DELETE, None, None)
            .await?
        {
            return Err(Error::OriginatorHasNoPrivilege(ctx.originator.clone()));
        }

        self.delete_subtree(resource).await
    }

    #[allow(clippy::manual_async_fn)]
    fn delete_subtree<'a>(
        &'a self,
        resource: Resource,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), Error>> + Send + 'a>> {
        Box::pin(async move {
            let children = self.store.direct_children(&resource.ri).await.map_err(Into::into)?;
            for child in children {
                self.delete_subtree(child).await?;
            }

            let handler = handler_for(resource.ty);
            handler.will_be_deactivated(&resource)?;

            self.store.delete_resource(&resource.ri).await.map_err(Into::into)?;
            self.store.delete_identifier(&resource.ri).await.map_err(Into::into)?;

            if resource.ty == ResourceType::Subscription {
                self.notifications.delete_subscription(&resource.ri).await?;
            }

            if let Some(pi) = &resource.pi {
                if let Some(mut parent) = self.store.get_resource(pi).await.map_err(Into::into)? {
                    handler_for(parent.ty).child_removed(&mut parent, &resource);
                    self.store.update_resource(parent).await.map_err(Into::into)?;
                }
            }

            self.events
                .fire(CseEvent::DeleteLocalResource { ri: resource.ri.clone() })
                .await;
            if let Some(pi) = &resource.pi {
                self.events
                    .fire(CseEvent::DeleteDirectChild {
                        parent_ri: pi.clone(),
                        child_ri: resource.ri.clone(),
                        child_ty: resource.ty,
                    })
                    .await;
            }

            if resource.ty == ResourceType::Csr {
                if let Some(peer_cse_id) = resource.attrs.get("csi").and_then(|v| v.as_str()) {
                    self.events
                        .fire(CseEvent::DeregisterRemoteCse {
                            peer_cse_id: peer_cse_id.to_string(),
                        })
                        .await;
                }
            }

            Ok(())
        })
    }

    /// Discovery: filter + sort children of `target` per `criteria`.
    #[instrument(skip(self, criteria, ctx))]
    pub async fn discover(
        &self,
        target: &str,
        criteria: &FilterCriteria,
        ctx: &RequestContext,
    ) -> Result<Vec<Resource>, Error> {
        let root = self.resolve(target).await?;
        if !self
            .acl
            .has_access(&ctx.originator, &root, Permission::DISCOVERY, None, None)
            .await?
        {
            return Err(Error::OriginatorHasNoPrivilege(ctx.originator.clone()));
        }

        let mut results = self.collect_subtree(&root).await?;
        results.retain(|r| matches_filter(r, criteria));

        if self.config.cse.sort_discovery_results {
            results.sort_by(|a, b| {
                (a.ty as u8 as i32, a.rn.to_lowercase()).cmp(&(b.ty as u8 as i32, b.rn.to_lowercase()))
            });
        }

        if let Some(offset) = criteria.offset {
            results.drain(..(offset as usize).min(results.len()));
        }
        if let Some(limit) = criteria.limit {
            results.truncate(limit as usize);
        }

        Ok(results)
    }

    fn collect_subtree<'a>(
        &'a self,
        root: &'a Resource,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Vec<Resource>, Error>> + Send + 'a>> {
        Box::pin(async move {
            let mut out = Vec::new();
            let children = self.store.direct_children(&root.ri).await.map_err(Into::into)?;
            for child in children {
                out.push(child.clone());
                out.extend(self.collect_subtree(&child).await?);
            }
            Ok(out)
        })
    }

    /// Expiration sweep: called by a worker on a fixed interval.
    pub async fn expire_due_resources(&self) -> Result<usize, Error> {
        let due = self
            .store
            .resources_expiring_before(Utc::now())
            .await
            .map_err(Into::into)?;
        let count = due.len();
        for resource in due {
            self.delete_subtree(resource).await?;
        }
        Ok(count)
    }

    /// Apply `cse.default_expiration_secs` when `et` is omitted, and clamp a
    /// supplied `et` to `cse.max_expiration_delta_secs` from now. A `0`
    /// horizon/delta disables the respective behaviour (no default, no cap).
    fn apply_expiration_defaults(&self, attrs: &mut serde_json::Map<String, serde_json::Value>) {
        let now = Utc::now();
        let supplied = attrs
            .get("et")
            .and_then(|v| v.as_str())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        match supplied {
            None => {
                if self.config.cse.default_expiration_secs > 0 {
                    let et = now + chrono::Duration::seconds(self.config.cse.default_expiration_secs as i64);
                    attrs.insert("et".to_string(), serde_json::json!(et.to_rfc3339()));
                }
            }
            Some(et) => {
                if self.config.cse.max_expiration_delta_secs > 0 {
                    let max_et =
                        now + chrono::Duration::seconds(self.config.cse.max_expiration_delta_secs as i64);
                    if et > max_et {
                        attrs.insert("et".to_string(), serde_json::json!(max_et.to_rfc3339()));
                    }
                }
            }
        }
    }

    /// Apply `cse.default_subscription_expiration_counter` to a `<sub>`
    /// CREATE that omits `exc`. `0` means "no default counter" (unlimited
    /// notifications), matching `CseIdentity`'s own default.
    fn apply_default_expiration_counter(&self, attrs: &mut serde_json::Map<String, serde_json::Value>) {
        if attrs.contains_key("exc") {
            return;
        }
        let default_exc = self.config.cse.default_subscription_expiration_counter;
        if default_exc > 0 {
            attrs.insert("exc".to_string(), serde_json::json!(default_exc));
        }
    }
}

fn split_virtual_suffix(target: &str) -> Option<(&str, &str)> {
    let (prefix, suffix) = target.rsplit_once('/')?;
    if suffix == "la" || suffix == "ol" {
        Some((prefix, suffix))
    } else {
        None
    }
}

fn matches_filter(resource: &Resource, criteria: &FilterCriteria) -> bool {
    if !criteria.ty.is_empty() && !criteria.ty.contains(&resource.ty) {
        return false;
    }
    if let Some(level) = criteria.level {
        if resource.level() > level {
            return false;
        }
    }
    if let Some(after) = criteria.created_after {
        if resource.ct < after {
            return false;
        }
    }
    if let Some(before) = criteria.created_before {
        if resource.ct > before {
            return false;
        }
    }
    if let Some(name) = &criteria.resource_name {
        if &resource.rn != name {
            return false;
        }
    }
    if !criteria.labels.is_empty() {
        let labels: Vec<String> = resource
            .attrs
            .get("lbl")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        if !criteria.labels.iter().all(|l| labels.contains(l)) {
            return false;
        }
    }
    true
}

fn subscription_record_from(resource: &Resource) -> Result<SubscriptionRecord, Error> {
    SubscriptionRecord::from_resource(resource)
        .ok_or_else(|| Error::BadRequest("<sub> has no parent".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_suffix_split_recognises_la_and_ol() {
        assert_eq!(split_virtual_suffix("cse-in/cnt1/la"), Some(("cse-in/cnt1", "la")));
        assert_eq!(split_virtual_suffix("cse-in/cnt1/ol"), Some(("cse-in/cnt1", "ol")));
        assert_eq!(split_virtual_suffix("cse-in/cnt1"), None);
    }
}
