//! Subscription / Cross-Resource-Subscription / Notification Manager.
//!
//! Grounded in `original_source/acme/services/NotificationManager.py`:
//! verification handshake on subscription CRUD, deletion notification on
//! subscription/parent removal, event → notification mapping filtered by
//! `net`/`chty`/`atr`, batch aggregation (`bn`), cross-resource sliding and
//! periodic windows, and time-series missing-data detection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use onem2m_common::{
    AggregatedNotification, BlockingMode, CseConfig, Error, NotificationContentType,
    NotificationEvent, NotificationEventType, NotificationPayload, Resource, SubscriptionRecord,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::events::{CseEvent, EventBus};
use crate::store::Store;
use crate::worker::WorkerPool;

/// Outbound delivery of a notification, injected so the core stays
/// transport-agnostic (the same seam `Store` provides for persistence).
#[async_trait]
pub trait NotificationSender: Send + Sync {
    /// Deliver a single notification to `target`. A bounded timeout maps to
    /// `Error::TargetNotReachable` at the call site, not here.
    async fn send(&self, target: &str, payload: &NotificationPayload) -> Result<(), Error>;
    /// Deliver an aggregated batch to `target`.
    async fn send_batch(&self, target: &str, batch: &AggregatedNotification) -> Result<(), Error>;
}

struct PendingBatch {
    items: Vec<(DateTime<Utc>, NotificationPayload)>,
    guard_started: bool,
}

/// The manager. One instance per running CSE, shared via `Arc`.
pub struct NotificationManager<S: Store> {
    store: Arc<S>,
    config: CseConfig,
    sender: Arc<dyn NotificationSender>,
    workers: Arc<WorkerPool>,
    events: Arc<EventBus>,
    pending_batches: Mutex<HashMap<(String, String), PendingBatch>>,
}

impl<S: Store> std::fmt::Debug for NotificationManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationManager").finish_non_exhaustive()
    }
}

impl<S: Store + 'static> NotificationManager<S> {
    pub fn new(
        store: Arc<S>,
        config: CseConfig,
        sender: Arc<dyn NotificationSender>,
        workers: Arc<WorkerPool>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            sender,
            workers,
            events,
            pending_batches: Mutex::new(HashMap::new()),
        })
    }

    /// Attach this manager's event handling to the bus. Runs in the
    /// background since delivery involves outbound I/O.
    pub fn register(self: &Arc<Self>, bus: &EventBus) {
        for name in [
            "createDirectChild",
            "deleteDirectChild",
            "updateLocalResource",
            "deleteLocalResource",
            "reportOnGeneratedMissingDataPoints",
        ] {
            bus.add_event(name, true);
        }

        let this = self.clone();
        bus.add_handler(
            "createDirectChild",
            Arc::new(move |event| {
                let this = this.clone();
                Box::pin(async move { this.handle_event(&event).await })
            }),
        );
        let this = self.clone();
        bus.add_handler(
            "deleteDirectChild",
            Arc::new(move |event| {
                let this = this.clone();
                Box::pin(async move { this.handle_event(&event).await })
            }),
        );
        let this = self.clone();
        bus.add_handler(
            "updateLocalResource",
            Arc::new(move |event| {
                let this = this.clone();
                Box::pin(async move { this.handle_event(&event).await })
            }),
        );
        let this = self.clone();
        bus.add_handler(
            "deleteLocalResource",
            Arc::new(move |event| {
                let this = this.clone();
                Box::pin(async move { this.handle_event(&event).await })
            }),
        );
    }

    /// Verification handshake: every `nu` entry that is new (not present in
    /// `previous_nu`) and not equal to `originator` must accept a
    /// verification request before the subscription CRUD succeeds.
    pub async fn verify_new_targets(
        &self,
        sub: &SubscriptionRecord,
        previous_nu: &[String],
        originator: &str,
    ) -> Result<(), Error> {
        for target in &sub.nu {
            if target == originator || previous_nu.contains(target) {
                continue;
            }
            let payload = NotificationPayload {
                sur: sub.ri.clone(),
                nev: NotificationEvent {
                    net: NotificationEventType::CreateDirectChild,
                    rep: None,
                },
                vrq: Some(true),
                sud: None,
                cr: Some(originator.to_string()),
            };
            self.sender.send(target, &payload).await.map_err(|_| {
                Error::SubscriptionVerificationInitiationFailed(target.clone())
            })?;
        }
        Ok(())
    }

    /// Create a `<sub>`: verify targets, then persist (decision #6: the
    /// Subscription table row is always rebuilt from the committed
    /// resource in the same commit, never patched independently).
    pub async fn create_subscription(
        &self,
        sub: SubscriptionRecord,
        originator: &str,
    ) -> Result<(), Error> {
        self.verify_new_targets(&sub, &[], originator).await?;
        self.store.put_subscription(sub).await.map_err(Into::into)
    }

    /// Update a `<sub>`: verify newly-added targets against the previous
    /// record, then rebuild the row from the updated resource.
    pub async fn update_subscription(
        &self,
        sub: SubscriptionRecord,
        originator: &str,
    ) -> Result<(), Error> {
        let previous = self
            .store
            .get_subscription(&sub.ri)
            .await
            .map_err(Into::into)?;
        let previous_nu = previous.map(|p| p.nu).unwrap_or_default();
        self.verify_new_targets(&sub, &previous_nu, originator).await?;
        self.store.put_subscription(sub).await.map_err(Into::into)
    }

    /// Delete a `<sub>`: best-effort deletion notification to `su` and every
    /// `acrs` entry, then remove the record regardless of delivery outcome.
    pub async fn delete_subscription(&self, ri: &str) -> Result<(), Error> {
        if let Some(sub) = self.store.get_subscription(ri).await.map_err(Into::into)? {
            let payload = NotificationPayload {
                sur: sub.ri.clone(),
                nev: NotificationEvent {
                    net: NotificationEventType::DeleteResource,
                    rep: None,
                },
                vrq: None,
                sud: Some(true),
                cr: None,
            };
            let mut targets: Vec<String> = sub.acrs.clone();
            if let Some(su) = &sub.su {
                targets.push(su.clone());
            }
            for target in targets {
                if let Err(err) = self.sender.send(&target, &payload).await {
                    warn!(target, error = %err, "deletion notification delivery failed");
                }
            }
        }
        self.store.delete_subscription(ri).await.map_err(Into::into)
    }

    /// Blocking delivery for `blockingUpdate`/`blockingRetrieve`: holds the
    /// caller until every matching subscription's notification completes,
    /// remapping delivery failures to the blocking-specific error codes
    /// (grounded in `NotificationManager.py`'s blocking-operation handling).
    /// `resource` is the one just updated/retrieved; subscriptions attached
    /// directly to it (`pi == resource.ri`) with a matching `blocking` mode
    /// are notified synchronously.
    pub async fn notify_blocking(
        &self,
        resource: &Resource,
        mode: BlockingMode,
        event_ty: NotificationEventType,
    ) -> Result<(), Error> {
        let subs = self
            .store
            .subscriptions_for_parent(&resource.ri)
            .await
            .map_err(Into::into)?;
        for sub in subs.into_iter().filter(|s| s.blocking == Some(mode)) {
            let payload = NotificationPayload {
                sur: sub.ri.clone(),
                nev: NotificationEvent { net: event_ty, rep: Some(resource.attrs.clone()) },
                vrq: None,
                sud: None,
                cr: None,
            };
            for target in &sub.nu {
                self.sender
                    .send(target, &payload)
                    .await
                    .map_err(remap_blocking_error)?;
            }
        }
        Ok(())
    }

    /// The event → notification mapping.
    async fn handle_event(self: &Arc<Self>, event: &CseEvent) -> Result<(), Error> {
        let (parent_ri, net, child_ty, changed_attrs) = match event {
            CseEvent::CreateDirectChild { parent_ri, child_ty, .. } => {
                (parent_ri.clone(), NotificationEventType::CreateDirectChild, Some(*child_ty), Vec::new())
            }
            CseEvent::DeleteDirectChild { parent_ri, child_ty, .. } => {
                (parent_ri.clone(), NotificationEventType::DeleteDirectChild, Some(*child_ty), Vec::new())
            }
            CseEvent::UpdateLocalResource { ri, changed_attrs } => {
                (ri.clone(), NotificationEventType::UpdateResource, None, changed_attrs.clone())
            }
            CseEvent::DeleteLocalResource { ri } => {
                (ri.clone(), NotificationEventType::DeleteResource, None, Vec::new())
            }
            _ => return Ok(()),
        };

        let subs = self
            .store
            .subscriptions_for_parent(&parent_ri)
            .await
            .map_err(Into::into)?;

        for sub in subs {
            if !sub.net.contains(&net) {
                continue;
            }
            if let Some(child_ty) = child_ty {
                if !sub.chty.is_empty() && !sub.chty.contains(&child_ty) {
                    continue;
                }
            }
            if net == NotificationEventType::UpdateResource && !sub.atr.is_empty() {
                let intersects = changed_attrs.iter().any(|a| sub.atr.contains(a));
                if !intersects {
                    continue;
                }
            }

            let target_ri = match event {
                CseEvent::CreateDirectChild { child_ri, .. } | CseEvent::DeleteDirectChild { child_ri, .. } => {
                    child_ri.clone()
                }
                _ => parent_ri.clone(),
            };

            let rep = self.build_representation(&sub, &target_ri, &changed_attrs).await?;
            let payload = NotificationPayload {
                sur: sub.ri.clone(),
                nev: NotificationEvent { net, rep },
                vrq: None,
                sud: None,
                cr: None,
            };

            for target in &sub.nu {
                self.deliver(&sub, target, payload.clone()).await;
            }

            self.record_crs_arrivals(&sub).await?;
            self.apply_expiration_counter(&sub).await?;
        }

        Ok(())
    }

    async fn build_representation(
        &self,
        sub: &SubscriptionRecord,
        target_ri: &str,
        changed_attrs: &[String],
    ) -> Result<Option<serde_json::Map<String, Value>>, Error> {
        match sub.nct {
            NotificationContentType::Ri => {
                let mut map = serde_json::Map::new();
                map.insert("ri".to_string(), json!(target_ri));
                Ok(Some(map))
            }
            NotificationContentType::All => {
                let resource = self.store.get_resource(target_ri).await.map_err(Into::into)?;
                Ok(resource.map(|r| resource_to_map(&r)))
            }
            NotificationContentType::ModifiedAttributes => {
                let resource = self.store.get_resource(target_ri).await.map_err(Into::into)?;
                Ok(resource.map(|r| {
                    let mut map = serde_json::Map::new();
                    for attr in changed_attrs {
                        if let Some(v) = r.attrs.get(attr) {
                            map.insert(attr.clone(), v.clone());
                        }
                    }
                    map
                }))
            }
            NotificationContentType::TimeSeriesNotification => Ok(None),
        }
    }

    /// Deliver one notification, honoring `bn` batching when configured.
    async fn deliver(self: &Arc<Self>, sub: &SubscriptionRecord, target: &str, payload: NotificationPayload) {
        let Some(bn) = &sub.bn else {
            if let Err(err) = self.sender.send(target, &payload).await {
                warn!(target, error = %err, "notification delivery failed");
            }
            return;
        };

        let key = (sub.ri.clone(), target.to_string());
        let should_flush;
        {
            let mut pending = self.pending_batches.lock();
            let entry = pending.entry(key.clone()).or_insert_with(|| PendingBatch {
                items: Vec::new(),
                guard_started: false,
            });
            if bn.latest_only {
                entry.items.clear();
            }
            entry.items.push((Utc::now(), payload));
            should_flush = entry.items.len() as u32 >= bn.num;
            if !should_flush && !entry.guard_started {
                entry.guard_started = true;
                self.schedule_batch_guard(key.clone(), Duration::from_secs(bn.dur_secs));
            }
        }

        if should_flush {
            self.flush_batch(&key).await;
        }
    }

    /// The guard actor carries the batch key; when it fires it asks this
    /// manager to flush whatever is still pending for that `(ri, nu)` pair.
    fn schedule_batch_guard(self: &Arc<Self>, key: (String, String), dur: Duration) {
        let key_json = json!({ "sub_ri": key.0, "target": key.1 });
        let this = self.clone();
        self.workers.new_actor(
            &format!("batch-guard:{}:{}", key.0, key.1),
            dur,
            key_json,
            Arc::new(move |_data| {
                let this = this.clone();
                let key = key.clone();
                Box::pin(async move {
                    this.flush_batch(&key).await;
                    Ok(())
                })
            }),
        );
    }

    async fn flush_batch(self: &Arc<Self>, key: &(String, String)) {
        let items = {
            let mut pending = self.pending_batches.lock();
            pending.remove(key).map(|b| b.items).unwrap_or_default()
        };
        if items.is_empty() {
            return;
        }
        let mut ordered = items;
        ordered.sort_by_key(|(ts, _)| *ts);
        let batch = AggregatedNotification {
            notifications: ordered.into_iter().map(|(_, n)| n).collect(),
        };
        if let Err(err) = self.sender.send_batch(&key.1, &batch).await {
            warn!(target = %key.1, error = %err, "batch notification delivery failed; retained for next guard");
        }
    }

    /// After a successful notification, decrement `exc`; delete the
    /// subscription once it would drop below one.
    async fn apply_expiration_counter(&self, sub: &SubscriptionRecord) -> Result<(), Error> {
        let Some(exc) = sub.exc else { return Ok(()) };
        if exc <= 1 {
            self.delete_subscription(&sub.ri).await?;
        } else {
            let mut updated = sub.clone();
            updated.exc = Some(exc - 1);
            self.store.put_subscription(updated).await.map_err(Into::into)?;
        }
        Ok(())
    }

    /// For every `<crs>` this subscription feeds (its `acrs` list), load the
    /// cross-resource subscription's window configuration and record this
    /// subscription's `ri` as an arrival.
    async fn record_crs_arrivals(&self, sub: &SubscriptionRecord) -> Result<(), Error> {
        for crs_ri in &sub.acrs {
            let Some(crs) = self.store.get_resource(crs_ri).await.map_err(Into::into)? else {
                continue;
            };
            let Some((twt, tws, count)) = crs.crs_window() else {
                continue;
            };
            self.record_cross_resource_arrival(crs_ri, twt, tws, count, sub.ri.clone());
        }
        Ok(())
    }

    /// Record an incoming `sur` against a cross-resource subscription's
    /// window, scheduling the periodic worker or sliding actor as needed.
    pub fn record_cross_resource_arrival(
        &self,
        crs_ri: &str,
        twt: onem2m_common::TimeWindowType,
        tws: Duration,
        subscription_count: usize,
        sur: String,
    ) {
        use onem2m_common::TimeWindowType::*;
        let name = format!("crs-window:{crs_ri}");

        match twt {
            Periodic => {
                let existing = self.workers.find_workers(&name);
                if existing.is_empty() {
                    let data = json!({ "sur": [sur], "expected": subscription_count });
                    let sender = self.sender.clone();
                    let crs_ri_owned = crs_ri.to_string();
                    self.workers.new_worker(
                        &name,
                        tws,
                        false,
                        data,
                        Arc::new(move |handle_data| {
                            let sender = sender.clone();
                            let crs_ri_owned = crs_ri_owned.clone();
                            Box::pin(async move {
                                let (sur_list, expected) = {
                                    let mut guard = handle_data.lock();
                                    let expected = guard["expected"].as_u64().unwrap_or(0) as usize;
                                    let list: Vec<String> = guard["sur"]
                                        .as_array()
                                        .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                                        .unwrap_or_default();
                                    guard["sur"] = json!([]);
                                    (list, expected)
                                };
                                if sur_list.len() >= expected && expected > 0 {
                                    let payload = NotificationPayload {
                                        sur: crs_ri_owned.clone(),
                                        nev: NotificationEvent {
                                            net: NotificationEventType::CreateDirectChild,
                                            rep: None,
                                        },
                                        vrq: None,
                                        sud: None,
                                        cr: None,
                                    };
                                    let _ = sender.send(&crs_ri_owned, &payload).await;
                                }
                                Ok(())
                            })
                        }),
                    );
                } else {
                    let handle = &existing[0];
                    let mut guard = handle.data.lock();
                    let arr = guard["sur"].as_array_mut().expect("sur array");
                    if !arr.iter().any(|v| v.as_str() == Some(sur.as_str())) {
                        arr.push(json!(sur));
                    }
                }
            }
            Sliding => {
                let existing = self.workers.find_workers(&name);
                if existing.is_empty() {
                    let data = json!({ "sur": [sur], "expected": subscription_count });
                    let sender = self.sender.clone();
                    let crs_ri_owned = crs_ri.to_string();
                    self.workers.new_actor(
                        &name,
                        tws,
                        data,
                        Arc::new(move |handle_data| {
                            let sender = sender.clone();
                            let crs_ri_owned = crs_ri_owned.clone();
                            Box::pin(async move {
                                let (sur_list, expected) = {
                                    let guard = handle_data.lock();
                                    let expected = guard["expected"].as_u64().unwrap_or(0) as usize;
                                    let list: Vec<String> = guard["sur"]
                                        .as_array()
                                        .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                                        .unwrap_or_default();
                                    (list, expected)
                                };
                                if sur_list.len() >= expected && expected > 0 {
                                    let payload = NotificationPayload {
                                        sur: crs_ri_owned.clone(),
                                        nev: NotificationEvent {
                                            net: NotificationEventType::CreateDirectChild,
                                            rep: None,
                                        },
                                        vrq: None,
                                        sud: None,
                                        cr: None,
                                    };
                                    let _ = sender.send(&crs_ri_owned, &payload).await;
                                }
                                Ok(())
                            })
                        }),
                    );
                } else {
                    let handle = &existing[0];
                    let mut guard = handle.data.lock();
                    let arr = guard["sur"].as_array_mut().expect("sur array");
                    if !arr.iter().any(|v| v.as_str() == Some(sur.as_str())) {
                        arr.push(json!(sur));
                    }
                }
            }
        }
        debug!(crs_ri, "recorded cross-resource subscription arrival");
    }

    /// Missing-data detection for a monitored `<ts>`: schedule a periodic
    /// check against expected arrival times derived from `pei`/`mdt`. On
    /// every tick, if no `<tsi>` arrived within `pei + mdt` of the previous
    /// one, `mdc` is incremented and the deadline recorded in `mdlt`; once
    /// `mdc` reaches the `<ts>`'s `mdn`, `reportOnGeneratedMissingDataPoints`
    /// fires and the counters reset (grounded in `TS.py`'s `mdc`/`mdlt`
    /// bookkeeping).
    pub fn monitor_time_series(&self, ts_ri: &str, pei: Duration, mdt: Duration) {
        let mdt = if mdt.is_zero() {
            Duration::from_secs_f64(
                pei.as_secs_f64() * self.config.notification.default_missing_data_detection_ratio,
            )
        } else {
            mdt
        };
        let name = format!("mdd:{ts_ri}");
        let data = json!({ "mdc": 0, "mdlt": [] });
        let ts_ri_owned = ts_ri.to_string();
        let store = self.store.clone();
        let events = self.events.clone();
        self.workers.new_worker(
            &name,
            pei,
            true,
            data,
            Arc::new(move |handle_data| {
                let ts_ri_owned = ts_ri_owned.clone();
                let store = store.clone();
                let events = events.clone();
                Box::pin(async move {
                    let Some(ts) = store.get_resource(&ts_ri_owned).await.map_err(Into::into)? else {
                        return Ok(());
                    };
                    let instances = store
                        .direct_children_of_type(&ts_ri_owned, onem2m_common::ResourceType::TimeSeriesInstance)
                        .await
                        .map_err(Into::into)?;
                    let deadline = Utc::now() - chrono::Duration::from_std(pei + mdt).unwrap_or_default();
                    let arrived_in_time = instances.iter().any(|i| i.ct >= deadline);

                    if !arrived_in_time {
                        let mdn = ts.attrs.get("mdn").and_then(Value::as_u64).unwrap_or(u64::MAX);
                        let (mdc, missed) = {
                            let mut guard = handle_data.lock();
                            let mdc = guard["mdc"].as_u64().unwrap_or(0) + 1;
                            guard["mdc"] = json!(mdc);
                            let arr = guard["mdlt"].as_array_mut().expect("mdlt array");
                            arr.push(json!(Utc::now()));
                            let missed: Vec<DateTime<Utc>> = arr
                                .iter()
                                .filter_map(|v| v.as_str().and_then(|s| s.parse().ok()))
                                .collect();
                            (mdc, missed)
                        };
                        if mdc >= mdn {
                            events
                                .fire(CseEvent::ReportOnGeneratedMissingDataPoints {
                                    ts_ri: ts_ri_owned.clone(),
                                    missed,
                                })
                                .await;
                            let mut guard = handle_data.lock();
                            guard["mdc"] = json!(0);
                            guard["mdlt"] = json!([]);
                        }
                    }
                    Ok(())
                })
            }),
        );
    }
}

/// Remap a delivery failure to the blocking-operation error codes: an
/// unreachable target becomes a remote-entity-unreachable error, and an
/// explicit refusal becomes a remote-entity-denied error.
fn remap_blocking_error(err: Error) -> Error {
    match err {
        Error::TargetNotReachable(target) => Error::RemoteEntityNotReachable(target),
        Error::OperationNotAllowed(detail) => Error::OperationDeniedByRemoteEntity(detail),
        other => other,
    }
}

fn resource_to_map(resource: &Resource) -> serde_json::Map<String, Value> {
    let mut map = resource.attrs.clone();
    map.insert("ri".into(), json!(resource.ri));
    map.insert("pi".into(), json!(resource.pi));
    map.insert("rn".into(), json!(resource.rn));
    map.insert("ct".into(), json!(resource.ct));
    map.insert("lt".into(), json!(resource.lt));
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_to_map_carries_envelope_fields() {
        let mut attrs = serde_json::Map::new();
        attrs.insert("cnf".into(), json!("text/plain"));
        let resource = Resource {
            ri: "ri-1".into(),
            pi: Some("ri-0".into()),
            rn: "cin1".into(),
            ty: onem2m_common::ResourceType::ContentInstance,
            srn: "cse-in/cnt1/cin1".into(),
            ct: Utc::now(),
            lt: Utc::now(),
            et: None,
            acpi: None,
            cstn: None,
            at: None,
            announced_to: vec![],
            attrs,
        };
        let map = resource_to_map(&resource);
        assert_eq!(map.get("ri"), Some(&json!("ri-1")));
        assert_eq!(map.get("cnf"), Some(&json!("text/plain")));
    }
}
