//! Announcement Manager.
//!
//! Grounded in `original_source/acme/services/AnnouncementManager.py`: on
//! remote-CSE (de)registration, walks local resources whose `at` attribute
//! names that peer and issues CREATE/DELETE of an announced shadow; on local
//! UPDATE, propagates the delta to already-announced shadows and reconciles
//! `at` additions/removals against `announced_to`.

use std::sync::Arc;

use async_trait::async_trait;
use onem2m_common::{Error, Resource};
use serde_json::{Map, Value};
use tracing::warn;

use crate::events::{CseEvent, EventBus};
use crate::store::Store;

/// Outbound peer-CSE announcement calls, injected so the core stays
/// transport-agnostic (the same seam `NotificationSender` provides).
#[async_trait]
pub trait AnnouncementSender: Send + Sync {
    /// Create an announced shadow of `resource` on `peer_cse_id`. Returns the
    /// shadow's `ri` on the peer.
    async fn announce_create(&self, peer_cse_id: &str, resource: &Resource) -> Result<String, Error>;
    /// Propagate an attribute delta to an already-announced shadow.
    async fn announce_update(
        &self,
        peer_cse_id: &str,
        remote_ri: &str,
        patch: &Map<String, Value>,
    ) -> Result<(), Error>;
    /// Remove an announced shadow.
    async fn announce_delete(&self, peer_cse_id: &str, remote_ri: &str) -> Result<(), Error>;
}

pub struct AnnouncementManager<S: Store> {
    store: Arc<S>,
    sender: Arc<dyn AnnouncementSender>,
}

impl<S: Store> std::fmt::Debug for AnnouncementManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnnouncementManager").finish_non_exhaustive()
    }
}

impl<S: Store + 'static> AnnouncementManager<S> {
    pub fn new(store: Arc<S>, sender: Arc<dyn AnnouncementSender>) -> Arc<Self> {
        Arc::new(Self { store, sender })
    }

    /// Attach to the bus. Runs in the background: every path here involves
    /// outbound peer-CSE I/O.
    pub fn register(self: &Arc<Self>, bus: &EventBus) {
        for name in ["registerRemoteCse", "deregisterRemoteCse", "updateLocalResource"] {
            bus.add_event(name, true);
        }

        let this = self.clone();
        bus.add_handler(
            "registerRemoteCse",
            Arc::new(move |event| {
                let this = this.clone();
                Box::pin(async move { this.handle_event(&event).await })
            }),
        );
        let this = self.clone();
        bus.add_handler(
            "deregisterRemoteCse",
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
    }

    async fn handle_event(self: &Arc<Self>, event: &CseEvent) -> Result<(), Error> {
        match event {
            CseEvent::RegisterRemoteCse { peer_cse_id, .. } => {
                self.announce_all_for_peer(peer_cse_id).await
            }
            CseEvent::DeregisterRemoteCse { peer_cse_id } => {
                self.deannounce_all_for_peer(peer_cse_id).await
            }
            CseEvent::UpdateLocalResource { ri, changed_attrs } => {
                self.propagate_update(ri, changed_attrs).await
            }
            _ => Ok(()),
        }
    }

    /// On registration: announce every resource whose `at` names this peer
    /// and that has not already been announced to it.
    async fn announce_all_for_peer(&self, peer_cse_id: &str) -> Result<(), Error> {
        let candidates = self
            .store
            .resources_announced_to(peer_cse_id)
            .await
            .map_err(Into::into)?;

        for mut resource in candidates {
            let already = resource
                .announced_to
                .iter()
                .any(|(peer, _)| peer == peer_cse_id);
            if already {
                continue;
            }
            match self.sender.announce_create(peer_cse_id, &resource).await {
                Ok(remote_ri) => {
                    resource.announced_to.push((peer_cse_id.to_string(), remote_ri));
                    self.store.update_resource(resource).await.map_err(Into::into)?;
                }
                Err(err) => warn!(peer_cse_id, ri = %resource.ri, error = %err, "announcement create failed"),
            }
        }
        Ok(())
    }

    /// On deregistration: de-announce every shadow held on this peer.
    async fn deannounce_all_for_peer(&self, peer_cse_id: &str) -> Result<(), Error> {
        let candidates = self
            .store
            .resources_announced_to(peer_cse_id)
            .await
            .map_err(Into::into)?;

        for mut resource in candidates {
            let Some(pos) = resource.announced_to.iter().position(|(peer, _)| peer == peer_cse_id) else {
                continue;
            };
            let (_, remote_ri) = resource.announced_to[pos].clone();
            if let Err(err) = self.sender.announce_delete(peer_cse_id, &remote_ri).await {
                warn!(peer_cse_id, ri = %resource.ri, error = %err, "announcement delete failed");
            }
            resource.announced_to.remove(pos);
            self.store.update_resource(resource).await.map_err(Into::into)?;
        }
        Ok(())
    }

    /// On local UPDATE: reconcile `at` additions/removals, then propagate the
    /// changed attributes to whatever shadows remain announced.
    async fn propagate_update(&self, ri: &str, changed_attrs: &[String]) -> Result<(), Error> {
        let Some(mut resource) = self.store.get_resource(ri).await.map_err(Into::into)? else {
            return Ok(());
        };

        if changed_attrs.iter().any(|a| a == "at") {
            let wanted: Vec<String> = resource.at.clone().unwrap_or_default();
            let announced_peers: Vec<String> =
                resource.announced_to.iter().map(|(p, _)| p.clone()).collect();

            for peer in &wanted {
                if !announced_peers.contains(peer) {
                    match self.sender.announce_create(peer, &resource).await {
                        Ok(remote_ri) => resource.announced_to.push((peer.clone(), remote_ri)),
                        Err(err) => warn!(peer_cse_id = %peer, ri, error = %err, "announcement create failed"),
                    }
                }
            }
            for peer in &announced_peers {
                if !wanted.contains(peer) {
                    if let Some(pos) = resource.announced_to.iter().position(|(p, _)| p == peer) {
                        let (_, remote_ri) = resource.announced_to[pos].clone();
                        if let Err(err) = self.sender.announce_delete(peer, &remote_ri).await {
                            warn!(peer_cse_id = %peer, ri, error = %err, "announcement delete failed");
                        }
                        resource.announced_to.remove(pos);
                    }
                }
            }
        }

        if !resource.announced_to.is_empty() {
            let mut patch = Map::new();
            for attr in changed_attrs {
                if attr == "at" {
                    continue;
                }
                if let Some(v) = resource.attrs.get(attr) {
                    patch.insert(attr.clone(), v.clone());
                }
            }
            if !patch.is_empty() {
                for (peer, remote_ri) in resource.announced_to.clone() {
                    if let Err(err) = self.sender.announce_update(&peer, &remote_ri, &patch).await {
                        warn!(peer_cse_id = %peer, ri, error = %err, "announcement update failed");
                    }
                }
            }
        }

        self.store.update_resource(resource).await.map_err(Into::into)
    }
}
