//! Logging stand-ins for the outbound transport seams (`NotificationSender`,
//! `AnnouncementSender`). Concrete HTTP/MQTT/WS/CoAP bindings are explicitly
//! out of scope; this is the boundary a real binding replaces.

use async_trait::async_trait;
use onem2m_common::{AggregatedNotification, Error, NotificationPayload, Resource};
use onem2m_core::{AnnouncementSender, NotificationSender};
use serde_json::Map;
use tracing::info;
use uuid::Uuid;

/// Logs every outbound notification instead of sending it over the wire.
#[derive(Debug, Default)]
pub struct LoggingNotificationSender;

#[async_trait]
impl NotificationSender for LoggingNotificationSender {
    async fn send(&self, target: &str, payload: &NotificationPayload) -> Result<(), Error> {
        info!(target, ?payload, "notification delivery (transport stub)");
        Ok(())
    }

    async fn send_batch(&self, target: &str, batch: &AggregatedNotification) -> Result<(), Error> {
        info!(
            target,
            count = batch.notifications.len(),
            "batch notification delivery (transport stub)"
        );
        Ok(())
    }
}

/// Logs every outbound announcement instead of calling a peer CSE.
#[derive(Debug, Default)]
pub struct LoggingAnnouncementSender;

#[async_trait]
impl AnnouncementSender for LoggingAnnouncementSender {
    async fn announce_create(&self, peer_cse_id: &str, resource: &Resource) -> Result<String, Error> {
        let remote_ri = format!("{peer_cse_id}/{}", Uuid::new_v4());
        info!(peer_cse_id, ri = resource.ri, remote_ri, "announce create (transport stub)");
        Ok(remote_ri)
    }

    async fn announce_update(
        &self,
        peer_cse_id: &str,
        remote_ri: &str,
        patch: &Map<String, serde_json::Value>,
    ) -> Result<(), Error> {
        info!(peer_cse_id, remote_ri, ?patch, "announce update (transport stub)");
        Ok(())
    }

    async fn announce_delete(&self, peer_cse_id: &str, remote_ri: &str) -> Result<(), Error> {
        info!(peer_cse_id, remote_ri, "announce delete (transport stub)");
        Ok(())
    }
}
