//! `CseContext`: the single `Arc`-held object wiring Store, Access-Control
//! Engine, Event Bus, Worker Pool, Notification Manager, Dispatcher and
//! Announcement Manager together.
//!
//! Deliberately one explicit, constructible handle threaded through every
//! transport binding and test, rather than module-level global state — the
//! way `cdk::mint::Mint` is the single `Arc`-held object a binary wires up
//! once at startup.

use std::sync::Arc;
use std::time::Duration;

use onem2m_common::CseConfig;
use tracing::info;

use crate::announcement::{AnnouncementManager, AnnouncementSender};
use crate::dispatcher::Dispatcher;
use crate::events::EventBus;
use crate::notification::{NotificationManager, NotificationSender};
use crate::store::Store;
use crate::worker::WorkerPool;

pub struct CseContext<S: Store + 'static> {
    pub store: Arc<S>,
    pub config: CseConfig,
    pub events: Arc<EventBus>,
    pub workers: Arc<WorkerPool>,
    pub notifications: Arc<NotificationManager<S>>,
    pub announcements: Arc<AnnouncementManager<S>>,
    pub dispatcher: Arc<Dispatcher<S>>,
}

impl<S: Store + 'static> std::fmt::Debug for CseContext<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CseContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S: Store + 'static> CseContext<S> {
    /// Build the full set of collaborators and wire the Event Bus
    /// subscriptions that make the Notification and Announcement Managers
    /// react to Dispatcher-emitted events.
    pub fn new(
        store: Arc<S>,
        config: CseConfig,
        notification_sender: Arc<dyn NotificationSender>,
        announcement_sender: Arc<dyn AnnouncementSender>,
    ) -> Arc<Self> {
        let events = Arc::new(EventBus::new());
        let workers = Arc::new(WorkerPool::new());

        let notifications = NotificationManager::new(
            store.clone(),
            config.clone(),
            notification_sender,
            workers.clone(),
            events.clone(),
        );
        notifications.register(&events);

        let announcements = AnnouncementManager::new(store.clone(), announcement_sender);
        announcements.register(&events);

        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            config.clone(),
            events.clone(),
            notifications.clone(),
        ));

        Arc::new(Self {
            store,
            config,
            events,
            workers,
            notifications,
            announcements,
            dispatcher,
        })
    }

    /// Start the periodic expiration sweep. Call once at startup.
    pub fn start_expiration_sweep(self: &Arc<Self>) {
        let interval = Duration::from_secs(self.config.worker.expiration_sweep_interval_secs);
        let dispatcher = self.dispatcher.clone();
        self.workers.new_worker(
            "expiration-sweep",
            interval,
            true,
            serde_json::Value::Null,
            Arc::new(move |_data| {
                let dispatcher = dispatcher.clone();
                Box::pin(async move {
                    let count = dispatcher.expire_due_resources().await?;
                    if count > 0 {
                        info!(count, "expiration sweep removed resources");
                    }
                    Ok(())
                })
            }),
        );
    }
}
