//! Event Bus: a named map of handler lists with foreground/background firing.
//!
//! Grounded in `original_source/acme/helpers/EventManager.py`: `addEvent`
//! registers a name and whether it fires in the background; `addHandler`/
//! `removeHandler` manage the handler list; `fire` dispatches. A background
//! event spawns each handler on its own task (mirroring the source's thread
//! pool dispatch); a foreground event runs handlers sequentially in the
//! caller. One handler's failure never prevents its siblings from running.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use onem2m_common::{Error, ResourceType};
use parking_lot::RwLock;
use tracing::{error, trace};

/// The resource-lifecycle and notification-manager events the Dispatcher
/// emits.
#[derive(Debug, Clone)]
pub enum CseEvent {
    CreateLocalResource { ri: String },
    UpdateLocalResource { ri: String, changed_attrs: Vec<String> },
    DeleteLocalResource { ri: String },
    CreateDirectChild { parent_ri: String, child_ri: String, child_ty: ResourceType },
    DeleteDirectChild { parent_ri: String, child_ri: String, child_ty: ResourceType },
    BlockingUpdate { ri: String },
    BlockingRetrieve { ri: String },
    ReportOnGeneratedMissingDataPoints {
        ts_ri: String,
        missed: Vec<DateTime<Utc>>,
    },
    /// A `<CSR>` for a peer CSE was created (remote-CSE registration).
    RegisterRemoteCse { csr_ri: String, peer_cse_id: String },
    /// A `<CSR>` for a peer CSE was deleted (remote-CSE deregistration).
    DeregisterRemoteCse { peer_cse_id: String },
}

impl CseEvent {
    /// The event-bus name this variant fires under.
    pub fn name(&self) -> &'static str {
        match self {
            CseEvent::CreateLocalResource { .. } => "createLocalResource",
            CseEvent::UpdateLocalResource { .. } => "updateLocalResource",
            CseEvent::DeleteLocalResource { .. } => "deleteLocalResource",
            CseEvent::CreateDirectChild { .. } => "createDirectChild",
            CseEvent::DeleteDirectChild { .. } => "deleteDirectChild",
            CseEvent::BlockingUpdate { .. } => "blockingUpdate",
            CseEvent::BlockingRetrieve { .. } => "blockingRetrieve",
            CseEvent::ReportOnGeneratedMissingDataPoints { .. } => {
                "reportOnGeneratedMissingDataPoints"
            }
            CseEvent::RegisterRemoteCse { .. } => "registerRemoteCse",
            CseEvent::DeregisterRemoteCse { .. } => "deregisterRemoteCse",
        }
    }
}

/// A registered handler: async, fallible, logged rather than propagated.
pub type HandlerFn = Arc<dyn Fn(Arc<CseEvent>) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

/// Opaque handle returned by `add_handler`, used to `remove_handler` later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct EventDef {
    background: bool,
    handlers: Vec<(HandlerId, HandlerFn)>,
}

/// In-process event bus. Events are not persisted; a restart loses all
/// registrations (callers re-register on startup).
pub struct EventBus {
    events: RwLock<HashMap<String, EventDef>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("events", &self.events.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            events: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Declare a named event and whether it fires handlers in the background.
    /// Re-declaring an existing name updates its background flag without
    /// touching the registered handlers.
    pub fn add_event(&self, name: &str, background: bool) {
        let mut events = self.events.write();
        events
            .entry(name.to_string())
            .and_modify(|def| def.background = background)
            .or_insert_with(|| EventDef {
                background,
                handlers: Vec::new(),
            });
    }

    /// Register a handler for a named event, auto-declaring it foreground if
    /// it doesn't exist yet.
    pub fn add_handler(&self, name: &str, handler: HandlerFn) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut events = self.events.write();
        events
            .entry(name.to_string())
            .or_insert_with(|| EventDef {
                background: false,
                handlers: Vec::new(),
            })
            .handlers
            .push((id, handler));
        id
    }

    /// Unregister a previously registered handler.
    pub fn remove_handler(&self, name: &str, id: HandlerId) {
        if let Some(def) = self.events.write().get_mut(name) {
            def.handlers.retain(|(h, _)| *h != id);
        }
    }

    /// Fire an event: background events dispatch each handler on its own
    /// task; foreground events run handlers sequentially in the caller.
    pub async fn fire(&self, event: CseEvent) {
        let name = event.name();
        let (background, handlers) = {
            let events = self.events.read();
            match events.get(name) {
                Some(def) => (def.background, def.handlers.clone()),
                None => {
                    trace!(name, "fired event with no registered handlers");
                    return;
                }
            }
        };
        let event = Arc::new(event);

        if background {
            for (_, handler) in handlers {
                let event = event.clone();
                tokio::spawn(async move {
                    if let Err(err) = handler(event).await {
                        error!(error = %err, "background event handler failed");
                    }
                });
            }
        } else {
            for (_, handler) in handlers {
                if let Err(err) = handler(event.clone()).await {
                    error!(error = %err, "foreground event handler failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn foreground_handlers_run_sequentially_and_independently() {
        let bus = EventBus::new();
        bus.add_event("createLocalResource", false);
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_a = calls.clone();
        bus.add_handler(
            "createLocalResource",
            Arc::new(move |_event| {
                let calls_a = calls_a.clone();
                Box::pin(async move {
                    calls_a.fetch_add(1, Ordering::Relaxed);
                    Err(Error::Internal("boom".into()))
                })
            }),
        );

        let calls_b = calls.clone();
        bus.add_handler(
            "createLocalResource",
            Arc::new(move |_event| {
                let calls_b = calls_b.clone();
                Box::pin(async move {
                    calls_b.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                })
            }),
        );

        bus.fire(CseEvent::CreateLocalResource { ri: "ri-1".into() })
            .await;

        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn event_names_match_spec_vocabulary() {
        assert_eq!(
            CseEvent::DeleteDirectChild {
                parent_ri: "a".into(),
                child_ri: "b".into(),
                child_ty: ResourceType::ContentInstance,
            }
            .name(),
            "deleteDirectChild"
        );
    }
}
