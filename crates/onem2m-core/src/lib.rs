//! The CSE engine: resource tree, access control, subscriptions and
//! notifications, background workers and peer-CSE announcement. The Store
//! backends and the transport bindings live in their own crates.

pub mod access_control;
pub mod announcement;
pub mod context;
pub mod dispatcher;
pub mod events;
pub mod notification;
pub mod resource_model;
pub mod store;
pub mod worker;

pub use access_control::AccessControlEngine;
pub use announcement::{AnnouncementManager, AnnouncementSender};
pub use context::CseContext;
pub use dispatcher::{Dispatcher, RequestContext};
pub use events::{CseEvent, EventBus, HandlerId};
pub use notification::{NotificationManager, NotificationSender};
pub use resource_model::{handler_for, ResourceHandler};
pub use store::Store;
pub use worker::{WorkerHandle, WorkerPool};
