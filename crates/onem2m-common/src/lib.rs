//! Shared types for the oneM2M CSE workspace: the resource envelope, the
//! request/response primitive shapes, the error/response-status taxonomy,
//! the `acop` permission bitmask, and configuration.

pub mod config;
pub mod envelope;
pub mod error;
pub mod permission;
pub mod resource;

pub use config::{CseConfig, StorageBackend};
pub use envelope::{
    AggregatedNotification, FilterCriteria, NotificationEvent, NotificationPayload, Operation,
    Request, Response, ResponseType, ResultContent,
};
pub use error::{Error, ErrorResponse, ResponseStatusCode};
pub use permission::Permission;
pub use resource::{
    BatchNotify, BlockingMode, NotificationContentType, NotificationEventType, Resource,
    ResourceType, SubscriptionRecord, TimeWindowType,
};

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;
