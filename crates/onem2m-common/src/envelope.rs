//! Request/response envelope, mirroring the oneM2M primitive parameters a
//! transport binding decodes off the wire before handing them to the
//! Dispatcher. The envelope is transport-agnostic: nothing here assumes
//! HTTP, CoAP, MQTT or WebSocket framing.

use crate::error::ResponseStatusCode;
use crate::resource::{NotificationContentType, NotificationEventType, ResourceType};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// `op`: the requested operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Create,
    Retrieve,
    Update,
    Delete,
    Notify,
}

/// Result-content filter criterion (`rcn`), controlling what a CREATE/UPDATE/
/// DELETE response body carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultContent {
    /// Nothing
    Nothing,
    /// The addressed (created/updated/deleted) resource
    Attributes,
    /// Just the `ri` of matched resources (discovery)
    HierarchicalAddress,
    /// Attributes and child resources
    AttributesAndChildResources,
    /// Child resource references only
    ChildResourceReferences,
}

/// Discovery/retrieve filter criteria (`fc`), applied by the Dispatcher when
/// a RETRIEVE addresses a non-leaf or uses `fu`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterCriteria {
    /// Restrict to these resource types
    pub ty: Vec<ResourceType>,
    /// Created on/after
    pub created_after: Option<chrono::DateTime<chrono::Utc>>,
    /// Created on/before
    pub created_before: Option<chrono::DateTime<chrono::Utc>>,
    /// Labels that must all be present
    pub labels: Vec<String>,
    /// Restrict to resources at this `srn` depth relative to the query root
    pub level: Option<usize>,
    /// Maximum number of matches to return
    pub limit: Option<u32>,
    /// Number of leading matches to skip before `limit` is applied
    pub offset: Option<u32>,
    /// Free-text match against `rn`
    pub resource_name: Option<String>,
}

/// A decoded oneM2M request primitive, independent of the transport that
/// carried it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Operation
    pub op: Operation,
    /// Target resource address (already resolved from `srn` or `ri` form)
    pub to: String,
    /// Originator
    pub fr: String,
    /// Request identifier, echoed back in the response
    pub rqi: String,
    /// Release version indicator
    pub rvi: String,
    /// Resource type of the content, required for CREATE
    pub ty: Option<ResourceType>,
    /// Primitive content (the resource representation / update patch)
    pub pc: Option<Map<String, Value>>,
    /// Result content selector
    pub rcn: Option<ResultContent>,
    /// Filter criteria for RETRIEVE/DELETE-as-discovery
    pub fc: Option<FilterCriteria>,
    /// Requested notification content type override (RETRIEVE of `<sub>`less ops)
    pub nct: Option<NotificationContentType>,
    /// Non-blocking request indicator; `None` means synchronous/blocking
    pub rt: Option<ResponseType>,
}

/// `rt`: whether/how the response is delivered asynchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseType {
    /// Caller polls a `<request>` resource for the result
    NonBlockingRequestSynch,
    /// Result is delivered to a notification target
    NonBlockingRequestAsynch,
}

/// A response primitive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Response status code
    pub rsc: ResponseStatusCode,
    /// Echoed request identifier
    pub rqi: String,
    /// Response content, shaped by the request's `rcn`
    pub pc: Option<Map<String, Value>>,
}

impl Response {
    /// Build a bare success response with no content (`rcn=Nothing`).
    pub fn ok(rsc: ResponseStatusCode, rqi: impl Into<String>) -> Self {
        Response {
            rsc,
            rqi: rqi.into(),
            pc: None,
        }
    }
}

/// `m2m:sgn`: a single notification, as delivered to a `nu`/`su` target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPayload {
    /// Subscription URI (SP-relative form) that produced this notification
    pub sur: String,
    /// Notification event: the event type and, per `nct`, the representation
    pub nev: NotificationEvent,
    /// Set on the initial verification handshake
    pub vrq: Option<bool>,
    /// Set when this notification announces the subscription's own deletion
    pub sud: Option<bool>,
    /// Creator of the triggering request, when known
    pub cr: Option<String>,
}

/// `nev`: event type plus representation (`rep`), shaped by `nct`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub net: NotificationEventType,
    pub rep: Option<Map<String, Value>>,
}

/// `m2m:agn`: an ordered batch of notifications aggregated under `bn`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedNotification {
    pub notifications: Vec<NotificationPayload>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_response_has_no_content() {
        let resp = Response::ok(ResponseStatusCode::Created, "rqi-1");
        assert!(resp.pc.is_none());
        assert_eq!(resp.rqi, "rqi-1");
    }

    #[test]
    fn verification_notification_sets_vrq() {
        let payload = NotificationPayload {
            sur: "/cse-in/cnt1/sub1".into(),
            nev: NotificationEvent {
                net: NotificationEventType::CreateDirectChild,
                rep: None,
            },
            vrq: Some(true),
            sud: None,
            cr: None,
        };
        assert_eq!(payload.vrq, Some(true));
    }
}
