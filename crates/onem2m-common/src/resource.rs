//! The resource type tag and the common resource envelope.
//!
//! Per the "dynamic typing of resources" design note, `ty` is a closed Rust
//! enum rather than a bare integer; the free-form part of a resource (the
//! attributes an attribute policy governs) stays a JSON object, the way
//! `cdk_common`'s `NotificationPayload`/`ProofInfo` keep a typed envelope
//! around loosely-typed domain data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// The `ty` discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    /// CSEBase, the root of the resource tree
    CseBase,
    /// Application Entity
    Ae,
    /// Container
    Container,
    /// Content Instance (child of a Container)
    ContentInstance,
    /// Subscription
    Subscription,
    /// Access Control Policy
    Acp,
    /// Group
    Group,
    /// Time Series
    TimeSeries,
    /// Time Series Instance (child of a TimeSeries)
    TimeSeriesInstance,
    /// Cross Resource Subscription
    CrossResourceSubscription,
    /// Request (tracks an asynchronous/non-blocking operation)
    Request,
    /// Polling Channel
    PollingChannel,
    /// Remote CSE registration record
    Csr,
    /// Announced AE shadow on a remote CSE
    AeAnnc,
    /// Announced Container shadow on a remote CSE
    ContainerAnnc,
    /// Announced ACP shadow on a remote CSE
    AcpAnnc,
    /// Virtual: most recent child of a Container/TimeSeries
    Latest,
    /// Virtual: oldest child of a Container/TimeSeries
    Oldest,
}

impl ResourceType {
    /// Virtual resources are computed on read and never stored (Invariant 4).
    pub fn is_virtual(self) -> bool {
        matches!(self, ResourceType::Latest | ResourceType::Oldest)
    }

    /// Announced shadow types, used by the Announcement Manager and by the
    /// access-control short-circuit for announcement originators.
    pub fn is_announced(self) -> bool {
        matches!(
            self,
            ResourceType::AeAnnc | ResourceType::ContainerAnnc | ResourceType::AcpAnnc
        )
    }

    /// Whether instances of this type may carry an `acpi` attribute at all.
    pub fn may_have_acpi(self) -> bool {
        !matches!(
            self,
            ResourceType::ContentInstance
                | ResourceType::TimeSeriesInstance
                | ResourceType::Latest
                | ResourceType::Oldest
        )
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A resource in the tree: the common envelope plus a free-form attribute map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    /// Primary identifier, globally unique
    pub ri: String,
    /// Parent identifier; `None` only for the CSEBase
    pub pi: Option<String>,
    /// Resource name, unique among siblings
    pub rn: String,
    /// Type discriminant
    pub ty: ResourceType,
    /// Structured resource name, the slash-joined path from the root
    pub srn: String,
    /// Creation time
    pub ct: DateTime<Utc>,
    /// Last modification time
    pub lt: DateTime<Utc>,
    /// Expiration time, if any
    pub et: Option<DateTime<Utc>>,
    /// Access-control-policy IDs governing this resource
    pub acpi: Option<Vec<String>>,
    /// Custodian originator, if set
    pub cstn: Option<String>,
    /// Announcement target CSE-IDs
    pub at: Option<Vec<String>>,
    /// Reverse announcement bookkeeping: `(peer CSE-ID, remote ri)` pairs
    pub announced_to: Vec<(String, String)>,
    /// Type-specific attributes, governed by the type's attribute policy
    pub attrs: Map<String, Value>,
}

impl Resource {
    /// The originator recorded at creation time (`cr`), used by the
    /// creator-fallback branch of the access-control engine.
    pub fn creator(&self) -> Option<&str> {
        self.attrs.get("cr").and_then(Value::as_str)
    }

    /// Whether this resource type allows inheriting its parent's ACP when it
    /// has none of its own (`inheritACP`).
    pub fn inherit_acp(&self) -> bool {
        self.attrs
            .get("inheritACP")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Apply an update patch: attributes set to `Value::Null` are removed
    /// (never stored as null), others are inserted/overwritten. Returns the
    /// set of attribute names that changed, for `atr` filter matching.
    pub fn apply_update(&mut self, patch: Map<String, Value>) -> Vec<String> {
        let mut changed = Vec::with_capacity(patch.len());
        for (key, value) in patch {
            if value.is_null() {
                self.attrs.remove(&key);
            } else {
                self.attrs.insert(key.clone(), value);
            }
            changed.push(key);
        }
        self.lt = Utc::now();
        self.sync_typed_fields_from_attrs();
        changed
    }

    /// Re-derive the typed `acpi`/`et`/`cstn`/`at` fields from their
    /// corresponding attributes, the way `SubscriptionRecord::from_resource`
    /// re-derives a `<sub>`'s flattened view from its attrs. The attrs map
    /// remains the single source of truth; these fields are a parsed cache
    /// of it kept for the Access-Control Engine and Announcement Manager,
    /// which need them without re-parsing JSON on every check.
    pub fn sync_typed_fields_from_attrs(&mut self) {
        self.acpi = self.attrs.get("acpi").and_then(Value::as_array).map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        });
        self.et = self
            .attrs
            .get("et")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));
        self.cstn = self
            .attrs
            .get("cstn")
            .and_then(Value::as_str)
            .map(str::to_string);
        self.at = self.attrs.get("at").and_then(Value::as_array).map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        });
    }

    /// `srn` path depth, used by discovery's `level` filter.
    pub fn level(&self) -> usize {
        self.srn.matches('/').count()
    }

    /// A `<crs>`'s window configuration: `(twt, tws, constituent count)`,
    /// read from its `twt`/`tws`/`rrat` attributes. `None` for any other
    /// type, or when the window is misconfigured.
    pub fn crs_window(&self) -> Option<(TimeWindowType, std::time::Duration, usize)> {
        if self.ty != ResourceType::CrossResourceSubscription {
            return None;
        }
        let twt = match self.attrs.get("twt").and_then(Value::as_str)? {
            "PERIODIC" => TimeWindowType::Periodic,
            "SLIDING" => TimeWindowType::Sliding,
            _ => return None,
        };
        let tws_secs = self.attrs.get("tws").and_then(Value::as_u64)?;
        let count = self
            .attrs
            .get("rrat")
            .and_then(Value::as_array)
            .map(|arr| arr.len())
            .unwrap_or(0);
        Some((twt, std::time::Duration::from_secs(tws_secs), count))
    }
}

/// Flattened hot-path view of a `<sub>` resource kept in the Subscription table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    /// Primary ID of the `<sub>` resource
    pub ri: String,
    /// Parent (subscribed-to) resource ID
    pub pi: String,
    /// Notification event types of interest
    pub net: Vec<NotificationEventType>,
    /// Child-type filter for child creation/deletion events
    pub chty: Vec<ResourceType>,
    /// Notification target URI(s)
    pub nu: Vec<String>,
    /// Notification content type
    pub nct: NotificationContentType,
    /// Attributes to filter update notifications by
    pub atr: Vec<String>,
    /// Batch notification parameters
    pub bn: Option<BatchNotify>,
    /// Subscriber URI for deletion notification
    pub su: Option<String>,
    /// Expiration counter; subscription is deleted when this reaches zero
    pub exc: Option<u64>,
    /// Associated cross-resource-subscription notification target URIs
    pub acrs: Vec<String>,
    /// Blocking mode, if any
    pub blocking: Option<BlockingMode>,
}

/// Blocking-notification variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockingMode {
    /// Hold an UPDATE until the notification completes
    BlockingUpdate,
    /// Hold a RETRIEVE until the notification completes (subject to `maxAge`)
    BlockingRetrieve,
}

/// Batch notification parameters (`bn`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchNotify {
    /// Number of notifications to accumulate before flushing
    pub num: u32,
    /// Guard duration, in seconds, after which a partial batch flushes anyway
    pub dur_secs: u64,
    /// Keep only the latest notification instead of aggregating
    pub latest_only: bool,
}

/// `net`: the kinds of resource events a subscription cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationEventType {
    /// The subscribed-to resource itself was updated
    UpdateResource,
    /// A direct child was created
    CreateDirectChild,
    /// A direct child was deleted
    DeleteDirectChild,
    /// The subscribed-to resource was deleted
    DeleteResource,
    /// Retrieval of the latest/oldest instance
    RetrieveCnt,
    /// Missing time-series data points were detected
    ReportOnGeneratedMissingDataPoints,
    /// The subscribed-to resource's `acpi` changed
    SecurityAcpUpdate,
}

/// `nct`: how the notification payload is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationContentType {
    /// Full resource representation
    All,
    /// Just `ri`
    Ri,
    /// Only the modified attributes
    ModifiedAttributes,
    /// Missing-data report
    TimeSeriesNotification,
}

/// `twt`: cross-resource subscription time-window type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeWindowType {
    /// Fixed-period window, re-armed on every tick
    Periodic,
    /// Window restarts on first arrival, closes `tws` after the last arrival
    Sliding,
}

impl NotificationEventType {
    /// Parse the wire tag used in a `<sub>`'s `net` attribute. Matches the
    /// variant's own name (`"UpdateResource"`, `"CreateDirectChild"`, …) —
    /// the same vocabulary `ResourceType`'s `Display` uses for `chty`, since
    /// both are carried as tagged strings rather than bare oneM2M integers
    /// per the "dynamic typing of resources" design note.
    pub fn from_tag(tag: &str) -> Option<Self> {
        use NotificationEventType::*;
        Some(match tag {
            "UpdateResource" => UpdateResource,
            "CreateDirectChild" => CreateDirectChild,
            "DeleteDirectChild" => DeleteDirectChild,
            "DeleteResource" => DeleteResource,
            "RetrieveCnt" => RetrieveCnt,
            "ReportOnGeneratedMissingDataPoints" => ReportOnGeneratedMissingDataPoints,
            "SecurityAcpUpdate" => SecurityAcpUpdate,
            _ => return None,
        })
    }
}

impl NotificationContentType {
    /// Parse the wire tag used in a `<sub>`'s `nct` attribute.
    pub fn from_tag(tag: &str) -> Option<Self> {
        use NotificationContentType::*;
        Some(match tag {
            "all" => All,
            "ri" => Ri,
            "modifiedAttributes" => ModifiedAttributes,
            "timeSeriesNotification" => TimeSeriesNotification,
            _ => return None,
        })
    }
}

impl ResourceType {
    /// Parse the wire tag used in a `<sub>`'s `chty` attribute: the same
    /// name `Display`/`Debug` produce for this type.
    pub fn from_tag(tag: &str) -> Option<Self> {
        use ResourceType::*;
        Some(match tag {
            "CseBase" => CseBase,
            "Ae" => Ae,
            "Container" => Container,
            "ContentInstance" => ContentInstance,
            "Subscription" => Subscription,
            "Acp" => Acp,
            "Group" => Group,
            "TimeSeries" => TimeSeries,
            "TimeSeriesInstance" => TimeSeriesInstance,
            "CrossResourceSubscription" => CrossResourceSubscription,
            "Request" => Request,
            "PollingChannel" => PollingChannel,
            "Csr" => Csr,
            "AeAnnc" => AeAnnc,
            "ContainerAnnc" => ContainerAnnc,
            "AcpAnnc" => AcpAnnc,
            "Latest" => Latest,
            "Oldest" => Oldest,
            _ => return None,
        })
    }
}

impl BatchNotify {
    /// Parse a `<sub>`'s `bn` attribute object (`{num, dur, ln}`).
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        Some(BatchNotify {
            num: obj.get("num")?.as_u64()? as u32,
            dur_secs: obj.get("dur").and_then(Value::as_u64).unwrap_or(0),
            latest_only: obj.get("ln").and_then(Value::as_bool).unwrap_or(false),
        })
    }
}

impl SubscriptionRecord {
    /// Build the flattened hot-path view of a `<sub>` resource from its
    /// attribute map. Unrecognised `net`/`chty`
    /// entries are dropped rather than failing the whole subscription, since
    /// an unknown filter tag should narrow matches, not break them.
    pub fn from_resource(resource: &Resource) -> Option<Self> {
        let attrs = &resource.attrs;
        let net = attrs
            .get("net")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_str)
                    .filter_map(NotificationEventType::from_tag)
                    .collect()
            })
            .unwrap_or_else(|| vec![NotificationEventType::CreateDirectChild]);
        let chty = attrs
            .get("chty")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_str)
                    .filter_map(ResourceType::from_tag)
                    .collect()
            })
            .unwrap_or_default();
        let nu = attrs
            .get("nu")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        let nct = attrs
            .get("nct")
            .and_then(Value::as_str)
            .and_then(NotificationContentType::from_tag)
            .unwrap_or(NotificationContentType::All);
        let atr = attrs
            .get("atr")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        let bn = attrs.get("bn").and_then(BatchNotify::from_value);
        let acrs = attrs
            .get("acrs")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        let blocking = match attrs.get("blocking").and_then(Value::as_str) {
            Some("update") => Some(BlockingMode::BlockingUpdate),
            Some("retrieve") => Some(BlockingMode::BlockingRetrieve),
            _ => None,
        };

        Some(SubscriptionRecord {
            ri: resource.ri.clone(),
            pi: resource.pi.clone()?,
            net,
            chty,
            nu,
            nct,
            atr,
            bn,
            su: attrs.get("su").and_then(|v| v.as_str()).map(str::to_string),
            exc: attrs.get("exc").and_then(Value::as_u64),
            acrs,
            blocking,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Resource {
        Resource {
            ri: "ri-1".into(),
            pi: Some("ri-0".into()),
            rn: "cnt1".into(),
            ty: ResourceType::Container,
            srn: "cse-in/cnt1".into(),
            ct: Utc::now(),
            lt: Utc::now(),
            et: None,
            acpi: None,
            cstn: None,
            at: None,
            announced_to: vec![],
            attrs: Map::new(),
        }
    }

    #[test]
    fn update_removes_null_attributes() {
        let mut r = sample();
        r.attrs.insert("lbl".into(), json!(["a", "b"]));
        let changed = r.apply_update(Map::from_iter([("lbl".to_string(), Value::Null)]));
        assert_eq!(changed, vec!["lbl".to_string()]);
        assert!(!r.attrs.contains_key("lbl"));
    }

    #[test]
    fn update_overwrites_non_null_attributes() {
        let mut r = sample();
        r.apply_update(Map::from_iter([("mni".to_string(), json!(5))]));
        assert_eq!(r.attrs.get("mni"), Some(&json!(5)));
    }

    #[test]
    fn sync_typed_fields_parses_acpi_et_cstn_at_from_attrs() {
        let mut r = sample();
        r.attrs.insert("acpi".into(), json!(["acp1", "acp2"]));
        r.attrs.insert("et".into(), json!("2030-01-01T00:00:00Z"));
        r.attrs.insert("cstn".into(), json!("CAdmin"));
        r.attrs.insert("at".into(), json!(["cse-remote"]));
        r.sync_typed_fields_from_attrs();

        assert_eq!(r.acpi, Some(vec!["acp1".to_string(), "acp2".to_string()]));
        assert_eq!(r.cstn, Some("CAdmin".to_string()));
        assert_eq!(r.at, Some(vec!["cse-remote".to_string()]));
        assert_eq!(
            r.et,
            Some("2030-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap())
        );
    }

    #[test]
    fn apply_update_re_derives_acpi_after_patching_attrs() {
        let mut r = sample();
        assert_eq!(r.acpi, None);
        r.apply_update(Map::from_iter([(
            "acpi".to_string(),
            json!(["acp1"]),
        )]));
        assert_eq!(r.acpi, Some(vec!["acp1".to_string()]));
    }

    #[test]
    fn virtual_types_are_flagged() {
        assert!(ResourceType::Latest.is_virtual());
        assert!(!ResourceType::Container.is_virtual());
    }

    fn sub_resource() -> Resource {
        let mut r = sample();
        r.ty = ResourceType::Subscription;
        r.attrs.insert("net".into(), json!(["CreateDirectChild", "DeleteResource"]));
        r.attrs.insert("chty".into(), json!(["ContentInstance"]));
        r.attrs.insert("nu".into(), json!(["http://example.com/notify"]));
        r.attrs.insert("nct".into(), json!("all"));
        r.attrs.insert("atr".into(), json!(["con"]));
        r.attrs.insert("bn".into(), json!({"num": 3, "dur": 30, "ln": false}));
        r.attrs.insert("su".into(), json!("http://example.com/notify"));
        r.attrs.insert("exc".into(), json!(5));
        r
    }

    #[test]
    fn subscription_record_parses_filter_attributes() {
        let sub = SubscriptionRecord::from_resource(&sub_resource()).unwrap();
        assert_eq!(
            sub.net,
            vec![NotificationEventType::CreateDirectChild, NotificationEventType::DeleteResource]
        );
        assert_eq!(sub.chty, vec![ResourceType::ContentInstance]);
        assert_eq!(sub.nct, NotificationContentType::All);
        assert_eq!(sub.atr, vec!["con".to_string()]);
        assert_eq!(sub.bn.as_ref().map(|b| b.num), Some(3));
        assert_eq!(sub.exc, Some(5));
    }

    #[test]
    fn subscription_record_defaults_net_to_create_direct_child() {
        let r = sample_with_type(ResourceType::Subscription);
        let sub = SubscriptionRecord::from_resource(&r).unwrap();
        assert_eq!(sub.net, vec![NotificationEventType::CreateDirectChild]);
    }

    fn sample_with_type(ty: ResourceType) -> Resource {
        let mut r = sample();
        r.ty = ty;
        r
    }
}
