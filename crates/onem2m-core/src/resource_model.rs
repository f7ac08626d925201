//! Per-type resource behaviour hooks and the allowed-child-type table.
//!
//! Hooks are synchronous and operate on already-fetched data, pure with
//! respect to the Store except for reading siblings — the Dispatcher is
//! responsible for fetching siblings before calling `child_added` and for
//! carrying out whatever Store mutations a hook's return value implies
//! (eviction, counter updates). This keeps `ResourceHandler` object-safe and
//! independent of the `Store` backend, the way `cdk`'s per-nut validation
//! functions take already-loaded state rather than a database handle.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use onem2m_common::{Error, Resource, ResourceType};
use serde_json::{json, Map, Value};

/// Declarative attribute policy consulted by `validate`/`update`: which
/// attributes a type requires at CREATE, and which no UPDATE payload may
/// touch, beyond the universal read-only attributes every type shares.
pub struct AttributePolicy {
    pub required: &'static [&'static str],
    pub immutable: &'static [&'static str],
}

/// Attributes no type's UPDATE payload may set, on top of its own policy's
/// `immutable` list: these are owned by the Dispatcher/Store, not the client.
const UNIVERSAL_IMMUTABLE: &[&str] = &["ri", "ty", "pi", "ct", "srn"];

static POLICIES: Lazy<HashMap<ResourceType, AttributePolicy>> = Lazy::new(|| {
    use ResourceType::*;
    let mut m: HashMap<ResourceType, AttributePolicy> = HashMap::new();
    m.insert(Ae, AttributePolicy { required: &[], immutable: &["aei"] });
    m.insert(Container, AttributePolicy { required: &[], immutable: &["cni", "cbs"] });
    m.insert(ContentInstance, AttributePolicy { required: &["con"], immutable: &["cs"] });
    m.insert(Subscription, AttributePolicy { required: &["nu"], immutable: &[] });
    m.insert(Acp, AttributePolicy { required: &["pv", "pvs"], immutable: &[] });
    m.insert(Group, AttributePolicy { required: &["mid"], immutable: &["cnm"] });
    m.insert(TimeSeries, AttributePolicy { required: &[], immutable: &["cni", "cbs"] });
    m.insert(TimeSeriesInstance, AttributePolicy { required: &["con"], immutable: &[] });
    m.insert(Csr, AttributePolicy { required: &["cb"], immutable: &[] });
    m
});

/// Attribute policy for a type, if one is declared; types with no entry fall
/// back to the universal rules only.
pub fn attribute_policy(ty: ResourceType) -> Option<&'static AttributePolicy> {
    POLICIES.get(&ty)
}

/// Per-type behaviour hooks.
pub trait ResourceHandler: Send + Sync {
    /// Child types this resource type may parent; the Dispatcher rejects
    /// CREATE of any other type underneath it.
    fn allowed_children(&self) -> &'static [ResourceType] {
        &[]
    }

    /// Enforce attribute policy. `is_create` distinguishes CREATE validation
    /// (required attributes must be present) from UPDATE validation.
    fn validate(&self, resource: &Resource, is_create: bool) -> Result<(), Error> {
        if is_create {
            if let Some(policy) = attribute_policy(resource.ty) {
                for attr in policy.required {
                    if !resource.attrs.contains_key(*attr) {
                        return Err(Error::ContentsUnacceptable(format!(
                            "{} requires attribute `{attr}`",
                            resource.ty
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Called after CREATE commits; may initialize derived attributes.
    fn activate(&self, _resource: &mut Resource) -> Result<(), Error> {
        Ok(())
    }

    /// Called before DELETE commits; may refuse deletion.
    fn will_be_deactivated(&self, _resource: &Resource) -> Result<(), Error> {
        Ok(())
    }

    /// Called before a child is persisted under this resource.
    fn child_will_be_added(&self, _parent: &Resource, _child: &Resource) -> Result<(), Error> {
        Ok(())
    }

    /// Called after a child is persisted. May mutate the parent's derived
    /// attributes (e.g. `cni`/`cbs`) and returns the `ri`s of any siblings
    /// that must now be evicted to respect `mni`/`mbs`/`mia`.
    fn child_added(&self, _parent: &mut Resource, _child: &Resource, _siblings: &[Resource]) -> Vec<String> {
        Vec::new()
    }

    /// Called after a child is removed (deleted or evicted).
    fn child_removed(&self, _parent: &mut Resource, _child: &Resource) {}

    /// Apply an UPDATE payload, returning the set of changed attribute names.
    fn update(&self, resource: &mut Resource, payload: Map<String, Value>) -> Result<Vec<String>, Error> {
        let immutable = attribute_policy(resource.ty).map(|p| p.immutable).unwrap_or(&[]);
        for attr in payload.keys() {
            if UNIVERSAL_IMMUTABLE.contains(&attr.as_str()) || immutable.contains(&attr.as_str()) {
                return Err(Error::ContentsUnacceptable(format!(
                    "`{attr}` is immutable on {}",
                    resource.ty
                )));
            }
        }
        Ok(resource.apply_update(payload))
    }
}

struct DefaultHandler {
    children: &'static [ResourceType],
}

impl ResourceHandler for DefaultHandler {
    fn allowed_children(&self) -> &'static [ResourceType] {
        self.children
    }
}

/// `<cnt>`/`<ts>` share eviction-by-cap semantics over their instance children.
struct InstanceContainerHandler {
    children: &'static [ResourceType],
    count_attr: &'static str,
    byte_size_attr: &'static str,
}

impl ResourceHandler for InstanceContainerHandler {
    fn allowed_children(&self) -> &'static [ResourceType] {
        self.children
    }

    fn child_added(&self, parent: &mut Resource, child: &Resource, siblings: &[Resource]) -> Vec<String> {
        let mni = parent.attrs.get("mni").and_then(Value::as_u64);
        let mbs = parent.attrs.get("mbs").and_then(Value::as_u64);

        let mut ordered: Vec<&Resource> = siblings.iter().collect();
        ordered.sort_by_key(|r| r.ct);

        let mut evicted = Vec::new();
        let mut remaining: Vec<&Resource> = ordered.clone();

        if let Some(mni) = mni {
            while remaining.len() as u64 > mni {
                let oldest = remaining.remove(0);
                evicted.push(oldest.ri.clone());
            }
        }
        if let Some(mbs) = mbs {
            let mut total: u64 = remaining
                .iter()
                .filter_map(|r| r.attrs.get("cs").and_then(Value::as_u64))
                .sum();
            let mut idx = 0;
            while total > mbs && idx < remaining.len() {
                let victim = remaining[idx];
                if evicted.contains(&victim.ri) {
                    idx += 1;
                    continue;
                }
                total = total.saturating_sub(victim.attrs.get("cs").and_then(Value::as_u64).unwrap_or(0));
                evicted.push(victim.ri.clone());
                idx += 1;
            }
        }

        let remaining_count = ordered.len() as u64 - evicted.len() as u64;
        let remaining_bytes: u64 = ordered
            .iter()
            .filter(|r| !evicted.contains(&r.ri))
            .filter_map(|r| r.attrs.get("cs").and_then(Value::as_u64))
            .sum();

        parent.attrs.insert(self.count_attr.to_string(), json!(remaining_count));
        parent
            .attrs
            .insert(self.byte_size_attr.to_string(), json!(remaining_bytes));

        let _ = child;
        evicted
    }

    fn child_removed(&self, parent: &mut Resource, _child: &Resource) {
        let current = parent.attrs.get(self.count_attr).and_then(Value::as_u64).unwrap_or(0);
        parent
            .attrs
            .insert(self.count_attr.to_string(), json!(current.saturating_sub(1)));
    }
}

/// `<request>` refuses deletion while `FORWARDED` (grounded in `REQ.py`).
struct RequestHandler;

impl ResourceHandler for RequestHandler {
    fn will_be_deactivated(&self, resource: &Resource) -> Result<(), Error> {
        if resource.attrs.get("rs").and_then(Value::as_str) == Some("FORWARDED") {
            return Err(Error::UnableToRecallRequest(resource.ri.clone()));
        }
        Ok(())
    }
}

static HANDLERS: Lazy<HashMap<ResourceType, Box<dyn ResourceHandler>>> = Lazy::new(|| {
    use ResourceType::*;
    let mut m: HashMap<ResourceType, Box<dyn ResourceHandler>> = HashMap::new();

    m.insert(
        CseBase,
        Box::new(DefaultHandler {
            children: &[Ae, Container, Subscription, Acp, Group, TimeSeries, Csr, PollingChannel, Request],
        }),
    );
    m.insert(
        Ae,
        Box::new(DefaultHandler {
            children: &[Container, Subscription, Acp, Group, TimeSeries, PollingChannel],
        }),
    );
    m.insert(
        Container,
        Box::new(InstanceContainerHandler {
            children: &[ContentInstance, Subscription, Container],
            count_attr: "cni",
            byte_size_attr: "cbs",
        }),
    );
    m.insert(ContentInstance, Box::new(DefaultHandler { children: &[] }));
    m.insert(
        TimeSeries,
        Box::new(InstanceContainerHandler {
            children: &[TimeSeriesInstance, Subscription],
            count_attr: "cni",
            byte_size_attr: "cbs",
        }),
    );
    m.insert(TimeSeriesInstance, Box::new(DefaultHandler { children: &[] }));
    m.insert(Subscription, Box::new(DefaultHandler { children: &[] }));
    m.insert(CrossResourceSubscription, Box::new(DefaultHandler { children: &[] }));
    m.insert(Acp, Box::new(DefaultHandler { children: &[] }));
    m.insert(Group, Box::new(DefaultHandler { children: &[Subscription] }));
    m.insert(Request, Box::new(RequestHandler));
    m.insert(PollingChannel, Box::new(DefaultHandler { children: &[] }));
    m.insert(Csr, Box::new(DefaultHandler { children: &[AeAnnc, ContainerAnnc, AcpAnnc] }));
    m.insert(AeAnnc, Box::new(DefaultHandler { children: &[] }));
    m.insert(ContainerAnnc, Box::new(DefaultHandler { children: &[] }));
    m.insert(AcpAnnc, Box::new(DefaultHandler { children: &[] }));

    m
});

/// Look up the behaviour hooks for a resource type. Types with no bespoke
/// entry (virtual types) fall back to a childless default handler.
pub fn handler_for(ty: ResourceType) -> &'static dyn ResourceHandler {
    static FALLBACK: DefaultHandler = DefaultHandler { children: &[] };
    HANDLERS
        .get(&ty)
        .map(|b| b.as_ref())
        .unwrap_or(&FALLBACK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn cin(ri: &str, cs: u64, ct_offset_secs: i64) -> Resource {
        let mut attrs = Map::new();
        attrs.insert("cs".into(), json!(cs));
        Resource {
            ri: ri.into(),
            pi: Some("cnt1".into()),
            rn: ri.into(),
            ty: ResourceType::ContentInstance,
            srn: format!("cse-in/cnt1/{ri}"),
            ct: Utc::now() + chrono::Duration::seconds(ct_offset_secs),
            lt: Utc::now(),
            et: None,
            acpi: None,
            cstn: None,
            at: None,
            announced_to: vec![],
            attrs,
        }
    }

    #[test]
    fn container_evicts_oldest_beyond_mni() {
        let handler = handler_for(ResourceType::Container);
        let mut parent = cin("cnt1", 0, 0);
        parent.ty = ResourceType::Container;
        parent.attrs.insert("mni".into(), json!(2));

        let a = cin("a", 1, 0);
        let b = cin("b", 1, 1);
        let c = cin("c", 1, 2);
        let siblings = vec![a.clone(), b.clone(), c.clone()];

        let evicted = handler.child_added(&mut parent, &c, &siblings);
        assert_eq!(evicted, vec!["a".to_string()]);
        assert_eq!(parent.attrs.get("cni"), Some(&json!(2)));
    }

    #[test]
    fn request_in_forwarded_state_cannot_be_recalled() {
        let handler = handler_for(ResourceType::Request);
        let mut req = cin("req1", 0, 0);
        req.ty = ResourceType::Request;
        req.attrs.insert("rs".into(), json!("FORWARDED"));
        assert!(handler.will_be_deactivated(&req).is_err());
    }

    #[test]
    fn content_instance_create_requires_con() {
        let handler = handler_for(ResourceType::ContentInstance);
        let mut bare = cin("cin1", 0, 0);
        bare.attrs.remove("cs");
        assert!(handler.validate(&bare, true).is_err());

        let mut with_con = cin("cin1", 0, 0);
        with_con.attrs.insert("con".into(), json!("hi"));
        assert!(handler.validate(&with_con, true).is_ok());
    }

    #[test]
    fn container_update_cannot_touch_cni() {
        let handler = handler_for(ResourceType::Container);
        let mut parent = cin("cnt1", 0, 0);
        parent.ty = ResourceType::Container;

        let mut payload = Map::new();
        payload.insert("cni".into(), json!(0));
        assert!(handler.update(&mut parent, payload).is_err());

        let mut payload = Map::new();
        payload.insert("lbl".into(), json!(["x"]));
        assert!(handler.update(&mut parent, payload).is_ok());
    }
}
