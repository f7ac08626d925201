//! Access-Control Engine: evaluates an originator's permission to perform an
//! operation against a target resource.
//!
//! Evaluation order is grounded line-for-line in
//! `original_source/acme/services/SecurityManager.py::hasAccess` /
//! `checkSingleACPPermission` / `_checkAcor` / `checkAcpiUpdatePermission`.

use std::sync::Arc;

use onem2m_common::{CseConfig, Error, Permission, Resource, ResourceType};
use regex::Regex;
use tracing::debug;

use crate::store::Store;

/// Access-control policy rule set member (`pv`/`pvs` entry).
#[derive(Debug, Clone)]
pub struct AcpRule {
    /// Permission bitmask granted by this rule
    pub acop: Permission,
    /// Originators this rule applies to: literal IDs, the keyword `"all"`,
    /// glob patterns (`*`, `?`), or a `group:<ri>` reference
    pub acor: Vec<String>,
    /// Restrict CREATE to these child types, when present
    pub acod_chty: Option<Vec<ResourceType>>,
}

/// The two rule sets carried by an `<ACP>` resource.
#[derive(Debug, Clone)]
pub struct AccessControlPolicy {
    pub ri: String,
    /// Rules governing the target resources this ACP is attached to
    pub pv: Vec<AcpRule>,
    /// Rules governing the ACP resource itself (self-permission)
    pub pvs: Vec<AcpRule>,
}

/// The Access-Control Engine. Stateless aside from the `Store` handle it
/// resolves ACP/group resources through and the configuration flag that can
/// disable checks entirely.
pub struct AccessControlEngine<S: Store> {
    store: Arc<S>,
    config: CseConfig,
}

impl<S: Store> std::fmt::Debug for AccessControlEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessControlEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S: Store> AccessControlEngine<S> {
    pub fn new(store: Arc<S>, config: CseConfig) -> Self {
        Self { store, config }
    }

    /// `(originator, resource, permission, ty?, parent?)` → allow/deny.
    ///
    /// `ty`/`parent` are only meaningful for CREATE, where `resource` is the
    /// prospective parent and `ty` the type being created.
    pub async fn has_access(
        &self,
        originator: &str,
        resource: &Resource,
        permission: Permission,
        ty: Option<ResourceType>,
        parent: Option<&Resource>,
    ) -> Result<bool, Error> {
        if !self.config.cse.acp_checks_enabled() {
            return Ok(true);
        }

        if originator == self.config.cse.cse_originator
            || originator == self.config.cse.cse_id
            || originator == self.config.cse.admin_originator
        {
            return Ok(true);
        }

        if permission == Permission::NOTIFY && originator == self.config.cse.cse_originator {
            return Ok(true);
        }

        if let Some(allow) = self.type_specific_rule(originator, resource, permission, ty) {
            debug!(originator, ?permission, "type-specific access rule matched");
            return Ok(allow);
        }

        if resource.ty == ResourceType::Acp {
            return self.acp_self_permission_check(originator, resource, permission, ty).await;
        }

        self.generic_acpi_check(originator, resource, permission, ty, parent)
            .await
    }

    /// `<ACP>` resources govern access to themselves through their own `pvs`
    /// rule set rather than through `acpi` (grounded in
    /// `SecurityManager.py::checkSingleACPPermission`'s `pvs` branch). Falls
    /// back to creator/custodian the way `generic_acpi_check` does for other
    /// types once `pvs` denies.
    async fn acp_self_permission_check(
        &self,
        originator: &str,
        resource: &Resource,
        permission: Permission,
        ty: Option<ResourceType>,
    ) -> Result<bool, Error> {
        if let Some(acp) = parse_acp(resource) {
            if self.rule_set_grants(&acp.pvs, originator, permission, ty).await? {
                return Ok(true);
            }
        }
        Ok(resource.creator() == Some(originator) || resource.cstn.as_deref() == Some(originator))
    }

    /// Short-circuits for resource types with bespoke rules.
    fn type_specific_rule(
        &self,
        originator: &str,
        resource: &Resource,
        permission: Permission,
        ty: Option<ResourceType>,
    ) -> Option<bool> {
        match resource.ty {
            ResourceType::CseBase if permission == Permission::RETRIEVE => Some(true),
            ResourceType::CseBase if permission == Permission::CREATE => match ty {
                Some(ResourceType::Ae) => {
                    Some(self.originator_allowed(originator, &self.config.cse.allowed_ae_originators))
                }
                Some(ResourceType::Csr) => {
                    Some(self.originator_allowed(originator, &self.config.cse.allowed_csr_originators))
                }
                _ => None,
            },
            ResourceType::PollingChannel => {
                Some(resource.creator() == Some(originator))
            }
            _ => None,
        }
    }

    /// Registration gate for AE/CSR CREATE under the CSEBase: an empty
    /// allow-list admits any originator, otherwise `originator` must match
    /// one of the configured literal IDs or glob patterns.
    fn originator_allowed(&self, originator: &str, allowed: &[String]) -> bool {
        allowed.is_empty() || allowed.iter().any(|pattern| simple_match(pattern, originator))
    }

    /// The generic `acpi`-driven rule evaluation.
    async fn generic_acpi_check(
        &self,
        originator: &str,
        resource: &Resource,
        permission: Permission,
        ty: Option<ResourceType>,
        parent: Option<&Resource>,
    ) -> Result<bool, Error> {
        if let Some(acpi) = &resource.acpi {
            for acp_ri in acpi {
                let acp = self.load_acp(acp_ri).await?;
                if let Some(acp) = acp {
                    if self
                        .rule_set_grants(&acp.pv, originator, permission, ty)
                        .await?
                    {
                        return Ok(true);
                    }
                }
            }
            return Ok(false);
        }

        if resource.ty.may_have_acpi() {
            if resource.creator() == Some(originator) || resource.cstn.as_deref() == Some(originator)
            {
                return Ok(true);
            }
        }

        if resource.inherit_acp() {
            if let Some(parent) = parent {
                return Box::pin(self.generic_acpi_check(originator, parent, permission, ty, None))
                    .await;
            }
        }

        Ok(false)
    }

    /// Evaluate one ACP rule set (`pv` or `pvs`) against an originator/permission.
    async fn rule_set_grants(
        &self,
        rules: &[AcpRule],
        originator: &str,
        permission: Permission,
        ty: Option<ResourceType>,
    ) -> Result<bool, Error> {
        for rule in rules {
            if !rule.acop.intersects(permission) {
                continue;
            }
            if let (Some(chty), Some(ty)) = (&rule.acod_chty, ty) {
                if !chty.contains(&ty) {
                    continue;
                }
            }
            if self.acor_matches(&rule.acor, originator).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// `acor` matching: literal equality, `"all"`, glob, or `group:<ri>` membership.
    async fn acor_matches(&self, acor: &[String], originator: &str) -> Result<bool, Error> {
        for pattern in acor {
            if pattern == "all" || pattern == originator {
                return Ok(true);
            }
            if let Some(group_ri) = pattern.strip_prefix("group:") {
                if self.group_contains(group_ri, originator).await? {
                    return Ok(true);
                }
                continue;
            }
            if simple_match(pattern, originator) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn group_contains(&self, group_ri: &str, originator: &str) -> Result<bool, Error> {
        match self.store.get_resource(group_ri).await.map_err(Into::into)? {
            Some(group) if group.ty == ResourceType::Group => {
                let members = group
                    .attrs
                    .get("mid")
                    .and_then(|v| v.as_array())
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|m| m.as_str())
                            .any(|m| m == originator)
                    })
                    .unwrap_or(false);
                Ok(members)
            }
            _ => Ok(false),
        }
    }

    /// Load and parse an `<ACP>` resource into its rule sets.
    async fn load_acp(&self, ri: &str) -> Result<Option<AccessControlPolicy>, Error> {
        let resource = self.store.get_resource(ri).await.map_err(Into::into)?;
        Ok(resource.and_then(|r| parse_acp(&r)))
    }

    /// UPDATE of `acpi` itself: a dedicated check distinct from the generic path.
    ///
    /// `acpi` must be the only attribute in the payload; the originator must
    /// be the creator (no prior `acpi`) or satisfy `pvs` UPDATE on at least
    /// one current `acpi` entry.
    pub async fn can_update_acpi(
        &self,
        originator: &str,
        resource: &Resource,
        payload_attrs: &[String],
    ) -> Result<(), Error> {
        if payload_attrs != ["acpi"] {
            return Err(Error::BadRequest(
                "acpi update must not contain other attributes".into(),
            ));
        }

        match &resource.acpi {
            None => {
                if resource.creator() == Some(originator) {
                    Ok(())
                } else {
                    Err(Error::OriginatorHasNoPrivilege(originator.to_string()))
                }
            }
            Some(acpi) => {
                for acp_ri in acpi {
                    if let Some(acp) = self.load_acp(acp_ri).await? {
                        if self
                            .rule_set_grants(&acp.pvs, originator, Permission::UPDATE, None)
                            .await?
                        {
                            return Ok(());
                        }
                    }
                }
                Err(Error::OriginatorHasNoPrivilege(originator.to_string()))
            }
        }
    }
}

/// Glob match supporting `*` and `?`, mirroring `SecurityManager.simpleMatch`.
fn simple_match(pattern: &str, value: &str) -> bool {
    if !pattern.contains('*') && !pattern.contains('?') {
        return pattern == value;
    }
    let mut regex_str = String::with_capacity(pattern.len() * 2);
    regex_str.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => regex_str.push_str(".*"),
            '?' => regex_str.push('.'),
            _ => regex_str.push_str(&regex::escape(&ch.to_string())),
        }
    }
    regex_str.push('$');
    Regex::new(&regex_str)
        .map(|re| re.is_match(value))
        .unwrap_or(false)
}

/// Parse an `<ACP>` resource's `pv`/`pvs` attributes into rule sets.
fn parse_acp(resource: &Resource) -> Option<AccessControlPolicy> {
    if resource.ty != ResourceType::Acp {
        return None;
    }
    let pv = parse_rule_set(resource.attrs.get("pv")?);
    let pvs = parse_rule_set(resource.attrs.get("pvs")?);
    Some(AccessControlPolicy {
        ri: resource.ri.clone(),
        pv,
        pvs,
    })
}

fn parse_rule_set(value: &serde_json::Value) -> Vec<AcpRule> {
    let Some(entries) = value.get("acr").and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| {
            let acop = entry.get("acop")?.as_u64()? as u16;
            let acor = entry
                .get("acor")?
                .as_array()?
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
            let acod_chty = entry.get("acod").and_then(|acod| {
                let list = acod.as_array().map(|v| v.as_slice()).unwrap_or(std::slice::from_ref(acod));
                let chtys: Vec<ResourceType> = list
                    .iter()
                    .filter_map(|od| od.get("chty"))
                    .filter_map(|v| v.as_array())
                    .flatten()
                    .filter_map(|v| v.as_str())
                    .filter_map(ResourceType::from_tag)
                    .collect();
                if chtys.is_empty() {
                    None
                } else {
                    Some(chtys)
                }
            });
            Some(AcpRule {
                acop: Permission(acop),
                acor,
                acod_chty,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_match_wildcard() {
        assert!(simple_match("Cae*", "Cae1234"));
        assert!(!simple_match("Cae*", "Dother"));
    }

    #[test]
    fn simple_match_literal() {
        assert!(simple_match("Cae1", "Cae1"));
        assert!(!simple_match("Cae1", "Cae2"));
    }
}
