//! Live Active Directory adapter
//!
//! Implements [`DirectoryService`] over LDAP. Every call borrows a bound
//! connection from the pool and is bounded by the operation timeout.

use crate::common_types::{domain_to_base_dn, is_sid_literal};
use crate::config::AuditConfig;
use crate::connection_pool::{LdapConnectionPool, PoolConfig};
use crate::credentials::{account_name_from_identity, ExplicitCredentials};
use crate::directory::DirectoryService;
use crate::errors::{AuditError, AuditResult};
use crate::ldap_helpers::SearchEntryExt;
use crate::ldap_timeout::{
    paged_search_with_timeout, sd_flags_control, search_with_timeout, DEFAULT_PAGE_SIZE,
};
use crate::ldap_utils::{escape_binary_filter, escape_ldap_filter, guid_to_bytes, sid_to_bytes};
use crate::model::{
    DirectoryObject, GroupEntry, GroupIdentifier, MemberRef, ObjectKind, PolicyContainer,
};
use ldap3::{Scope, SearchEntry};
use tracing::{debug, info, warn};

const ACCOUNT_ATTRS: &[&str] = &["sAMAccountName", "sAMAccountType", "objectSid"];
const MEMBER_ATTRS: &[&str] = &["objectSid", "objectClass"];

/// Users and computers; `sAMAccountType` excludes trust accounts and groups
const ACCOUNT_FILTER: &str = "(|(sAMAccountType=805306368)(sAMAccountType=805306369))";

pub struct LdapDirectory {
    pool: LdapConnectionPool,
    domain: String,
    base_dn: String,
    netbios_name: String,
    include_disabled_links: bool,
}

impl LdapDirectory {
    /// Connect and bind to `server` (or the domain name when `None`).
    ///
    /// Binds with explicit credentials. A bare account name is qualified
    /// with the domain as a UPN.
    pub fn connect(
        server: Option<&str>,
        use_ldaps: bool,
        domain: &str,
        credentials: &ExplicitCredentials,
        config: &AuditConfig,
    ) -> AuditResult<Self> {
        if credentials.username().trim().is_empty() {
            return Err(AuditError::Configuration(
                "LDAP access requires a username and password".to_string(),
            ));
        }

        let host = server.unwrap_or(domain);
        let url = if use_ldaps {
            format!("ldaps://{}:636", host)
        } else {
            format!("ldap://{}:389", host)
        };

        let bind_name = bind_name(credentials.username(), domain);
        let pool = LdapConnectionPool::new(
            url,
            ExplicitCredentials::new(bind_name, credentials.password().to_string()),
            PoolConfig {
                max_idle: config.max_concurrency,
                connect_timeout: config.connect_timeout(),
                operation_timeout: config.operation_timeout(),
                ..PoolConfig::default()
            },
        );
        pool.warm_up()?;
        info!("LDAP directory ready for {} via {}", domain, pool.url());

        Ok(Self {
            pool,
            domain: domain.to_string(),
            base_dn: domain_to_base_dn(domain),
            netbios_name: netbios_from_domain(domain),
            include_disabled_links: config.include_disabled_links,
        })
    }

    pub fn base_dn(&self) -> &str {
        &self.base_dn
    }

    fn policies_dn(&self) -> String {
        format!("CN=Policies,CN=System,{}", self.base_dn)
    }

    fn search(&self, base: &str, scope: Scope, filter: &str, attrs: &[&str]) -> AuditResult<Vec<SearchEntry>> {
        let timeout = self.pool.operation_timeout();
        self.pool.with_connection(|ldap| {
            search_with_timeout(ldap, base, scope, filter, attrs, Vec::new(), timeout)
        })
    }

    fn paged_search(&self, base: &str, filter: &str, attrs: &[&str]) -> AuditResult<Vec<SearchEntry>> {
        let timeout = self.pool.operation_timeout();
        self.pool.with_connection(|ldap| {
            paged_search_with_timeout(ldap, base, Scope::Subtree, filter, attrs, DEFAULT_PAGE_SIZE, timeout)
        })
    }

    fn find_by_sid(&self, sid: &str, attrs: &[&str]) -> AuditResult<Option<SearchEntry>> {
        let filter = format!("(objectSid={})", escape_binary_filter(&sid_to_bytes(sid)?));
        Ok(self
            .search(&self.base_dn, Scope::Subtree, &filter, attrs)?
            .into_iter()
            .next())
    }

    /// Direct members of a group, read through the members' `memberOf`
    /// back-link so large groups need no ranged retrieval.
    fn direct_members(&self, group_dn: &str) -> AuditResult<Vec<MemberRef>> {
        let filter = format!("(memberOf={})", escape_ldap_filter(group_dn));
        let entries = self.paged_search(&self.base_dn, &filter, MEMBER_ATTRS)?;
        Ok(entries
            .iter()
            .map(|e| MemberRef {
                distinguished_name: e.get_dn(),
                sid: e.get_sid(),
                is_group: e.has_object_class("group"),
            })
            .collect())
    }
}

fn bind_name(username: &str, domain: &str) -> String {
    if username.contains('@') || username.contains('\\') {
        username.to_string()
    } else {
        format!("{}@{}", username, domain)
    }
}

fn netbios_from_domain(domain: &str) -> String {
    domain.split('.').next().unwrap_or(domain).to_uppercase()
}

/// Any container carrying a `gPLink` that mentions the policy: OUs, the
/// domain head and sites alike
pub fn linked_container_filter(id: &str) -> String {
    format!("(gPLink=*{}*)", escape_ldap_filter(id))
}

/// Whether a `gPLink` value references `id` through an active link.
///
/// The value is a run of `[LDAP://cn={GUID},...;options]` segments. Option
/// bit 0 marks the link disabled.
pub fn gplink_references(gp_link: &str, id: &str, include_disabled: bool) -> bool {
    let needle = id.to_lowercase();
    gp_link
        .split(']')
        .filter(|segment| segment.to_lowercase().contains(&needle))
        .any(|segment| {
            let options = segment
                .rsplit_once(';')
                .and_then(|(_, opt)| opt.trim().parse::<u32>().ok())
                .unwrap_or(0);
            include_disabled || options & 1 == 0
        })
}

fn account_from_entry(entry: &SearchEntry) -> Option<DirectoryObject> {
    let kind = entry
        .get_optional_u32_attr("sAMAccountType")
        .and_then(ObjectKind::from_sam_account_type)?;
    let sid = entry.get_sid()?;
    Some(DirectoryObject::new(
        kind,
        entry.get_dn(),
        sid,
        entry.get_string_attr("sAMAccountName"),
    ))
}

impl DirectoryService for LdapDirectory {
    fn domain(&self) -> &str {
        &self.domain
    }

    fn verify_root(&self) -> AuditResult<()> {
        let entries = self.search(&self.base_dn, Scope::Base, "(objectClass=*)", &["objectClass"])?;
        if entries.is_empty() {
            return Err(AuditError::Connectivity(format!(
                "Domain root {} is not readable",
                self.base_dn
            )));
        }
        Ok(())
    }

    fn lookup_policy_container(&self, id: &str) -> AuditResult<Option<PolicyContainer>> {
        let filter = format!(
            "(&(objectClass=groupPolicyContainer)(cn={}))",
            escape_ldap_filter(id)
        );
        let timeout = self.pool.operation_timeout();
        let policies_dn = self.policies_dn();
        let entries = self.pool.with_connection(|ldap| {
            search_with_timeout(
                ldap,
                &policies_dn,
                Scope::OneLevel,
                &filter,
                &["displayName", "versionNumber", "nTSecurityDescriptor"],
                vec![sd_flags_control()],
                timeout,
            )
        })?;

        Ok(entries.first().map(|entry| PolicyContainer {
            display_name: entry.get_optional_attr("displayName"),
            security_descriptor: entry.get_binary_attr("nTSecurityDescriptor"),
            version: entry.get_optional_u32_attr("versionNumber"),
        }))
    }

    fn lookup_linked_ous(&self, id: &str) -> AuditResult<Vec<String>> {
        let filter = linked_container_filter(id);
        let entries = self.paged_search(&self.base_dn, &filter, &["gPLink"])?;

        let mut ous = Vec::new();
        for entry in entries {
            let gp_link = entry.get_string_attr("gPLink");
            if gplink_references(&gp_link, id, self.include_disabled_links) {
                ous.push(entry.get_dn());
            } else {
                debug!("Link from {} to {} is disabled", entry.dn, id);
            }
        }
        Ok(ous)
    }

    fn lookup_ou_children(&self, ou_dn: &str) -> AuditResult<Vec<DirectoryObject>> {
        let entries = self.paged_search(ou_dn, ACCOUNT_FILTER, ACCOUNT_ATTRS)?;
        let children: Vec<DirectoryObject> = entries.iter().filter_map(account_from_entry).collect();
        if children.len() < entries.len() {
            warn!(
                "{} account(s) under {} had no readable SID or account type",
                entries.len() - children.len(),
                ou_dn
            );
        }
        Ok(children)
    }

    fn resolve_id_to_name(&self, sid: &str) -> AuditResult<Option<String>> {
        Ok(self
            .find_by_sid(sid, &["sAMAccountName"])?
            .and_then(|e| e.get_optional_attr("sAMAccountName"))
            .map(|name| format!("{}\\{}", self.netbios_name, name)))
    }

    fn resolve_name_to_id(&self, name: &str) -> AuditResult<Option<String>> {
        if is_sid_literal(name) {
            return Ok(self.find_by_sid(name, &["objectSid"])?.and_then(|e| e.get_sid()));
        }
        let filter = format!(
            "(sAMAccountName={})",
            escape_ldap_filter(account_name_from_identity(name))
        );
        Ok(self
            .search(&self.base_dn, Scope::Subtree, &filter, &["objectSid"])?
            .first()
            .and_then(|e| e.get_sid()))
    }

    fn lookup_object(&self, sid: &str) -> AuditResult<Option<DirectoryObject>> {
        Ok(self
            .find_by_sid(sid, ACCOUNT_ATTRS)?
            .as_ref()
            .and_then(account_from_entry))
    }

    fn resolve_group(&self, id: &GroupIdentifier) -> AuditResult<Option<GroupEntry>> {
        let (base, scope, filter) = match id {
            GroupIdentifier::Guid(guid) => (
                self.base_dn.clone(),
                Scope::Subtree,
                format!(
                    "(&(objectCategory=group)(objectGUID={}))",
                    escape_binary_filter(&guid_to_bytes(guid)?)
                ),
            ),
            GroupIdentifier::Sid(sid) => (
                self.base_dn.clone(),
                Scope::Subtree,
                format!(
                    "(&(objectCategory=group)(objectSid={}))",
                    escape_binary_filter(&sid_to_bytes(sid)?)
                ),
            ),
            GroupIdentifier::DistinguishedName(dn) => {
                (dn.clone(), Scope::Base, "(objectCategory=group)".to_string())
            }
        };

        let group = match self.search(&base, scope, &filter, &["objectSid"])?.into_iter().next() {
            Some(entry) => entry,
            None => return Ok(None),
        };
        let sid = group.get_sid().ok_or_else(|| {
            AuditError::Parse(format!("Group {} has no readable objectSid", group.dn))
        })?;

        let members = self.direct_members(&group.dn)?;
        debug!("{} has {} direct members", group.dn, members.len());

        Ok(Some(GroupEntry {
            distinguished_name: group.dn,
            sid,
            members,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const ID: &str = "{31B2F340-016D-11D2-945F-00C04FB984F9}";

    #[test]
    fn test_gplink_enabled_and_disabled_segments() {
        let enabled = format!("[LDAP://cn={},cn=policies,cn=system,DC=corp,DC=local;0]", ID.to_lowercase());
        let disabled = format!("[LDAP://cn={},cn=policies,cn=system,DC=corp,DC=local;1]", ID);
        let enforced_disabled = format!("[LDAP://cn={},cn=policies,cn=system,DC=corp,DC=local;3]", ID);
        let enforced = format!("[LDAP://cn={},cn=policies,cn=system,DC=corp,DC=local;2]", ID);

        assert!(gplink_references(&enabled, ID, false));
        assert!(gplink_references(&enforced, ID, false));
        assert!(!gplink_references(&disabled, ID, false));
        assert!(!gplink_references(&enforced_disabled, ID, false));
        assert!(gplink_references(&disabled, ID, true));
    }

    #[test]
    fn test_gplink_options_read_per_segment() {
        let other = "{6AC1786C-016F-11D2-945F-00C04FB984F9}";
        let value = format!(
            "[LDAP://cn={},cn=policies,cn=system,DC=corp,DC=local;1][LDAP://cn={},cn=policies,cn=system,DC=corp,DC=local;0]",
            other, ID
        );
        assert!(gplink_references(&value, ID, false));
        assert!(!gplink_references(&value, other, false));
        assert!(!gplink_references(&value, "{00000000-0000-0000-0000-000000000000}", true));
    }

    #[test]
    fn test_linked_container_filter_has_no_class_restriction() {
        let filter = linked_container_filter(ID);
        assert_eq!(filter, format!("(gPLink=*{}*)", ID));
        assert!(!filter.contains("objectClass"));
    }

    #[test]
    fn test_bind_name_qualification() {
        assert_eq!(bind_name("auditor", "corp.local"), "auditor@corp.local");
        assert_eq!(bind_name("CORP\\auditor", "corp.local"), "CORP\\auditor");
        assert_eq!(bind_name("auditor@corp.local", "corp.local"), "auditor@corp.local");
        assert_eq!(netbios_from_domain("corp.local"), "CORP");
    }

    #[test]
    fn test_account_from_entry() {
        let mut attrs = HashMap::new();
        attrs.insert("sAMAccountName".to_string(), vec!["WS01$".to_string()]);
        attrs.insert("sAMAccountType".to_string(), vec!["805306369".to_string()]);
        let mut bin_attrs = HashMap::new();
        bin_attrs.insert(
            "objectSid".to_string(),
            vec![sid_to_bytes("S-1-5-21-1-2-3-1201").unwrap()],
        );
        let entry = SearchEntry {
            dn: "CN=WS01,OU=Workstations,DC=corp,DC=local".to_string(),
            attrs,
            bin_attrs,
        };

        let object = account_from_entry(&entry).unwrap();
        assert_eq!(object.kind, ObjectKind::Computer);
        assert_eq!(object.sid, "S-1-5-21-1-2-3-1201");
        assert_eq!(object.name, "WS01$");
    }

    #[test]
    fn test_connect_requires_username() {
        let creds = ExplicitCredentials::new(String::new(), String::new());
        let result = LdapDirectory::connect(None, false, "corp.local", &creds, &AuditConfig::default());
        assert!(matches!(result, Err(AuditError::Configuration(_))));
    }
}
