//! Security descriptor evaluation for policy containers
//!
//! Turns a parsed discretionary ACL into the set of principals that can write
//! the object and the set of principals the policy applies to (its security
//! filter).

use crate::common_types::{ds_rights, well_known_sids};
use crate::directory::DirectoryService;
use crate::ldap_utils::{AceEntry, SecurityDescriptor};
use crate::model::{SecurityPrincipal, WritePermissionResult};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, trace};

/// Display names for SIDs that never resolve through the directory
fn well_known_name(sid: &str) -> Option<&'static str> {
    let name = match sid.to_uppercase().as_str() {
        well_known_sids::EVERYONE => "Everyone",
        well_known_sids::AUTHENTICATED_USERS => "NT AUTHORITY\\Authenticated Users",
        well_known_sids::SYSTEM => "NT AUTHORITY\\SYSTEM",
        well_known_sids::ENTERPRISE_DOMAIN_CONTROLLERS => {
            "NT AUTHORITY\\ENTERPRISE DOMAIN CONTROLLERS"
        }
        well_known_sids::CREATOR_OWNER => "CREATOR OWNER",
        well_known_sids::BUILTIN_ADMINISTRATORS => "BUILTIN\\Administrators",
        "S-1-5-32-548" => "BUILTIN\\Account Operators",
        "S-1-5-32-549" => "BUILTIN\\Server Operators",
        "S-1-5-32-550" => "BUILTIN\\Print Operators",
        "S-1-5-32-551" => "BUILTIN\\Backup Operators",
        "S-1-5-7" => "NT AUTHORITY\\ANONYMOUS LOGON",
        "S-1-5-10" => "NT AUTHORITY\\SELF",
        _ => return None,
    };
    Some(name)
}

/// Best-effort SID to display-name translation, cached for the run.
///
/// Failures never propagate: an unresolved SID renders as itself.
pub struct NameResolver {
    directory: Arc<dyn DirectoryService>,
    cache: DashMap<String, String>,
}

impl NameResolver {
    pub fn new(directory: Arc<dyn DirectoryService>) -> Self {
        Self {
            directory,
            cache: DashMap::new(),
        }
    }

    pub fn display_name(&self, sid: &str) -> String {
        let key = sid.to_uppercase();
        if let Some(name) = self.cache.get(&key) {
            return name.clone();
        }

        if let Some(name) = well_known_name(&key) {
            self.cache.insert(key, name.to_string());
            return name.to_string();
        }

        match self.directory.resolve_id_to_name(sid) {
            Ok(Some(name)) => {
                self.cache.insert(key, name.clone());
                name
            }
            Ok(None) => {
                self.cache.insert(key, sid.to_string());
                sid.to_string()
            }
            Err(e) => {
                debug!("Could not translate {}: {}", sid, e);
                sid.to_string()
            }
        }
    }

    pub fn principal(&self, sid: &str) -> SecurityPrincipal {
        SecurityPrincipal::from_sid(sid, self.display_name(sid))
    }
}

pub struct SecurityDescriptorEvaluator {
    resolver: Arc<NameResolver>,
    honor_deny_aces: bool,
}

impl SecurityDescriptorEvaluator {
    pub fn new(resolver: Arc<NameResolver>, honor_deny_aces: bool) -> Self {
        Self {
            resolver,
            honor_deny_aces,
        }
    }

    /// Principals holding write-property through an allow entry.
    ///
    /// With deny handling on, a write-property deny for the same SID that
    /// precedes the allow in ACL order suppresses it. Deny entries never add
    /// a principal.
    pub fn extract_write_access_principals(
        &self,
        subject: &str,
        descriptor: &SecurityDescriptor,
    ) -> WritePermissionResult {
        let mut result = WritePermissionResult::empty(subject);
        let mut denied: HashSet<String> = HashSet::new();

        for ace in &descriptor.dacl {
            if ace.access_mask & ds_rights::WRITE_PROPERTY == 0 {
                continue;
            }

            if ace.is_deny() {
                if denies_whole_write(ace) {
                    denied.insert(ace.trustee_sid.to_uppercase());
                }
                continue;
            }

            if !ace.is_allow() {
                continue;
            }

            if self.honor_deny_aces && denied.contains(&ace.trustee_sid.to_uppercase()) {
                debug!(
                    "{}: write allow for {} suppressed by preceding deny",
                    subject, ace.trustee_sid
                );
                continue;
            }

            trace!("{}: {} holds write-property", subject, ace.trustee_sid);
            result.insert(self.resolver.principal(&ace.trustee_sid));
        }

        result
    }

    /// Principals granted the given extended right through an object allow entry
    pub fn extract_security_filter_targets(
        &self,
        descriptor: &SecurityDescriptor,
        apply_right: &str,
    ) -> Vec<SecurityPrincipal> {
        let mut targets = WritePermissionResult::default();

        for ace in &descriptor.dacl {
            if !(ace.is_allow() && ace.is_object_ace()) {
                continue;
            }
            let matches_right = ace
                .object_guid
                .as_deref()
                .is_some_and(|g| g.eq_ignore_ascii_case(apply_right));
            if matches_right {
                targets.insert(self.resolver.principal(&ace.trustee_sid));
            }
        }

        targets.principals
    }
}

/// A deny scoped to one property does not deny writing the object as a whole
fn denies_whole_write(ace: &AceEntry) -> bool {
    !ace.is_object_ace() || ace.object_guid.is_none()
}
