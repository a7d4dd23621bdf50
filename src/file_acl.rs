//! Content store ACL evaluation

use crate::common_types::file_rights;
use crate::errors::AuditError;
use crate::model::WritePermissionResult;
use crate::policy_store::PolicyStore;
use crate::security_descriptor::NameResolver;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct FileAclEvaluator {
    store: Arc<dyn PolicyStore>,
    resolver: Arc<NameResolver>,
    honor_deny_aces: bool,
}

impl FileAclEvaluator {
    pub fn new(store: Arc<dyn PolicyStore>, resolver: Arc<NameResolver>, honor_deny_aces: bool) -> Self {
        Self {
            store,
            resolver,
            honor_deny_aces,
        }
    }

    /// Principals granted `FILE_WRITE_DATA` on `path`.
    ///
    /// An unreadable ACL yields no writers plus a warning: the store is then
    /// "not confirmed writable", never assumed writable.
    pub fn extract_write_access_principals(
        &self,
        path: &str,
    ) -> (WritePermissionResult, Option<String>) {
        let mut result = WritePermissionResult::empty(path);

        let acl = match self.store.get_acl(path) {
            Ok(acl) => acl,
            Err(e) => {
                let reason = match &e {
                    AuditError::AccessDenied(_) => "access denied",
                    AuditError::NotFound(_) => "path not found",
                    AuditError::Unsupported(_) => "ACL retrieval unsupported",
                    AuditError::Timeout(_) => "timed out",
                    _ => "unreadable",
                };
                warn!("Cannot read ACL of {} ({}): {}", path, reason, e);
                return (
                    result,
                    Some(format!("Store ACL of {} not readable ({}): {}", path, reason, e)),
                );
            }
        };

        let mut denied: HashSet<String> = HashSet::new();
        for ace in &acl {
            if ace.access_mask & file_rights::WRITE_DATA == 0 {
                continue;
            }
            let sid = ace.trustee_sid.to_uppercase();
            if !ace.allow {
                denied.insert(sid);
                continue;
            }
            if self.honor_deny_aces && denied.contains(&sid) {
                debug!("{}: write allow for {} suppressed by preceding deny", path, ace.trustee_sid);
                continue;
            }
            result.insert(self.resolver.principal(&ace.trustee_sid));
        }

        (result, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{DomainSnapshot, SnapshotDirectory};
    use serde_json::json;

    const GPO_ID: &str = "{31B2F340-016D-11D2-945F-00C04FB984F9}";

    fn evaluator(store_acl: serde_json::Value, unreadable: bool) -> (FileAclEvaluator, String) {
        let snapshot: DomainSnapshot = serde_json::from_value(json!({
            "domain": "corp.local",
            "accounts": [
                {"name": "Domain Admins", "sid": "S-1-5-21-1-2-3-512", "distinguished_name": "CN=Domain Admins,CN=Users,DC=corp,DC=local", "kind": "group"}
            ],
            "gpos": [{"id": GPO_ID, "store_acl": store_acl, "store_unreadable": unreadable}]
        }))
        .unwrap();
        let dir = Arc::new(SnapshotDirectory::new(snapshot).unwrap());
        let path = dir.policy_path(GPO_ID);
        let resolver = Arc::new(NameResolver::new(dir.clone()));
        (FileAclEvaluator::new(dir, resolver, true), path)
    }

    #[test]
    fn test_write_data_allow_entries() {
        let (evaluator, path) = evaluator(
            json!([
                {"sid": "S-1-5-21-1-2-3-512", "mask": 0x1f01ff},
                {"sid": "S-1-5-11", "mask": 0x1200a9},
                {"sid": "S-1-5-18", "mask": 2}
            ]),
            false,
        );
        let (result, warning) = evaluator.extract_write_access_principals(&path);
        assert!(warning.is_none());
        let names: Vec<&str> = result.principals.iter().map(|p| p.display_name.as_str()).collect();
        assert_eq!(names, vec!["CORP\\Domain Admins", "NT AUTHORITY\\SYSTEM"]);
    }

    #[test]
    fn test_deny_entries_never_contribute() {
        let (evaluator, path) = evaluator(
            json!([
                {"sid": "S-1-5-11", "mask": 2, "allow": false},
                {"sid": "S-1-5-11", "mask": 2}
            ]),
            false,
        );
        let (result, _) = evaluator.extract_write_access_principals(&path);
        assert!(result.is_empty());
    }

    #[test]
    fn test_unreadable_acl_is_warning_not_writer() {
        let (evaluator, path) = evaluator(json!([{"sid": "S-1-5-11", "mask": 2}]), true);
        let (result, warning) = evaluator.extract_write_access_principals(&path);
        assert!(result.is_empty());
        assert!(warning.unwrap().contains("access denied"));
    }
}
