//! Directory service seam
//!
//! The engine never talks LDAP itself; it asks a `DirectoryService` for raw
//! facts. Implementations: [`crate::ldap_directory::LdapDirectory`] for a live
//! domain and [`crate::snapshot::SnapshotDirectory`] for captured data.
//!
//! Absent objects are `Ok(None)` or an empty list. Errors are reserved for
//! failed round trips.

use crate::errors::AuditResult;
use crate::model::{DirectoryObject, GroupEntry, GroupIdentifier, PolicyContainer};

pub trait DirectoryService: Send + Sync {
    /// DNS name of the audited domain
    fn domain(&self) -> &str;

    /// Confirm the domain root is reachable. Failure aborts a run.
    fn verify_root(&self) -> AuditResult<()>;

    /// `groupPolicyContainer` attributes for a policy id (`{GUID}` form)
    fn lookup_policy_container(&self, id: &str) -> AuditResult<Option<PolicyContainer>>;

    /// DNs of containers (OUs or the domain head) whose `gPLink` references the policy
    fn lookup_linked_ous(&self, id: &str) -> AuditResult<Vec<String>>;

    /// User and computer accounts under an OU
    fn lookup_ou_children(&self, ou_dn: &str) -> AuditResult<Vec<DirectoryObject>>;

    fn resolve_id_to_name(&self, sid: &str) -> AuditResult<Option<String>>;

    fn resolve_name_to_id(&self, name: &str) -> AuditResult<Option<String>>;

    fn lookup_object(&self, sid: &str) -> AuditResult<Option<DirectoryObject>>;

    /// A group and its direct members only
    fn resolve_group(&self, id: &GroupIdentifier) -> AuditResult<Option<GroupEntry>>;
}
