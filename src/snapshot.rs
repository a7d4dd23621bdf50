//! Offline domain snapshot
//!
//! A JSON capture of the facts the audit reads from a domain: accounts and
//! groups, OUs with their policy links, and per-policy container and content
//! store data. [`SnapshotDirectory`] serves a snapshot through both the
//! [`DirectoryService`] and [`PolicyStore`] traits, so an audit can run
//! against a captured domain exactly as it would against a live one.
//!
//! Descriptors are stored in a readable ACE form and encoded to the binary
//! self-relative layout at load time, so they pass through the same parser as
//! live `nTSecurityDescriptor` values. `raw_descriptor_b64` bypasses encoding.

use crate::common_types::{dn_is_under, is_sid_literal};
use crate::credentials::account_name_from_identity;
use crate::directory::DirectoryService;
use crate::errors::{AuditError, AuditResult};
use crate::ldap_utils::{ace_types, encode_security_descriptor, AceEntry};
use crate::model::{
    DirectoryObject, FileAce, GroupEntry, GroupIdentifier, MemberRef, ObjectKind,
    PolicyContainer,
};
use crate::policy_store::{PolicyStore, POLICY_MARKER_FILE};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainSnapshot {
    pub domain: String,
    /// Defaults to the upper-cased first label of `domain`
    #[serde(default)]
    pub netbios_name: Option<String>,
    /// Simulates an unreachable domain root and policies share
    #[serde(default)]
    pub unreachable: bool,
    #[serde(default)]
    pub accounts: Vec<SnapshotAccount>,
    #[serde(default)]
    pub ous: Vec<SnapshotOu>,
    #[serde(default)]
    pub gpos: Vec<SnapshotGpo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
    User,
    Computer,
    Group,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotAccount {
    pub name: String,
    pub sid: String,
    pub distinguished_name: String,
    pub kind: AccountKind,
    #[serde(default)]
    pub object_guid: Option<String>,
    /// Direct members of a group, by DN or SID
    #[serde(default)]
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotOu {
    pub distinguished_name: String,
    #[serde(default)]
    pub linked_gpos: Vec<String>,
    #[serde(default)]
    pub disabled_links: Vec<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotGpo {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default = "default_true")]
    pub has_marker: bool,
    #[serde(default = "default_true")]
    pub has_container: bool,
    #[serde(default)]
    pub descriptor: Option<SnapshotDescriptor>,
    #[serde(default)]
    pub raw_descriptor_b64: Option<String>,
    #[serde(default)]
    pub store_acl: Vec<SnapshotFileAce>,
    #[serde(default)]
    pub store_unreadable: bool,
    /// Container lookups that time out before one succeeds
    #[serde(default)]
    pub transient_failures: u32,
    /// Artificial latency added to the container lookup
    #[serde(default)]
    pub lookup_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotDescriptor {
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub dacl: Vec<SnapshotAce>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotAceKind {
    Allow,
    Deny,
    AllowObject,
    DenyObject,
}

impl SnapshotAceKind {
    fn ace_type(self) -> u8 {
        match self {
            SnapshotAceKind::Allow => ace_types::ACCESS_ALLOWED,
            SnapshotAceKind::Deny => ace_types::ACCESS_DENIED,
            SnapshotAceKind::AllowObject => ace_types::ACCESS_ALLOWED_OBJECT,
            SnapshotAceKind::DenyObject => ace_types::ACCESS_DENIED_OBJECT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotAce {
    pub kind: SnapshotAceKind,
    pub sid: String,
    pub mask: u32,
    #[serde(default)]
    pub object_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFileAce {
    pub sid: String,
    pub mask: u32,
    #[serde(default = "default_true")]
    pub allow: bool,
}

impl DomainSnapshot {
    pub fn load(path: &Path) -> AuditResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Strip braces and lower-case a policy id for lookups
fn normalize_policy_id(id: &str) -> String {
    id.trim()
        .trim_start_matches('{')
        .trim_end_matches('}')
        .to_lowercase()
}

/// Directory and policy store served from a [`DomainSnapshot`]
pub struct SnapshotDirectory {
    snapshot: DomainSnapshot,
    netbios_name: String,
    include_disabled_links: bool,
    by_sid: HashMap<String, usize>,
    by_name: HashMap<String, usize>,
    by_dn: HashMap<String, usize>,
    by_guid: HashMap<String, usize>,
    gpo_index: HashMap<String, usize>,
    descriptors: HashMap<usize, Vec<u8>>,
    /// Policies whose descriptor could not be encoded, with the cause
    descriptor_errors: HashMap<usize, String>,
    pending_failures: HashMap<usize, AtomicU32>,
    group_lookups: AtomicUsize,
}

impl SnapshotDirectory {
    pub fn new(snapshot: DomainSnapshot) -> AuditResult<Self> {
        let netbios_name = snapshot.netbios_name.clone().unwrap_or_else(|| {
            snapshot
                .domain
                .split('.')
                .next()
                .unwrap_or(snapshot.domain.as_str())
                .to_uppercase()
        });

        let mut by_sid = HashMap::new();
        let mut by_name = HashMap::new();
        let mut by_dn = HashMap::new();
        let mut by_guid = HashMap::new();
        for (idx, account) in snapshot.accounts.iter().enumerate() {
            by_sid.insert(account.sid.to_uppercase(), idx);
            by_name.insert(account.name.to_lowercase(), idx);
            by_dn.insert(account.distinguished_name.to_lowercase(), idx);
            if let Some(guid) = &account.object_guid {
                by_guid.insert(normalize_policy_id(guid), idx);
            }
        }

        let mut gpo_index = HashMap::new();
        let mut descriptors = HashMap::new();
        let mut pending_failures = HashMap::new();
        let mut descriptor_errors = HashMap::new();
        for (idx, gpo) in snapshot.gpos.iter().enumerate() {
            gpo_index.insert(normalize_policy_id(&gpo.id), idx);
            match Self::encode_descriptor(gpo) {
                Ok(Some(encoded)) => {
                    descriptors.insert(idx, encoded);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Policy {} has an unusable descriptor: {}", gpo.id, e);
                    descriptor_errors.insert(idx, e);
                }
            }
            if gpo.transient_failures > 0 {
                pending_failures.insert(idx, AtomicU32::new(gpo.transient_failures));
            }
        }

        info!(
            "Loaded snapshot of {}: {} accounts, {} OUs, {} policies",
            snapshot.domain,
            snapshot.accounts.len(),
            snapshot.ous.len(),
            snapshot.gpos.len()
        );

        Ok(Self {
            snapshot,
            netbios_name,
            include_disabled_links: false,
            by_sid,
            by_name,
            by_dn,
            by_guid,
            gpo_index,
            descriptors,
            descriptor_errors,
            pending_failures,
            group_lookups: AtomicUsize::new(0),
        })
    }

    pub fn load(path: &Path) -> AuditResult<Self> {
        Self::new(DomainSnapshot::load(path)?)
    }

    pub fn with_disabled_links(mut self, include: bool) -> Self {
        self.include_disabled_links = include;
        self
    }

    /// Number of `resolve_group` calls served so far
    pub fn group_lookup_count(&self) -> usize {
        self.group_lookups.load(Ordering::Relaxed)
    }

    /// Binary descriptor for a policy; the error is a cause for that policy only
    fn encode_descriptor(gpo: &SnapshotGpo) -> Result<Option<Vec<u8>>, String> {
        if let Some(raw) = &gpo.raw_descriptor_b64 {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(raw)
                .map_err(|e| format!("Policy {} has invalid raw_descriptor_b64: {}", gpo.id, e))?;
            return Ok(Some(bytes));
        }

        let Some(descriptor) = &gpo.descriptor else {
            return Ok(None);
        };

        let dacl: Vec<AceEntry> = descriptor
            .dacl
            .iter()
            .map(|ace| AceEntry {
                ace_type: ace.kind.ace_type(),
                ace_flags: 0,
                access_mask: ace.mask,
                trustee_sid: ace.sid.clone(),
                object_guid: ace.object_type.clone(),
                inherited_object_guid: None,
            })
            .collect();

        encode_security_descriptor(descriptor.owner.as_deref(), &dacl)
            .map(Some)
            .map_err(|e| format!("Policy {} descriptor: {}", gpo.id, e))
    }

    fn account_by_sid(&self, sid: &str) -> Option<&SnapshotAccount> {
        self.by_sid
            .get(&sid.to_uppercase())
            .map(|&idx| &self.snapshot.accounts[idx])
    }

    fn account_by_reference(&self, reference: &str) -> Option<&SnapshotAccount> {
        if is_sid_literal(reference) {
            return self.account_by_sid(reference);
        }
        self.by_dn
            .get(&reference.to_lowercase())
            .map(|&idx| &self.snapshot.accounts[idx])
    }

    fn gpo(&self, id: &str) -> Option<(usize, &SnapshotGpo)> {
        self.gpo_index
            .get(&normalize_policy_id(id))
            .map(|&idx| (idx, &self.snapshot.gpos[idx]))
    }

    fn check_reachable(&self) -> AuditResult<()> {
        if self.snapshot.unreachable {
            return Err(AuditError::Connectivity(format!(
                "Domain {} is unreachable",
                self.snapshot.domain
            )));
        }
        Ok(())
    }

    /// Resolve a store path back to its policy and whether it names the marker
    fn gpo_for_path(&self, path: &str) -> Option<(&SnapshotGpo, bool)> {
        let root = self.policies_root();
        let rest = path.strip_prefix(&root)?.trim_start_matches(['/', '\\']);
        let (id, tail) = match rest.split_once(['/', '\\']) {
            Some((id, tail)) => (id, Some(tail)),
            None => (rest, None),
        };
        let (_, gpo) = self.gpo(id)?;
        match tail {
            None | Some("") => Some((gpo, false)),
            Some(t) if t.eq_ignore_ascii_case(POLICY_MARKER_FILE) => Some((gpo, true)),
            Some(_) => None,
        }
    }
}

fn to_directory_object(account: &SnapshotAccount) -> Option<DirectoryObject> {
    let kind = match account.kind {
        AccountKind::User => ObjectKind::User,
        AccountKind::Computer => ObjectKind::Computer,
        AccountKind::Group => return None,
    };
    Some(DirectoryObject::new(
        kind,
        account.distinguished_name.clone(),
        account.sid.clone(),
        account.name.clone(),
    ))
}

impl DirectoryService for SnapshotDirectory {
    fn domain(&self) -> &str {
        &self.snapshot.domain
    }

    fn verify_root(&self) -> AuditResult<()> {
        self.check_reachable()
    }

    fn lookup_policy_container(&self, id: &str) -> AuditResult<Option<PolicyContainer>> {
        self.check_reachable()?;
        let Some((idx, gpo)) = self.gpo(id) else {
            return Ok(None);
        };

        if gpo.lookup_delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(gpo.lookup_delay_ms));
        }

        if let Some(remaining) = self.pending_failures.get(&idx) {
            let consumed = remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if consumed {
                return Err(AuditError::Timeout(format!(
                    "Container lookup for {} timed out",
                    gpo.id
                )));
            }
        }

        if !gpo.has_container {
            return Ok(None);
        }

        if let Some(cause) = self.descriptor_errors.get(&idx) {
            return Err(AuditError::Configuration(cause.clone()));
        }

        Ok(Some(PolicyContainer {
            display_name: gpo.display_name.clone(),
            security_descriptor: self.descriptors.get(&idx).cloned(),
            version: gpo.version,
        }))
    }

    fn lookup_linked_ous(&self, id: &str) -> AuditResult<Vec<String>> {
        self.check_reachable()?;
        let wanted = normalize_policy_id(id);
        let links = |list: &[String]| list.iter().any(|l| normalize_policy_id(l) == wanted);

        Ok(self
            .snapshot
            .ous
            .iter()
            .filter(|ou| {
                links(&ou.linked_gpos) || (self.include_disabled_links && links(&ou.disabled_links))
            })
            .map(|ou| ou.distinguished_name.clone())
            .collect())
    }

    fn lookup_ou_children(&self, ou_dn: &str) -> AuditResult<Vec<DirectoryObject>> {
        self.check_reachable()?;
        Ok(self
            .snapshot
            .accounts
            .iter()
            .filter(|a| dn_is_under(&a.distinguished_name, ou_dn))
            .filter_map(to_directory_object)
            .collect())
    }

    fn resolve_id_to_name(&self, sid: &str) -> AuditResult<Option<String>> {
        self.check_reachable()?;
        Ok(self
            .account_by_sid(sid)
            .map(|a| format!("{}\\{}", self.netbios_name, a.name)))
    }

    fn resolve_name_to_id(&self, name: &str) -> AuditResult<Option<String>> {
        self.check_reachable()?;
        if is_sid_literal(name) {
            return Ok(self.account_by_sid(name).map(|a| a.sid.clone()));
        }
        let account = account_name_from_identity(name).to_lowercase();
        Ok(self
            .by_name
            .get(&account)
            .map(|&idx| self.snapshot.accounts[idx].sid.clone()))
    }

    fn lookup_object(&self, sid: &str) -> AuditResult<Option<DirectoryObject>> {
        self.check_reachable()?;
        Ok(self.account_by_sid(sid).and_then(to_directory_object))
    }

    fn resolve_group(&self, id: &GroupIdentifier) -> AuditResult<Option<GroupEntry>> {
        self.group_lookups.fetch_add(1, Ordering::Relaxed);
        self.check_reachable()?;

        let account = match id {
            GroupIdentifier::Guid(guid) => self
                .by_guid
                .get(&normalize_policy_id(guid))
                .map(|&idx| &self.snapshot.accounts[idx]),
            GroupIdentifier::Sid(sid) => self.account_by_sid(sid),
            GroupIdentifier::DistinguishedName(dn) => self.account_by_reference(dn),
        };
        let Some(group) = account.filter(|a| a.kind == AccountKind::Group) else {
            debug!("Group {:?} not present in snapshot", id);
            return Ok(None);
        };

        let members = group
            .members
            .iter()
            .map(|reference| match self.account_by_reference(reference) {
                Some(member) => MemberRef {
                    distinguished_name: member.distinguished_name.clone(),
                    sid: Some(member.sid.clone()),
                    is_group: member.kind == AccountKind::Group,
                },
                None => MemberRef {
                    distinguished_name: reference.clone(),
                    sid: None,
                    is_group: false,
                },
            })
            .collect();

        Ok(Some(GroupEntry {
            distinguished_name: group.distinguished_name.clone(),
            sid: group.sid.clone(),
            members,
        }))
    }
}

impl PolicyStore for SnapshotDirectory {
    fn policies_root(&self) -> String {
        format!("snapshot://{}/Policies", self.snapshot.domain)
    }

    fn list_policy_directories(&self) -> AuditResult<Vec<String>> {
        if self.snapshot.unreachable {
            return Err(AuditError::Connectivity(format!(
                "Cannot list policies root {}",
                self.policies_root()
            )));
        }
        Ok(self.snapshot.gpos.iter().map(|g| g.id.clone()).collect())
    }

    fn policy_path(&self, id: &str) -> String {
        format!("{}/{}", self.policies_root(), id)
    }

    fn marker_path(&self, id: &str) -> String {
        format!("{}/{}", self.policy_path(id), POLICY_MARKER_FILE)
    }

    fn path_exists(&self, path: &str) -> bool {
        match self.gpo_for_path(path) {
            Some((_, false)) => true,
            Some((gpo, true)) => gpo.has_marker,
            None => false,
        }
    }

    fn get_acl(&self, path: &str) -> AuditResult<Vec<FileAce>> {
        let (gpo, _) = self
            .gpo_for_path(path)
            .ok_or_else(|| AuditError::NotFound(format!("{} does not exist", path)))?;
        if gpo.store_unreadable {
            return Err(AuditError::AccessDenied(format!(
                "Cannot read ACL of {}",
                path
            )));
        }
        Ok(gpo
            .store_acl
            .iter()
            .map(|ace| FileAce {
                trustee_sid: ace.sid.clone(),
                access_mask: ace.mask,
                allow: ace.allow,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ldap_utils::parse_security_descriptor;
    use serde_json::json;

    const GPO_ID: &str = "{6AC1786C-016F-11D2-945F-00C04FB984F9}";

    fn snapshot() -> SnapshotDirectory {
        let snapshot: DomainSnapshot = serde_json::from_value(json!({
            "domain": "corp.local",
            "accounts": [
                {"name": "alice", "sid": "S-1-5-21-1-2-3-1105", "distinguished_name": "CN=alice,OU=Staff,DC=corp,DC=local", "kind": "user"},
                {"name": "WS01$", "sid": "S-1-5-21-1-2-3-1106", "distinguished_name": "CN=WS01,OU=Devices,OU=Staff,DC=corp,DC=local", "kind": "computer"},
                {"name": "Ops", "sid": "S-1-5-21-1-2-3-1200", "distinguished_name": "CN=Ops,OU=Groups,DC=corp,DC=local", "kind": "group",
                 "object_guid": "11111111-2222-3333-4444-555555555555",
                 "members": ["CN=alice,OU=Staff,DC=corp,DC=local", "S-1-5-21-1-2-3-9999"]}
            ],
            "ous": [
                {"distinguished_name": "OU=Staff,DC=corp,DC=local", "linked_gpos": [GPO_ID]},
                {"distinguished_name": "OU=Lab,DC=corp,DC=local", "disabled_links": [GPO_ID]}
            ],
            "gpos": [
                {"id": GPO_ID, "display_name": "Default Domain Controllers Policy", "version": 3,
                 "descriptor": {"owner": "S-1-5-32-544", "dacl": [{"kind": "allow", "sid": "S-1-5-11", "mask": 32}]},
                 "store_acl": [{"sid": "S-1-5-11", "mask": 2}]}
            ]
        }))
        .unwrap();
        SnapshotDirectory::new(snapshot).unwrap()
    }

    #[test]
    fn test_descriptor_encoded_for_parser() {
        let dir = snapshot();
        let container = dir.lookup_policy_container(GPO_ID).unwrap().unwrap();
        let sd = parse_security_descriptor(&container.security_descriptor.unwrap()).unwrap();
        assert_eq!(sd.dacl.len(), 1);
        assert_eq!(sd.dacl[0].trustee_sid, "S-1-5-11");
        assert_eq!(container.version, Some(3));
    }

    #[test]
    fn test_ou_children_include_nested() {
        let dir = snapshot();
        let children = dir.lookup_ou_children("OU=Staff,DC=corp,DC=local").unwrap();
        assert_eq!(children.len(), 2);
        assert!(children.iter().any(|c| c.kind == ObjectKind::Computer));
    }

    #[test]
    fn test_disabled_links_are_opt_in() {
        let dir = snapshot();
        assert_eq!(dir.lookup_linked_ous(GPO_ID).unwrap().len(), 1);
        let dir = dir.with_disabled_links(true);
        assert_eq!(
            dir.lookup_linked_ous("6ac1786c-016f-11d2-945f-00c04fb984f9").unwrap().len(),
            2
        );
    }

    #[test]
    fn test_resolve_group_members() {
        let dir = snapshot();
        let group = dir
            .resolve_group(&GroupIdentifier::Guid("11111111-2222-3333-4444-555555555555".to_string()))
            .unwrap()
            .unwrap();
        assert_eq!(group.members.len(), 2);
        assert_eq!(group.members[0].sid.as_deref(), Some("S-1-5-21-1-2-3-1105"));
        assert!(group.members[1].sid.is_none());
        assert_eq!(dir.group_lookup_count(), 1);

        // A user is not a group
        assert!(dir
            .resolve_group(&GroupIdentifier::Sid("S-1-5-21-1-2-3-1105".to_string()))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_store_paths() {
        let dir = snapshot();
        assert!(dir.path_exists(&dir.policy_path(GPO_ID)));
        assert!(dir.path_exists(&dir.marker_path(GPO_ID)));
        assert!(!dir.path_exists("snapshot://corp.local/Policies/{00000000-0000-0000-0000-000000000000}"));
        let acl = dir.get_acl(&dir.policy_path(GPO_ID)).unwrap();
        assert_eq!(acl[0].access_mask, 2);
    }

    #[test]
    fn test_unreachable_root() {
        let snapshot: DomainSnapshot =
            serde_json::from_value(json!({"domain": "corp.local", "unreachable": true})).unwrap();
        let dir = SnapshotDirectory::new(snapshot).unwrap();
        assert!(matches!(dir.verify_root(), Err(AuditError::Connectivity(_))));
        assert!(matches!(
            dir.list_policy_directories(),
            Err(AuditError::Connectivity(_))
        ));
    }

    #[test]
    fn test_invalid_descriptor_fails_only_its_policy() {
        let other = "{22222222-2222-2222-2222-222222222222}";
        let snapshot: DomainSnapshot = serde_json::from_value(json!({
            "domain": "corp.local",
            "gpos": [
                {"id": GPO_ID, "raw_descriptor_b64": "%%%"},
                {"id": other, "descriptor": {"dacl": [{"kind": "allow", "sid": "S-1-5-11", "mask": 32}]}}
            ]
        }))
        .unwrap();
        let dir = SnapshotDirectory::new(snapshot).unwrap();
        assert!(matches!(
            dir.lookup_policy_container(GPO_ID),
            Err(AuditError::Configuration(_))
        ));
        assert!(dir
            .lookup_policy_container(other)
            .unwrap()
            .unwrap()
            .security_descriptor
            .is_some());
    }
}
