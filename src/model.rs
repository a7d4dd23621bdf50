//! Directory object and principal model
//!
//! Passive value types. Classification (user vs computer, domain vs common
//! principal) is decided once when a value is constructed.

use crate::common_types::{
    is_common_principal_name, is_common_sid, is_sid_literal, sam_account_types,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Account kinds the audit tracks under an OU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    User,
    Computer,
}

impl ObjectKind {
    /// Classify from `sAMAccountType`; any other account type is not tracked
    pub fn from_sam_account_type(value: u32) -> Option<Self> {
        match value {
            sam_account_types::NORMAL_USER_ACCOUNT => Some(ObjectKind::User),
            sam_account_types::MACHINE_ACCOUNT => Some(ObjectKind::Computer),
            _ => None,
        }
    }
}

/// A resolved user or computer account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryObject {
    pub kind: ObjectKind,
    pub distinguished_name: String,
    pub sid: String,
    pub name: String,
}

impl DirectoryObject {
    pub fn new(
        kind: ObjectKind,
        distinguished_name: impl Into<String>,
        sid: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            distinguished_name: distinguished_name.into(),
            sid: sid.into(),
            name: name.into(),
        }
    }

    /// Identity used for deduplication (case-insensitive DN)
    pub fn identity_key(&self) -> String {
        self.distinguished_name.to_lowercase()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalClass {
    /// A specific domain account or group
    Domain,
    /// Everyone / Authenticated Users: satisfied by any domain-joined object
    Common,
}

/// A trustee named in an ACL or a security filter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityPrincipal {
    /// SID literal when one is known, otherwise the bare name
    pub identifier: String,
    pub display_name: String,
    pub class: PrincipalClass,
}

impl SecurityPrincipal {
    /// Principal taken from an ACE: the SID is authoritative for classification
    pub fn from_sid(sid: impl Into<String>, display_name: impl Into<String>) -> Self {
        let sid = sid.into();
        let class = if is_common_sid(&sid) {
            PrincipalClass::Common
        } else {
            PrincipalClass::Domain
        };
        Self {
            identifier: sid,
            display_name: display_name.into(),
            class,
        }
    }

    /// Principal known only by name (or by a SID literal typed as a name)
    pub fn from_name(name: impl Into<String>) -> Self {
        let name = name.into();
        if is_sid_literal(&name) {
            return Self::from_sid(name.clone(), name);
        }
        let class = if is_common_principal_name(&name) {
            PrincipalClass::Common
        } else {
            PrincipalClass::Domain
        };
        Self {
            identifier: name.clone(),
            display_name: name,
            class,
        }
    }

    pub fn is_common(&self) -> bool {
        self.class == PrincipalClass::Common
    }

    /// The SID, if this principal was built from one
    pub fn sid(&self) -> Option<&str> {
        is_sid_literal(&self.identifier).then_some(self.identifier.as_str())
    }
}

/// An OU with the accounts directly or transitively beneath it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganizationalUnit {
    pub distinguished_name: String,
    pub children: Vec<DirectoryObject>,
}

/// Attributes of a `groupPolicyContainer` object as returned by the directory
#[derive(Debug, Clone, Default)]
pub struct PolicyContainer {
    pub display_name: Option<String>,
    pub security_descriptor: Option<Vec<u8>>,
    pub version: Option<u32>,
}

/// Subject (store path or container id) and the principals able to write it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WritePermissionResult {
    pub subject: String,
    pub principals: Vec<SecurityPrincipal>,
}

impl WritePermissionResult {
    pub fn empty(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            principals: Vec::new(),
        }
    }

    /// Add a principal unless one with the same identifier is already present
    pub fn insert(&mut self, principal: SecurityPrincipal) {
        if !self
            .principals
            .iter()
            .any(|p| p.identifier.eq_ignore_ascii_case(&principal.identifier))
        {
            self.principals.push(principal);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.principals.is_empty()
    }
}

/// How a group is named when asking the directory to resolve it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GroupIdentifier {
    Guid(String),
    Sid(String),
    DistinguishedName(String),
}

impl GroupIdentifier {
    /// Classify an identifier string: GUID first, then SID, then DN
    pub fn parse(value: &str) -> Option<Self> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return None;
        }
        let unbraced = trimmed.trim_start_matches('{').trim_end_matches('}');
        if let Ok(guid) = Uuid::parse_str(unbraced) {
            return Some(GroupIdentifier::Guid(guid.hyphenated().to_string()));
        }
        if is_sid_literal(trimmed) {
            return Some(GroupIdentifier::Sid(trimmed.to_uppercase()));
        }
        if trimmed.contains('=') {
            return Some(GroupIdentifier::DistinguishedName(trimmed.to_string()));
        }
        None
    }

    /// Normalized key for caching
    pub fn cache_key(&self) -> String {
        match self {
            GroupIdentifier::Guid(g) => format!("guid:{}", g.to_lowercase()),
            GroupIdentifier::Sid(s) => format!("sid:{}", s.to_uppercase()),
            GroupIdentifier::DistinguishedName(dn) => format!("dn:{}", dn.to_lowercase()),
        }
    }
}

/// Direct member of a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRef {
    pub distinguished_name: String,
    pub sid: Option<String>,
    pub is_group: bool,
}

/// A resolved group and its direct members
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupEntry {
    pub distinguished_name: String,
    pub sid: String,
    pub members: Vec<MemberRef>,
}

/// One entry of a filesystem ACL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAce {
    pub trustee_sid: String,
    pub access_mask: u32,
    pub allow: bool,
}
