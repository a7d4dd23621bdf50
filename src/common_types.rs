//! Common Types Module
//!
//! Well-known identifiers, access-right bits and small DN/SID helpers shared
//! by the evaluators, the membership resolver and the directory adapters.

/// Well-known security identifiers
pub mod well_known_sids {
    pub const EVERYONE: &str = "S-1-1-0";
    pub const AUTHENTICATED_USERS: &str = "S-1-5-11";
    pub const SYSTEM: &str = "S-1-5-18";
    pub const ENTERPRISE_DOMAIN_CONTROLLERS: &str = "S-1-5-9";
    pub const CREATOR_OWNER: &str = "S-1-3-0";
    pub const BUILTIN_ADMINISTRATORS: &str = "S-1-5-32-544";

    /// Relative identifier of the built-in Domain Users group
    pub const DOMAIN_USERS_RID: u32 = 513;
    /// Relative identifier of the built-in Domain Computers group
    pub const DOMAIN_COMPUTERS_RID: u32 = 515;
}

/// Directory access rights (MS-ADTS 5.1.3.2)
pub mod ds_rights {
    pub const WRITE_PROPERTY: u32 = 0x0000_0020;
}

/// Filesystem access rights (MS-DTYP 2.4.3, file-specific bits)
pub mod file_rights {
    /// FILE_WRITE_DATA on files, FILE_ADD_FILE on directories
    pub const WRITE_DATA: u32 = 0x0000_0002;
}

/// Apply-Group-Policy extended right
pub const APPLY_GROUP_POLICY_RIGHT: &str = "edacfd8f-ffb3-11d1-b41d-00a0c968f939";

/// sAMAccountType values that identify accounts the audit cares about
pub mod sam_account_types {
    pub const NORMAL_USER_ACCOUNT: u32 = 0x3000_0000;
    pub const MACHINE_ACCOUNT: u32 = 0x3000_0001;
}

/// Names the common principals are commonly rendered as
const COMMON_PRINCIPAL_NAMES: &[&str] = &["Everyone", "Authenticated Users"];

/// Returns true if `value` has the shape of a SID literal (`S-1-5-21-...`)
pub fn is_sid_literal(value: &str) -> bool {
    let mut parts = value.split('-');
    if !matches!(parts.next(), Some(p) if p.eq_ignore_ascii_case("S")) {
        return false;
    }
    let rest: Vec<&str> = parts.collect();
    rest.len() >= 2
        && rest
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

/// Returns true for the Everyone and Authenticated Users SIDs
pub fn is_common_sid(sid: &str) -> bool {
    sid.eq_ignore_ascii_case(well_known_sids::EVERYONE)
        || sid.eq_ignore_ascii_case(well_known_sids::AUTHENTICATED_USERS)
}

/// Name-based fallback for principals known only by their display name
pub fn is_common_principal_name(name: &str) -> bool {
    let bare = name
        .rsplit_once('\\')
        .map(|(_, account)| account)
        .unwrap_or(name)
        .trim();
    COMMON_PRINCIPAL_NAMES
        .iter()
        .any(|common| bare.eq_ignore_ascii_case(common))
}

/// If `sid` is a domain-relative SID (`S-1-5-21-a-b-c-RID`), return the RID
pub fn domain_relative_rid(sid: &str) -> Option<u32> {
    if !is_sid_literal(sid) {
        return None;
    }
    let parts: Vec<&str> = sid.split('-').collect();
    // S, 1, 5, 21, a, b, c, rid
    if parts.len() != 8 || parts[1] != "1" || parts[2] != "5" || parts[3] != "21" {
        return None;
    }
    parts[7].parse().ok()
}

/// Convert a DNS domain name to an LDAP base DN
/// e.g., "corp.example.com" -> "DC=corp,DC=example,DC=com"
pub fn domain_to_base_dn(domain: &str) -> String {
    domain
        .split('.')
        .map(|part| format!("DC={}", part))
        .collect::<Vec<_>>()
        .join(",")
}

/// True if `dn` names an object strictly below `container_dn`
pub fn dn_is_under(dn: &str, container_dn: &str) -> bool {
    let dn = dn.to_ascii_lowercase();
    let suffix = format!(",{}", container_dn.to_ascii_lowercase());
    dn.ends_with(&suffix)
}
