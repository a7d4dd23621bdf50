//! LDAP Utilities
//!
//! RFC 4515 filter escaping plus the MS-DTYP binary codecs the audit needs:
//! self-relative security descriptors, ACLs, ACEs, SIDs and GUIDs.
//!
//! Parsing is strict. A descriptor that is truncated, points outside its own
//! buffer or contains an ACE that cannot be decoded is a `Parse` error rather
//! than a partially populated result, so callers can fail closed.

use crate::errors::{AuditError, AuditResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Escapes a string for safe use in an LDAP search filter (RFC 4515).
///
/// The following characters are escaped:
/// - `*` (asterisk) -> `\2a`
/// - `(` (left parenthesis) -> `\28`
/// - `)` (right parenthesis) -> `\29`
/// - `\` (backslash) -> `\5c`
/// - `\0` (NUL) -> `\00`
///
/// # Examples
///
/// ```
/// use gpo_write_audit::ldap_utils::escape_ldap_filter;
///
/// let safe = escape_ldap_filter("admin*");
/// assert_eq!(safe, "admin\\2a");
/// ```
pub fn escape_ldap_filter(input: &str) -> String {
    input.chars().fold(String::new(), |mut acc, c| {
        match c {
            '*' => acc.push_str("\\2a"),
            '(' => acc.push_str("\\28"),
            ')' => acc.push_str("\\29"),
            '\\' => acc.push_str("\\5c"),
            '\0' => acc.push_str("\\00"),
            _ => acc.push(c),
        }
        acc
    })
}

/// Escapes raw bytes for an LDAP filter assertion value (`\xx` per byte).
/// Used to match binary attributes such as `objectGUID`.
pub fn escape_binary_filter(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("\\{:02x}", b)).collect()
}

// ============================================================================
// Security Descriptor Parsing (MS-DTYP)
// ============================================================================

/// SE_DACL_PRESENT control bit
pub const SE_DACL_PRESENT: u16 = 0x0004;
/// SE_SELF_RELATIVE control bit
pub const SE_SELF_RELATIVE: u16 = 0x8000;

const SD_HEADER_LEN: usize = 20;
const ACL_HEADER_LEN: usize = 8;
const ACL_REVISION: u8 = 2;
const ACL_REVISION_DS: u8 = 4;

/// Object ACE flag: ObjectType GUID present
const ACE_OBJECT_TYPE_PRESENT: u32 = 0x1;
/// Object ACE flag: InheritedObjectType GUID present
const ACE_INHERITED_OBJECT_TYPE_PRESENT: u32 = 0x2;

/// Represents a Windows Security Descriptor (MS-DTYP 2.4.6)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityDescriptor {
    pub revision: u8,
    pub control_flags: u16,
    pub owner_sid: Option<String>,
    pub group_sid: Option<String>,
    /// Discretionary ACL in stored order; empty when no DACL is present
    pub dacl: Vec<AceEntry>,
}

/// Represents an Access Control Entry (ACE) in a DACL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AceEntry {
    pub ace_type: u8,
    pub ace_flags: u8,
    pub access_mask: u32,
    pub trustee_sid: String,
    pub object_guid: Option<String>,
    pub inherited_object_guid: Option<String>,
}

impl AceEntry {
    /// Plain or object-scoped allow entry
    pub fn is_allow(&self) -> bool {
        matches!(
            self.ace_type,
            ace_types::ACCESS_ALLOWED | ace_types::ACCESS_ALLOWED_OBJECT
        )
    }

    /// Plain or object-scoped deny entry
    pub fn is_deny(&self) -> bool {
        matches!(
            self.ace_type,
            ace_types::ACCESS_DENIED | ace_types::ACCESS_DENIED_OBJECT
        )
    }

    pub fn is_object_ace(&self) -> bool {
        ace_types::is_object_type(self.ace_type)
    }
}

/// ACE Type constants (MS-DTYP 2.4.4.1)
pub mod ace_types {
    pub const ACCESS_ALLOWED: u8 = 0x00;
    pub const ACCESS_DENIED: u8 = 0x01;
    pub const SYSTEM_AUDIT: u8 = 0x02;
    pub const ACCESS_ALLOWED_OBJECT: u8 = 0x05;
    pub const ACCESS_DENIED_OBJECT: u8 = 0x06;
    pub const SYSTEM_AUDIT_OBJECT: u8 = 0x07;
    pub const SYSTEM_ALARM_OBJECT: u8 = 0x08;
    pub const ACCESS_ALLOWED_CALLBACK_OBJECT: u8 = 0x0B;
    pub const ACCESS_DENIED_CALLBACK_OBJECT: u8 = 0x0C;
    pub const SYSTEM_AUDIT_CALLBACK_OBJECT: u8 = 0x0F;
    pub const SYSTEM_ALARM_CALLBACK_OBJECT: u8 = 0x10;

    /// Types whose body carries object flags and optional GUIDs before the SID
    pub fn is_object_type(ace_type: u8) -> bool {
        matches!(
            ace_type,
            ACCESS_ALLOWED_OBJECT
                | ACCESS_DENIED_OBJECT
                | SYSTEM_AUDIT_OBJECT
                | SYSTEM_ALARM_OBJECT
                | ACCESS_ALLOWED_CALLBACK_OBJECT
                | ACCESS_DENIED_CALLBACK_OBJECT
                | SYSTEM_AUDIT_CALLBACK_OBJECT
                | SYSTEM_ALARM_CALLBACK_OBJECT
        )
    }
}

fn read_u16(bytes: &[u8], offset: usize) -> AuditResult<u16> {
    bytes
        .get(offset..offset + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or_else(|| AuditError::Parse(format!("Truncated data reading u16 at {}", offset)))
}

fn read_u32(bytes: &[u8], offset: usize) -> AuditResult<u32> {
    bytes
        .get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| AuditError::Parse(format!("Truncated data reading u32 at {}", offset)))
}

/// Parse a Windows Security Descriptor from binary format
///
/// # Format (MS-DTYP 2.4.6):
/// ```text
/// Offset  Size  Field
/// 0       1     Revision
/// 1       1     Sbz1 (padding)
/// 2       2     Control flags
/// 4       4     Owner SID offset
/// 8       4     Group SID offset
/// 12      4     SACL offset
/// 16      4     DACL offset
/// ```
///
/// The SACL is not decoded; the audit only reads the discretionary ACL.
pub fn parse_security_descriptor(bytes: &[u8]) -> AuditResult<SecurityDescriptor> {
    if bytes.len() < SD_HEADER_LEN {
        return Err(AuditError::Parse(format!(
            "Security descriptor too short ({} bytes, minimum {})",
            bytes.len(),
            SD_HEADER_LEN
        )));
    }

    let revision = bytes[0];
    if revision != 1 {
        return Err(AuditError::Parse(format!(
            "Unsupported security descriptor revision {}",
            revision
        )));
    }
    let control_flags = read_u16(bytes, 2)?;
    let owner_offset = read_u32(bytes, 4)? as usize;
    let group_offset = read_u32(bytes, 8)? as usize;
    let dacl_offset = read_u32(bytes, 16)? as usize;

    let owner_sid = parse_optional_sid(bytes, owner_offset, "owner")?;
    let group_sid = parse_optional_sid(bytes, group_offset, "group")?;

    let dacl = if dacl_offset == 0 {
        Vec::new()
    } else {
        let acl = bytes.get(dacl_offset..).filter(|b| !b.is_empty()).ok_or_else(|| {
            AuditError::Parse(format!(
                "DACL offset {} outside descriptor of {} bytes",
                dacl_offset,
                bytes.len()
            ))
        })?;
        parse_acl(acl)?
    };

    Ok(SecurityDescriptor {
        revision,
        control_flags,
        owner_sid,
        group_sid,
        dacl,
    })
}

fn parse_optional_sid(bytes: &[u8], offset: usize, what: &str) -> AuditResult<Option<String>> {
    if offset == 0 {
        return Ok(None);
    }
    let sid_bytes = bytes.get(offset..).filter(|b| !b.is_empty()).ok_or_else(|| {
        AuditError::Parse(format!("{} SID offset {} outside descriptor", what, offset))
    })?;
    sid_to_string(sid_bytes).map(Some)
}

/// Parse an Access Control List (ACL) from binary format
///
/// # Format (MS-DTYP 2.4.5):
/// ```text
/// Offset  Size  Field
/// 0       1     Revision
/// 1       1     Sbz1 (padding)
/// 2       2     ACL size
/// 4       2     ACE count
/// 6       2     Sbz2 (padding)
/// 8       ...   ACE entries
/// ```
fn parse_acl(bytes: &[u8]) -> AuditResult<Vec<AceEntry>> {
    if bytes.len() < ACL_HEADER_LEN {
        return Err(AuditError::Parse(format!(
            "ACL too short ({} bytes, minimum {})",
            bytes.len(),
            ACL_HEADER_LEN
        )));
    }

    let acl_size = read_u16(bytes, 2)? as usize;
    if acl_size < ACL_HEADER_LEN || acl_size > bytes.len() {
        return Err(AuditError::Parse(format!(
            "ACL size {} inconsistent with {} available bytes",
            acl_size,
            bytes.len()
        )));
    }
    let bytes = &bytes[..acl_size];

    let ace_count = read_u16(bytes, 4)? as usize;
    let mut aces = Vec::with_capacity(ace_count);
    let mut offset = ACL_HEADER_LEN;

    for index in 0..ace_count {
        if offset + 4 > bytes.len() {
            return Err(AuditError::Parse(format!(
                "ACE {} of {} starts past end of ACL",
                index, ace_count
            )));
        }

        let ace_type = bytes[offset];
        let ace_flags = bytes[offset + 1];
        let ace_size = read_u16(bytes, offset + 2)? as usize;

        if ace_size < 4 || offset + ace_size > bytes.len() {
            return Err(AuditError::Parse(format!(
                "ACE {} declares size {} beyond ACL bounds",
                index, ace_size
            )));
        }

        let ace_data = &bytes[offset..offset + ace_size];
        aces.push(parse_ace(ace_type, ace_flags, ace_data)?);
        offset += ace_size;
    }

    Ok(aces)
}

/// Parse a single ACE from binary format
fn parse_ace(ace_type: u8, ace_flags: u8, data: &[u8]) -> AuditResult<AceEntry> {
    // type(1) + flags(1) + size(2) + access_mask(4) + SID(>= 8)
    if data.len() < 16 {
        return Err(AuditError::Parse(format!(
            "ACE of type 0x{:02x} too short ({} bytes)",
            ace_type,
            data.len()
        )));
    }

    let access_mask = read_u32(data, 4)?;

    let (trustee_sid, object_guid, inherited_object_guid) = if ace_types::is_object_type(ace_type)
    {
        // Object ACE: header(8) + flags(4) + [object_guid(16)] + [inherited_guid(16)] + SID
        let object_flags = read_u32(data, 8)?;
        let mut sid_offset = 12;

        let obj_guid = if object_flags & ACE_OBJECT_TYPE_PRESENT != 0 {
            let guid = guid_to_string(data.get(sid_offset..sid_offset + 16).ok_or_else(|| {
                AuditError::Parse("Object ACE truncated in object type GUID".to_string())
            })?)?;
            sid_offset += 16;
            Some(guid)
        } else {
            None
        };

        let inh_guid = if object_flags & ACE_INHERITED_OBJECT_TYPE_PRESENT != 0 {
            let guid = guid_to_string(data.get(sid_offset..sid_offset + 16).ok_or_else(|| {
                AuditError::Parse("Object ACE truncated in inherited type GUID".to_string())
            })?)?;
            sid_offset += 16;
            Some(guid)
        } else {
            None
        };

        let sid_bytes = data
            .get(sid_offset..)
            .ok_or_else(|| AuditError::Parse("Object ACE has no room for SID".to_string()))?;
        (sid_to_string(sid_bytes)?, obj_guid, inh_guid)
    } else {
        (sid_to_string(&data[8..])?, None, None)
    };

    Ok(AceEntry {
        ace_type,
        ace_flags,
        access_mask,
        trustee_sid,
        object_guid,
        inherited_object_guid,
    })
}

/// Convert a binary SID to string format (S-1-5-21-...)
///
/// # Format (MS-DTYP 2.4.2):
/// ```text
/// Offset  Size  Field
/// 0       1     Revision
/// 1       1     SubAuthorityCount
/// 2       6     IdentifierAuthority
/// 8       4*N   SubAuthorities (N = SubAuthorityCount)
/// ```
pub fn sid_to_string(bytes: &[u8]) -> AuditResult<String> {
    if bytes.len() < 8 {
        return Err(AuditError::Parse("SID too short (minimum 8 bytes)".to_string()));
    }

    let revision = bytes[0];
    if revision != 1 {
        return Err(AuditError::Parse(format!("Invalid SID revision {}", revision)));
    }
    let sub_auth_count = bytes[1] as usize;
    if sub_auth_count > 15 {
        return Err(AuditError::Parse(format!(
            "SID declares {} sub-authorities (maximum 15)",
            sub_auth_count
        )));
    }

    if bytes.len() < 8 + (sub_auth_count * 4) {
        return Err(AuditError::Parse(format!(
            "SID data insufficient for {} sub-authorities",
            sub_auth_count
        )));
    }

    // 48-bit identifier authority (big-endian)
    let id_auth = u64::from_be_bytes([
        0, 0, bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]);

    let mut sid = format!("S-{}-{}", revision, id_auth);

    // Sub-authorities (little-endian)
    for i in 0..sub_auth_count {
        let sub_auth = read_u32(bytes, 8 + i * 4)?;
        sid.push_str(&format!("-{}", sub_auth));
    }

    Ok(sid)
}

/// Convert a SID literal back to its binary form
pub fn sid_to_bytes(sid: &str) -> AuditResult<Vec<u8>> {
    let invalid = || AuditError::Parse(format!("Invalid SID literal '{}'", sid));

    let mut parts = sid.split('-');
    match parts.next() {
        Some(p) if p.eq_ignore_ascii_case("S") => {}
        _ => return Err(invalid()),
    }
    let revision: u8 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
    let authority: u64 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
    if authority >= 1 << 48 {
        return Err(invalid());
    }
    let sub_authorities = parts
        .map(|p| p.parse::<u32>().map_err(|_| invalid()))
        .collect::<AuditResult<Vec<u32>>>()?;
    if sub_authorities.len() > 15 {
        return Err(invalid());
    }

    let mut out = Vec::with_capacity(8 + sub_authorities.len() * 4);
    out.push(revision);
    out.push(sub_authorities.len() as u8);
    out.extend_from_slice(&authority.to_be_bytes()[2..]);
    for sub in sub_authorities {
        out.extend_from_slice(&sub.to_le_bytes());
    }
    Ok(out)
}

/// Convert a binary GUID to string format
///
/// # Format (MS-DTYP 2.3.4.2):
/// ```text
/// GUID = Data1(4) + Data2(2) + Data3(2) + Data4(8)
/// Data1..Data3 little-endian, Data4 as stored
/// ```
pub fn guid_to_string(bytes: &[u8]) -> AuditResult<String> {
    let raw: [u8; 16] = bytes
        .get(..16)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| AuditError::Parse("GUID too short (requires 16 bytes)".to_string()))?;
    Ok(Uuid::from_bytes_le(raw).hyphenated().to_string())
}

/// Convert a GUID string (with or without braces) to its 16-byte wire form
pub fn guid_to_bytes(guid: &str) -> AuditResult<[u8; 16]> {
    let trimmed = guid.trim().trim_start_matches('{').trim_end_matches('}');
    Uuid::parse_str(trimmed)
        .map(|u| u.to_bytes_le())
        .map_err(|e| AuditError::Parse(format!("Invalid GUID '{}': {}", guid, e)))
}

// ============================================================================
// Security Descriptor Encoding
// ============================================================================

/// Encode a self-relative security descriptor holding an owner and a DACL.
///
/// Produces the same layout Active Directory returns for `nTSecurityDescriptor`
/// so that offline snapshots flow through the same strict parser.
pub fn encode_security_descriptor(
    owner_sid: Option<&str>,
    dacl: &[AceEntry],
) -> AuditResult<Vec<u8>> {
    let owner = owner_sid.map(sid_to_bytes).transpose()?;

    let mut ace_bytes = Vec::new();
    let mut uses_object_aces = false;
    for ace in dacl {
        uses_object_aces |= ace.is_object_ace();
        ace_bytes.extend(encode_ace(ace)?);
    }

    let acl_size = ACL_HEADER_LEN + ace_bytes.len();
    let acl_size_u16 = u16::try_from(acl_size)
        .map_err(|_| AuditError::Parse(format!("ACL of {} bytes exceeds 64 KiB", acl_size)))?;

    let owner_offset = if owner.is_some() { SD_HEADER_LEN } else { 0 };
    let dacl_offset = SD_HEADER_LEN + owner.as_ref().map_or(0, |o| o.len());

    let mut out = Vec::with_capacity(dacl_offset + acl_size);
    out.push(1);
    out.push(0);
    out.extend_from_slice(&(SE_SELF_RELATIVE | SE_DACL_PRESENT).to_le_bytes());
    out.extend_from_slice(&(owner_offset as u32).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // group
    out.extend_from_slice(&0u32.to_le_bytes()); // sacl
    out.extend_from_slice(&(dacl_offset as u32).to_le_bytes());
    if let Some(owner) = owner {
        out.extend(owner);
    }

    out.push(if uses_object_aces { ACL_REVISION_DS } else { ACL_REVISION });
    out.push(0);
    out.extend_from_slice(&acl_size_u16.to_le_bytes());
    out.extend_from_slice(&(dacl.len() as u16).to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend(ace_bytes);

    Ok(out)
}

fn encode_ace(ace: &AceEntry) -> AuditResult<Vec<u8>> {
    let sid = sid_to_bytes(&ace.trustee_sid)?;

    let mut body = Vec::new();
    body.extend_from_slice(&ace.access_mask.to_le_bytes());
    if ace.is_object_ace() {
        let object = ace.object_guid.as_deref().map(guid_to_bytes).transpose()?;
        let inherited = ace
            .inherited_object_guid
            .as_deref()
            .map(guid_to_bytes)
            .transpose()?;
        let mut flags = 0u32;
        if object.is_some() {
            flags |= ACE_OBJECT_TYPE_PRESENT;
        }
        if inherited.is_some() {
            flags |= ACE_INHERITED_OBJECT_TYPE_PRESENT;
        }
        body.extend_from_slice(&flags.to_le_bytes());
        if let Some(guid) = object {
            body.extend_from_slice(&guid);
        }
        if let Some(guid) = inherited {
            body.extend_from_slice(&guid);
        }
    }
    body.extend(sid);

    let size = u16::try_from(4 + body.len())
        .map_err(|_| AuditError::Parse("ACE exceeds 64 KiB".to_string()))?;
    let mut out = Vec::with_capacity(size as usize);
    out.push(ace.ace_type);
    out.push(ace.ace_flags);
    out.extend_from_slice(&size.to_le_bytes());
    out.extend(body);
    Ok(out)
}
