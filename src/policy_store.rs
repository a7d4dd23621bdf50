//! Policy content store (SYSVOL)
//!
//! Lists policy directories under `\\<domain>\SYSVOL\<domain>\Policies` and
//! reads filesystem ACLs. Directory listing uses `std::fs`; ACL retrieval goes
//! through the native security API and is unsupported on other platforms.

use crate::errors::{AuditError, AuditResult};
use crate::model::FileAce;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Name of the marker file every policy directory carries
pub const POLICY_MARKER_FILE: &str = "gpt.ini";

pub trait PolicyStore: Send + Sync {
    /// Display form of the policies root
    fn policies_root(&self) -> String;

    /// Policy directory names (`{GUID}` form). A missing root is a connectivity error.
    fn list_policy_directories(&self) -> AuditResult<Vec<String>>;

    fn policy_path(&self, id: &str) -> String;

    fn marker_path(&self, id: &str) -> String {
        Path::new(&self.policy_path(id))
            .join(POLICY_MARKER_FILE)
            .to_string_lossy()
            .into_owned()
    }

    fn path_exists(&self, path: &str) -> bool;

    /// Discretionary ACL of a file or directory
    fn get_acl(&self, path: &str) -> AuditResult<Vec<FileAce>>;
}

/// Policy store backed by a mounted SYSVOL share or a local copy of one
#[derive(Debug, Clone)]
pub struct SysvolStore {
    root: PathBuf,
}

impl SysvolStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `\\<domain>\SYSVOL\<domain>\Policies`
    pub fn for_domain(domain: &str) -> Self {
        Self::new(format!(r"\\{0}\SYSVOL\{0}\Policies", domain))
    }
}

impl PolicyStore for SysvolStore {
    fn policies_root(&self) -> String {
        self.root.to_string_lossy().into_owned()
    }

    fn list_policy_directories(&self) -> AuditResult<Vec<String>> {
        let entries = std::fs::read_dir(&self.root).map_err(|e| {
            AuditError::Connectivity(format!(
                "Cannot list policies root {}: {}",
                self.root.display(),
                e
            ))
        })?;

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            // PolicyDefinitions and other non-GPO folders share the root
            if name.starts_with('{') && name.ends_with('}') {
                ids.push(name);
            } else {
                debug!("Skipping non-policy directory {}", name);
            }
        }
        ids.sort_by_key(|id| id.to_lowercase());

        info!("Found {} policy directories under {}", ids.len(), self.root.display());
        Ok(ids)
    }

    fn policy_path(&self, id: &str) -> String {
        self.root.join(id).to_string_lossy().into_owned()
    }

    fn path_exists(&self, path: &str) -> bool {
        Path::new(path).exists()
    }

    fn get_acl(&self, path: &str) -> AuditResult<Vec<FileAce>> {
        read_file_acl(path)
    }
}

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use crate::ldap_utils::parse_security_descriptor;
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::{GetLastError, ERROR_ACCESS_DENIED, ERROR_FILE_NOT_FOUND, ERROR_PATH_NOT_FOUND};
    use windows::Win32::Security::{GetFileSecurityW, DACL_SECURITY_INFORMATION, PSECURITY_DESCRIPTOR};

    /// Read the DACL through GetFileSecurityW and decode the self-relative descriptor
    pub fn read_dacl(path: &str) -> AuditResult<Vec<FileAce>> {
        let wide: Vec<u16> = path.encode_utf16().chain(std::iter::once(0)).collect();

        unsafe {
            // First call to get required buffer size
            let mut needed: u32 = 0;
            let _ = GetFileSecurityW(
                PCWSTR(wide.as_ptr()),
                DACL_SECURITY_INFORMATION.0,
                PSECURITY_DESCRIPTOR(std::ptr::null_mut()),
                0,
                &mut needed,
            );

            if needed == 0 {
                return Err(map_last_error(path));
            }

            let mut buffer: Vec<u8> = vec![0; needed as usize];
            let ok = GetFileSecurityW(
                PCWSTR(wide.as_ptr()),
                DACL_SECURITY_INFORMATION.0,
                PSECURITY_DESCRIPTOR(buffer.as_mut_ptr() as *mut _),
                needed,
                &mut needed,
            );

            if !ok.as_bool() {
                return Err(map_last_error(path));
            }

            let sd = parse_security_descriptor(&buffer)?;
            Ok(sd
                .dacl
                .into_iter()
                .filter(|ace| ace.is_allow() || ace.is_deny())
                .map(|ace| FileAce {
                    allow: ace.is_allow(),
                    trustee_sid: ace.trustee_sid,
                    access_mask: ace.access_mask,
                })
                .collect())
        }
    }

    fn map_last_error(path: &str) -> AuditError {
        let err = unsafe { GetLastError() };
        if err == ERROR_ACCESS_DENIED {
            AuditError::AccessDenied(format!("Cannot read ACL of {}", path))
        } else if err == ERROR_FILE_NOT_FOUND || err == ERROR_PATH_NOT_FOUND {
            AuditError::NotFound(format!("{} does not exist", path))
        } else {
            AuditError::Io(std::io::Error::from_raw_os_error(err.0 as i32))
        }
    }
}

#[cfg(windows)]
fn read_file_acl(path: &str) -> AuditResult<Vec<FileAce>> {
    windows_impl::read_dacl(path)
}

#[cfg(not(windows))]
fn read_file_acl(path: &str) -> AuditResult<Vec<FileAce>> {
    Err(AuditError::Unsupported(format!(
        "Reading the ACL of {} requires Windows",
        path
    )))
}
