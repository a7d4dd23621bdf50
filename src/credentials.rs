//! Credential context
//!
//! Supplies the name of the identity the audit acts as. The engine only reads
//! the name; it never switches identity itself.

use crate::errors::{AuditError, AuditResult};
use std::fmt;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub trait CredentialContext: Send + Sync {
    /// Acting identity as `DOMAIN\user`, `user@domain` or a bare account name
    fn identity_name(&self) -> AuditResult<String>;
}

/// Reduce `DOMAIN\user` or `user@domain` to the bare account name
pub fn account_name_from_identity(identity: &str) -> &str {
    let identity = identity.trim();
    if let Some((_, account)) = identity.rsplit_once('\\') {
        return account;
    }
    if let Some((account, _)) = identity.split_once('@') {
        return account;
    }
    identity
}

/// A string that zeros its contents when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecureString {
    inner: String,
}

impl SecureString {
    pub fn new(s: String) -> Self {
        Self { inner: s }
    }

    /// Temporarily exposes the secret. Do not store the returned reference.
    pub fn expose_secret(&self) -> &str {
        &self.inner
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl fmt::Debug for SecureString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecureString([REDACTED])")
    }
}

/// Alternate credentials supplied on the command line
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ExplicitCredentials {
    username: String,
    password: SecureString,
}

impl ExplicitCredentials {
    pub fn new(username: String, password: String) -> Self {
        Self {
            username,
            password: SecureString::new(password),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Use only for the bind call.
    pub fn password(&self) -> &str {
        self.password.expose_secret()
    }
}

impl fmt::Debug for ExplicitCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExplicitCredentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

impl CredentialContext for ExplicitCredentials {
    fn identity_name(&self) -> AuditResult<String> {
        if self.username.trim().is_empty() {
            return Err(AuditError::Configuration(
                "Alternate credentials require a username".to_string(),
            ));
        }
        Ok(self.username.clone())
    }
}

/// A simulated identity, for offline analysis "as if" a given account ran it
#[derive(Debug, Clone)]
pub struct FixedIdentity(pub String);

impl CredentialContext for FixedIdentity {
    fn identity_name(&self) -> AuditResult<String> {
        Ok(self.0.clone())
    }
}

/// The user running this process
#[derive(Debug, Clone, Default)]
pub struct CurrentUser;

impl CredentialContext for CurrentUser {
    fn identity_name(&self) -> AuditResult<String> {
        current_user_name()
    }
}

#[cfg(windows)]
fn current_user_name() -> AuditResult<String> {
    use windows::core::PWSTR;
    use windows::Win32::Security::Authentication::Identity::{GetUserNameExW, NameSamCompatible};

    unsafe {
        // First call to get required buffer size
        let mut size: u32 = 0;
        let _ = GetUserNameExW(NameSamCompatible, PWSTR::null(), &mut size);

        if size == 0 {
            return Err(AuditError::Unsupported(
                "Failed to get buffer size for SAM username".to_string(),
            ));
        }

        let mut buffer: Vec<u16> = vec![0; size as usize];
        let result = GetUserNameExW(NameSamCompatible, PWSTR(buffer.as_mut_ptr()), &mut size);

        if result.0 != 0 {
            let username = String::from_utf16_lossy(&buffer[..size as usize]);
            debug!("Current user (SAM): {}", username);
            Ok(username)
        } else {
            Err(AuditError::Unsupported("GetUserNameExW (SAM) failed".to_string()))
        }
    }
}

#[cfg(not(windows))]
fn current_user_name() -> AuditResult<String> {
    let name = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .map_err(|_| AuditError::Unsupported("Cannot determine current user".to_string()))?;
    debug!("Current user (environment): {}", name);
    Ok(name)
}
