//! GPO discovery
//!
//! Builds the immutable [`GpoSource`] for one policy directory: checks the
//! marker file, reads the policy container and enumerates linked OUs with
//! their accounts. A policy with missing pieces is a `Configuration` error
//! and gets skipped; it is never analyzed on partial data.

use crate::directory::DirectoryService;
use crate::errors::{AuditError, AuditResult};
use crate::model::{DirectoryObject, OrganizationalUnit, PolicyContainer};
use crate::policy_store::{PolicyStore, POLICY_MARKER_FILE};
use std::sync::Arc;
use tracing::{debug, warn};

/// Everything discovery learns about one policy. Read-only once built.
#[derive(Debug, Clone)]
pub struct GpoSource {
    pub id: String,
    pub display_name: String,
    pub store_path: String,
    pub version: u32,
    /// Raw self-relative `nTSecurityDescriptor` of the container
    pub descriptor: Vec<u8>,
    pub linked_ous: Vec<OrganizationalUnit>,
}

impl GpoSource {
    /// Accounts under every linked OU, in link order (may repeat across nested OUs)
    pub fn linked_objects(&self) -> Vec<DirectoryObject> {
        self.linked_ous
            .iter()
            .flat_map(|ou| ou.children.iter().cloned())
            .collect()
    }
}

pub struct GpoDiscovery {
    directory: Arc<dyn DirectoryService>,
    store: Arc<dyn PolicyStore>,
    transient_retries: u32,
}

impl GpoDiscovery {
    pub fn new(
        directory: Arc<dyn DirectoryService>,
        store: Arc<dyn PolicyStore>,
        transient_retries: u32,
    ) -> Self {
        Self {
            directory,
            store,
            transient_retries,
        }
    }

    pub fn discover(&self, id: &str) -> AuditResult<GpoSource> {
        let marker = self.store.marker_path(id);
        if !self.store.path_exists(&marker) {
            return Err(AuditError::Configuration(format!(
                "{} has no {} in its policy directory",
                id, POLICY_MARKER_FILE
            )));
        }

        let container = self.lookup_container_with_retry(id)?.ok_or_else(|| {
            AuditError::Configuration(format!("{} has no policy container in the directory", id))
        })?;

        let display_name = container.display_name.ok_or_else(|| {
            AuditError::Configuration(format!("{} container has no displayName", id))
        })?;
        let descriptor = container.security_descriptor.ok_or_else(|| {
            AuditError::Configuration(format!("{} container has no readable security descriptor", id))
        })?;
        let version = container.version.ok_or_else(|| {
            AuditError::Configuration(format!("{} container has no versionNumber", id))
        })?;

        let mut linked_ous = Vec::new();
        for ou_dn in self.directory.lookup_linked_ous(id)? {
            let children = self.directory.lookup_ou_children(&ou_dn)?;
            debug!("{} linked to {} ({} accounts)", id, ou_dn, children.len());
            linked_ous.push(OrganizationalUnit {
                distinguished_name: ou_dn,
                children,
            });
        }

        Ok(GpoSource {
            id: id.to_string(),
            display_name,
            store_path: self.store.policy_path(id),
            version,
            descriptor,
            linked_ous,
        })
    }

    fn lookup_container_with_retry(&self, id: &str) -> AuditResult<Option<PolicyContainer>> {
        let mut attempt = 0;
        loop {
            match self.directory.lookup_policy_container(id) {
                Err(e) if e.is_transient() && attempt < self.transient_retries => {
                    attempt += 1;
                    warn!(
                        "Container lookup for {} failed transiently ({}), retry {}/{}",
                        id, e, attempt, self.transient_retries
                    );
                }
                other => return other,
            }
        }
    }
}
