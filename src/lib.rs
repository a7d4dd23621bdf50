//! Group Policy write-primitive audit
//!
//! Finds Group Policy Objects that a given identity can modify in both the
//! directory and the policy file share while the policy is linked to live
//! accounts, and lists which of those accounts the policy reaches.

pub mod common_types;
pub mod config;
pub mod connection_pool;
pub mod credentials;
pub mod directory;
pub mod errors;
pub mod file_acl;
pub mod gpo_audit;
pub mod gpo_discovery;
pub mod ldap_directory;
mod ldap_helpers;
pub mod ldap_timeout;
pub mod ldap_utils;
pub mod logging;
pub mod membership;
pub mod model;
pub mod parallel_executor;
pub mod policy_store;
pub mod report;
pub mod security_descriptor;
pub mod snapshot;
pub mod target_set;

pub use config::AuditConfig;
pub use errors::{AuditError, AuditResult};
pub use gpo_audit::{ExploitabilityEngine, GpoAnalyzer, Subjects};
pub use report::AuditReport;
