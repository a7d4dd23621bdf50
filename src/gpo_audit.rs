//! GPO exploitability audit
//!
//! For every policy in the domain, decides whether the acting identity can
//! rewrite it in a way that reaches live accounts. Three gates must all hold:
//!
//! - **store writable**: the policy's content directory grants write-data to
//!   the identity (or to Everyone / Authenticated Users);
//! - **object writable**: the policy container grants write-property likewise;
//! - **linked**: the policy is linked to at least one OU.
//!
//! When they do, the accounts under the linked OUs are split into those the
//! policy's security filter currently targets and those it would reach once
//! the filter is also rewritten.
//!
//! Analysis per policy is a fixed pipeline: discovery produces a
//! [`GpoSource`], independent stages derive writer sets, filter principals and
//! linked accounts from it, and [`GpoAnalysis`] can only be assembled from all
//! of those outputs.

use crate::common_types::APPLY_GROUP_POLICY_RIGHT;
use crate::config::AuditConfig;
use crate::credentials::{account_name_from_identity, CredentialContext};
use crate::directory::DirectoryService;
use crate::errors::{AuditError, AuditResult};
use crate::file_acl::FileAclEvaluator;
use crate::gpo_discovery::{GpoDiscovery, GpoSource};
use crate::ldap_utils::parse_security_descriptor;
use crate::membership::{GroupMembershipResolver, PrincipalMatcher};
use crate::model::{DirectoryObject, SecurityPrincipal, WritePermissionResult};
use crate::parallel_executor::{run_blocking, BoundedExecutor};
use crate::policy_store::PolicyStore;
use crate::report::{
    evaluate_gates, AuditReport, GateVerdict, GpoReportEntry, RunStats, SuppliedPrincipalVerdict,
    UnknownGpo,
};
use crate::security_descriptor::{NameResolver, SecurityDescriptorEvaluator};
use crate::target_set::{partition, TargetPartition};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, info_span, warn};

/// Identities whose write access is being tested
#[derive(Debug, Clone, Default)]
pub struct Subjects {
    /// The identity the audit runs as; `None` when it could not be resolved
    pub acting: Option<DirectoryObject>,
    /// An additional account named by the operator
    pub supplied: Option<DirectoryObject>,
}

struct StoreStage {
    writers: WritePermissionResult,
    warning: Option<String>,
}

struct DescriptorStage {
    writers: WritePermissionResult,
    filters: Vec<SecurityPrincipal>,
}

/// Derived facts for one policy
#[derive(Debug, Clone)]
pub struct GpoAnalysis {
    pub source: GpoSource,
    pub store_writers: WritePermissionResult,
    pub object_writers: WritePermissionResult,
    pub filter_principals: Vec<SecurityPrincipal>,
    pub linked_objects: Vec<DirectoryObject>,
    pub gates: GateVerdict,
    pub supplied_gates: Option<GateVerdict>,
    /// Present when the policy is exploitable by either subject
    pub partition: Option<TargetPartition>,
    pub warnings: Vec<String>,
}

impl GpoAnalysis {
    fn assemble(
        source: GpoSource,
        store: StoreStage,
        descriptor: DescriptorStage,
        linked_objects: Vec<DirectoryObject>,
        subjects: &Subjects,
        matcher: &dyn PrincipalMatcher,
    ) -> Self {
        let linked = !source.linked_ous.is_empty();

        let gates_for = |subject: Option<&DirectoryObject>| {
            evaluate_gates(
                can_write(matcher, &store.writers, subject),
                can_write(matcher, &descriptor.writers, subject),
                linked,
            )
        };

        let gates = gates_for(subjects.acting.as_ref());
        let supplied_gates = subjects.supplied.as_ref().map(|s| gates_for(Some(s)));

        let exploitable_by_any =
            gates.exploitable || supplied_gates.is_some_and(|g| g.exploitable);
        let targets = exploitable_by_any
            .then(|| partition(matcher, &linked_objects, &descriptor.filters));

        Self {
            source,
            store_writers: store.writers,
            object_writers: descriptor.writers,
            filter_principals: descriptor.filters,
            linked_objects,
            gates,
            supplied_gates,
            partition: targets,
            warnings: store.warning.into_iter().collect(),
        }
    }
}

/// A writer set admits the subject if any writer is a common principal or
/// covers the subject through membership.
fn can_write(
    matcher: &dyn PrincipalMatcher,
    writers: &WritePermissionResult,
    subject: Option<&DirectoryObject>,
) -> bool {
    writers
        .principals
        .iter()
        .any(|p| p.is_common() || subject.is_some_and(|s| matcher.check_principal(s, p)))
}

/// Runs the per-policy pipeline. Blocking; meant for worker threads.
pub struct GpoAnalyzer {
    discovery: GpoDiscovery,
    file_acl: FileAclEvaluator,
    descriptors: SecurityDescriptorEvaluator,
    matcher: Arc<GroupMembershipResolver>,
}

impl GpoAnalyzer {
    pub fn new(
        directory: Arc<dyn DirectoryService>,
        store: Arc<dyn PolicyStore>,
        config: &AuditConfig,
    ) -> Self {
        let resolver = Arc::new(NameResolver::new(directory.clone()));
        Self {
            discovery: GpoDiscovery::new(directory.clone(), store.clone(), config.transient_retries),
            file_acl: FileAclEvaluator::new(store, resolver.clone(), config.honor_deny_aces),
            descriptors: SecurityDescriptorEvaluator::new(resolver, config.honor_deny_aces),
            matcher: Arc::new(GroupMembershipResolver::new(
                directory,
                config.membership.clone(),
            )),
        }
    }

    pub fn matcher(&self) -> &GroupMembershipResolver {
        &self.matcher
    }

    pub fn analyze(&self, id: &str, subjects: &Subjects) -> AuditResult<GpoAnalysis> {
        let _span = info_span!("gpo", id = %id).entered();

        let source = self.discovery.discover(id)?;
        let store = self.store_stage(&source);
        let descriptor = self.descriptor_stage(&source)?;
        let linked = source.linked_objects();

        let analysis = GpoAnalysis::assemble(
            source,
            store,
            descriptor,
            linked,
            subjects,
            self.matcher.as_ref(),
        );

        debug!(
            "store_writable={} object_writable={} linked={}",
            analysis.gates.store_writable, analysis.gates.object_writable, analysis.gates.linked
        );
        Ok(analysis)
    }

    fn store_stage(&self, source: &GpoSource) -> StoreStage {
        let (writers, warning) = self
            .file_acl
            .extract_write_access_principals(&source.store_path);
        StoreStage { writers, warning }
    }

    fn descriptor_stage(&self, source: &GpoSource) -> AuditResult<DescriptorStage> {
        let descriptor = parse_security_descriptor(&source.descriptor).map_err(|e| {
            AuditError::Parse(format!("Security descriptor of {}: {}", source.id, e))
        })?;
        Ok(DescriptorStage {
            writers: self
                .descriptors
                .extract_write_access_principals(&source.id, &descriptor),
            filters: self
                .descriptors
                .extract_security_filter_targets(&descriptor, APPLY_GROUP_POLICY_RIGHT),
        })
    }
}

/// Orchestrates a full audit of one domain
pub struct ExploitabilityEngine {
    directory: Arc<dyn DirectoryService>,
    store: Arc<dyn PolicyStore>,
    config: AuditConfig,
}

impl ExploitabilityEngine {
    pub fn new(
        directory: Arc<dyn DirectoryService>,
        store: Arc<dyn PolicyStore>,
        config: AuditConfig,
    ) -> Self {
        Self {
            directory,
            store,
            config,
        }
    }

    /// Audit every policy in the domain.
    ///
    /// Fails only when the configuration is invalid or the directory root or
    /// policies root cannot be reached. Per-policy failures land in
    /// [`AuditReport::unknown`].
    pub async fn run(
        &self,
        credentials: &dyn CredentialContext,
        supplied: Option<&str>,
    ) -> AuditResult<AuditReport> {
        self.config.validate()?;
        let started_at = Utc::now();
        let op_timeout = self.config.operation_timeout();

        info!("Starting GPO audit of {}", self.directory.domain());

        let directory = self.directory.clone();
        run_blocking(op_timeout, "directory root check", move || directory.verify_root())
            .await
            .map_err(|e| root_failure("directory root", e))?;

        let store = self.store.clone();
        let ids = run_blocking(op_timeout, "policy listing", move || {
            store.list_policy_directories()
        })
        .await
        .map_err(|e| root_failure(&self.store.policies_root(), e))?;
        info!("Discovered {} policies under {}", ids.len(), self.store.policies_root());

        let mut warnings = Vec::new();

        let acting_identity = match credentials.identity_name() {
            Ok(name) => Some(name),
            Err(e) => {
                warnings.push(format!("Acting identity unavailable: {}", e));
                None
            }
        };
        let acting = match &acting_identity {
            Some(name) => self.resolve_subject(name, "acting identity", &mut warnings).await,
            None => None,
        };
        let supplied_object = match supplied {
            Some(name) => self.resolve_subject(name, "supplied principal", &mut warnings).await,
            None => None,
        };
        if acting.is_none() {
            warn!("Acting identity not resolved; only common identities can satisfy write gates");
        }

        let subjects = Arc::new(Subjects {
            acting,
            supplied: supplied_object,
        });
        let analyzer = Arc::new(GpoAnalyzer::new(
            self.directory.clone(),
            self.store.clone(),
            &self.config,
        ));

        let executor = BoundedExecutor::new(self.config.max_concurrency, self.config.gpo_timeout());
        let op = {
            let analyzer = analyzer.clone();
            let subjects = subjects.clone();
            Arc::new(move |id: String| analyzer.analyze(&id, &subjects))
        };
        let results = executor.execute_blocking(ids.clone(), op).await;

        let mut entries = Vec::new();
        let mut unknown = Vec::new();
        for (id, result) in ids.iter().zip(results) {
            match result {
                Ok(analysis) => entries.push(to_entry(analysis, subjects.supplied.as_ref())),
                Err(e) => {
                    warn!("{} could not be evaluated: {}", id, e);
                    unknown.push(UnknownGpo {
                        id: id.clone(),
                        kind: e.code().to_string(),
                        cause: e.to_string(),
                    });
                }
            }
        }

        warnings.extend(analyzer.matcher().drain_warnings());

        let exploitable: Vec<String> = entries
            .iter()
            .filter(|e| e.exploitable)
            .map(|e| e.id.clone())
            .collect();
        let exploitable_by_supplied: Vec<String> = entries
            .iter()
            .filter(|e| e.supplied_principal.as_ref().is_some_and(|s| s.exploitable))
            .map(|e| e.id.clone())
            .collect();

        info!(
            "Audit complete: {} evaluated, {} exploitable, {} unknown",
            entries.len(),
            exploitable.len(),
            unknown.len()
        );

        Ok(AuditReport {
            domain: self.directory.domain().to_string(),
            acting_identity: acting_identity.unwrap_or_else(|| "<unknown>".to_string()),
            supplied_principal: supplied.map(str::to_string),
            stats: RunStats {
                policies_discovered: ids.len(),
                policies_evaluated: entries.len(),
                execution: executor.stats().await,
                membership: analyzer.matcher().stats(),
            },
            entries,
            exploitable,
            exploitable_by_supplied,
            unknown,
            warnings,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Name -> SID -> account. Failures become run warnings.
    async fn resolve_subject(
        &self,
        name: &str,
        role: &str,
        warnings: &mut Vec<String>,
    ) -> Option<DirectoryObject> {
        let directory = self.directory.clone();
        let account = account_name_from_identity(name).to_string();
        let lookup = run_blocking(self.config.operation_timeout(), role, move || {
            match directory.resolve_name_to_id(&account)? {
                Some(sid) => directory.lookup_object(&sid),
                None => Ok(None),
            }
        })
        .await;

        match lookup {
            Ok(Some(object)) => {
                info!("Resolved {} {} to {}", role, name, object.distinguished_name);
                Some(object)
            }
            Ok(None) => {
                warnings.push(format!(
                    "The {} '{}' could not be resolved to a user or computer",
                    role, name
                ));
                None
            }
            Err(e) => {
                warnings.push(format!("Resolving the {} '{}' failed: {}", role, name, e));
                None
            }
        }
    }
}

fn root_failure(what: &str, err: AuditError) -> AuditError {
    match err {
        AuditError::Connectivity(_) => err,
        other => AuditError::Connectivity(format!("{} unreachable: {}", what, other)),
    }
}

fn to_entry(analysis: GpoAnalysis, supplied: Option<&DirectoryObject>) -> GpoReportEntry {
    let GpoAnalysis {
        source,
        store_writers,
        object_writers,
        filter_principals,
        gates,
        supplied_gates,
        partition,
        warnings,
        ..
    } = analysis;

    let (targeted, reachable_but_untargeted) = match partition {
        Some(p) => (p.targeted, p.untargeted),
        None => (Vec::new(), Vec::new()),
    };

    let supplied_principal = supplied.zip(supplied_gates).map(|(object, g)| {
        SuppliedPrincipalVerdict {
            principal: object.name.clone(),
            store_writable: g.store_writable,
            object_writable: g.object_writable,
            exploitable: g.exploitable,
        }
    });

    GpoReportEntry {
        id: source.id,
        display_name: source.display_name,
        store_path: source.store_path,
        version: source.version,
        store_writable: gates.store_writable,
        object_writable: gates.object_writable,
        linked: gates.linked,
        exploitable: gates.exploitable,
        linked_ous: source
            .linked_ous
            .into_iter()
            .map(|ou| ou.distinguished_name)
            .collect(),
        store_writers: store_writers.principals,
        object_writers: object_writers.principals,
        security_filter_principals: filter_principals,
        targeted,
        reachable_but_untargeted,
        supplied_principal,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ObjectKind;
    use crate::snapshot::{DomainSnapshot, SnapshotDirectory};
    use serde_json::json;

    const GPO: &str = "{0F1E2D3C-4B5A-6978-8796-A5B4C3D2E1F0}";
    const ALICE: &str = "S-1-5-21-7-8-9-1105";

    fn analyzer_for(gpo: serde_json::Value) -> GpoAnalyzer {
        let snapshot: DomainSnapshot = serde_json::from_value(json!({
            "domain": "corp.local",
            "accounts": [
                {"name": "alice", "sid": ALICE, "distinguished_name": "CN=alice,OU=Staff,DC=corp,DC=local", "kind": "user"}
            ],
            "ous": [{"distinguished_name": "OU=Staff,DC=corp,DC=local", "linked_gpos": [GPO]}],
            "gpos": [gpo]
        }))
        .unwrap();
        let dir = Arc::new(SnapshotDirectory::new(snapshot).unwrap());
        GpoAnalyzer::new(dir.clone(), dir, &AuditConfig::default())
    }

    fn alice() -> Subjects {
        Subjects {
            acting: Some(DirectoryObject::new(
                ObjectKind::User,
                "CN=alice,OU=Staff,DC=corp,DC=local",
                ALICE,
                "alice",
            )),
            supplied: None,
        }
    }

    #[test]
    fn test_acting_identity_writer_on_both_sides() {
        let analyzer = analyzer_for(json!({
            "id": GPO, "display_name": "Staff", "version": 1,
            "descriptor": {"dacl": [
                {"kind": "allow", "sid": ALICE, "mask": 0x20},
                {"kind": "allow_object", "sid": ALICE, "mask": 0x100, "object_type": APPLY_GROUP_POLICY_RIGHT}
            ]},
            "store_acl": [{"sid": ALICE, "mask": 0x2}]
        }));
        let analysis = analyzer.analyze(GPO, &alice()).unwrap();
        assert!(analysis.gates.exploitable);
        let p = analysis.partition.unwrap();
        assert_eq!(p.targeted.len(), 1);
        assert!(p.untargeted.is_empty());
    }

    #[test]
    fn test_unresolved_identity_only_common_writers_count() {
        let analyzer = analyzer_for(json!({
            "id": GPO, "display_name": "Staff", "version": 1,
            "descriptor": {"dacl": [{"kind": "allow", "sid": ALICE, "mask": 0x20}]},
            "store_acl": [{"sid": "S-1-5-11", "mask": 0x2}]
        }));
        let analysis = analyzer.analyze(GPO, &Subjects::default()).unwrap();
        assert!(analysis.gates.store_writable);
        assert!(!analysis.gates.object_writable);
        assert!(analysis.partition.is_none());
    }

    #[test]
    fn test_unparseable_descriptor_is_parse_error() {
        let analyzer = analyzer_for(json!({
            "id": GPO, "display_name": "Broken", "version": 1,
            "raw_descriptor_b64": "AQAEgBQAAAAAAAAAAAAAAA==",
            "store_acl": [{"sid": "S-1-5-11", "mask": 0x2}]
        }));
        assert!(matches!(
            analyzer.analyze(GPO, &alice()),
            Err(AuditError::Parse(_))
        ));
    }
}
