//! Integration tests for the GPO write audit
//!
//! Drives the public engine against snapshot collaborators.

use gpo_write_audit::common_types::APPLY_GROUP_POLICY_RIGHT;
use gpo_write_audit::config::MembershipLimits;
use gpo_write_audit::credentials::{account_name_from_identity, FixedIdentity};
use gpo_write_audit::directory::DirectoryService;
use gpo_write_audit::membership::{GroupMembershipResolver, PrincipalMatcher};
use gpo_write_audit::model::{DirectoryObject, ObjectKind, SecurityPrincipal};
use gpo_write_audit::snapshot::{DomainSnapshot, SnapshotDirectory};
use gpo_write_audit::{AuditConfig, AuditError, AuditReport, ExploitabilityEngine};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;

const DOMAIN_SID: &str = "S-1-5-21-1000-2000-3000";
const STAFF_OU: &str = "OU=Staff,DC=corp,DC=local";
const GPO_A: &str = "{11111111-AAAA-4AAA-8AAA-111111111111}";
const GPO_B: &str = "{22222222-BBBB-4BBB-8BBB-222222222222}";

const WRITE_PROPERTY: u32 = 0x20;
const WRITE_DATA: u32 = 0x2;
const CONTROL_ACCESS: u32 = 0x100;

fn sid(rid: u32) -> String {
    format!("{}-{}", DOMAIN_SID, rid)
}

fn accounts() -> Value {
    json!([
        {"name": "alice", "sid": sid(1105), "distinguished_name": format!("CN=alice,{}", STAFF_OU), "kind": "user"},
        {"name": "bob", "sid": sid(1106), "distinguished_name": format!("CN=bob,{}", STAFF_OU), "kind": "user"},
        {"name": "carol", "sid": sid(1107), "distinguished_name": format!("CN=carol,{}", STAFF_OU), "kind": "user"},
        {"name": "WS01$", "sid": sid(1201), "distinguished_name": format!("CN=WS01,{}", STAFF_OU), "kind": "computer"},
        {"name": "mallory", "sid": sid(1300), "distinguished_name": "CN=mallory,CN=Users,DC=corp,DC=local", "kind": "user"},
        {"name": "GPO Editors", "sid": sid(1400), "distinguished_name": "CN=GPO Editors,CN=Users,DC=corp,DC=local", "kind": "group",
         "object_guid": "6f1e2d3c-0000-4000-8000-000000001400",
         "members": ["CN=Helpdesk,CN=Users,DC=corp,DC=local"]},
        {"name": "Helpdesk", "sid": sid(1401), "distinguished_name": "CN=Helpdesk,CN=Users,DC=corp,DC=local", "kind": "group",
         "members": ["CN=GPO Editors,CN=Users,DC=corp,DC=local", sid(1300)]}
    ])
}

fn directory_with(gpos: Value, ous: Value) -> Arc<SnapshotDirectory> {
    let snapshot: DomainSnapshot = serde_json::from_value(json!({
        "domain": "corp.local",
        "accounts": accounts(),
        "ous": ous,
        "gpos": gpos
    }))
    .unwrap();
    Arc::new(SnapshotDirectory::new(snapshot).unwrap())
}

fn directory(gpos: Value) -> Arc<SnapshotDirectory> {
    directory_with(gpos, json!([{"distinguished_name": STAFF_OU, "linked_gpos": [GPO_A, GPO_B]}]))
}

/// A policy writable on both sides by `writer`, filtered to Domain Users
fn writable_gpo(id: &str, writer: &str) -> Value {
    json!({
        "id": id,
        "display_name": "Staff Policy",
        "version": 3,
        "descriptor": {"dacl": [
            {"kind": "allow", "sid": writer, "mask": WRITE_PROPERTY},
            {"kind": "allow_object", "sid": sid(513), "mask": CONTROL_ACCESS, "object_type": APPLY_GROUP_POLICY_RIGHT}
        ]},
        "store_acl": [{"sid": writer, "mask": WRITE_DATA}]
    })
}

async fn run(dir: Arc<SnapshotDirectory>, identity: &str, supplied: Option<&str>, config: AuditConfig) -> AuditReport {
    ExploitabilityEngine::new(dir.clone(), dir, config)
        .run(&FixedIdentity(identity.to_string()), supplied)
        .await
        .unwrap()
}

fn names(objects: &[DirectoryObject]) -> Vec<&str> {
    objects.iter().map(|o| o.name.as_str()).collect()
}

#[tokio::test]
async fn test_store_writable_object_not_writable_is_not_exploitable() {
    let dir = directory(json!([{
        "id": GPO_A, "display_name": "Store Only", "version": 1,
        "descriptor": {"dacl": [{"kind": "allow", "sid": "S-1-5-18", "mask": WRITE_PROPERTY}]},
        "store_acl": [{"sid": "S-1-5-11", "mask": WRITE_DATA}]
    }]));

    let report = run(dir, "CORP\\alice", None, AuditConfig::default()).await;
    let entry = report.entry(GPO_A).unwrap();
    assert!(entry.store_writable);
    assert!(!entry.object_writable);
    assert!(entry.linked);
    assert!(!entry.exploitable);
    assert!(report.exploitable.is_empty());
    assert!(entry.targeted.is_empty() && entry.reachable_but_untargeted.is_empty());
}

#[tokio::test]
async fn test_domain_users_filter_targets_users_only() {
    let dir = directory(json!([writable_gpo(GPO_A, &sid(1105))]));

    let report = run(dir, "CORP\\alice", None, AuditConfig::default()).await;
    assert_eq!(report.exploitable, vec![GPO_A.to_string()]);

    let entry = report.entry(GPO_A).unwrap();
    assert_eq!(names(&entry.targeted), vec!["alice", "bob", "carol"]);
    assert_eq!(names(&entry.reachable_but_untargeted), vec!["WS01$"]);
    assert_eq!(entry.linked_ous, vec![STAFF_OU.to_string()]);

    let text = report.render_text();
    assert!(text.contains(
        "***** Staff Policy is currently exploitable with 3 user target/s: [alice, bob, carol] *****"
    ));
    assert!(text.contains("enabling up to 1 additional exploitable computer target/s: [WS01$]"));
}

#[tokio::test]
async fn test_partition_is_disjoint_and_covers_linked_objects() {
    // Nested OU linked to the same policy must not duplicate accounts
    let dir = directory_with(
        json!([writable_gpo(GPO_A, "S-1-1-0")]),
        json!([
            {"distinguished_name": STAFF_OU, "linked_gpos": [GPO_A]},
            {"distinguished_name": "DC=corp,DC=local", "linked_gpos": [GPO_A]}
        ]),
    );

    let report = run(dir.clone(), "CORP\\bob", None, AuditConfig::default()).await;
    let entry = report.entry(GPO_A).unwrap();

    let targeted: HashSet<String> = entry.targeted.iter().map(|o| o.identity_key()).collect();
    let untargeted: HashSet<String> = entry
        .reachable_but_untargeted
        .iter()
        .map(|o| o.identity_key())
        .collect();
    assert!(targeted.is_disjoint(&untargeted));

    let mut linked: HashSet<String> = HashSet::new();
    for ou in &entry.linked_ous {
        for child in dir.lookup_ou_children(ou).unwrap() {
            linked.insert(child.identity_key());
        }
    }
    let union: HashSet<String> = targeted.union(&untargeted).cloned().collect();
    assert_eq!(union, linked);
    assert_eq!(entry.targeted.len() + entry.reachable_but_untargeted.len(), linked.len());
}

#[tokio::test]
async fn test_unparseable_descriptor_lands_in_unknown_only() {
    let dir = directory(json!([
        {
            "id": GPO_A, "display_name": "Broken", "version": 1,
            "raw_descriptor_b64": "AQAEgBQAAAAAAAAAAAAAAA==",
            "store_acl": [{"sid": "S-1-1-0", "mask": WRITE_DATA}]
        },
        writable_gpo(GPO_B, "S-1-5-11")
    ]));

    let report = run(dir, "CORP\\alice", None, AuditConfig::default()).await;
    assert!(report.entry(GPO_A).is_none());
    assert!(report.is_unknown(GPO_A));
    assert_eq!(report.unknown[0].kind, "PARSE_ERROR");
    assert!(!report.exploitable.contains(&GPO_A.to_string()));
    // The other policy is still evaluated
    assert_eq!(report.exploitable, vec![GPO_B.to_string()]);
}

#[tokio::test]
async fn test_unencodable_snapshot_descriptor_skips_only_that_policy() {
    let mut broken = writable_gpo(GPO_A, "S-1-5-11");
    broken["descriptor"]["dacl"][0]["sid"] = json!("not-a-sid");
    let dir = directory(json!([broken, writable_gpo(GPO_B, "S-1-5-11")]));

    let report = run(dir, "CORP\\alice", None, AuditConfig::default()).await;
    assert!(report.is_unknown(GPO_A));
    assert_eq!(report.unknown.len(), 1);
    assert_eq!(report.unknown[0].kind, "CONFIGURATION");
    assert!(report.unknown[0].cause.contains("not-a-sid"));
    assert_eq!(report.exploitable, vec![GPO_B.to_string()]);
}

#[tokio::test]
async fn test_each_gate_is_required() {
    let all_on = writable_gpo(GPO_A, &sid(1105));

    let mut store_off = all_on.clone();
    store_off["store_acl"] = json!([]);

    let mut object_off = all_on.clone();
    object_off["descriptor"]["dacl"][0]["mask"] = json!(0x10);

    for (gpo, expected) in [(all_on.clone(), true), (store_off, false), (object_off, false)] {
        let report = run(directory(json!([gpo])), "CORP\\alice", None, AuditConfig::default()).await;
        assert_eq!(report.entry(GPO_A).unwrap().exploitable, expected);
    }

    let unlinked = directory_with(json!([all_on]), json!([{"distinguished_name": STAFF_OU}]));
    let report = run(unlinked, "CORP\\alice", None, AuditConfig::default()).await;
    let entry = report.entry(GPO_A).unwrap();
    assert!(entry.store_writable && entry.object_writable);
    assert!(!entry.linked);
    assert!(!entry.exploitable);
}

#[tokio::test]
async fn test_disabled_link_counts_only_when_enabled() {
    let ous = json!([{"distinguished_name": STAFF_OU, "disabled_links": [GPO_A]}]);
    let gpos = json!([writable_gpo(GPO_A, &sid(1105))]);

    let report = run(directory_with(gpos.clone(), ous.clone()), "CORP\\alice", None, AuditConfig::default()).await;
    assert!(!report.entry(GPO_A).unwrap().linked);

    let dir = Arc::new(
        SnapshotDirectory::new(
            serde_json::from_value(json!({"domain": "corp.local", "accounts": accounts(), "ous": ous, "gpos": gpos}))
                .unwrap(),
        )
        .unwrap()
        .with_disabled_links(true),
    );
    let report = run(dir, "CORP\\alice", None, AuditConfig::default()).await;
    assert!(report.entry(GPO_A).unwrap().exploitable);
}

#[tokio::test]
async fn test_nested_cyclic_group_writer() {
    // GPO Editors <-> Helpdesk cycle; mallory sits in Helpdesk
    let dir = directory(json!([writable_gpo(GPO_A, &sid(1400))]));

    let report = run(dir.clone(), "CORP\\mallory", None, AuditConfig::default()).await;
    assert!(report.entry(GPO_A).unwrap().exploitable);

    // A non-member walks the same cycle and gets a definite "no"
    let report = run(dir, "CORP\\bob", None, AuditConfig::default()).await;
    let entry = report.entry(GPO_A).unwrap();
    assert!(!entry.store_writable);
    assert!(!entry.exploitable);
    assert_eq!(report.stats.membership.limit_exceeded, 0);
}

#[tokio::test]
async fn test_group_identified_by_guid_or_dn() {
    let dir = directory(json!([]));
    let resolver = GroupMembershipResolver::new(dir.clone(), MembershipLimits::default());
    let mallory = dir.lookup_object(&sid(1300)).unwrap().unwrap();

    for identifier in [
        "{6F1E2D3C-0000-4000-8000-000000001400}",
        "CN=GPO Editors,CN=Users,DC=corp,DC=local",
        sid(1400).as_str(),
    ] {
        assert!(
            resolver.check_principal(&mallory, &SecurityPrincipal::from_name(identifier)),
            "{}",
            identifier
        );
    }
}

#[test]
fn test_builtin_domain_groups_need_no_lookup() {
    let dir = directory(json!([]));
    let resolver = GroupMembershipResolver::new(dir.clone(), MembershipLimits::default());

    let user = DirectoryObject::new(ObjectKind::User, format!("CN=bob,{}", STAFF_OU), sid(1106), "bob");
    let computer = DirectoryObject::new(ObjectKind::Computer, format!("CN=WS01,{}", STAFF_OU), sid(1201), "WS01$");

    assert!(resolver.check_principal(&user, &SecurityPrincipal::from_sid(sid(513), "CORP\\Domain Users")));
    assert!(resolver.check_principal(&computer, &SecurityPrincipal::from_sid(sid(515), "CORP\\Domain Computers")));
    assert_eq!(dir.group_lookup_count(), 0);
}

#[test]
fn test_name_id_name_round_trip() {
    let dir = directory(json!([]));
    for name in ["alice", "CORP\\Bob", "WS01$", "mallory@corp.local"] {
        let id = dir.resolve_name_to_id(name).unwrap().unwrap();
        let back = dir.resolve_id_to_name(&id).unwrap().unwrap();
        assert!(
            account_name_from_identity(&back).eq_ignore_ascii_case(account_name_from_identity(name)),
            "{} -> {} -> {}",
            name,
            id,
            back
        );
    }
    assert_eq!(dir.resolve_name_to_id("nobody").unwrap(), None);
}

#[tokio::test]
async fn test_preceding_deny_toggle() {
    let alice = sid(1105);
    let gpo = json!({
        "id": GPO_A, "display_name": "Denied", "version": 1,
        "descriptor": {"dacl": [
            {"kind": "deny", "sid": alice, "mask": WRITE_PROPERTY},
            {"kind": "allow", "sid": alice, "mask": WRITE_PROPERTY}
        ]},
        "store_acl": [
            {"sid": alice, "mask": WRITE_DATA, "allow": false},
            {"sid": alice, "mask": WRITE_DATA}
        ]
    });

    let report = run(directory(json!([gpo.clone()])), "CORP\\alice", None, AuditConfig::default()).await;
    let entry = report.entry(GPO_A).unwrap();
    assert!(!entry.object_writable);
    assert!(!entry.store_writable);

    let config = AuditConfig {
        honor_deny_aces: false,
        ..AuditConfig::default()
    };
    let report = run(directory(json!([gpo])), "CORP\\alice", None, config).await;
    let entry = report.entry(GPO_A).unwrap();
    assert!(entry.object_writable);
    assert!(entry.store_writable);
}

#[tokio::test]
async fn test_incomplete_policies_are_skipped_with_cause() {
    let mut no_marker = writable_gpo(GPO_A, "S-1-1-0");
    no_marker["has_marker"] = json!(false);
    let mut no_version = writable_gpo(GPO_B, "S-1-1-0");
    no_version["version"] = json!(null);

    let report = run(directory(json!([no_marker, no_version])), "CORP\\alice", None, AuditConfig::default()).await;
    assert!(report.entries.is_empty());
    assert_eq!(report.unknown.len(), 2);
    assert!(report.unknown.iter().all(|u| u.kind == "CONFIGURATION"));
    assert!(report.unknown[0].cause.contains("gpt.ini"));
    assert!(report.unknown[1].cause.contains("versionNumber"));
    assert_eq!(report.stats.policies_discovered, 2);
    assert_eq!(report.stats.policies_evaluated, 0);
}

#[tokio::test]
async fn test_unreachable_root_aborts_run() {
    let snapshot: DomainSnapshot = serde_json::from_value(json!({
        "domain": "corp.local", "unreachable": true, "gpos": [writable_gpo(GPO_A, "S-1-1-0")]
    }))
    .unwrap();
    let dir = Arc::new(SnapshotDirectory::new(snapshot).unwrap());

    let result = ExploitabilityEngine::new(dir.clone(), dir, AuditConfig::default())
        .run(&FixedIdentity("CORP\\alice".to_string()), None)
        .await;
    assert!(matches!(result, Err(AuditError::Connectivity(_))));
}

#[tokio::test]
async fn test_supplied_principal_gets_own_gates() {
    let dir = directory(json!([writable_gpo(GPO_A, &sid(1400))]));

    let report = run(dir, "CORP\\alice", Some("mallory"), AuditConfig::default()).await;
    let entry = report.entry(GPO_A).unwrap();
    assert!(!entry.exploitable);
    let supplied = entry.supplied_principal.as_ref().unwrap();
    assert!(supplied.store_writable && supplied.object_writable && supplied.exploitable);
    assert_eq!(report.exploitable_by_supplied, vec![GPO_A.to_string()]);
    // Reach is still reported for a policy only the supplied principal can exploit
    assert_eq!(entry.targeted.len(), 3);
}

#[tokio::test]
async fn test_unresolved_supplied_principal_is_a_warning() {
    let dir = directory(json!([writable_gpo(GPO_A, &sid(1105))]));

    let report = run(dir, "CORP\\alice", Some("CORP\\ghost"), AuditConfig::default()).await;
    assert!(report.entry(GPO_A).unwrap().exploitable);
    assert!(report.entry(GPO_A).unwrap().supplied_principal.is_none());
    assert!(report.warnings.iter().any(|w| w.contains("ghost")));
}

#[tokio::test]
async fn test_transient_container_failures() {
    let mut flaky = writable_gpo(GPO_A, "S-1-1-0");
    flaky["transient_failures"] = json!(1);
    let mut down = writable_gpo(GPO_B, "S-1-1-0");
    down["transient_failures"] = json!(5);

    let report = run(directory(json!([flaky, down])), "CORP\\alice", None, AuditConfig::default()).await;
    assert!(report.entry(GPO_A).is_some());
    assert!(report.is_unknown(GPO_B));
    assert_eq!(report.unknown[0].kind, "TIMEOUT");
}

#[tokio::test]
async fn test_slow_policy_times_out_without_blocking_others() {
    let mut slow = writable_gpo(GPO_A, "S-1-1-0");
    slow["lookup_delay_ms"] = json!(1500);

    let config = AuditConfig {
        gpo_timeout_secs: 1,
        ..AuditConfig::default()
    };
    let report = run(directory(json!([slow, writable_gpo(GPO_B, "S-1-1-0")])), "CORP\\alice", None, config).await;
    assert!(report.is_unknown(GPO_A));
    assert_eq!(report.unknown[0].kind, "TIMEOUT");
    assert!(report.entry(GPO_B).unwrap().exploitable);
    assert_eq!(report.stats.execution.timed_out, 1);
}

#[tokio::test]
async fn test_snapshot_file_and_json_report() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let snapshot = json!({
        "domain": "corp.local",
        "accounts": accounts(),
        "ous": [{"distinguished_name": STAFF_OU, "linked_gpos": [GPO_A]}],
        "gpos": [writable_gpo(GPO_A, "S-1-5-11")]
    });
    std::fs::write(file.path(), serde_json::to_vec(&snapshot).unwrap()).unwrap();

    let dir = Arc::new(SnapshotDirectory::load(file.path()).unwrap());
    let report = run(dir, "CORP\\carol", None, AuditConfig::default()).await;

    let parsed: Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
    assert_eq!(parsed["domain"], "corp.local");
    assert_eq!(parsed["exploitable"][0], GPO_A);
    assert_eq!(parsed["entries"][0]["object_writers"][0]["class"], "common");
    assert_eq!(parsed["entries"][0]["targeted"].as_array().unwrap().len(), 3);
}
