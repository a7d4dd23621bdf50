//! Audit report
//!
//! The structured result of a run, serializable to JSON, plus a plain-text
//! rendering for terminals.

use crate::membership::MembershipStats;
use crate::model::{DirectoryObject, ObjectKind, SecurityPrincipal};
use crate::parallel_executor::ExecutionStats;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// Gate values for one subject against one policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateVerdict {
    pub store_writable: bool,
    pub object_writable: bool,
    pub linked: bool,
    pub exploitable: bool,
}

/// Verdict is the conjunction of the three gates
pub fn evaluate_gates(store_writable: bool, object_writable: bool, linked: bool) -> GateVerdict {
    GateVerdict {
        store_writable,
        object_writable,
        linked,
        exploitable: store_writable && object_writable && linked,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuppliedPrincipalVerdict {
    pub principal: String,
    pub store_writable: bool,
    pub object_writable: bool,
    pub exploitable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpoReportEntry {
    pub id: String,
    pub display_name: String,
    pub store_path: String,
    pub version: u32,
    pub store_writable: bool,
    pub object_writable: bool,
    pub linked: bool,
    pub exploitable: bool,
    pub linked_ous: Vec<String>,
    pub store_writers: Vec<SecurityPrincipal>,
    pub object_writers: Vec<SecurityPrincipal>,
    pub security_filter_principals: Vec<SecurityPrincipal>,
    /// Filled only for exploitable policies
    pub targeted: Vec<DirectoryObject>,
    pub reachable_but_untargeted: Vec<DirectoryObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supplied_principal: Option<SuppliedPrincipalVerdict>,
    pub warnings: Vec<String>,
}

/// A policy that could not be evaluated
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnknownGpo {
    pub id: String,
    /// Error code, e.g. `PARSE_ERROR`, `CONFIGURATION`, `TIMEOUT`
    pub kind: String,
    pub cause: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStats {
    pub policies_discovered: usize,
    pub policies_evaluated: usize,
    pub execution: ExecutionStats,
    pub membership: MembershipStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditReport {
    pub domain: String,
    pub acting_identity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supplied_principal: Option<String>,
    pub entries: Vec<GpoReportEntry>,
    /// Ids of exploitable policies, in discovery order
    pub exploitable: Vec<String>,
    pub exploitable_by_supplied: Vec<String>,
    pub unknown: Vec<UnknownGpo>,
    pub warnings: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stats: RunStats,
}

impl AuditReport {
    pub fn entry(&self, id: &str) -> Option<&GpoReportEntry> {
        self.entries.iter().find(|e| e.id.eq_ignore_ascii_case(id))
    }

    pub fn is_unknown(&self, id: &str) -> bool {
        self.unknown.iter().any(|u| u.id.eq_ignore_ascii_case(id))
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Domain: {}", self.domain);

        for entry in &self.entries {
            let _ = writeln!(out);
            let _ = writeln!(out, "{} ({})", entry.display_name, entry.id);
            let _ = writeln!(
                out,
                "Current security principal ({}) can modify backing store: {}",
                self.acting_identity, entry.store_writable
            );
            let _ = writeln!(
                out,
                "Current security principal ({}) can modify AD object: {}",
                self.acting_identity, entry.object_writable
            );
            if let Some(supplied) = &entry.supplied_principal {
                let _ = writeln!(
                    out,
                    "Supplied security principal ({}) can modify backing store: {}",
                    supplied.principal, supplied.store_writable
                );
                let _ = writeln!(
                    out,
                    "Supplied security principal ({}) can modify AD object: {}",
                    supplied.principal, supplied.object_writable
                );
            }
            for warning in &entry.warnings {
                let _ = writeln!(out, "  warning: {}", warning);
            }
        }

        for entry in self.entries.iter().filter(|e| e.exploitable) {
            let _ = writeln!(out);
            render_exploitable(&mut out, entry);
        }

        if !self.unknown.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "Policies that could not be evaluated:");
            for unknown in &self.unknown {
                let _ = writeln!(out, "  {} [{}] {}", unknown.id, unknown.kind, unknown.cause);
            }
        }

        if !self.warnings.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "Warnings:");
            for warning in &self.warnings {
                let _ = writeln!(out, "  {}", warning);
            }
        }

        out
    }
}

fn names(objects: &[DirectoryObject], kind: ObjectKind) -> Vec<&str> {
    objects
        .iter()
        .filter(|o| o.kind == kind)
        .map(|o| o.name.as_str())
        .collect()
}

fn render_exploitable(out: &mut String, entry: &GpoReportEntry) {
    let mut any = false;
    for (kind, label) in [(ObjectKind::Computer, "computer"), (ObjectKind::User, "user")] {
        let targeted = names(&entry.targeted, kind);
        if !targeted.is_empty() {
            any = true;
            let _ = writeln!(
                out,
                "***** {} is currently exploitable with {} {} target/s: [{}] *****",
                entry.display_name,
                targeted.len(),
                label,
                targeted.join(", ")
            );
        }
    }
    for (kind, label) in [(ObjectKind::Computer, "computer"), (ObjectKind::User, "user")] {
        let untargeted = names(&entry.reachable_but_untargeted, kind);
        if !untargeted.is_empty() {
            any = true;
            let _ = writeln!(
                out,
                "***** Security filtering for {} can be modified, enabling up to {} additional exploitable {} target/s: [{}] *****",
                entry.display_name,
                untargeted.len(),
                label,
                untargeted.join(", ")
            );
        }
    }
    if !any {
        let _ = writeln!(
            out,
            "***** {} is not currently exploitable as its linked OUs contain no user or computer objects *****",
            entry.display_name
        );
    }
}
