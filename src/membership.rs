//! Group membership resolution
//!
//! Decides whether a user or computer satisfies a principal named in an ACL or
//! security filter, following nested groups through the directory. Group
//! lookups go through a read-through cache shared by every check in a run.

use crate::common_types::{domain_relative_rid, well_known_sids};
use crate::config::MembershipLimits;
use crate::directory::DirectoryService;
use crate::errors::AuditResult;
use crate::model::{DirectoryObject, GroupEntry, GroupIdentifier, MemberRef, ObjectKind, SecurityPrincipal};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};

/// Decides whether an object is covered by a principal
pub trait PrincipalMatcher: Send + Sync {
    fn check_principal(&self, object: &DirectoryObject, principal: &SecurityPrincipal) -> bool;
}

#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

/// `None` until populated; `Some(None)` records a definite "not found"
type Slot = Option<Option<GroupEntry>>;

/// Read-through cache of resolved groups.
///
/// Each key owns a mutex held while the entry is populated, so concurrent
/// checks wait for one directory lookup instead of issuing their own.
/// Failed lookups leave the slot empty.
#[derive(Default)]
pub struct MemberCache {
    entries: DashMap<String, Arc<Mutex<Slot>>>,
    stats: CacheStats,
}

impl MemberCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_resolve<F>(&self, key: &str, resolve: F) -> AuditResult<Option<GroupEntry>>
    where
        F: FnOnce() -> AuditResult<Option<GroupEntry>>,
    {
        let slot = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .value()
            .clone();

        let mut guard = slot.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(cached) = guard.as_ref() {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(cached.clone());
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        let value = resolve()?;
        *guard = Some(value.clone());
        Ok(value)
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MembershipStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub limit_exceeded: u64,
}

enum SearchAbort {
    Depth,
    Expansions,
}

pub struct GroupMembershipResolver {
    directory: Arc<dyn DirectoryService>,
    cache: Arc<MemberCache>,
    limits: MembershipLimits,
    limit_exceeded: AtomicU64,
    warnings: Mutex<Vec<String>>,
}

impl GroupMembershipResolver {
    pub fn new(directory: Arc<dyn DirectoryService>, limits: MembershipLimits) -> Self {
        Self::with_cache(directory, limits, Arc::new(MemberCache::new()))
    }

    pub fn with_cache(
        directory: Arc<dyn DirectoryService>,
        limits: MembershipLimits,
        cache: Arc<MemberCache>,
    ) -> Self {
        Self {
            directory,
            cache,
            limits,
            limit_exceeded: AtomicU64::new(0),
            warnings: Mutex::new(Vec::new()),
        }
    }

    pub fn stats(&self) -> MembershipStats {
        MembershipStats {
            cache_hits: self.cache.stats().hits(),
            cache_misses: self.cache.stats().misses(),
            limit_exceeded: self.limit_exceeded.load(Ordering::Relaxed),
        }
    }

    /// Warnings raised by checks that hit a limit, cleared on read
    pub fn drain_warnings(&self) -> Vec<String> {
        let mut warnings = self.warnings.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *warnings)
    }

    fn lookup(&self, id: &GroupIdentifier) -> AuditResult<Option<GroupEntry>> {
        self.cache
            .get_or_resolve(&id.cache_key(), || self.directory.resolve_group(id))
    }

    fn is_nested_member(&self, object: &DirectoryObject, root: &GroupIdentifier) -> bool {
        let mut visited = HashSet::new();
        let mut expansions = 0usize;

        match self.search(object, root, 0, &mut visited, &mut expansions) {
            Ok(found) => found,
            Err(abort) => {
                let limit = match abort {
                    SearchAbort::Depth => format!("nesting depth {}", self.limits.max_depth),
                    SearchAbort::Expansions => {
                        format!("{} group expansions", self.limits.max_expansions)
                    }
                };
                let message = format!(
                    "Membership check of {} against {:?} stopped at {}; treated as not a member",
                    object.distinguished_name, root, limit
                );
                warn!("{}", message);
                self.limit_exceeded.fetch_add(1, Ordering::Relaxed);
                self.warnings
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(message);
                false
            }
        }
    }

    fn search(
        &self,
        object: &DirectoryObject,
        id: &GroupIdentifier,
        depth: usize,
        visited: &mut HashSet<String>,
        expansions: &mut usize,
    ) -> Result<bool, SearchAbort> {
        if depth > self.limits.max_depth {
            return Err(SearchAbort::Depth);
        }
        *expansions += 1;
        if *expansions > self.limits.max_expansions {
            return Err(SearchAbort::Expansions);
        }

        let group = match self.lookup(id) {
            Ok(Some(group)) => group,
            Ok(None) => {
                trace!("Group {:?} not found", id);
                return Ok(false);
            }
            Err(e) => {
                debug!("Group lookup for {:?} failed: {}", id, e);
                return Ok(false);
            }
        };

        if !visited.insert(group.distinguished_name.to_lowercase()) {
            return Ok(false);
        }

        if group.members.iter().any(|m| is_same_object(object, m)) {
            return Ok(true);
        }

        for member in group.members.iter().filter(|m| m.is_group) {
            if visited.contains(&member.distinguished_name.to_lowercase()) {
                continue;
            }
            let child = match &member.sid {
                Some(sid) => GroupIdentifier::Sid(sid.clone()),
                None => GroupIdentifier::DistinguishedName(member.distinguished_name.clone()),
            };
            if self.search(object, &child, depth + 1, visited, expansions)? {
                return Ok(true);
            }
        }

        Ok(false)
    }
}

fn is_same_object(object: &DirectoryObject, member: &MemberRef) -> bool {
    member
        .sid
        .as_deref()
        .is_some_and(|sid| sid.eq_ignore_ascii_case(&object.sid))
        || member
            .distinguished_name
            .eq_ignore_ascii_case(&object.distinguished_name)
}

impl PrincipalMatcher for GroupMembershipResolver {
    fn check_principal(&self, object: &DirectoryObject, principal: &SecurityPrincipal) -> bool {
        if principal.is_common() {
            return true;
        }

        if principal.identifier.eq_ignore_ascii_case(&object.sid) {
            return true;
        }

        if let Some(rid) = principal.sid().and_then(domain_relative_rid) {
            match (rid, object.kind) {
                (well_known_sids::DOMAIN_COMPUTERS_RID, ObjectKind::Computer)
                | (well_known_sids::DOMAIN_USERS_RID, ObjectKind::User) => return true,
                _ => {}
            }
        }

        match GroupIdentifier::parse(&principal.identifier) {
            Some(id) => self.is_nested_member(object, &id),
            None => {
                trace!("{} is not a resolvable group identifier", principal.identifier);
                false
            }
        }
    }
}
