//! Security-filter target sets

use crate::membership::PrincipalMatcher;
use crate::model::{DirectoryObject, SecurityPrincipal};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Linked objects split by whether the policy's security filter covers them.
/// Disjoint; their union is the deduplicated linked-object set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetPartition {
    pub targeted: Vec<DirectoryObject>,
    pub untargeted: Vec<DirectoryObject>,
}

/// Partition `linked` against `filters` (logical OR across filter principals).
///
/// Objects reachable through several linked OUs appear once, in order of
/// first appearance.
pub fn partition(
    matcher: &dyn PrincipalMatcher,
    linked: &[DirectoryObject],
    filters: &[SecurityPrincipal],
) -> TargetPartition {
    let mut seen = HashSet::new();
    let mut result = TargetPartition::default();

    for object in linked {
        if !seen.insert(object.identity_key()) {
            continue;
        }
        if filters.iter().any(|f| matcher.check_principal(object, f)) {
            result.targeted.push(object.clone());
        } else {
            result.untargeted.push(object.clone());
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ObjectKind;

    /// Matches users only, regardless of principal
    struct UsersOnly;

    impl PrincipalMatcher for UsersOnly {
        fn check_principal(&self, object: &DirectoryObject, _principal: &SecurityPrincipal) -> bool {
            object.kind == ObjectKind::User
        }
    }

    fn obj(kind: ObjectKind, cn: &str) -> DirectoryObject {
        DirectoryObject::new(kind, format!("CN={},OU=Staff,DC=corp,DC=local", cn), format!("S-1-5-21-1-2-3-{}", cn.len()), cn)
    }

    #[test]
    fn test_partition_is_disjoint_and_complete() {
        let linked = vec![
            obj(ObjectKind::User, "u1"),
            obj(ObjectKind::Computer, "pc1"),
            obj(ObjectKind::User, "u2"),
            // Same object through a nested OU link
            DirectoryObject::new(ObjectKind::User, "cn=U1,ou=staff,dc=corp,dc=local", "S-1-5-21-1-2-3-2", "u1"),
        ];
        let filters = vec![SecurityPrincipal::from_name("CORP\\Staff")];

        let p = partition(&UsersOnly, &linked, &filters);
        assert_eq!(p.targeted.len(), 2);
        assert_eq!(p.untargeted.len(), 1);
        assert_eq!(p.untargeted[0].name, "pc1");

        let targeted: HashSet<String> = p.targeted.iter().map(|o| o.identity_key()).collect();
        assert!(p.untargeted.iter().all(|o| !targeted.contains(&o.identity_key())));
    }

    #[test]
    fn test_no_filters_means_nothing_targeted() {
        let linked = vec![obj(ObjectKind::User, "u1")];
        let p = partition(&UsersOnly, &linked, &[]);
        assert!(p.targeted.is_empty());
        assert_eq!(p.untargeted.len(), 1);
    }
}
