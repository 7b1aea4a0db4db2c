//! Desired-vs-current diff for the authorized set

use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

use crate::control_plane::RemoteUser;
use crate::state::{AuthorizedUser, UserDiff};

/// Diff the local authorized set against the control plane's list.
///
/// Only active remote users are desired. Duplicate remote entries collapse
/// to the first one. Output is sorted by credential ID so ticks are
/// reproducible.
pub fn compute_diff(local: &BTreeMap<Uuid, AuthorizedUser>, remote: &[RemoteUser]) -> UserDiff {
    let mut desired: BTreeMap<Uuid, AuthorizedUser> = BTreeMap::new();
    for user in remote.iter().filter(|u| u.active) {
        desired.entry(user.id).or_insert_with(|| AuthorizedUser::from(user));
    }

    let to_add = desired
        .values()
        .filter(|u| !local.contains_key(&u.id))
        .cloned()
        .collect();

    let desired_ids: HashSet<&Uuid> = desired.keys().collect();
    let to_remove = local
        .keys()
        .filter(|id| !desired_ids.contains(id))
        .copied()
        .collect();

    UserDiff { to_add, to_remove }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests_support::user;

    fn remote(n: u128, active: bool) -> RemoteUser {
        RemoteUser {
            id: Uuid::from_u128(n),
            label: format!("user-{}", n),
            active,
            quota_bytes: None,
        }
    }

    fn local(ids: &[u128]) -> BTreeMap<Uuid, AuthorizedUser> {
        ids.iter().map(|n| (Uuid::from_u128(*n), user(*n))).collect()
    }

    #[test]
    fn test_adds_and_removes() {
        let diff = compute_diff(&local(&[1, 2]), &[remote(2, true), remote(3, true)]);

        assert_eq!(diff.to_add.len(), 1);
        assert_eq!(diff.to_add[0].id, Uuid::from_u128(3));
        assert_eq!(diff.to_remove, vec![Uuid::from_u128(1)]);
    }

    #[test]
    fn test_suspended_users_are_removed() {
        let diff = compute_diff(&local(&[1]), &[remote(1, false)]);

        assert!(diff.to_add.is_empty());
        assert_eq!(diff.to_remove, vec![Uuid::from_u128(1)]);
    }

    #[test]
    fn test_in_sync_is_empty() {
        let diff = compute_diff(&local(&[1, 2]), &[remote(1, true), remote(2, true), remote(5, false)]);
        assert!(diff.is_empty());
    }

    #[test]
    fn test_duplicate_remote_entries() {
        let diff = compute_diff(&local(&[]), &[remote(4, true), remote(4, true)]);
        assert_eq!(diff.to_add.len(), 1);
    }

    #[test]
    fn test_empty_remote_removes_everything() {
        let diff = compute_diff(&local(&[1, 2, 3]), &[]);
        assert_eq!(diff.to_remove.len(), 3);
    }
}
