//! Membership diffing between a live snapshot and the persisted model.

use crate::gateway::{GatewayError, Participant};
use crate::model::{ParticipantKind, Status};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Result of comparing enumerated participants with persisted records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipDiff {
    /// Persisted as active but absent from the snapshot; needs a point lookup.
    pub missing: BTreeSet<i64>,
    /// In the snapshot but not persisted as active.
    pub newly_seen: BTreeSet<i64>,
    /// Newly seen users whose previous status was Banned.
    pub rejoined_while_banned: BTreeSet<i64>,
}

/// Compare `enumerated` against the statuses held before the snapshot was applied.
#[must_use]
pub fn diff_membership(
    enumerated: &HashSet<i64>,
    prior: &HashMap<i64, Status>,
) -> MembershipDiff {
    let persisted_active: HashSet<i64> = prior
        .iter()
        .filter(|(_, status)| status.is_active())
        .map(|(id, _)| *id)
        .collect();

    let missing = persisted_active.difference(enumerated).copied().collect();
    let newly_seen: BTreeSet<i64> = enumerated.difference(&persisted_active).copied().collect();
    let rejoined_while_banned = newly_seen
        .iter()
        .filter(|id| prior.get(*id) == Some(&Status::Banned))
        .copied()
        .collect();

    MembershipDiff {
        missing,
        newly_seen,
        rejoined_while_banned,
    }
}

/// Verdict of an authoritative lookup for a disputed user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupVerdict {
    /// Still present; the snapshot was incomplete.
    StillMember,
    /// Gone.
    Left,
    /// Banned.
    Banned,
    /// The account no longer exists.
    AccountGone,
}

impl LookupVerdict {
    /// Interpret a point lookup. `None` means inconclusive; leave the record alone.
    #[must_use]
    pub fn from_lookup(result: &Result<Participant, GatewayError>) -> Option<Self> {
        match result {
            Ok(participant) if participant.kind.is_present() => Some(Self::StillMember),
            Ok(participant) if participant.kind == ParticipantKind::Banned => Some(Self::Banned),
            Ok(_) => Some(Self::Left),
            Err(GatewayError::MemberNotFound(_)) => Some(Self::AccountGone),
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_ten_enumerated_seven_persisted() {
        // 5 of the 7 persisted members are enumerated, 2 are absent
        let prior: HashMap<i64, Status> = (1..=7).map(|id| (id, Status::Member)).collect();
        let enumerated: HashSet<i64> = (1..=5).chain(8..=12).collect();
        let diff = diff_membership(&enumerated, &prior);
        assert_eq!(diff.missing, BTreeSet::from([6, 7]));
        assert_eq!(diff.newly_seen, (8..=12).collect());
        assert!(diff.rejoined_while_banned.is_empty());
    }

    #[test]
    fn test_banned_user_reappearing() {
        let prior = HashMap::from([(1, Status::Banned), (2, Status::Left), (3, Status::Admin)]);
        let enumerated = HashSet::from([1, 2, 3]);
        let diff = diff_membership(&enumerated, &prior);
        assert_eq!(diff.newly_seen, BTreeSet::from([1, 2]));
        assert_eq!(diff.rejoined_while_banned, BTreeSet::from([1]));
        assert!(diff.missing.is_empty());
    }

    #[test]
    fn test_lookup_verdicts() {
        use crate::model::UserProfile;
        let participant = |kind| {
            Ok(Participant {
                profile: UserProfile::new(1, "One"),
                kind,
                joined_at: None,
            })
        };
        assert_eq!(
            LookupVerdict::from_lookup(&participant(ParticipantKind::Restricted { is_member: true })),
            Some(LookupVerdict::StillMember)
        );
        assert_eq!(
            LookupVerdict::from_lookup(&participant(ParticipantKind::Left)),
            Some(LookupVerdict::Left)
        );
        assert_eq!(
            LookupVerdict::from_lookup(&participant(ParticipantKind::Banned)),
            Some(LookupVerdict::Banned)
        );
        assert_eq!(
            LookupVerdict::from_lookup(&Err(GatewayError::MemberNotFound("user not found".into()))),
            Some(LookupVerdict::AccountGone)
        );
        assert_eq!(
            LookupVerdict::from_lookup(&Err(GatewayError::Transient("timeout".into()))),
            None
        );
    }

    fn status_strategy() -> impl Strategy<Value = Status> {
        prop_oneof![
            Just(Status::Member),
            Just(Status::Admin),
            Just(Status::Creator),
            Just(Status::Left),
            Just(Status::Kicked),
            Just(Status::Banned),
            Just(Status::NotAvailable),
        ]
    }

    proptest! {
        #[test]
        fn prop_diff_partitions(
            prior in proptest::collection::hash_map(0i64..60, status_strategy(), 0..40),
            enumerated in proptest::collection::hash_set(0i64..60, 0..40),
        ) {
            let diff = diff_membership(&enumerated, &prior);
            let active: HashSet<i64> = prior
                .iter()
                .filter(|(_, s)| s.is_active())
                .map(|(id, _)| *id)
                .collect();

            for id in &diff.missing {
                prop_assert!(active.contains(id) && !enumerated.contains(id));
            }
            for id in &diff.newly_seen {
                prop_assert!(enumerated.contains(id) && !active.contains(id));
            }
            prop_assert!(diff.missing.is_disjoint(&diff.newly_seen));
            prop_assert!(diff.rejoined_while_banned.is_subset(&diff.newly_seen));
            for id in &diff.rejoined_while_banned {
                prop_assert_eq!(prior.get(id), Some(&Status::Banned));
            }
            // Ids both persisted active and enumerated land in neither set
            for id in active.union(&enumerated) {
                let both = active.contains(id) && enumerated.contains(id);
                prop_assert_eq!(
                    both,
                    !diff.missing.contains(id) && !diff.newly_seen.contains(id)
                );
            }
        }
    }
}
