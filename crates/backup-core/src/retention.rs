use crate::artifact::Artifact;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;

/// Count- and age-based retention over `complete` artifacts.
///
/// Partial and failed artifacts are never selected and never count toward
/// `max_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_count: usize,
    pub max_age: Duration,
}

impl RetentionPolicy {
    pub fn new(max_count: usize, max_age: Duration) -> Self {
        Self { max_count, max_age }
    }

    /// Identifiers of the artifacts to delete as of `now`.
    ///
    /// - Age rule: a complete artifact created before `now - max_age` is
    ///   selected.
    /// - Count rule: of those left after the age rule, everything beyond the
    ///   newest `max_count` is selected.
    /// - The newest complete artifact is never selected.
    ///
    /// Ordering is `(created_at, identifier)`, newest first, so equal
    /// timestamps fall back to identifier order.
    pub fn select_for_deletion(&self, artifacts: &[Artifact], now: DateTime<Utc>) -> BTreeSet<String> {
        let mut complete: Vec<&Artifact> = artifacts.iter().filter(|a| a.is_complete()).collect();
        complete.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.identifier.cmp(&a.identifier))
        });

        let mut selected = BTreeSet::new();
        let Some((_newest, older)) = complete.split_first() else {
            return selected;
        };

        // A max_age reaching past the representable range means "no age limit".
        let cutoff = now.checked_sub_signed(self.max_age);
        // The newest artifact always survives and occupies the first slot.
        let mut kept = 1usize;
        for artifact in older {
            let expired = cutoff.is_some_and(|c| artifact.created_at < c);
            if expired || kept >= self.max_count {
                selected.insert(artifact.identifier.clone());
            } else {
                kept += 1;
            }
        }
        selected
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::new(7, Duration::days(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths;
    use crate::types::ArtifactStatus;
    use chrono::TimeZone;
    use std::path::Path;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 3, 0, 0).unwrap()
    }

    fn artifact(days_ago: i64, status: ArtifactStatus) -> Artifact {
        let created_at = now() - Duration::days(days_ago);
        let identifier = paths::format_identifier(created_at);
        Artifact {
            path: paths::artifact_path(Path::new("/b"), &identifier),
            identifier,
            size_bytes: 10,
            created_at,
            checksum: Some("00".repeat(32)),
            status,
            exit_code: Some(0),
        }
    }

    fn daily(n: i64) -> Vec<Artifact> {
        (0..n)
            .map(|d| artifact(d, ArtifactStatus::Complete))
            .collect()
    }

    fn id(days_ago: i64) -> String {
        paths::format_identifier(now() - Duration::days(days_ago))
    }

    #[test]
    fn empty_set_selects_nothing() {
        let policy = RetentionPolicy::default();
        assert!(policy.select_for_deletion(&[], now()).is_empty());
    }

    #[test]
    fn count_rule_keeps_newest() {
        let policy = RetentionPolicy::new(7, Duration::days(365));
        let selected = policy.select_for_deletion(&daily(10), now());
        let expected: BTreeSet<String> = [7, 8, 9].into_iter().map(id).collect();
        assert_eq!(selected, expected);
    }

    #[test]
    fn age_rule_applies_independently_of_count() {
        let policy = RetentionPolicy::new(7, Duration::days(2));
        let selected = policy.select_for_deletion(&daily(5), now());
        let expected: BTreeSet<String> = [3, 4].into_iter().map(id).collect();
        assert_eq!(selected, expected);
    }

    #[test]
    fn newest_survives_even_when_expired() {
        let policy = RetentionPolicy::new(7, Duration::days(1));
        let artifacts = vec![
            artifact(40, ArtifactStatus::Complete),
            artifact(50, ArtifactStatus::Complete),
        ];
        let selected = policy.select_for_deletion(&artifacts, now());
        assert_eq!(selected, BTreeSet::from([id(50)]));
    }

    #[test]
    fn single_recent_backup_is_never_pruned() {
        let policy = RetentionPolicy::new(1, Duration::days(1));
        let selected = policy.select_for_deletion(&daily(1), now());
        assert!(selected.is_empty());
    }

    #[test]
    fn partial_and_failed_are_ignored_and_do_not_count() {
        let policy = RetentionPolicy::new(2, Duration::days(365));
        let artifacts = vec![
            artifact(0, ArtifactStatus::Partial),
            artifact(1, ArtifactStatus::Complete),
            artifact(2, ArtifactStatus::Failed),
            artifact(3, ArtifactStatus::Complete),
            artifact(4, ArtifactStatus::Complete),
            artifact(400, ArtifactStatus::Partial),
        ];
        let selected = policy.select_for_deletion(&artifacts, now());
        assert_eq!(selected, BTreeSet::from([id(4)]));
    }

    #[test]
    fn input_order_does_not_matter() {
        let policy = RetentionPolicy::new(3, Duration::days(365));
        let mut artifacts = daily(6);
        artifacts.reverse();
        let selected = policy.select_for_deletion(&artifacts, now());
        let expected: BTreeSet<String> = [3, 4, 5].into_iter().map(id).collect();
        assert_eq!(selected, expected);
    }

    #[test]
    fn timestamp_ties_break_on_identifier() {
        let policy = RetentionPolicy::new(1, Duration::days(365));
        let mut a = artifact(1, ArtifactStatus::Complete);
        let mut b = a.clone();
        a.identifier = "20261015T030000000Z".into();
        b.identifier = "20261015T030000001Z".into();
        let selected = policy.select_for_deletion(&[a.clone(), b], now());
        assert_eq!(selected, BTreeSet::from([a.identifier]));
    }

    #[test]
    fn retained_count_never_exceeds_max_or_drops_to_zero() {
        for max_count in 1..=5 {
            for max_age_days in [1, 3, 30] {
                for n in 1..=12 {
                    let policy = RetentionPolicy::new(max_count, Duration::days(max_age_days));
                    let artifacts = daily(n);
                    let selected = policy.select_for_deletion(&artifacts, now());
                    let retained = artifacts.len() - selected.len();
                    assert!(retained <= max_count, "max_count={max_count} n={n}");
                    assert!(retained >= 1, "max_count={max_count} n={n}");
                }
            }
        }
    }

    #[test]
    fn selection_is_idempotent_after_deletion() {
        let policy = RetentionPolicy::new(3, Duration::days(5));
        let artifacts = daily(9);
        let selected = policy.select_for_deletion(&artifacts, now());
        let survivors: Vec<Artifact> = artifacts
            .into_iter()
            .filter(|a| !selected.contains(&a.identifier))
            .collect();
        assert!(policy.select_for_deletion(&survivors, now()).is_empty());
    }
}
