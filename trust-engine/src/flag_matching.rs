use sha1::{Digest, Sha1};
use std::fmt::Write;

use crate::api::{DecisionSource, FlagDecision};
use crate::flag_definitions::{Flag, Override, Rule, RuleKind};
use crate::ids::OrgId;

const LONG_SCALE: u64 = 0xfffffffffffffff;

/// This function takes an organization id and a flag key and returns a float
/// in [0, 100). Given the same pair it always returns the same value. These
/// values are uniformly distributed, so if we want to roll a feature out to
/// 20% of organizations we can do `bucket(org, key) < 20.0`. Because the
/// enabled set at percentage p is a prefix of the set at p' > p, raising a
/// rollout never disables an organization that was already enabled.
pub fn bucket(org_id: OrgId, flag_key: &str) -> f64 {
    let hash_key = format!("{}.{}", flag_key, org_id);
    let mut hasher = Sha1::new();
    hasher.update(hash_key.as_bytes());
    let result = hasher.finalize();
    // :TRICKY: Convert the first 15 hex digits of the digest to a u64,
    // padding each byte as 2 characters
    let hex_str: String = result.iter().fold(String::new(), |mut acc, byte| {
        let _ = write!(acc, "{:02x}", byte);
        acc
    })[..15]
        .to_string();
    let hash_val = u64::from_str_radix(&hex_str, 16).unwrap();

    (hash_val as f64 / LONG_SCALE as f64) * 100.0
}

fn rule_matches(rule: &Rule, org_id: OrgId, flag_key: &str) -> bool {
    match rule.kind {
        RuleKind::OrgList => rule.org_ids.contains(&org_id),
        RuleKind::Percentage => bucket(org_id, flag_key) < rule.normalized_percentage(),
        RuleKind::Global => true,
        // Rules written by a newer schema revision never match here.
        RuleKind::Unknown => false,
    }
}

/// Resolves a flag for one organization: a live override always wins, then
/// the first matching enabled rule in `(priority asc, id asc)` order, then
/// the flag default. Pure with respect to its inputs; the caller is
/// responsible for filtering the override for liveness.
pub fn resolve(
    flag: &Flag,
    rules: &[Rule],
    live_override: Option<&Override>,
    org_id: OrgId,
) -> FlagDecision {
    if let Some(ov) = live_override {
        return FlagDecision {
            enabled: ov.enabled,
            source: DecisionSource::Override,
            rule_id: None,
        };
    }

    let mut ordered: Vec<&Rule> = rules
        .iter()
        .filter(|rule| rule.enabled && rule.flag_id == flag.id)
        .collect();
    ordered.sort_by_key(|rule| (rule.priority, rule.id));

    for rule in ordered {
        if rule_matches(rule, org_id, &flag.key) {
            return FlagDecision {
                enabled: rule.enabled,
                source: DecisionSource::Rule,
                rule_id: Some(rule.id),
            };
        }
    }

    FlagDecision::from_default(flag.enabled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{FlagId, RuleId};
    use std::collections::BTreeSet;

    fn test_flag(enabled: bool) -> Flag {
        Flag {
            id: FlagId::new(),
            key: "new-dashboard".to_string(),
            name: "New dashboard".to_string(),
            enabled,
        }
    }

    fn rule(flag: &Flag, kind: RuleKind, priority: i32) -> Rule {
        Rule {
            id: RuleId::new(),
            flag_id: flag.id,
            kind,
            org_ids: BTreeSet::new(),
            percentage: 100.0,
            priority,
            enabled: true,
        }
    }

    #[test]
    fn test_bucket_is_deterministic_and_in_range() {
        let org = OrgId::new();
        let value = bucket(org, "new-dashboard");
        assert!((0.0..100.0).contains(&value));
        for _ in 0..10 {
            assert_eq!(bucket(org, "new-dashboard"), value);
        }
    }

    #[test]
    fn test_bucket_varies_across_orgs_and_keys() {
        let org = OrgId::new();
        let other_org = OrgId::new();
        // Distinct inputs virtually never collide on 60 bits of digest.
        assert_ne!(bucket(org, "new-dashboard"), bucket(other_org, "new-dashboard"));
        assert_ne!(bucket(org, "new-dashboard"), bucket(org, "beta-exports"));
    }

    #[test]
    fn test_bucket_is_roughly_uniform() {
        let enabled = (0..1000)
            .filter(|_| bucket(OrgId::new(), "new-dashboard") < 50.0)
            .count();
        assert!(
            (350..=650).contains(&enabled),
            "expected ~500 of 1000 orgs under a 50% threshold, got {enabled}"
        );
    }

    #[test]
    fn test_override_wins_over_all_rules() {
        let flag = test_flag(true);
        let rules = vec![rule(&flag, RuleKind::Global, 0)];
        let ov = Override {
            id: uuid::Uuid::now_v7(),
            flag_id: flag.id,
            org_id: OrgId::new(),
            enabled: false,
            reason: "support escalation".to_string(),
            expires_at: None,
        };

        let decision = resolve(&flag, &rules, Some(&ov), ov.org_id);
        assert_eq!(decision.enabled, false);
        assert_eq!(decision.source, DecisionSource::Override);
        assert_eq!(decision.rule_id, None);
    }

    #[test]
    fn test_first_matching_rule_by_priority_decides() {
        let flag = test_flag(false);
        let low_priority = rule(&flag, RuleKind::Global, 10);
        let high_priority = rule(&flag, RuleKind::Global, 5);
        let rules = vec![low_priority.clone(), high_priority.clone()];

        let decision = resolve(&flag, &rules, None, OrgId::new());
        assert_eq!(decision.source, DecisionSource::Rule);
        assert_eq!(decision.rule_id, Some(high_priority.id));
    }

    #[test]
    fn test_priority_ties_break_on_rule_id() {
        let flag = test_flag(false);
        let first = rule(&flag, RuleKind::Global, 5);
        let second = rule(&flag, RuleKind::Global, 5);
        assert!(first.id < second.id);

        // Insertion order must not matter.
        let decision = resolve(&flag, &[second.clone(), first.clone()], None, OrgId::new());
        assert_eq!(decision.rule_id, Some(first.id));
    }

    #[test]
    fn test_disabled_rules_are_skipped() {
        let flag = test_flag(false);
        let mut paused = rule(&flag, RuleKind::Global, 0);
        paused.enabled = false;

        let decision = resolve(&flag, &[paused], None, OrgId::new());
        assert_eq!(decision.source, DecisionSource::Default);
        assert_eq!(decision.enabled, false);
    }

    #[test]
    fn test_org_list_rule_matches_only_listed_orgs() {
        let flag = test_flag(false);
        let listed = OrgId::new();
        let mut targeted = rule(&flag, RuleKind::OrgList, 0);
        targeted.org_ids = BTreeSet::from([listed]);
        let rules = vec![targeted];

        assert_eq!(resolve(&flag, &rules, None, listed).source, DecisionSource::Rule);
        assert_eq!(
            resolve(&flag, &rules, None, OrgId::new()).source,
            DecisionSource::Default
        );
    }

    #[test]
    fn test_percentage_rule_boundaries() {
        let flag = test_flag(false);
        let mut none = rule(&flag, RuleKind::Percentage, 0);
        none.percentage = 0.0;
        let mut all = rule(&flag, RuleKind::Percentage, 0);
        all.percentage = 100.0;

        for _ in 0..50 {
            let org = OrgId::new();
            assert_eq!(
                resolve(&flag, std::slice::from_ref(&none), None, org).source,
                DecisionSource::Default
            );
            assert_eq!(
                resolve(&flag, std::slice::from_ref(&all), None, org).source,
                DecisionSource::Rule
            );
        }
    }

    #[test]
    fn test_raising_percentage_never_drops_an_org() {
        let flag = test_flag(false);
        let mut narrow = rule(&flag, RuleKind::Percentage, 0);
        narrow.percentage = 30.0;
        let mut wide = narrow.clone();
        wide.percentage = 60.0;

        for _ in 0..200 {
            let org = OrgId::new();
            let at_narrow = resolve(&flag, std::slice::from_ref(&narrow), None, org);
            let at_wide = resolve(&flag, std::slice::from_ref(&wide), None, org);
            if at_narrow.enabled {
                assert!(at_wide.enabled, "org enabled at 30% must stay enabled at 60%");
            }
        }
    }

    #[test]
    fn test_unknown_rule_kind_never_matches() {
        let flag = test_flag(true);
        let decision = resolve(
            &flag,
            &[rule(&flag, RuleKind::Unknown, 0)],
            None,
            OrgId::new(),
        );
        assert_eq!(decision.source, DecisionSource::Default);
        assert_eq!(decision.enabled, true);
    }

    #[test]
    fn test_rules_for_other_flags_are_ignored() {
        let flag = test_flag(false);
        let other = test_flag(false);
        let decision = resolve(&flag, &[rule(&other, RuleKind::Global, 0)], None, OrgId::new());
        assert_eq!(decision.source, DecisionSource::Default);
    }
}
