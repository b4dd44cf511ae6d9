//! Relative risk tiers over one result set.
//!
//! Thresholds come from the distribution of `high_risk_patients` across the groups passed
//! in, so the same absolute count can land in different tiers under different filters.

use crate::model::{GeographicalGroup, RiskTier};

const HIGH_PERCENTILE: usize = 85;
const MEDIUM_PERCENTILE: usize = 60;

/// Value at rank `ceil(p/100 * n) - 1` of an ascending slice, clamped to the slice bounds.
pub fn percentile(sorted: &[i64], p: usize) -> Option<i64> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    let rank = (p * n).div_ceil(100).saturating_sub(1).min(n - 1);
    Some(sorted[rank])
}

pub fn tier_for(value: i64, p85: i64, p60: i64) -> RiskTier {
    if value >= p85 {
        RiskTier::High
    } else if value >= p60 {
        RiskTier::Medium
    } else {
        RiskTier::Low
    }
}

/// Assigns a tier to every group. Does nothing for an empty slice.
pub fn assign_risk_tiers(groups: &mut [GeographicalGroup]) {
    let mut values: Vec<i64> = groups.iter().map(|g| g.high_risk_patients).collect();
    values.sort_unstable();
    let (Some(p85), Some(p60)) = (
        percentile(&values, HIGH_PERCENTILE),
        percentile(&values, MEDIUM_PERCENTILE),
    ) else {
        return;
    };
    for g in groups.iter_mut() {
        g.risk_tier = Some(tier_for(g.high_risk_patients, p85, p60));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GroupingLevel;

    fn group(key: &str, high_risk: i64) -> GeographicalGroup {
        GeographicalGroup {
            key: key.to_string(),
            level: GroupingLevel::State,
            provider_count: 1,
            total_patients: high_risk * 10,
            high_risk_patients: high_risk,
            avg_lift_score: 0,
            top_specialties: Vec::new(),
            centroid: None,
            risk_tier: None,
        }
    }

    #[test]
    fn percentile_ranks() {
        let v: Vec<i64> = (1..=10).collect();
        assert_eq!(percentile(&v, 85), Some(9));
        assert_eq!(percentile(&v, 60), Some(6));
        assert_eq!(percentile(&v, 0), Some(1));
        assert_eq!(percentile(&v, 100), Some(10));
        assert_eq!(percentile(&[], 85), None);
    }

    #[test]
    fn ten_groups_split_into_three_tiers() {
        let mut groups: Vec<GeographicalGroup> =
            (1..=10).map(|i| group(&format!("g{i}"), i)).collect();
        assign_risk_tiers(&mut groups);
        for g in &groups {
            let expected = match g.high_risk_patients {
                9 | 10 => RiskTier::High,
                6..=8 => RiskTier::Medium,
                _ => RiskTier::Low,
            };
            assert_eq!(g.risk_tier, Some(expected), "group {}", g.key);
        }
    }

    #[test]
    fn input_order_does_not_matter() {
        let mut groups: Vec<GeographicalGroup> =
            [7, 2, 10, 5, 1, 9, 3, 8, 6, 4].iter().map(|&i| group(&i.to_string(), i)).collect();
        assign_risk_tiers(&mut groups);
        let ten = groups.iter().find(|g| g.high_risk_patients == 10).unwrap();
        let five = groups.iter().find(|g| g.high_risk_patients == 5).unwrap();
        assert_eq!(ten.risk_tier, Some(RiskTier::High));
        assert_eq!(five.risk_tier, Some(RiskTier::Low));
    }

    #[test]
    fn single_group_is_high_risk() {
        let mut groups = vec![group("only", 0)];
        assign_risk_tiers(&mut groups);
        assert_eq!(groups[0].risk_tier, Some(RiskTier::High));
    }

    #[test]
    fn empty_is_a_no_op() {
        let mut groups: Vec<GeographicalGroup> = Vec::new();
        assign_risk_tiers(&mut groups);
        assert!(groups.is_empty());
    }

    #[test]
    fn tiers_never_invert_order() {
        let values = [0, 0, 3, 3, 3, 17, 40, 41, 41, 1000, 2, 2, 9];
        let mut groups: Vec<GeographicalGroup> = values
            .iter()
            .enumerate()
            .map(|(i, &v)| group(&i.to_string(), v))
            .collect();
        assign_risk_tiers(&mut groups);

        let min_high = groups
            .iter()
            .filter(|g| g.risk_tier == Some(RiskTier::High))
            .map(|g| g.high_risk_patients)
            .min()
            .unwrap();
        let max_low = groups
            .iter()
            .filter(|g| g.risk_tier == Some(RiskTier::Low))
            .map(|g| g.high_risk_patients)
            .max()
            .unwrap();
        assert!(min_high >= max_low);
        assert!(groups.iter().all(|g| g.risk_tier.is_some()));
    }

    #[test]
    fn equal_values_share_a_tier() {
        let mut groups = vec![group("a", 4), group("b", 4), group("c", 4)];
        assign_risk_tiers(&mut groups);
        assert!(groups.iter().all(|g| g.risk_tier == Some(RiskTier::High)));
    }
}
