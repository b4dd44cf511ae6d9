//! Geographic rollups of provider records.
//!
//! Groups are rebuilt from scratch on every call; nothing here is incremental.

use std::collections::HashMap;

use crate::geo;
use crate::model::{
    GeographicalGroup, GroupingLevel, Presentation, ProviderRecord, UNKNOWN,
};

const TOP_SPECIALTIES: usize = 3;

struct Bucket<'a> {
    key: String,
    members: Vec<&'a ProviderRecord>,
}

/// Groups `records` at `level` and computes per-group statistics.
///
/// Tiers are left unset; see [`crate::tiering::assign_risk_tiers`]. Output order is the
/// order in which each key was first seen.
pub fn aggregate(
    records: &[ProviderRecord],
    level: GroupingLevel,
    presentation: Presentation,
) -> Vec<GeographicalGroup> {
    // Map markers need a real location at city/zip granularity.
    let needs_coords = presentation == Presentation::Map && level != GroupingLevel::State;

    let mut index: HashMap<String, usize> = HashMap::new();
    let mut buckets: Vec<Bucket<'_>> = Vec::new();

    for r in records {
        if needs_coords && r.coordinates().is_none() {
            continue;
        }
        let Some(key) = geo::group_key(r, level) else {
            continue;
        };
        match index.get(&key) {
            Some(&i) => buckets[i].members.push(r),
            None => {
                index.insert(key.clone(), buckets.len());
                buckets.push(Bucket {
                    key,
                    members: vec![r],
                });
            }
        }
    }

    let min_size = level.min_group_size();
    buckets
        .into_iter()
        .filter(|b| b.members.len() >= min_size)
        .map(|b| summarize(b, level, presentation))
        .collect()
}

fn summarize(
    bucket: Bucket<'_>,
    level: GroupingLevel,
    presentation: Presentation,
) -> GeographicalGroup {
    let members = &bucket.members;
    let provider_count = members.len();
    let total_patients: i64 = members.iter().map(|r| r.patients.unwrap_or(0)).sum();
    let high_risk_patients: i64 = members.iter().map(|r| r.patients_phenom.unwrap_or(0)).sum();
    let lift_sum: f64 = members.iter().map(|r| finite_or_zero(r.phenom_lift_potential)).sum();
    let avg_lift_score = round_half_up(lift_sum / provider_count as f64);

    let centroid = match (presentation, level) {
        (Presentation::List, _) => None,
        (Presentation::Map, GroupingLevel::State) => Some(geo::state_centroid(&bucket.key)),
        (Presentation::Map, _) => {
            let points: Vec<(f64, f64)> = members.iter().filter_map(|r| r.coordinates()).collect();
            geo::mean_centroid(&points)
        }
    };

    GeographicalGroup {
        top_specialties: top_specialties(members),
        key: bucket.key,
        level,
        provider_count,
        total_patients,
        high_risk_patients,
        avg_lift_score,
        centroid,
        risk_tier: None,
    }
}

/// Halves round toward positive infinity, so -2.5 becomes -2.
fn round_half_up(x: f64) -> i64 {
    (x + 0.5).floor() as i64
}

fn finite_or_zero(v: Option<f64>) -> f64 {
    v.filter(|x| x.is_finite()).unwrap_or(0.0)
}

/// Most frequent specialties, ties broken by first appearance.
fn top_specialties(members: &[&ProviderRecord]) -> Vec<String> {
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for r in members {
        let s = r
            .specialty
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(UNKNOWN);
        match counts.iter_mut().find(|(name, _)| *name == s) {
            Some((_, n)) => *n += 1,
            None => counts.push((s, 1)),
        }
    }
    // Stable sort keeps first-seen order among equal counts.
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    counts
        .into_iter()
        .take(TOP_SPECIALTIES)
        .map(|(s, _)| s.to_string())
        .collect()
}

/// Ordering used by the ranked list: most high-risk patients first.
pub fn sort_for_list(groups: &mut [GeographicalGroup]) {
    groups.sort_by(|a, b| b.high_risk_patients.cmp(&a.high_risk_patients));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(npi: &str, state: &str, city: &str, zip: &str) -> ProviderRecord {
        ProviderRecord {
            npi: npi.to_string(),
            state: Some(state.to_string()),
            city: Some(city.to_string()),
            zip_code: Some(zip.to_string()),
            patients: Some(100),
            patients_phenom: Some(10),
            phenom_lift_potential: Some(5.0),
            latitude: Some(42.0),
            longitude: Some(-71.0),
            specialty: Some("Cardiology".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn three_boston_providers_form_one_city_group() {
        let records = vec![
            provider("1", "MA", "Boston", "02101"),
            provider("2", "MA", "Boston", "02102"),
            provider("3", "MA", "Boston", "02103"),
        ];
        let groups = aggregate(&records, GroupingLevel::City, Presentation::List);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].key, "Boston, MA");
        assert_eq!(groups[0].provider_count, 3);
        assert_eq!(groups[0].total_patients, 300);
        assert_eq!(groups[0].high_risk_patients, 30);
        assert_eq!(groups[0].avg_lift_score, 5);
        assert!(groups[0].risk_tier.is_none());
    }

    #[test]
    fn single_member_city_is_dropped() {
        let records = vec![provider("1", "KS", "Solo City", "66002")];
        assert!(aggregate(&records, GroupingLevel::City, Presentation::List).is_empty());
    }

    #[test]
    fn single_member_zip_is_dropped() {
        let records = vec![
            provider("1", "MA", "Boston", "02101"),
            provider("2", "MA", "Boston", "02139"),
            provider("3", "MA", "Cambridge", "02139"),
        ];
        for view in [Presentation::List, Presentation::Map] {
            let groups = aggregate(&records, GroupingLevel::Zipcode, view);
            assert_eq!(groups.len(), 1, "{view:?}");
            assert_eq!(groups[0].key, "02139");
            assert_eq!(groups[0].provider_count, 2);
        }
    }

    #[test]
    fn single_member_state_is_kept() {
        let records = vec![provider("1", "KS", "Solo City", "66002")];
        let groups = aggregate(&records, GroupingLevel::State, Presentation::List);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].provider_count, 1);
    }

    #[test]
    fn empty_zip_is_excluded_from_zip_grouping() {
        let records = vec![
            provider("1", "MA", "Boston", ""),
            provider("2", "MA", "Boston", ""),
            provider("3", "MA", "Boston", "02101"),
            provider("4", "MA", "Boston", "02101"),
        ];
        let groups = aggregate(&records, GroupingLevel::Zipcode, Presentation::List);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].key, "02101");
        assert_eq!(groups[0].provider_count, 2);
    }

    #[test]
    fn every_valid_record_lands_in_exactly_one_group() {
        let mut records = Vec::new();
        for (i, (state, city)) in [
            ("MA", "Boston"),
            ("MA", "Boston"),
            ("MA", "Worcester"),
            ("NY", "Albany"),
            ("NY", "Albany"),
            ("NY", "Albany"),
            ("Unknown", "Nowhere"),
            ("TX", ""),
        ]
        .iter()
        .enumerate()
        {
            records.push(provider(&i.to_string(), state, city, "10001"));
        }

        let by_state = aggregate(&records, GroupingLevel::State, Presentation::List);
        let total: usize = by_state.iter().map(|g| g.provider_count).sum();
        // Only the "Unknown" row lacks a usable state.
        assert_eq!(total, 7);

        let by_city = aggregate(&records, GroupingLevel::City, Presentation::List);
        let total: usize = by_city.iter().map(|g| g.provider_count).sum();
        // 6 valid city keys, minus the lone Worcester row.
        assert_eq!(total, 5);
        assert!(by_city.iter().all(|g| g.provider_count >= 2));
    }

    #[test]
    fn missing_numbers_count_as_zero() {
        let mut a = provider("1", "MA", "Boston", "02101");
        let mut b = provider("2", "MA", "Boston", "02101");
        a.patients_phenom = None;
        a.phenom_lift_potential = None;
        b.phenom_lift_potential = Some(f64::NAN);
        b.patients = None;
        let groups = aggregate(&[a, b], GroupingLevel::State, Presentation::List);
        assert_eq!(groups[0].high_risk_patients, 10);
        assert_eq!(groups[0].total_patients, 100);
        assert_eq!(groups[0].avg_lift_score, 0);
    }

    #[test]
    fn lift_mean_is_rounded() {
        let mut a = provider("1", "MA", "Boston", "02101");
        let mut b = provider("2", "MA", "Boston", "02101");
        a.phenom_lift_potential = Some(3.0);
        b.phenom_lift_potential = Some(4.2);
        let groups = aggregate(&[a, b], GroupingLevel::State, Presentation::List);
        assert_eq!(groups[0].avg_lift_score, 4);
    }

    #[test]
    fn negative_half_lift_rounds_up() {
        let mut a = provider("1", "MA", "Boston", "02101");
        let mut b = provider("2", "MA", "Boston", "02101");
        a.phenom_lift_potential = Some(-2.0);
        b.phenom_lift_potential = Some(-3.0);
        let groups = aggregate(&[a.clone(), b.clone()], GroupingLevel::State, Presentation::List);
        assert_eq!(groups[0].avg_lift_score, -2);

        a.phenom_lift_potential = Some(2.0);
        b.phenom_lift_potential = Some(3.0);
        let groups = aggregate(&[a, b], GroupingLevel::State, Presentation::List);
        assert_eq!(groups[0].avg_lift_score, 3);
    }

    #[test]
    fn top_specialties_rank_by_frequency_then_first_seen() {
        let specs = [
            Some("Oncology"),
            Some("Cardiology"),
            None,
            Some("Cardiology"),
            Some("Neurology"),
            Some("Oncology"),
            Some("Pediatrics"),
        ];
        let records: Vec<ProviderRecord> = specs
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let mut r = provider(&i.to_string(), "MA", "Boston", "02101");
                r.specialty = s.map(str::to_string);
                r
            })
            .collect();
        let groups = aggregate(&records, GroupingLevel::State, Presentation::List);
        assert_eq!(
            groups[0].top_specialties,
            vec!["Oncology", "Cardiology", "Unknown"]
        );
    }

    #[test]
    fn map_view_drops_records_without_coordinates() {
        let mut a = provider("1", "MA", "Boston", "02101");
        let b = provider("2", "MA", "Boston", "02101");
        let mut c = provider("3", "MA", "Boston", "02101");
        a.latitude = Some(0.0);
        c.latitude = Some(44.0);
        c.longitude = Some(-73.0);

        let groups = aggregate(&[a.clone(), b.clone(), c.clone()], GroupingLevel::City, Presentation::Map);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].provider_count, 2);
        let centroid = groups[0].centroid.unwrap();
        assert_eq!(centroid.lat, 43.0);
        assert_eq!(centroid.lon, -72.0);

        // The list view keeps all three.
        let groups = aggregate(&[a, b, c], GroupingLevel::City, Presentation::List);
        assert_eq!(groups[0].provider_count, 3);
        assert!(groups[0].centroid.is_none());
    }

    #[test]
    fn map_view_uses_state_lookup() {
        let mut a = provider("1", "MA", "Boston", "02101");
        a.latitude = None;
        let mut b = provider("2", "XX", "Elsewhere", "99999");
        b.longitude = None;
        let groups = aggregate(&[a, b], GroupingLevel::State, Presentation::Map);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].centroid, Some(geo::state_centroid("MA")));
        assert_eq!(groups[1].centroid, Some(geo::US_CENTER));
    }

    #[test]
    fn no_valid_records_yields_empty() {
        let mut r = provider("1", "Unknown", "", "");
        r.state = Some(UNKNOWN.to_string());
        assert!(aggregate(&[r], GroupingLevel::State, Presentation::List).is_empty());
        assert!(aggregate(&[], GroupingLevel::Zipcode, Presentation::Map).is_empty());
    }

    #[test]
    fn list_sort_is_descending() {
        let mut records = Vec::new();
        for (i, (state, hr)) in [("MA", 5), ("NY", 20), ("TX", 10)].iter().enumerate() {
            let mut r = provider(&i.to_string(), state, "X", "1");
            r.patients_phenom = Some(*hr);
            records.push(r);
        }
        let mut groups = aggregate(&records, GroupingLevel::State, Presentation::List);
        assert_eq!(groups[0].key, "MA");
        sort_for_list(&mut groups);
        let keys: Vec<&str> = groups.iter().map(|g| g.key.as_str()).collect();
        assert_eq!(keys, vec!["NY", "TX", "MA"]);
    }
}
