use crate::model::{Centroid, GroupingLevel, ProviderRecord, UNKNOWN};

/// Geographic center of the contiguous United States.
pub const US_CENTER: Centroid = Centroid {
    lat: 39.8283,
    lon: -98.5795,
};

// Approximate geographic centers, keyed by USPS code.
const STATE_CENTROIDS: &[(&str, f64, f64)] = &[
    ("AL", 32.806671, -86.791130),
    ("AK", 61.370716, -152.404419),
    ("AZ", 33.729759, -111.431221),
    ("AR", 34.969704, -92.373123),
    ("CA", 36.116203, -119.681564),
    ("CO", 39.059811, -105.311104),
    ("CT", 41.597782, -72.755371),
    ("DE", 39.318523, -75.507141),
    ("DC", 38.897438, -77.026817),
    ("FL", 27.766279, -81.686783),
    ("GA", 33.040619, -83.643074),
    ("HI", 21.094318, -157.498337),
    ("ID", 44.240459, -114.478828),
    ("IL", 40.349457, -88.986137),
    ("IN", 39.849426, -86.258278),
    ("IA", 42.011539, -93.210526),
    ("KS", 38.526600, -96.726486),
    ("KY", 37.668140, -84.670067),
    ("LA", 31.169546, -91.867805),
    ("ME", 44.693947, -69.381927),
    ("MD", 39.063946, -76.802101),
    ("MA", 42.230171, -71.530106),
    ("MI", 43.326618, -84.536095),
    ("MN", 45.694454, -93.900192),
    ("MS", 32.741646, -89.678696),
    ("MO", 38.456085, -92.288368),
    ("MT", 46.921925, -110.454353),
    ("NE", 41.125370, -98.268082),
    ("NV", 38.313515, -117.055374),
    ("NH", 43.452492, -71.563896),
    ("NJ", 40.298904, -74.521011),
    ("NM", 34.840515, -106.248482),
    ("NY", 42.165726, -74.948051),
    ("NC", 35.630066, -79.806419),
    ("ND", 47.528912, -99.784012),
    ("OH", 40.388783, -82.764915),
    ("OK", 35.565342, -96.928917),
    ("OR", 44.572021, -122.070938),
    ("PA", 40.590752, -77.209755),
    ("RI", 41.680893, -71.511780),
    ("SC", 33.856892, -80.945007),
    ("SD", 44.299782, -99.438828),
    ("TN", 35.747845, -86.692345),
    ("TX", 31.054487, -97.563461),
    ("UT", 40.150032, -111.862434),
    ("VT", 44.045876, -72.710686),
    ("VA", 37.769337, -78.169968),
    ("WA", 47.400902, -121.490494),
    ("WV", 38.491226, -80.954453),
    ("WI", 44.268543, -89.616508),
    ("WY", 42.755966, -107.302490),
    ("PR", 18.220833, -66.590149),
];

/// Centroid for a state code, falling back to the center of the continental US.
pub fn state_centroid(state: &str) -> Centroid {
    let code = state.trim();
    STATE_CENTROIDS
        .iter()
        .find(|(c, _, _)| c.eq_ignore_ascii_case(code))
        .map(|&(_, lat, lon)| Centroid { lat, lon })
        .unwrap_or(US_CENTER)
}

pub fn mean_centroid(points: &[(f64, f64)]) -> Option<Centroid> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f64;
    let (lat, lon) = points
        .iter()
        .fold((0.0, 0.0), |(a, b), (lat, lon)| (a + lat, b + lon));
    Some(Centroid {
        lat: lat / n,
        lon: lon / n,
    })
}

fn present(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

fn usable_state(s: Option<&str>) -> Option<&str> {
    present(s).filter(|s| *s != UNKNOWN)
}

fn usable_zip(s: Option<&str>) -> Option<&str> {
    let raw = s?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    // A zip that is all zeroes is a placeholder, not a location.
    if trimmed.chars().all(|c| c == '0') {
        return None;
    }
    Some(raw)
}

/// Group key for a record at the given level, or `None` if it has no usable key.
pub fn group_key(record: &ProviderRecord, level: GroupingLevel) -> Option<String> {
    match level {
        GroupingLevel::State => usable_state(record.state.as_deref()).map(str::to_string),
        GroupingLevel::City => {
            let city = present(record.city.as_deref())?;
            let state = usable_state(record.state.as_deref())?;
            Some(format!("{city}, {state}"))
        }
        GroupingLevel::Zipcode => usable_zip(record.zip_code.as_deref()).map(str::to_string),
    }
}

/// Normalizes a free-form postal code to its 5-digit form.
pub fn normalize_zip5(s: &str) -> Option<String> {
    let mut digits = String::with_capacity(5);
    for ch in s.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            if digits.len() == 5 {
                break;
            }
        } else if !digits.is_empty() {
            break;
        }
    }
    if digits.len() == 5 {
        Some(digits)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(state: Option<&str>, city: Option<&str>, zip: Option<&str>) -> ProviderRecord {
        ProviderRecord {
            npi: "1".to_string(),
            state: state.map(str::to_string),
            city: city.map(str::to_string),
            zip_code: zip.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn state_key_skips_unknown_sentinel() {
        assert_eq!(
            group_key(&rec(Some("MA"), None, None), GroupingLevel::State).as_deref(),
            Some("MA")
        );
        assert_eq!(
            group_key(&rec(Some("Unknown"), None, None), GroupingLevel::State),
            None
        );
        assert_eq!(group_key(&rec(Some("  "), None, None), GroupingLevel::State), None);
    }

    #[test]
    fn city_key_needs_city_and_state() {
        assert_eq!(
            group_key(&rec(Some("MA"), Some("Boston"), None), GroupingLevel::City).as_deref(),
            Some("Boston, MA")
        );
        assert_eq!(group_key(&rec(None, Some("Boston"), None), GroupingLevel::City), None);
        assert_eq!(group_key(&rec(Some("MA"), Some(""), None), GroupingLevel::City), None);
    }

    #[test]
    fn zip_key_is_verbatim() {
        assert_eq!(
            group_key(&rec(None, None, Some("02139-1234")), GroupingLevel::Zipcode).as_deref(),
            Some("02139-1234")
        );
        assert_eq!(group_key(&rec(None, None, Some("")), GroupingLevel::Zipcode), None);
        assert_eq!(group_key(&rec(None, None, Some("0")), GroupingLevel::Zipcode), None);
        assert_eq!(group_key(&rec(None, None, None), GroupingLevel::Zipcode), None);
    }

    #[test]
    fn unknown_state_falls_back_to_us_center() {
        assert_eq!(state_centroid("ZZ"), US_CENTER);
        let ma = state_centroid("ma");
        assert!((ma.lat - 42.230171).abs() < 1e-9);
    }

    #[test]
    fn mean_centroid_averages() {
        let c = mean_centroid(&[(40.0, -70.0), (42.0, -72.0)]).unwrap();
        assert_eq!(c.lat, 41.0);
        assert_eq!(c.lon, -71.0);
        assert!(mean_centroid(&[]).is_none());
    }

    #[test]
    fn zip5_normalization() {
        assert_eq!(normalize_zip5("02139-1234").as_deref(), Some("02139"));
        assert_eq!(normalize_zip5("021391234").as_deref(), Some("02139"));
        assert_eq!(normalize_zip5("213"), None);
    }
}
