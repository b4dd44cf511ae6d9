use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

/// Sentinel some upstream views use in place of a missing state.
pub const UNKNOWN: &str = "Unknown";

/// One provider row as served by the normalized `providers` table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub npi: String,
    pub name: Option<String>,
    pub state: Option<String>,
    pub city: Option<String>,
    pub zip_code: Option<String>,
    pub years_in_practice: Option<f64>,
    pub patients: Option<i64>,
    pub patients_phenom: Option<i64>,
    pub phenom_lift_potential: Option<f64>,
    #[serde(default)]
    pub is_client_target: bool,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub specialty: Option<String>,
    pub outcome: Option<String>,
}

impl ProviderRecord {
    /// Latitude/longitude pair, if both are finite and non-zero.
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        let lat = self.latitude.filter(|v| v.is_finite() && *v != 0.0)?;
        let lon = self.longitude.filter(|v| v.is_finite() && *v != 0.0)?;
        Some((lat, lon))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GroupingLevel {
    #[default]
    State,
    City,
    Zipcode,
}

impl GroupingLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            GroupingLevel::State => "state",
            GroupingLevel::City => "city",
            GroupingLevel::Zipcode => "zipcode",
        }
    }

    /// Smallest member count a group needs before it is emitted.
    pub fn min_group_size(self) -> usize {
        match self {
            GroupingLevel::State => 1,
            GroupingLevel::City | GroupingLevel::Zipcode => 2,
        }
    }
}

impl fmt::Display for GroupingLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GroupingLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "state" => Ok(GroupingLevel::State),
            "city" => Ok(GroupingLevel::City),
            "zip" | "zipcode" | "zip_code" => Ok(GroupingLevel::Zipcode),
            other => Err(anyhow!(
                "unknown grouping level {other:?}; expected state, city or zipcode"
            )),
        }
    }
}

/// Which presenter the groups are computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Presentation {
    #[default]
    List,
    Map,
}

impl FromStr for Presentation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "list" | "table" => Ok(Presentation::List),
            "map" => Ok(Presentation::Map),
            other => Err(anyhow!("unknown view {other:?}; expected list or map")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RiskTier {
    #[serde(rename = "Low Risk")]
    Low,
    #[serde(rename = "Medium Risk")]
    Medium,
    #[serde(rename = "High Risk")]
    High,
}

impl RiskTier {
    pub fn label(self) -> &'static str {
        match self {
            RiskTier::Low => "Low Risk",
            RiskTier::Medium => "Medium Risk",
            RiskTier::High => "High Risk",
        }
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Centroid {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeographicalGroup {
    pub key: String,
    pub level: GroupingLevel,
    pub provider_count: usize,
    pub total_patients: i64,
    pub high_risk_patients: i64,
    pub avg_lift_score: i64,
    pub top_specialties: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub centroid: Option<Centroid>,
    pub risk_tier: Option<RiskTier>,
}
