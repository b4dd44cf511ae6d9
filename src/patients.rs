//! Per-patient risk scores and the outcome × time-horizon panel built from them.
//!
//! Each `patient_risks` row is one score for one person, outcome and horizon. The panel
//! pivots those rows into one row per person with a column per (outcome, horizon) pair.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::str::FromStr;

use anyhow::{Context, anyhow};
use duckdb::{Connection, params_from_iter};
use serde::{Deserialize, Serialize};

use crate::source::placeholders;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatientRisk {
    pub person_id: String,
    pub name: Option<String>,
    pub age: Option<i64>,
    pub sex: Option<String>,
    pub state: Option<String>,
    /// Attributed provider.
    pub npi: Option<String>,
    pub outcome: String,
    pub time_horizon: String,
    pub absolute_risk: Option<f64>,
    pub relative_risk: Option<f64>,
}

impl PatientRisk {
    pub fn score(&self, kind: ScoreKind) -> Option<f64> {
        let v = match kind {
            ScoreKind::Absolute => self.absolute_risk,
            ScoreKind::Relative => self.relative_risk,
        };
        v.filter(|x| x.is_finite())
    }
}

/// Which score fills the panel cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScoreKind {
    #[default]
    Absolute,
    Relative,
}

impl FromStr for ScoreKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "absolute" | "abs" => Ok(ScoreKind::Absolute),
            "relative" | "rel" => Ok(ScoreKind::Relative),
            other => Err(anyhow!(
                "unknown score {other:?}; expected absolute or relative"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PanelColumn {
    pub outcome: String,
    pub time_horizon: String,
}

/// Parses `outcome:horizon`, e.g. `stroke:1y`.
impl FromStr for PanelColumn {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (outcome, horizon) = s
            .split_once(':')
            .ok_or_else(|| anyhow!("expected <outcome>:<time_horizon>, got {s:?}"))?;
        let (outcome, horizon) = (outcome.trim(), horizon.trim());
        if outcome.is_empty() || horizon.is_empty() {
            return Err(anyhow!("expected <outcome>:<time_horizon>, got {s:?}"));
        }
        Ok(PanelColumn {
            outcome: outcome.to_string(),
            time_horizon: horizon.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PanelRow {
    pub person_id: String,
    pub name: Option<String>,
    pub age: Option<i64>,
    pub sex: Option<String>,
    pub state: Option<String>,
    pub npi: Option<String>,
    /// One cell per panel column, in column order.
    pub scores: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatientPanel {
    pub score: ScoreKind,
    pub columns: Vec<PanelColumn>,
    pub total_patients: usize,
    pub rows: Vec<PanelRow>,
}

impl PatientPanel {
    /// Keeps one page of rows; `total_patients` still counts all of them.
    pub fn page(mut self, page: usize, page_size: usize) -> Self {
        let page_size = page_size.clamp(1, 500);
        let start = page.saturating_mul(page_size).min(self.rows.len());
        self.rows = self.rows.into_iter().skip(start).take(page_size).collect();
        self
    }
}

/// Filters for [`fetch_patient_risks`]; empty lists mean no restriction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatientQuery {
    pub outcomes: Vec<String>,
    pub time_horizons: Vec<String>,
    pub states: Vec<String>,
    pub npis: Vec<String>,
    pub person_ids: Vec<String>,
}

const PATIENT_COLUMNS: &str = "person_id, name, age, sex, state, npi, outcome, time_horizon, \
     absolute_risk, relative_risk";

pub fn fetch_patient_risks(
    conn: &Connection,
    q: &PatientQuery,
) -> anyhow::Result<Vec<PatientRisk>> {
    let mut where_sql = String::from("WHERE 1=1");
    let mut args: Vec<String> = Vec::new();
    for (col, values) in [
        ("outcome", &q.outcomes),
        ("time_horizon", &q.time_horizons),
        ("state", &q.states),
        ("npi", &q.npis),
        ("person_id", &q.person_ids),
    ] {
        if values.is_empty() {
            continue;
        }
        where_sql.push_str(&format!(" AND {col} IN ({})", placeholders(values.len())));
        args.extend(values.iter().cloned());
    }

    let sql = format!(
        "SELECT {PATIENT_COLUMNS} FROM patient_risks {where_sql} \
         ORDER BY person_id, outcome, time_horizon"
    );
    let mut stmt = conn.prepare(&sql).context("prepare patient risk fetch")?;
    let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
        Ok(PatientRisk {
            person_id: row.get(0)?,
            name: row.get(1)?,
            age: row.get(2)?,
            sex: row.get(3)?,
            state: row.get(4)?,
            npi: row.get(5)?,
            outcome: row.get(6)?,
            time_horizon: row.get(7)?,
            absolute_risk: row.get(8)?,
            relative_risk: row.get(9)?,
        })
    })?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

/// Pivots risk rows into the panel.
///
/// Columns are ordered by outcome, then by horizon length. With `sort_by` naming a panel
/// column, rows are ranked by that cell (highest first, empty cells last); otherwise, and
/// among ties, by person id. A repeated (person, outcome, horizon) keeps its first score.
pub fn compose_panel(
    records: &[PatientRisk],
    score: ScoreKind,
    sort_by: Option<&PanelColumn>,
) -> PatientPanel {
    let mut columns: Vec<PanelColumn> = Vec::new();
    for r in records {
        if !columns
            .iter()
            .any(|c| c.outcome == r.outcome && c.time_horizon == r.time_horizon)
        {
            columns.push(PanelColumn {
                outcome: r.outcome.clone(),
                time_horizon: r.time_horizon.clone(),
            });
        }
    }
    columns.sort_by(|a, b| {
        a.outcome
            .cmp(&b.outcome)
            .then_with(|| cmp_horizons(&a.time_horizon, &b.time_horizon))
    });

    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut rows: Vec<PanelRow> = Vec::new();
    let mut filled: Vec<Vec<bool>> = Vec::new();
    for r in records {
        let i = *index.entry(r.person_id.as_str()).or_insert_with(|| {
            rows.push(PanelRow {
                person_id: r.person_id.clone(),
                name: None,
                age: None,
                sex: None,
                state: None,
                npi: None,
                scores: vec![None; columns.len()],
            });
            filled.push(vec![false; columns.len()]);
            rows.len() - 1
        });
        let row = &mut rows[i];
        row.name = row.name.take().or_else(|| r.name.clone());
        row.age = row.age.or(r.age);
        row.sex = row.sex.take().or_else(|| r.sex.clone());
        row.state = row.state.take().or_else(|| r.state.clone());
        row.npi = row.npi.take().or_else(|| r.npi.clone());

        let Some(j) = columns
            .iter()
            .position(|c| c.outcome == r.outcome && c.time_horizon == r.time_horizon)
        else {
            continue;
        };
        if !filled[i][j] {
            filled[i][j] = true;
            row.scores[j] = r.score(score);
        }
    }

    let sort_col = sort_by.and_then(|s| columns.iter().position(|c| c == s));
    rows.sort_by(|a, b| {
        let by_score = match sort_col {
            Some(j) => cmp_desc_missing_last(a.scores[j], b.scores[j]),
            None => Ordering::Equal,
        };
        by_score.then_with(|| a.person_id.cmp(&b.person_id))
    });

    PatientPanel {
        score,
        columns,
        total_patients: rows.len(),
        rows,
    }
}

fn cmp_desc_missing_last(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => y.total_cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn cmp_horizons(a: &str, b: &str) -> Ordering {
    match (horizon_days(a), horizon_days(b)) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

/// Approximate length in days of horizons like `30d`, `6m`, `1y` or `5 years`.
fn horizon_days(s: &str) -> Option<u32> {
    let s = s.trim().to_ascii_lowercase();
    let split = s.find(|c: char| !c.is_ascii_digit())?;
    let n: u32 = s[..split].parse().ok()?;
    let per = match s[split..].trim() {
        "d" | "day" | "days" => 1,
        "w" | "wk" | "week" | "weeks" => 7,
        "m" | "mo" | "month" | "months" => 30,
        "y" | "yr" | "year" | "years" => 365,
        _ => return None,
    };
    n.checked_mul(per)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::tests::seeded_connection;

    fn risk(person: &str, outcome: &str, horizon: &str, abs: f64, rel: f64) -> PatientRisk {
        PatientRisk {
            person_id: person.to_string(),
            outcome: outcome.to_string(),
            time_horizon: horizon.to_string(),
            absolute_risk: Some(abs),
            relative_risk: Some(rel),
            ..Default::default()
        }
    }

    fn column_labels(panel: &PatientPanel) -> Vec<String> {
        panel
            .columns
            .iter()
            .map(|c| format!("{}:{}", c.outcome, c.time_horizon))
            .collect()
    }

    #[test]
    fn horizons_order_by_length() {
        assert_eq!(horizon_days("30d"), Some(30));
        assert_eq!(horizon_days("6m"), Some(180));
        assert_eq!(horizon_days("1y"), Some(365));
        assert_eq!(horizon_days("5 years"), Some(1825));
        assert_eq!(horizon_days("lifetime"), None);
        assert_eq!(cmp_horizons("1y", "90d"), Ordering::Greater);
        assert_eq!(cmp_horizons("lifetime", "5y"), Ordering::Greater);
    }

    #[test]
    fn panel_pivots_outcomes_and_horizons() {
        let records = vec![
            risk("p2", "stroke", "1y", 0.2, 1.1),
            risk("p1", "stroke", "5y", 0.4, 1.9),
            risk("p1", "heart_failure", "1y", 0.1, 2.5),
            risk("p1", "stroke", "30d", 0.01, 1.0),
        ];
        let panel = compose_panel(&records, ScoreKind::Absolute, None);
        assert_eq!(
            column_labels(&panel),
            vec!["heart_failure:1y", "stroke:30d", "stroke:1y", "stroke:5y"]
        );
        assert_eq!(panel.total_patients, 2);
        assert_eq!(panel.rows[0].person_id, "p1");
        assert_eq!(panel.rows[0].scores, vec![Some(0.1), Some(0.01), None, Some(0.4)]);
        assert_eq!(panel.rows[1].scores, vec![None, None, Some(0.2), None]);

        let relative = compose_panel(&records, ScoreKind::Relative, None);
        assert_eq!(relative.rows[0].scores[0], Some(2.5));
    }

    #[test]
    fn sort_column_ranks_rows_with_gaps_last() {
        let records = vec![
            risk("a", "stroke", "1y", 0.1, 1.0),
            risk("b", "stroke", "1y", 0.3, 1.0),
            risk("c", "heart_failure", "1y", 0.9, 1.0),
            risk("d", "stroke", "1y", 0.3, 1.0),
        ];
        let col: PanelColumn = "stroke:1y".parse().unwrap();
        let panel = compose_panel(&records, ScoreKind::Absolute, Some(&col));
        let order: Vec<&str> = panel.rows.iter().map(|r| r.person_id.as_str()).collect();
        assert_eq!(order, vec!["b", "d", "a", "c"]);

        // A column that isn't in the panel falls back to person order.
        let missing: PanelColumn = "sepsis:1y".parse().unwrap();
        let panel = compose_panel(&records, ScoreKind::Absolute, Some(&missing));
        assert_eq!(panel.rows[0].person_id, "a");
    }

    #[test]
    fn repeated_cell_keeps_first_and_bad_scores_are_empty() {
        let mut nan = risk("p1", "stroke", "1y", f64::NAN, 1.0);
        nan.name = Some("Ana".to_string());
        let records = vec![nan, risk("p1", "stroke", "1y", 0.5, 1.0)];
        let panel = compose_panel(&records, ScoreKind::Absolute, None);
        assert_eq!(panel.rows.len(), 1);
        assert_eq!(panel.rows[0].scores, vec![None]);
        assert_eq!(panel.rows[0].name.as_deref(), Some("Ana"));
    }

    #[test]
    fn paging_keeps_the_total() {
        let records: Vec<PatientRisk> = (0..5)
            .map(|i| risk(&format!("p{i}"), "stroke", "1y", 0.1, 1.0))
            .collect();
        let panel = compose_panel(&records, ScoreKind::Absolute, None).page(1, 2);
        assert_eq!(panel.total_patients, 5);
        let ids: Vec<&str> = panel.rows.iter().map(|r| r.person_id.as_str()).collect();
        assert_eq!(ids, vec!["p2", "p3"]);

        let past_end = compose_panel(&records, ScoreKind::Absolute, None).page(9, 2);
        assert!(past_end.rows.is_empty());
    }

    #[test]
    fn bad_column_and_score_strings() {
        assert!("stroke".parse::<PanelColumn>().is_err());
        assert!("stroke: ".parse::<PanelColumn>().is_err());
        assert_eq!("REL".parse::<ScoreKind>().unwrap(), ScoreKind::Relative);
        assert!("percentile".parse::<ScoreKind>().is_err());
    }

    #[test]
    fn fetch_filters_patient_rows() {
        let conn = seeded_connection();
        let all = fetch_patient_risks(&conn, &PatientQuery::default()).unwrap();
        assert_eq!(all.len(), 6);

        let q = PatientQuery {
            outcomes: vec!["stroke".to_string()],
            states: vec!["TX".to_string()],
            ..Default::default()
        };
        let rows = fetch_patient_risks(&conn, &q).unwrap();
        let horizons: Vec<&str> = rows.iter().map(|r| r.time_horizon.as_str()).collect();
        assert_eq!(horizons, vec!["1y", "5y"]);
        assert_eq!(rows[0].relative_risk, None);

        let q = PatientQuery {
            npis: vec!["1000000001".to_string()],
            time_horizons: vec!["1y".to_string()],
            ..Default::default()
        };
        let rows = fetch_patient_risks(&conn, &q).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.person_id == "p1"));
        assert_eq!(rows[0].age, Some(67));
    }
}
