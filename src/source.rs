use anyhow::Context;
use duckdb::{Connection, OptionalExt, params_from_iter};
use serde::{Deserialize, Serialize};

use crate::model::ProviderRecord;

/// Upstream filters applied before aggregation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderQuery {
    /// Exact-match allow-list on `state`; empty means all states.
    #[serde(default)]
    pub states: Vec<String>,
    #[serde(default)]
    pub outcome: Option<String>,
    /// Restrict to these NPIs; empty means no restriction.
    #[serde(default)]
    pub npis: Vec<String>,
}

impl ProviderQuery {
    pub fn matches(&self, r: &ProviderRecord) -> bool {
        if !self.states.is_empty() {
            let Some(state) = r.state.as_deref() else {
                return false;
            };
            if !self.states.iter().any(|s| s == state) {
                return false;
            }
        }
        if let Some(outcome) = self.outcome.as_deref() {
            if r.outcome.as_deref() != Some(outcome) {
                return false;
            }
        }
        if !self.npis.is_empty() && !self.npis.iter().any(|n| *n == r.npi) {
            return false;
        }
        true
    }
}

pub trait ProviderSource {
    fn fetch(&self, q: &ProviderQuery) -> anyhow::Result<Vec<ProviderRecord>>;
}

impl ProviderSource for [ProviderRecord] {
    fn fetch(&self, q: &ProviderQuery) -> anyhow::Result<Vec<ProviderRecord>> {
        Ok(self.iter().filter(|r| q.matches(r)).cloned().collect())
    }
}

/// Reads the normalized `providers` table built by `build`.
pub struct DuckDbSource<'a> {
    conn: &'a Connection,
}

impl<'a> DuckDbSource<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn provider(&self, npi: &str) -> anyhow::Result<Option<ProviderRecord>> {
        let sql = format!("SELECT {PROVIDER_COLUMNS} FROM providers WHERE npi = ? LIMIT 1");
        let mut stmt = self.conn.prepare(&sql)?;
        let r = stmt.query_row([npi], row_to_record).optional()?;
        Ok(r)
    }
}

impl ProviderSource for DuckDbSource<'_> {
    fn fetch(&self, q: &ProviderQuery) -> anyhow::Result<Vec<ProviderRecord>> {
        let mut where_sql = String::from("WHERE 1=1");
        let mut args: Vec<String> = Vec::new();

        if !q.states.is_empty() {
            where_sql.push_str(" AND state IN (");
            where_sql.push_str(&placeholders(q.states.len()));
            where_sql.push(')');
            args.extend(q.states.iter().cloned());
        }
        if let Some(outcome) = q.outcome.as_deref() {
            where_sql.push_str(" AND outcome = ?");
            args.push(outcome.to_string());
        }
        if !q.npis.is_empty() {
            where_sql.push_str(" AND npi IN (");
            where_sql.push_str(&placeholders(q.npis.len()));
            where_sql.push(')');
            args.extend(q.npis.iter().cloned());
        }

        let sql = format!("SELECT {PROVIDER_COLUMNS} FROM providers {where_sql} ORDER BY npi");
        let mut stmt = self.conn.prepare(&sql).context("prepare provider fetch")?;
        let rows = stmt.query_map(params_from_iter(args.iter()), row_to_record)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}

pub(crate) const PROVIDER_COLUMNS: &str = "npi, name, state, city, zip_code, years_in_practice, \
     patients, patients_phenom, phenom_lift_potential, is_client_target, latitude, longitude, \
     specialty, outcome";

pub(crate) fn row_to_record(row: &duckdb::Row<'_>) -> duckdb::Result<ProviderRecord> {
    Ok(ProviderRecord {
        npi: row.get(0)?,
        name: row.get(1)?,
        state: row.get(2)?,
        city: row.get(3)?,
        zip_code: row.get(4)?,
        years_in_practice: row.get(5)?,
        patients: row.get(6)?,
        patients_phenom: row.get(7)?,
        phenom_lift_potential: row.get(8)?,
        is_client_target: row.get::<usize, Option<bool>>(9)?.unwrap_or(false),
        latitude: row.get(10)?,
        longitude: row.get(11)?,
        specialty: row.get(12)?,
        outcome: row.get(13)?,
    })
}

pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}
