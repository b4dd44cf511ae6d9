use anyhow::{Context, anyhow};
use duckdb::Connection;
use serde::{Deserialize, Serialize};

use crate::aggregate;
use crate::cli::AggregateArgs;
use crate::model::{GeographicalGroup, GroupingLevel, Presentation};
use crate::source::{DuckDbSource, ProviderQuery, ProviderSource};
use crate::storage::{StoragePaths, file_present_nonempty};
use crate::tiering;

/// Everything that determines one geographic result set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoRequest {
    #[serde(default)]
    pub level: GroupingLevel,
    #[serde(default)]
    pub view: Presentation,
    #[serde(flatten)]
    pub query: ProviderQuery,
}

/// Fetches, aggregates and tiers. List views come back ranked by high-risk patients,
/// map views keep first-seen order.
pub fn geographic_groups<S>(source: &S, req: &GeoRequest) -> anyhow::Result<Vec<GeographicalGroup>>
where
    S: ProviderSource + ?Sized,
{
    let records = source.fetch(&req.query)?;
    let mut groups = aggregate::aggregate(&records, req.level, req.view);
    tiering::assign_risk_tiers(&mut groups);
    if req.view == Presentation::List {
        aggregate::sort_for_list(&mut groups);
    }
    tracing::debug!(
        "{} records -> {} groups at {} level",
        records.len(),
        groups.len(),
        req.level
    );
    Ok(groups)
}

impl From<&AggregateArgs> for GeoRequest {
    fn from(a: &AggregateArgs) -> Self {
        GeoRequest {
            level: a.level,
            view: a.view,
            query: ProviderQuery {
                states: a.states.clone(),
                outcome: a.outcome.clone(),
                npis: a.npis.clone(),
            },
        }
    }
}

/// `aggregate` subcommand: one pipeline run against a built data dir, JSON on stdout.
pub fn run(opts: AggregateArgs) -> anyhow::Result<()> {
    let paths = StoragePaths::new(&opts.data_dir);
    if !file_present_nonempty(&paths.duckdb_path) {
        return Err(anyhow!(
            "DuckDB not found at {}. Run: phenom-risk-panel build",
            paths.duckdb_path.display()
        ));
    }
    let conn = Connection::open(&paths.duckdb_path)
        .with_context(|| format!("open duckdb at {}", paths.duckdb_path.display()))?;

    let req = GeoRequest::from(&opts);
    let groups = geographic_groups(&DuckDbSource::new(&conn), &req)?;
    tracing::info!("{} groups at {} level", groups.len(), req.level);

    let out = if opts.pretty {
        serde_json::to_string_pretty(&groups)?
    } else {
        serde_json::to_string(&groups)?
    };
    println!("{out}");
    Ok(())
}
