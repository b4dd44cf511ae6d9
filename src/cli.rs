use clap::{Parser, Subcommand};

use crate::model::{GroupingLevel, Presentation};

const DEFAULT_DATA_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/data");

#[derive(Parser, Debug)]
#[command(name = "phenom-risk-panel")]
#[command(about = "PhenOM patient risk panel backend (DuckDB + Tantivy)", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fetch or load a provider snapshot, normalize it into DuckDB, build the search index.
    Build(BuildArgs),
    /// Serve the HTTP API (requires a completed build).
    Serve(ServeArgs),
    /// Print tiered geographic groups as JSON (requires a completed build).
    Aggregate(AggregateArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct BuildArgs {
    /// Backend data directory (snapshot, DuckDB DB, Tantivy index).
    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    pub data_dir: String,

    /// Local provider file (.csv, .parquet, .json or .ndjson). Takes precedence over the backend.
    #[arg(long)]
    pub providers_file: Option<String>,

    /// Local patient risk file (one row per person, outcome and time horizon).
    #[arg(long)]
    pub patients_file: Option<String>,

    /// Base URL of the hosted backend (REST interface at <url>/rest/v1).
    #[arg(long, env = "PHENOM_BACKEND_URL")]
    pub backend_url: Option<String>,

    /// API key sent as `apikey` and bearer token.
    #[arg(long, env = "PHENOM_BACKEND_KEY", hide_env_values = true)]
    pub backend_key: Option<String>,

    /// Table or view holding provider risk rows.
    #[arg(long, default_value = "provider_risk_view")]
    pub backend_table: String,

    /// Table or view holding per-patient risk scores.
    #[arg(long, default_value = "patient_risk_view")]
    pub patients_table: String,

    /// Do not download a missing snapshot; error instead.
    #[arg(long)]
    pub offline: bool,

    /// Re-download the snapshot even if one already exists.
    #[arg(long)]
    pub force_download: bool,

    /// Rebuild DuckDB tables and the Tantivy index even if they already exist.
    #[arg(long)]
    pub rebuild: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ServeArgs {
    /// Backend data directory (DuckDB DB and Tantivy index).
    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    pub data_dir: String,

    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, default_value_t = 8788)]
    pub port: u16,

    /// Dashboard state file (defaults to <data-dir>/views.json).
    #[arg(long)]
    pub views_file: Option<String>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct AggregateArgs {
    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    pub data_dir: String,

    /// state, city or zipcode.
    #[arg(long, default_value = "state")]
    pub level: GroupingLevel,

    /// list (ranked by high-risk patients) or map (first-seen order, with centroids).
    #[arg(long, default_value = "list")]
    pub view: Presentation,

    /// Restrict to these states (repeatable or comma-separated).
    #[arg(long = "state", value_delimiter = ',')]
    pub states: Vec<String>,

    #[arg(long)]
    pub outcome: Option<String>,

    /// Restrict to these NPIs (repeatable or comma-separated).
    #[arg(long = "npi", value_delimiter = ',')]
    pub npis: Vec<String>,

    #[arg(long)]
    pub pretty: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_args_parse() {
        let args = Args::parse_from([
            "phenom-risk-panel",
            "aggregate",
            "--level",
            "zipcode",
            "--view",
            "map",
            "--state",
            "MA,NY",
            "--state",
            "TX",
            "--npi",
            "1000000001",
        ]);
        let Command::Aggregate(a) = args.cmd else {
            panic!("expected aggregate");
        };
        assert_eq!(a.level, GroupingLevel::Zipcode);
        assert_eq!(a.view, Presentation::Map);
        assert_eq!(a.states, vec!["MA", "NY", "TX"]);
        assert_eq!(a.npis, vec!["1000000001"]);
    }

    #[test]
    fn build_defaults_both_backend_tables() {
        let args = Args::parse_from(["phenom-risk-panel", "build", "--offline"]);
        let Command::Build(b) = args.cmd else {
            panic!("expected build");
        };
        assert!(b.offline);
        assert_eq!(b.backend_table, "provider_risk_view");
        assert_eq!(b.patients_table, "patient_risk_view");
        assert_eq!(b.patients_file, None);
    }

    #[test]
    fn bad_level_is_rejected() {
        let r = Args::try_parse_from(["phenom-risk-panel", "aggregate", "--level", "county"]);
        assert!(r.is_err());
    }
}
