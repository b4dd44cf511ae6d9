use std::path::Path;

use anyhow::{Context, anyhow};
use duckdb::{Connection, params};
use serde::Serialize;

use crate::cli::BuildArgs;
use crate::download;
use crate::index;
use crate::storage::StoragePaths;
use crate::views::unix_now;

#[derive(Debug, Serialize)]
struct BuildMeta {
    built_at_unix: u64,
    source_file: String,
    patient_source_file: Option<String>,
    duckdb_path: String,
    provider_index_dir: String,
    provider_count: u64,
    patient_risk_rows: u64,
    dropped_rows: u64,
    ignored_columns: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColType {
    Text,
    Double,
    BigInt,
    Bool,
}

impl ColType {
    fn sql(self) -> &'static str {
        match self {
            ColType::Text => "VARCHAR",
            ColType::Double => "DOUBLE",
            ColType::BigInt => "BIGINT",
            ColType::Bool => "BOOLEAN",
        }
    }
}

/// A serving table and the raw view it is normalized from.
#[derive(Debug)]
struct TableSpec {
    name: &'static str,
    raw_view: &'static str,
    /// `true` marks columns the source must carry.
    columns: &'static [(&'static str, ColType, bool)],
    /// Rows with NULL in any of these are dropped.
    keys: &'static [&'static str],
}

const PROVIDERS: TableSpec = TableSpec {
    name: "providers",
    raw_view: "providers_raw",
    columns: &[
        ("npi", ColType::Text, true),
        ("name", ColType::Text, false),
        ("state", ColType::Text, true),
        ("city", ColType::Text, false),
        ("zip_code", ColType::Text, false),
        ("years_in_practice", ColType::Double, false),
        ("patients", ColType::BigInt, false),
        ("patients_phenom", ColType::BigInt, false),
        ("phenom_lift_potential", ColType::Double, false),
        ("is_client_target", ColType::Bool, false),
        ("latitude", ColType::Double, false),
        ("longitude", ColType::Double, false),
        ("specialty", ColType::Text, false),
        ("outcome", ColType::Text, false),
    ],
    keys: &["npi"],
};

const PATIENT_RISKS: TableSpec = TableSpec {
    name: "patient_risks",
    raw_view: "patient_risks_raw",
    columns: &[
        ("person_id", ColType::Text, true),
        ("name", ColType::Text, false),
        ("age", ColType::BigInt, false),
        ("sex", ColType::Text, false),
        ("state", ColType::Text, false),
        ("npi", ColType::Text, false),
        ("outcome", ColType::Text, true),
        ("time_horizon", ColType::Text, true),
        ("absolute_risk", ColType::Double, false),
        ("relative_risk", ColType::Double, false),
    ],
    keys: &["person_id", "outcome", "time_horizon"],
};

pub async fn run(opts: BuildArgs) -> anyhow::Result<()> {
    tracing::info!("phenom-risk-panel build");
    tracing::info!("data_dir={}", opts.data_dir);
    if opts.offline {
        tracing::info!("offline=true (will not download a missing snapshot)");
    }
    if opts.force_download {
        tracing::info!("force_download=true (will re-download the snapshot)");
    }
    // A fresh snapshot is worthless if the old tables are kept.
    let rebuild = opts.rebuild || opts.force_download;
    if rebuild {
        tracing::info!("rebuild=true (will rebuild tables and index)");
    }

    let paths = StoragePaths::new(&opts.data_dir);
    paths
        .ensure_dirs()
        .context("create backend data directories")?;

    tracing::info!("Step 1/5: ensure provider and patient risk input");
    let t0 = std::time::Instant::now();
    let input = download::ensure_provider_input(&paths, &opts).await?;
    let patient_input = download::ensure_patient_input(&paths, &opts).await?;
    tracing::info!(
        "Input ready in {:.1}s: {}",
        t0.elapsed().as_secs_f64(),
        input.display()
    );

    tracing::info!("Step 2/5: open DuckDB + create source views");
    let t1 = std::time::Instant::now();
    let mut conn = Connection::open(&paths.duckdb_path)
        .with_context(|| format!("open duckdb at {}", paths.duckdb_path.display()))?;
    create_source_view(&mut conn, &PROVIDERS, &input).context("create providers_raw view")?;
    if let Some(p) = patient_input.as_deref() {
        create_source_view(&mut conn, &PATIENT_RISKS, p)
            .context("create patient_risks_raw view")?;
    }
    tracing::info!(
        "DuckDB ready in {:.1}s: {}",
        t1.elapsed().as_secs_f64(),
        paths.duckdb_path.display()
    );

    tracing::info!("Step 3/5: build serving table (providers)");
    let providers_exists = table_exists(&mut conn, PROVIDERS.name)?;
    let providers_bad = if providers_exists && !rebuild {
        let bad = count_bad_keys(&mut conn, PROVIDERS.name, "npi")?;
        if bad > 0 {
            tracing::info!(
                "DuckDB table providers has {} rows with NULL/empty npi; rebuilding",
                bad
            );
        }
        bad > 0
    } else {
        false
    };

    let mut report = NormalizeReport::default();
    let rebuild_table = rebuild || !providers_exists || providers_bad;
    if rebuild_table {
        report = rebuild_normalized(&mut conn, &PROVIDERS).context("build providers")?;
    } else {
        tracing::info!("DuckDB table providers already exists; skipping");
    }

    tracing::info!("Step 4/5: build serving table (patient_risks)");
    let patients_exists = table_exists(&mut conn, PATIENT_RISKS.name)?;
    // An empty table left by an earlier build without patient input gets filled now.
    let patients_empty =
        patients_exists && one_u64(&mut conn, "SELECT COUNT(*) FROM patient_risks")? == 0;
    match patient_input.as_deref() {
        Some(_) if rebuild || !patients_exists || patients_empty => {
            let r = rebuild_normalized(&mut conn, &PATIENT_RISKS)
                .context("build patient_risks")?;
            report.dropped_rows += r.dropped_rows;
            report.ignored_columns.extend(r.ignored_columns);
        }
        None if !patients_exists => {
            create_empty_table(&mut conn, &PATIENT_RISKS).context("create patient_risks")?;
            tracing::info!("Created empty patient_risks table");
        }
        _ => tracing::info!("DuckDB table patient_risks already exists; skipping"),
    }

    tracing::info!("Step 5/5: build search index (Tantivy)");
    index::providers::build_provider_index(&conn, &paths.provider_index_dir, rebuild_table)
        .context("build provider tantivy index")?;

    let provider_count: u64 = one_u64(&mut conn, "SELECT COUNT(*) FROM providers")?;
    let patient_risk_rows: u64 = one_u64(&mut conn, "SELECT COUNT(*) FROM patient_risks")?;

    let meta = BuildMeta {
        built_at_unix: unix_now(),
        source_file: input.display().to_string(),
        patient_source_file: patient_input.map(|p| p.display().to_string()),
        duckdb_path: paths.duckdb_path.display().to_string(),
        provider_index_dir: paths.provider_index_dir.display().to_string(),
        provider_count,
        patient_risk_rows,
        dropped_rows: report.dropped_rows,
        ignored_columns: report.ignored_columns,
    };
    write_json(&paths.meta_path, &meta).context("write meta.json")?;

    tracing::info!("Build complete.");
    tracing::info!("DuckDB: {}", paths.duckdb_path.display());
    tracing::info!("Provider index: {}", paths.provider_index_dir.display());

    Ok(())
}

fn create_source_view(
    conn: &mut Connection,
    spec: &TableSpec,
    input: &Path,
) -> anyhow::Result<()> {
    let reader = source_reader(input)?;
    conn.execute(
        &format!(
            "CREATE OR REPLACE VIEW {} AS SELECT * FROM {reader}",
            spec.raw_view
        ),
        [],
    )?;
    Ok(())
}

fn source_reader(input: &Path) -> anyhow::Result<String> {
    let quoted = sql_quote_path(input);
    let ext = input
        .extension()
        .and_then(|x| x.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        // all_varchar keeps zip codes like 02139 intact; casting happens in rebuild_normalized.
        "csv" | "tsv" | "txt" => Ok(format!(
            "read_csv_auto('{quoted}', header=true, all_varchar=true)"
        )),
        "parquet" => Ok(format!("read_parquet('{quoted}')")),
        "json" | "ndjson" | "jsonl" => Ok(format!("read_json_auto('{quoted}')")),
        other => Err(anyhow!(
            "unsupported input file type {other:?} for {}; expected csv, parquet or json",
            input.display()
        )),
    }
}

#[derive(Debug, Default)]
struct NormalizeReport {
    dropped_rows: u64,
    ignored_columns: Vec<String>,
}

fn rebuild_normalized(conn: &mut Connection, spec: &TableSpec) -> anyhow::Result<NormalizeReport> {
    tracing::info!("Building {} from {}...", spec.name, spec.raw_view);
    let source_cols = view_columns(conn, spec.raw_view)?;
    let select = normalized_select(spec, &source_cols)?;

    let ignored_columns: Vec<String> = source_cols
        .iter()
        .filter(|c| {
            !spec
                .columns
                .iter()
                .any(|(name, _, _)| c.eq_ignore_ascii_case(name))
        })
        .cloned()
        .collect();
    if !ignored_columns.is_empty() {
        tracing::info!(
            "{}: ignoring {} non-canonical columns: {}",
            spec.name,
            ignored_columns.len(),
            ignored_columns.join(", ")
        );
    }

    let raw_rows = one_u64(conn, &format!("SELECT COUNT(*) FROM {}", spec.raw_view))?;

    let keys_present = spec
        .keys
        .iter()
        .map(|k| format!("{k} IS NOT NULL"))
        .collect::<Vec<_>>()
        .join(" AND ");
    conn.execute(&format!("DROP TABLE IF EXISTS {}", spec.name), [])?;
    let sql = format!(
        r#"
        CREATE TABLE {name} AS
        WITH normalized AS ({select})
        SELECT * FROM normalized
        WHERE {keys_present}
    "#,
        name = spec.name
    );
    conn.execute(&sql, [])?;

    let kept = one_u64(conn, &format!("SELECT COUNT(*) FROM {}", spec.name))?;
    let dropped_rows = raw_rows.saturating_sub(kept);
    if dropped_rows > 0 {
        tracing::info!(
            "{}: dropped {} rows missing {}",
            spec.name,
            dropped_rows,
            spec.keys.join("/")
        );
    }
    Ok(NormalizeReport {
        dropped_rows,
        ignored_columns,
    })
}

fn create_empty_table(conn: &mut Connection, spec: &TableSpec) -> anyhow::Result<()> {
    let cols = spec
        .columns
        .iter()
        .map(|(name, ty, _)| format!("{name} {}", ty.sql()))
        .collect::<Vec<_>>()
        .join(", ");
    conn.execute(&format!("CREATE TABLE {} ({cols})", spec.name), [])?;
    Ok(())
}

/// SELECT over the raw view producing exactly the canonical columns.
fn normalized_select(spec: &TableSpec, source_cols: &[String]) -> anyhow::Result<String> {
    let mut exprs = Vec::with_capacity(spec.columns.len());
    for &(name, ty, required) in spec.columns {
        let found = source_cols.iter().find(|c| c.eq_ignore_ascii_case(name));
        let expr = match found {
            Some(src) => cast_expr(&sql_quote_ident(src), ty),
            None if required => {
                return Err(anyhow!(
                    "{} source is missing required column {name:?} (found: {})",
                    spec.name,
                    source_cols.join(", ")
                ));
            }
            None => format!("CAST(NULL AS {})", ty.sql()),
        };
        exprs.push(format!("{expr} AS {name}"));
    }
    Ok(format!(
        "SELECT {} FROM {}",
        exprs.join(",\n               "),
        spec.raw_view
    ))
}

fn cast_expr(col: &str, ty: ColType) -> String {
    match ty {
        ColType::Text => format!("NULLIF(TRIM(CAST({col} AS VARCHAR)), '')"),
        ColType::Double => format!("TRY_CAST({col} AS DOUBLE)"),
        ColType::BigInt => format!("TRY_CAST(ROUND(TRY_CAST({col} AS DOUBLE)) AS BIGINT)"),
        ColType::Bool => format!("COALESCE(TRY_CAST({col} AS BOOLEAN), false)"),
    }
}

fn view_columns(conn: &mut Connection, view: &str) -> anyhow::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT column_name
        FROM information_schema.columns
        WHERE table_schema = 'main' AND table_name = ?
        ORDER BY ordinal_position
    "#,
    )?;
    let rows = stmt.query_map(params![view], |row| row.get::<usize, String>(0))?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    if out.is_empty() {
        return Err(anyhow!("{view} has no columns"));
    }
    Ok(out)
}

fn table_exists(conn: &mut Connection, name: &str) -> anyhow::Result<bool> {
    let mut stmt = conn.prepare(
        r#"
        SELECT COUNT(*)::BIGINT
        FROM information_schema.tables
        WHERE table_schema = 'main' AND table_name = ? AND table_type = 'BASE TABLE'
    "#,
    )?;
    let count: i64 = stmt.query_row(params![name], |row| row.get(0))?;
    Ok(count > 0)
}

fn count_bad_keys(conn: &mut Connection, table: &str, col: &str) -> anyhow::Result<i64> {
    // table/col are compile-time constants in this crate; keep this helper private.
    let sql =
        format!("SELECT COUNT(*)::BIGINT FROM {table} WHERE {col} IS NULL OR TRIM({col}) = ''");
    let mut stmt = conn.prepare(&sql)?;
    let v: i64 = stmt.query_row([], |row| row.get(0))?;
    Ok(v)
}

fn one_u64(conn: &mut Connection, sql: &str) -> anyhow::Result<u64> {
    let mut stmt = conn.prepare(sql)?;
    let v: i64 = stmt.query_row([], |row| row.get(0))?;
    Ok(v.max(0) as u64)
}

fn write_json(path: &Path, v: &impl Serialize) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let s = serde_json::to_string_pretty(v)?;
    std::fs::write(path, s)?;
    Ok(())
}

fn sql_quote_path(path: &Path) -> String {
    // DuckDB expects single-quoted string literals; escape embedded single quotes.
    path.display().to_string().replace('\'', "''")
}

fn sql_quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patients::{PatientQuery, fetch_patient_risks};
    use crate::source::{DuckDbSource, ProviderQuery, ProviderSource};

    fn load_csv(
        spec: &TableSpec,
        file: &str,
        csv: &str,
    ) -> (tempfile::TempDir, Connection, NormalizeReport) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(file);
        std::fs::write(&path, csv).unwrap();
        let mut conn = Connection::open_in_memory().unwrap();
        create_source_view(&mut conn, spec, &path).unwrap();
        let report = rebuild_normalized(&mut conn, spec).unwrap();
        (dir, conn, report)
    }

    #[test]
    fn missing_optional_columns_become_null() {
        let sql = normalized_select(&PROVIDERS, &["NPI".to_string(), "state".to_string()]).unwrap();
        assert!(sql.contains("NULLIF(TRIM(CAST(\"NPI\" AS VARCHAR)), '') AS npi"));
        assert!(sql.contains("CAST(NULL AS DOUBLE) AS latitude"));
        assert!(sql.contains("CAST(NULL AS BIGINT) AS patients_phenom"));
        assert!(sql.ends_with("FROM providers_raw"));
    }

    #[test]
    fn missing_required_column_is_an_error() {
        let err = normalized_select(&PROVIDERS, &["npi".to_string(), "city".to_string()])
            .unwrap_err();
        assert!(err.to_string().contains("\"state\""));

        let err = normalized_select(
            &PATIENT_RISKS,
            &["person_id".to_string(), "outcome".to_string()],
        )
        .unwrap_err();
        assert!(err.to_string().contains("\"time_horizon\""));
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        assert!(source_reader(Path::new("/x/providers.xlsx")).is_err());
        assert!(source_reader(Path::new("/x/it's.csv")).unwrap().contains("it''s.csv"));
    }

    #[test]
    fn csv_ingest_normalizes_and_drops_keyless_rows() {
        let csv = "\
npi,state,city,zip_code,patients,patients_phenom,phenom_lift_potential,is_client_target,latitude,longitude,specialty,internal_note
1000000001,MA,Boston,02101,400,40,6.5,true,42.36,-71.06,Cardiology,x
1000000002,MA,Boston,02101,250.0,12,oops,false,42.35,-71.05,,y
,NY,Albany,12207,90,3,1.0,false,42.65,-73.75,Oncology,z
";
        let (_dir, conn, report) = load_csv(&PROVIDERS, "providers.csv", csv);
        assert_eq!(report.dropped_rows, 1);
        assert_eq!(report.ignored_columns, vec!["internal_note"]);

        let src = DuckDbSource::new(&conn);
        let rows = src.fetch(&ProviderQuery::default()).unwrap();
        assert_eq!(rows.len(), 2);

        let a = &rows[0];
        assert_eq!(a.zip_code.as_deref(), Some("02101"));
        assert_eq!(a.patients, Some(400));
        assert!(a.is_client_target);
        assert_eq!(a.outcome, None);

        let b = &rows[1];
        assert_eq!(b.patients, Some(250));
        assert_eq!(b.phenom_lift_potential, None);
        assert_eq!(b.specialty, None);
    }

    #[test]
    fn patient_csv_requires_all_key_columns() {
        let csv = "\
person_id,outcome,time_horizon,absolute_risk,relative_risk,age,mrn
p1,stroke,1y,0.05,1.2,67,A1
p1,stroke,,0.07,1.3,67,A1
p2,heart_failure,30d,n/a,2.0,54.0,B2
";
        let (_dir, conn, report) = load_csv(&PATIENT_RISKS, "risks.csv", csv);
        assert_eq!(report.dropped_rows, 1);
        assert_eq!(report.ignored_columns, vec!["mrn"]);

        let rows = fetch_patient_risks(&conn, &PatientQuery::default()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].person_id, "p1");
        assert_eq!(rows[0].age, Some(67));
        assert_eq!(rows[0].npi, None);
        assert_eq!(rows[1].absolute_risk, None);
        assert_eq!(rows[1].relative_risk, Some(2.0));
        assert_eq!(rows[1].age, Some(54));
    }

    #[test]
    fn empty_patient_table_has_canonical_columns() {
        let mut conn = Connection::open_in_memory().unwrap();
        create_empty_table(&mut conn, &PATIENT_RISKS).unwrap();
        assert!(table_exists(&mut conn, "patient_risks").unwrap());
        let rows = fetch_patient_risks(&conn, &PatientQuery::default()).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn table_exists_ignores_views() {
        let csv = "npi,state\n1,MA\n";
        let (_dir, mut conn, _) = load_csv(&PROVIDERS, "providers.csv", csv);
        assert!(table_exists(&mut conn, "providers").unwrap());
        assert!(!table_exists(&mut conn, "providers_raw").unwrap());
        assert_eq!(count_bad_keys(&mut conn, "providers", "npi").unwrap(), 0);
    }
}
