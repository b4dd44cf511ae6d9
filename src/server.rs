use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use duckdb::{Connection, params_from_iter};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};

use crate::cli::ServeArgs;
use crate::dashboard::Dashboard;
use crate::index::providers::{
    ProviderEngine, ProviderHit, ProviderSearchQuery, ProviderSearchResponse, Sort,
};
use crate::model::{GroupingLevel, Presentation};
use crate::patients::{
    PanelColumn, PatientPanel, PatientQuery, ScoreKind, compose_panel, fetch_patient_risks,
};
use crate::pipeline::{self, GeoRequest};
use crate::source::{DuckDbSource, ProviderQuery, placeholders};
use crate::storage::{StoragePaths, file_present_nonempty};
use crate::views::ViewStore;

#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Connection>>,
    providers: Arc<ProviderEngine>,
    dashboard: Arc<Dashboard>,
    meta: Option<serde_json::Value>,
}

pub async fn run(opts: ServeArgs) -> anyhow::Result<()> {
    let paths = StoragePaths::new(&opts.data_dir);
    if !file_present_nonempty(&paths.duckdb_path) {
        return Err(anyhow!(
            "DuckDB not found at {}. Run: phenom-risk-panel build",
            paths.duckdb_path.display()
        ));
    }
    if !paths.provider_index_dir.exists() {
        return Err(anyhow!(
            "Provider index not found at {}. Run: phenom-risk-panel build",
            paths.provider_index_dir.display()
        ));
    }

    let conn = Connection::open(&paths.duckdb_path)
        .with_context(|| format!("open duckdb at {}", paths.duckdb_path.display()))?;
    let providers =
        ProviderEngine::open(&paths.provider_index_dir).context("open provider index")?;

    let meta = if file_present_nonempty(&paths.meta_path) {
        let s = std::fs::read_to_string(&paths.meta_path)?;
        serde_json::from_str(&s).ok()
    } else {
        None
    };

    let views_path = opts
        .views_file
        .clone()
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| paths.views_path.clone());
    let views = ViewStore::load(&views_path).context("load dashboard state")?;
    tracing::info!("Dashboard state file: {}", views.path().display());

    let db = Arc::new(Mutex::new(conn));
    let dashboard = Dashboard::new(Arc::clone(&db), views);
    dashboard.start().await;

    let state = AppState {
        db,
        providers: Arc::new(providers),
        dashboard,
        meta,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/api/stats", get(api_stats))
        .route("/api/filters", get(api_filters))
        .route("/api/providers", get(api_provider_search))
        .route("/api/providers/:npi", get(api_provider_detail))
        .route("/api/patients", get(api_patient_panel))
        .route("/api/patients/:person_id", get(api_patient_detail))
        .route("/api/geo", get(api_geo))
        .route("/api/state", get(api_get_state).put(api_put_state))
        .route("/api/state/groups", get(api_state_groups))
        .route("/api/views", get(api_list_views).post(api_create_view))
        .route("/api/views/:id", axum::routing::delete(api_delete_view))
        .route("/api/views/:id/apply", post(api_apply_view))
        .layer(cors)
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", opts.host, opts.port)
        .parse()
        .context("parse host:port")?;

    tracing::info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    meta: Option<serde_json::Value>,
}

async fn api_stats(State(st): State<AppState>) -> impl IntoResponse {
    Json(StatsResponse { meta: st.meta })
}

#[derive(Debug, Serialize)]
struct FiltersResponse {
    states: Vec<String>,
    specialties: Vec<SpecialtyOpt>,
    outcomes: Vec<String>,
    time_horizons: Vec<String>,
}

#[derive(Debug, Serialize)]
struct SpecialtyOpt {
    name: String,
    count: u64,
}

async fn api_filters(State(st): State<AppState>) -> impl IntoResponse {
    let db = st.db.lock().await;
    match filter_options(&db) {
        Ok(v) => Json(v).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

fn filter_options(db: &Connection) -> anyhow::Result<FiltersResponse> {
    let states = query_string_list(
        db,
        "SELECT DISTINCT state FROM providers WHERE state IS NOT NULL ORDER BY state ASC",
    )?;
    let outcomes = query_string_list(
        db,
        r#"
        SELECT outcome FROM providers WHERE outcome IS NOT NULL
        UNION
        SELECT outcome FROM patient_risks
        ORDER BY outcome ASC
    "#,
    )?;
    let time_horizons = query_string_list(
        db,
        "SELECT DISTINCT time_horizon FROM patient_risks ORDER BY time_horizon ASC",
    )?;

    let sql = r#"
        SELECT specialty, COUNT(*) AS provider_count
        FROM providers
        WHERE specialty IS NOT NULL
        GROUP BY specialty
        ORDER BY provider_count DESC, specialty ASC
        LIMIT 2000
    "#;
    let mut stmt = db.prepare(sql)?;
    let rows = stmt.query_map([], |row| {
        Ok(SpecialtyOpt {
            name: row.get::<usize, String>(0)?,
            count: row.get::<usize, i64>(1)?.max(0) as u64,
        })
    })?;
    let mut specialties = Vec::new();
    for r in rows {
        specialties.push(r?);
    }

    Ok(FiltersResponse {
        states,
        specialties,
        outcomes,
        time_horizons,
    })
}

fn query_string_list(db: &Connection, sql: &str) -> anyhow::Result<Vec<String>> {
    let mut stmt = db.prepare(sql)?;
    let mut out = Vec::new();
    let rows = stmt.query_map([], |row| row.get::<usize, String>(0))?;
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

#[derive(Debug, Default, Deserialize)]
struct ProviderSearchParams {
    q: Option<String>,
    state: Option<String>,
    specialty: Option<String>,
    outcome: Option<String>,
    client_target: Option<bool>,
    sort: Option<String>,
    page: Option<usize>,
    page_size: Option<usize>,
}

async fn api_provider_search(
    State(st): State<AppState>,
    Query(p): Query<ProviderSearchParams>,
) -> impl IntoResponse {
    let sort = parse_provider_sort(p.sort.as_deref());

    // Plain alphabetical browsing is cheaper and exact in DuckDB.
    let q_empty = p.q.as_deref().map(str::trim).unwrap_or("").is_empty();
    if q_empty && sort == Sort::NameAsc {
        let db = st.db.lock().await;
        return match duckdb_provider_browse(&db, &p) {
            Ok(r) => Json(r).into_response(),
            Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        };
    }

    let query = ProviderSearchQuery {
        q: p.q.clone(),
        states: split_list(p.state.as_deref()),
        specialties: split_list(p.specialty.as_deref()),
        outcome: p.outcome.clone(),
        client_target: p.client_target,
        sort,
        page: p.page.unwrap_or(0),
        page_size: p.page_size.unwrap_or(50),
    };

    match st.providers.search(query) {
        Ok(r) => Json(r).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

fn duckdb_provider_browse(
    db: &Connection,
    p: &ProviderSearchParams,
) -> anyhow::Result<ProviderSearchResponse> {
    let page_size = p.page_size.unwrap_or(50).clamp(1, 200);
    let offset = p.page.unwrap_or(0).saturating_mul(page_size);

    let mut where_sql = String::from("WHERE 1=1");
    let mut args: Vec<String> = Vec::new();

    let states = split_list(p.state.as_deref());
    if !states.is_empty() {
        where_sql.push_str(&format!(" AND state IN ({})", placeholders(states.len())));
        args.extend(states);
    }
    let specialties = split_list(p.specialty.as_deref());
    if !specialties.is_empty() {
        where_sql.push_str(&format!(
            " AND specialty IN ({})",
            placeholders(specialties.len())
        ));
        args.extend(specialties);
    }
    if let Some(outcome) = p.outcome.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        where_sql.push_str(" AND outcome = ?");
        args.push(outcome.to_string());
    }
    if let Some(target) = p.client_target {
        // Fixed literal, not user text.
        where_sql.push_str(if target {
            " AND is_client_target"
        } else {
            " AND NOT is_client_target"
        });
    }

    let count_sql = format!("SELECT COUNT(*) FROM providers {where_sql}");
    let total_hits: i64 = db
        .prepare(&count_sql)?
        .query_row(params_from_iter(args.iter()), |row| row.get(0))?;

    let data_sql = format!(
        r#"
        SELECT
          npi,
          name,
          city,
          state,
          zip_code,
          specialty,
          outcome,
          is_client_target,
          patients,
          patients_phenom,
          phenom_lift_potential
        FROM providers
        {where_sql}
        ORDER BY name ASC NULLS LAST, npi ASC
        LIMIT {page_size} OFFSET {offset}
    "#
    );
    let mut stmt = db.prepare(&data_sql)?;
    let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
        Ok(ProviderHit {
            npi: row.get(0)?,
            name: row.get(1)?,
            city: row.get(2)?,
            state: row.get(3)?,
            zip_code: row.get(4)?,
            specialty: row.get(5)?,
            outcome: row.get(6)?,
            is_client_target: row.get::<usize, Option<bool>>(7)?.unwrap_or(false),
            patients: row.get::<usize, Option<i64>>(8)?.unwrap_or(0),
            patients_phenom: row.get::<usize, Option<i64>>(9)?.unwrap_or(0),
            phenom_lift_potential: row
                .get::<usize, Option<f64>>(10)?
                .filter(|x| x.is_finite())
                .unwrap_or(0.0),
        })
    })?;
    let mut hits = Vec::new();
    for r in rows {
        hits.push(r?);
    }

    Ok(ProviderSearchResponse {
        total_hits: total_hits.max(0) as usize,
        hits,
    })
}

async fn api_provider_detail(
    State(st): State<AppState>,
    AxumPath(npi): AxumPath<String>,
) -> impl IntoResponse {
    let db = st.db.lock().await;
    match DuckDbSource::new(&db).provider(npi.trim()) {
        Ok(Some(r)) => Json(r).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, format!("no provider with npi {npi}")).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

#[derive(Debug, Default, Deserialize)]
struct PatientParams {
    outcome: Option<String>,
    time_horizon: Option<String>,
    state: Option<String>,
    npi: Option<String>,
    person: Option<String>,
    score: Option<String>,
    /// `outcome:time_horizon` column to rank by.
    sort: Option<String>,
    page: Option<usize>,
    page_size: Option<usize>,
}

struct PanelRequest {
    query: PatientQuery,
    score: ScoreKind,
    sort: Option<PanelColumn>,
    page: usize,
    page_size: usize,
}

impl PatientParams {
    fn to_request(&self) -> anyhow::Result<PanelRequest> {
        let score = match self.score.as_deref() {
            Some(s) => s.parse()?,
            None => ScoreKind::default(),
        };
        let sort = match self.sort.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(s) => Some(s.parse()?),
            None => None,
        };
        Ok(PanelRequest {
            query: PatientQuery {
                outcomes: split_list(self.outcome.as_deref()),
                time_horizons: split_list(self.time_horizon.as_deref()),
                states: split_list(self.state.as_deref()),
                npis: split_list(self.npi.as_deref()),
                person_ids: split_list(self.person.as_deref()),
            },
            score,
            sort,
            page: self.page.unwrap_or(0),
            page_size: self.page_size.unwrap_or(50),
        })
    }
}

fn patient_panel(db: &Connection, req: &PanelRequest) -> anyhow::Result<PatientPanel> {
    let records = fetch_patient_risks(db, &req.query)?;
    let panel = compose_panel(&records, req.score, req.sort.as_ref());
    Ok(panel.page(req.page, req.page_size))
}

async fn api_patient_panel(
    State(st): State<AppState>,
    Query(p): Query<PatientParams>,
) -> impl IntoResponse {
    let req = match p.to_request() {
        Ok(r) => r,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    let db = st.db.lock().await;
    match patient_panel(&db, &req) {
        Ok(panel) => Json(panel).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn api_patient_detail(
    State(st): State<AppState>,
    AxumPath(person_id): AxumPath<String>,
) -> impl IntoResponse {
    let q = PatientQuery {
        person_ids: vec![person_id.trim().to_string()],
        ..Default::default()
    };
    let db = st.db.lock().await;
    match fetch_patient_risks(&db, &q) {
        Ok(rows) if rows.is_empty() => (
            StatusCode::NOT_FOUND,
            format!("no patient with id {person_id}"),
        )
            .into_response(),
        Ok(rows) => Json(rows).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Debug, Default, Deserialize)]
struct GeoParams {
    level: Option<String>,
    view: Option<String>,
    state: Option<String>,
    outcome: Option<String>,
    npi: Option<String>,
}

impl GeoParams {
    fn to_request(&self) -> anyhow::Result<GeoRequest> {
        let level = match self.level.as_deref() {
            Some(s) => s.parse()?,
            None => GroupingLevel::default(),
        };
        let view = match self.view.as_deref() {
            Some(s) => s.parse()?,
            None => Presentation::default(),
        };
        Ok(GeoRequest {
            level,
            view,
            query: ProviderQuery {
                states: split_list(self.state.as_deref()),
                outcome: self
                    .outcome
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
                npis: split_list(self.npi.as_deref()),
            },
        })
    }
}

async fn api_geo(State(st): State<AppState>, Query(p): Query<GeoParams>) -> impl IntoResponse {
    let req = match p.to_request() {
        Ok(r) => r,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    let db = st.db.lock().await;
    match pipeline::geographic_groups(&DuckDbSource::new(&db), &req) {
        Ok(groups) => Json(groups).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn api_get_state(State(st): State<AppState>) -> impl IntoResponse {
    Json(st.dashboard.state().await)
}

async fn api_put_state(
    State(st): State<AppState>,
    Json(filters): Json<GeoRequest>,
) -> impl IntoResponse {
    match st.dashboard.commit(filters).await {
        Ok((snap, _)) => Json(snap).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")).into_response(),
    }
}

async fn api_state_groups(State(st): State<AppState>) -> impl IntoResponse {
    Json(st.dashboard.groups())
}

async fn api_list_views(State(st): State<AppState>) -> impl IntoResponse {
    Json(st.dashboard.views().await)
}

#[derive(Debug, Deserialize)]
struct CreateViewBody {
    name: String,
    filters: Option<GeoRequest>,
}

async fn api_create_view(
    State(st): State<AppState>,
    Json(body): Json<CreateViewBody>,
) -> impl IntoResponse {
    match st.dashboard.save_view(&body.name, body.filters).await {
        Ok(v) => (StatusCode::CREATED, Json(v)).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, format!("{e:#}")).into_response(),
    }
}

async fn api_delete_view(
    State(st): State<AppState>,
    AxumPath(id): AxumPath<u64>,
) -> impl IntoResponse {
    match st.dashboard.delete_view(id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => (StatusCode::NOT_FOUND, format!("no view with id {id}")).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")).into_response(),
    }
}

async fn api_apply_view(
    State(st): State<AppState>,
    AxumPath(id): AxumPath<u64>,
) -> impl IntoResponse {
    match st.dashboard.apply_view(id).await {
        Ok(Some((snap, _))) => Json(snap).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, format!("no view with id {id}")).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")).into_response(),
    }
}

fn parse_provider_sort(s: Option<&str>) -> Sort {
    match s.unwrap_or("high_risk_desc").to_ascii_lowercase().as_str() {
        "high_risk_asc" => Sort::HighRiskAsc,
        "lift_desc" => Sort::LiftDesc,
        "patients_desc" => Sort::PatientsDesc,
        "name_asc" => Sort::NameAsc,
        "relevance" => Sort::Relevance,
        _ => Sort::HighRiskDesc,
    }
}

fn split_list(v: Option<&str>) -> Vec<String> {
    let Some(s) = v else {
        return Vec::new();
    };
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}
