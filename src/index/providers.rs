use std::path::Path;

use anyhow::{Context, anyhow};
use duckdb::Connection;
use serde::Serialize;
use tantivy::collector::TopDocs;
use tantivy::directory::MmapDirectory;
use tantivy::query::{AllQuery, BooleanQuery, Occur, Query, QueryParser, TermQuery};
use tantivy::schema::{
    Facet, FacetOptions, Field, IndexRecordOption, NumericOptions, STORED, STRING, Schema, TEXT,
    Value,
};
use tantivy::{DocAddress, Index, IndexReader, Order, Score, TantivyDocument, Term};

use crate::geo::normalize_zip5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sort {
    Relevance,
    HighRiskDesc,
    HighRiskAsc,
    LiftDesc,
    PatientsDesc,
    NameAsc,
}

#[derive(Debug, Clone)]
pub struct ProviderSearchQuery {
    pub q: Option<String>,
    pub states: Vec<String>,
    pub specialties: Vec<String>,
    pub outcome: Option<String>,
    pub client_target: Option<bool>,
    pub sort: Sort,
    pub page: usize,
    pub page_size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderHit {
    pub npi: String,
    pub name: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip_code: Option<String>,
    pub specialty: Option<String>,
    pub outcome: Option<String>,
    pub is_client_target: bool,

    pub patients: i64,
    pub patients_phenom: i64,
    pub phenom_lift_potential: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderSearchResponse {
    pub total_hits: usize,
    pub hits: Vec<ProviderHit>,
}

#[derive(Clone)]
pub struct ProviderEngine {
    reader: IndexReader,
    fields: ProviderFields,
    query_parser: QueryParser,
}

#[derive(Debug, Clone)]
struct ProviderFields {
    npi: Field,
    name: Field,
    city: Field,
    state: Field,
    zip_code: Field,
    zip5: Field,
    specialty: Field,
    outcome: Field,

    state_facet: Field,
    specialty_facet: Field,
    outcome_facet: Field,
    client_target: Field,

    patients: Field,
    patients_phenom: Field,
    lift: Field,
}

impl ProviderEngine {
    pub fn open(index_dir: &Path) -> anyhow::Result<Self> {
        let dir = MmapDirectory::open(index_dir)
            .with_context(|| format!("open index dir {}", index_dir.display()))?;
        let index = Index::open(dir).context("open tantivy index")?;
        Self::from_index(&index)
    }

    fn from_index(index: &Index) -> anyhow::Result<Self> {
        let schema = index.schema();
        let fields = provider_fields(&schema)?;

        let reader = index.reader().context("create index reader")?;
        let query_parser =
            QueryParser::for_index(index, vec![fields.name, fields.city, fields.specialty]);

        Ok(Self {
            reader,
            fields,
            query_parser,
        })
    }

    pub fn search(&self, q: ProviderSearchQuery) -> anyhow::Result<ProviderSearchResponse> {
        let searcher = self.reader.searcher();
        let query = self.build_query(&q)?;

        // total hits (for pagination UI)
        let total_hits = searcher
            .search(&query, &tantivy::collector::Count)
            .context("count hits")?;

        let page_size = q.page_size.clamp(1, 200);
        let offset = q.page.saturating_mul(page_size);

        let doc_addrs: Vec<DocAddress> = match q.sort {
            Sort::Relevance => {
                let top_docs: Vec<(Score, DocAddress)> = searcher
                    .search(&query, &TopDocs::with_limit(page_size).and_offset(offset))
                    .context("tantivy search")?;
                top_docs.into_iter().map(|(_, a)| a).collect()
            }
            Sort::HighRiskDesc | Sort::HighRiskAsc | Sort::PatientsDesc => {
                let (field, order) = match q.sort {
                    Sort::HighRiskDesc => ("patients_phenom", Order::Desc),
                    Sort::HighRiskAsc => ("patients_phenom", Order::Asc),
                    _ => ("patients", Order::Desc),
                };
                let top_docs: Vec<(i64, DocAddress)> = searcher.search(
                    &query,
                    &TopDocs::with_limit(page_size)
                        .and_offset(offset)
                        .order_by_fast_field::<i64>(field, order),
                )?;
                top_docs.into_iter().map(|(_, a)| a).collect()
            }
            Sort::LiftDesc => {
                let top_docs: Vec<(f64, DocAddress)> = searcher.search(
                    &query,
                    &TopDocs::with_limit(page_size)
                        .and_offset(offset)
                        .order_by_fast_field::<f64>("phenom_lift_potential", Order::Desc),
                )?;
                top_docs.into_iter().map(|(_, a)| a).collect()
            }
            Sort::NameAsc => {
                // No lexicographic collector; sort a wider window in memory.
                let window = ((offset + page_size) * 20).clamp(page_size, 5000);
                let top_docs: Vec<(Score, DocAddress)> = searcher
                    .search(&query, &TopDocs::with_limit(window))
                    .context("tantivy search (name_asc window)")?;
                let mut docs = top_docs
                    .into_iter()
                    .map(|(_, addr)| self.doc_to_hit(&searcher, addr))
                    .collect::<anyhow::Result<Vec<_>>>()?;
                docs.sort_by(|a, b| {
                    a.name
                        .as_deref()
                        .unwrap_or("")
                        .cmp(b.name.as_deref().unwrap_or(""))
                        .then_with(|| a.npi.cmp(&b.npi))
                });
                let hits = docs.into_iter().skip(offset).take(page_size).collect();
                return Ok(ProviderSearchResponse { total_hits, hits });
            }
        };

        let hits = doc_addrs
            .into_iter()
            .map(|addr| self.doc_to_hit(&searcher, addr))
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(ProviderSearchResponse { total_hits, hits })
    }

    fn build_simple_query(&self, q: &str) -> anyhow::Result<Box<dyn Query>> {
        let s = q.trim();
        if looks_like_npi(s) {
            let term = Term::from_field_text(self.fields.npi, s);
            Ok(Box::new(TermQuery::new(term, IndexRecordOption::Basic)))
        } else if let Some(zip) = looks_like_zip(s) {
            let term = Term::from_field_text(self.fields.zip5, &zip);
            Ok(Box::new(TermQuery::new(term, IndexRecordOption::Basic)))
        } else {
            Ok(self.query_parser.parse_query(s).context("parse query")?)
        }
    }

    fn build_query(&self, q: &ProviderSearchQuery) -> anyhow::Result<Box<dyn Query>> {
        let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();

        let base: Box<dyn Query> = match q.q.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            None => Box::new(AllQuery),
            Some(s) => self.build_simple_query(s)?,
        };
        clauses.push((Occur::Must, base));

        if !q.states.is_empty() {
            clauses.push((
                Occur::Must,
                facet_or_query(self.fields.state_facet, "state", &q.states),
            ));
        }
        if !q.specialties.is_empty() {
            clauses.push((
                Occur::Must,
                facet_or_query(self.fields.specialty_facet, "specialty", &q.specialties),
            ));
        }
        if let Some(outcome) = q.outcome.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            clauses.push((
                Occur::Must,
                facet_term_query(self.fields.outcome_facet, "outcome", outcome),
            ));
        }
        if let Some(target) = q.client_target {
            let term = Term::from_field_bool(self.fields.client_target, target);
            clauses.push((
                Occur::Must,
                Box::new(TermQuery::new(term, IndexRecordOption::Basic)),
            ));
        }

        Ok(Box::new(BooleanQuery::new(clauses)))
    }

    fn doc_to_hit(
        &self,
        searcher: &tantivy::Searcher,
        addr: DocAddress,
    ) -> anyhow::Result<ProviderHit> {
        let doc: TantivyDocument = searcher.doc(addr)?;
        let text = |f: Field| {
            doc.get_first(f)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        };

        let npi = text(self.fields.npi).ok_or_else(|| anyhow!("missing npi in doc"))?;

        Ok(ProviderHit {
            npi,
            name: text(self.fields.name),
            city: text(self.fields.city),
            state: text(self.fields.state),
            zip_code: text(self.fields.zip_code),
            specialty: text(self.fields.specialty),
            outcome: text(self.fields.outcome),
            is_client_target: doc
                .get_first(self.fields.client_target)
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            patients: doc
                .get_first(self.fields.patients)
                .and_then(|v| v.as_i64())
                .unwrap_or(0),
            patients_phenom: doc
                .get_first(self.fields.patients_phenom)
                .and_then(|v| v.as_i64())
                .unwrap_or(0),
            phenom_lift_potential: doc
                .get_first(self.fields.lift)
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0),
        })
    }
}

pub fn build_provider_index(
    conn: &Connection,
    index_dir: &Path,
    rebuild: bool,
) -> anyhow::Result<()> {
    let success_marker = index_dir.join("_SUCCESS");
    if index_dir.exists() && !rebuild {
        if success_marker.exists() {
            tracing::info!(
                "Provider index already exists at {}; skipping",
                index_dir.display()
            );
            return Ok(());
        }
        tracing::info!(
            "Provider index dir exists but is missing {} (previous build likely failed); rebuilding",
            success_marker.display()
        );
        std::fs::remove_dir_all(index_dir)
            .with_context(|| format!("remove {}", index_dir.display()))?;
    } else if rebuild && index_dir.exists() {
        std::fs::remove_dir_all(index_dir)
            .with_context(|| format!("remove {}", index_dir.display()))?;
    }
    std::fs::create_dir_all(index_dir).with_context(|| format!("mkdir {}", index_dir.display()))?;

    let index = Index::create_in_dir(index_dir, provider_schema()).context("create provider index")?;
    let count = index_providers(conn, &index)?;
    tracing::info!("Provider index committed ({} docs)", count);

    let _ = std::fs::write(&success_marker, "ok\n");
    Ok(())
}

fn index_providers(conn: &Connection, index: &Index) -> anyhow::Result<u64> {
    let mut writer = index
        .writer_with_num_threads(2, 128_000_000)
        .context("create index writer")?;
    let schema = index.schema();
    let fields = provider_fields(&schema)?;

    let sql = r#"
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
    "#;

    let mut stmt = conn.prepare(sql).context("prepare providers scan")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<usize, Option<String>>(0)?,
            row.get::<usize, Option<String>>(1)?,
            row.get::<usize, Option<String>>(2)?,
            row.get::<usize, Option<String>>(3)?,
            row.get::<usize, Option<String>>(4)?,
            row.get::<usize, Option<String>>(5)?,
            row.get::<usize, Option<String>>(6)?,
            row.get::<usize, Option<bool>>(7)?,
            row.get::<usize, Option<i64>>(8)?,
            row.get::<usize, Option<i64>>(9)?,
            row.get::<usize, Option<f64>>(10)?,
        ))
    })?;

    let mut count: u64 = 0;
    let mut skipped: u64 = 0;
    for r in rows {
        let (npi, name, city, state, zip, specialty, outcome, target, patients, phenom, lift) = r?;

        let Some(npi) = npi.as_deref().map(str::trim).filter(|s| !s.is_empty()) else {
            skipped += 1;
            continue;
        };

        let mut doc = TantivyDocument::default();
        doc.add_text(fields.npi, npi);

        if let Some(v) = name.as_deref().filter(|s| !s.trim().is_empty()) {
            doc.add_text(fields.name, v);
        }
        if let Some(v) = city.as_deref().filter(|s| !s.trim().is_empty()) {
            doc.add_text(fields.city, v);
        }
        if let Some(v) = state.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            doc.add_text(fields.state, v);
            doc.add_facet(fields.state_facet, Facet::from_path(["state", v]));
        }
        if let Some(v) = zip.as_deref().filter(|s| !s.trim().is_empty()) {
            doc.add_text(fields.zip_code, v);
            if let Some(z5) = normalize_zip5(v) {
                doc.add_text(fields.zip5, &z5);
            }
        }
        if let Some(v) = specialty.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            doc.add_text(fields.specialty, v);
            doc.add_facet(fields.specialty_facet, Facet::from_path(["specialty", v]));
        }
        if let Some(v) = outcome.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            doc.add_text(fields.outcome, v);
            doc.add_facet(fields.outcome_facet, Facet::from_path(["outcome", v]));
        }
        doc.add_bool(fields.client_target, target.unwrap_or(false));

        doc.add_i64(fields.patients, patients.unwrap_or(0));
        doc.add_i64(fields.patients_phenom, phenom.unwrap_or(0));
        doc.add_f64(
            fields.lift,
            lift.filter(|x| x.is_finite()).unwrap_or(0.0),
        );

        writer.add_document(doc)?;
        count += 1;
        if count % 100_000 == 0 {
            tracing::info!("Indexed {} providers...", count);
        }
    }

    if skipped > 0 {
        tracing::info!("Skipped {} rows with NULL/empty npi", skipped);
    }
    writer.commit().context("commit provider index")?;
    Ok(count)
}

fn provider_schema() -> Schema {
    let mut b = Schema::builder();

    b.add_text_field("npi", STRING | STORED);
    b.add_text_field("name", TEXT | STORED);
    b.add_text_field("city", TEXT | STORED);
    b.add_text_field("state", STRING | STORED);
    b.add_text_field("zip_code", STORED);
    b.add_text_field("zip5", STRING);
    b.add_text_field("specialty", TEXT | STORED);
    b.add_text_field("outcome", STRING | STORED);

    b.add_facet_field("state_facet", FacetOptions::default());
    b.add_facet_field("specialty_facet", FacetOptions::default());
    b.add_facet_field("outcome_facet", FacetOptions::default());

    let numeric = NumericOptions::default()
        .set_fast()
        .set_indexed()
        .set_stored();

    b.add_bool_field(
        "is_client_target",
        NumericOptions::default().set_indexed().set_stored(),
    );
    b.add_i64_field("patients", numeric.clone());
    b.add_i64_field("patients_phenom", numeric.clone());
    b.add_f64_field("phenom_lift_potential", numeric);

    b.build()
}

fn provider_fields(schema: &Schema) -> anyhow::Result<ProviderFields> {
    Ok(ProviderFields {
        npi: schema.get_field("npi")?,
        name: schema.get_field("name")?,
        city: schema.get_field("city")?,
        state: schema.get_field("state")?,
        zip_code: schema.get_field("zip_code")?,
        zip5: schema.get_field("zip5")?,
        specialty: schema.get_field("specialty")?,
        outcome: schema.get_field("outcome")?,

        state_facet: schema.get_field("state_facet")?,
        specialty_facet: schema.get_field("specialty_facet")?,
        outcome_facet: schema.get_field("outcome_facet")?,
        client_target: schema.get_field("is_client_target")?,

        patients: schema.get_field("patients")?,
        patients_phenom: schema.get_field("patients_phenom")?,
        lift: schema.get_field("phenom_lift_potential")?,
    })
}

fn facet_term_query(field: Field, root: &str, value: &str) -> Box<dyn Query> {
    let term = Term::from_facet(field, &Facet::from_path([root, value]));
    Box::new(TermQuery::new(term, IndexRecordOption::Basic))
}

fn facet_or_query(field: Field, root: &str, values: &[String]) -> Box<dyn Query> {
    let mut should = Vec::new();
    for v in values {
        let v = v.trim();
        if v.is_empty() {
            continue;
        }
        should.push((Occur::Should, facet_term_query(field, root, v)));
    }
    Box::new(BooleanQuery::new(should))
}

fn looks_like_npi(s: &str) -> bool {
    s.len() == 10 && s.chars().all(|c| c.is_ascii_digit())
}

fn looks_like_zip(s: &str) -> Option<String> {
    let short = s.len() == 5 || (s.len() == 10 && s.as_bytes()[5] == b'-');
    if short { normalize_zip5(s) } else { None }
}
