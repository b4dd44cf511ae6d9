use std::future::Future;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::cli::BuildArgs;
use crate::storage::{StoragePaths, file_present_nonempty};

/// Rows requested per REST call. Hosted gateways commonly cap responses at 1000.
const PAGE_ROWS: u64 = 1000;

/// One backend table the build can pull.
#[derive(Debug, Clone, Copy)]
struct RemoteTable<'a> {
    table: &'a str,
    /// PostgREST `order` value; paging needs a stable order.
    order: &'a str,
}

/// Resolves the provider file the build should load, pulling a fresh snapshot from the
/// hosted backend when no local file was given.
pub async fn ensure_provider_input(
    paths: &StoragePaths,
    opts: &BuildArgs,
) -> anyhow::Result<PathBuf> {
    paths.ensure_dirs().context("create data directories")?;

    if let Some(p) = opts.providers_file.as_ref() {
        return local_input(p, "Provider");
    }

    let dest = paths.backend_snapshot();
    if !opts.force_download && file_present_nonempty(&dest) {
        tracing::info!("Reusing provider snapshot at {}", dest.display());
        return Ok(dest);
    }

    if opts.offline {
        return Err(anyhow!(
            "Missing provider snapshot at {} (use --providers-file or run without --offline).",
            dest.display()
        ));
    }

    let base = backend_base(opts).ok_or_else(|| {
        anyhow!("No provider input: pass --providers-file or --backend-url/PHENOM_BACKEND_URL")
    })?;
    let remote = RemoteTable {
        table: &opts.backend_table,
        order: "npi.asc",
    };
    download_table(base, opts.backend_key.as_deref(), remote, &dest).await?;
    Ok(dest)
}

/// Like [`ensure_provider_input`] for the patient risk table, which is optional:
/// `Ok(None)` means the build proceeds with an empty patient panel.
pub async fn ensure_patient_input(
    paths: &StoragePaths,
    opts: &BuildArgs,
) -> anyhow::Result<Option<PathBuf>> {
    if let Some(p) = opts.patients_file.as_ref() {
        return local_input(p, "Patient risk").map(Some);
    }

    let dest = paths.patient_snapshot();
    if !opts.force_download && file_present_nonempty(&dest) {
        tracing::info!("Reusing patient risk snapshot at {}", dest.display());
        return Ok(Some(dest));
    }

    let Some(base) = backend_base(opts) else {
        tracing::info!("No patient risk input configured; patient panel will be empty");
        return Ok(None);
    };
    if opts.offline {
        tracing::warn!(
            "Missing patient risk snapshot at {} and offline=true; patient panel will be empty",
            dest.display()
        );
        return Ok(None);
    }

    let remote = RemoteTable {
        table: &opts.patients_table,
        order: "person_id.asc,outcome.asc,time_horizon.asc",
    };
    download_table(base, opts.backend_key.as_deref(), remote, &dest).await?;
    Ok(Some(dest))
}

fn local_input(p: &str, what: &str) -> anyhow::Result<PathBuf> {
    let p = PathBuf::from(p);
    if !file_present_nonempty(&p) {
        return Err(anyhow!("{what} file {} is missing or empty", p.display()));
    }
    Ok(p)
}

fn backend_base(opts: &BuildArgs) -> Option<&str> {
    opts.backend_url
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn rest_table_url(base: &str, table: &str) -> String {
    format!(
        "{}/rest/v1/{}?select=*",
        base.trim_end_matches('/'),
        table.trim()
    )
}

fn page_url(table_url: &str, order: &str, offset: u64, limit: u64) -> String {
    format!("{table_url}&order={order}&limit={limit}&offset={offset}")
}

/// One page of rows plus the total the server reported, if any.
#[derive(Debug, Default)]
struct Page {
    rows: Vec<serde_json::Value>,
    total: Option<u64>,
}

async fn download_table(
    base: &str,
    key: Option<&str>,
    remote: RemoteTable<'_>,
    dest: &Path,
) -> anyhow::Result<()> {
    let table_url = rest_table_url(base, remote.table);
    tracing::info!("Downloading {} -> {}", table_url, dest.display());

    let client = reqwest::Client::new();
    let (rows, total) = write_snapshot(dest, PAGE_ROWS, |offset| {
        let url = page_url(&table_url, remote.order, offset, PAGE_ROWS);
        fetch_page(client.clone(), url, key.map(str::to_string))
    })
    .await?;

    match total {
        Some(total) if total != rows => tracing::warn!(
            "{}: backend reported {} rows but {} were downloaded",
            remote.table,
            total,
            rows
        ),
        _ => tracing::info!("{}: downloaded {} rows", remote.table, rows),
    }
    Ok(())
}

async fn fetch_page(
    client: reqwest::Client,
    url: String,
    key: Option<String>,
) -> anyhow::Result<Page> {
    let mut req = client
        .get(&url)
        .header("Accept", "application/json")
        .header("Prefer", "count=exact");
    if let Some(key) = key.as_deref() {
        req = req
            .header("apikey", key)
            .header("Authorization", format!("Bearer {key}"));
    }
    let resp = req.send().await.with_context(|| format!("GET {url}"))?;

    if !resp.status().is_success() {
        return Err(anyhow!("Download failed ({}): {}", resp.status(), url));
    }

    let total = resp
        .headers()
        .get(reqwest::header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(content_range_total);
    let body = resp
        .bytes()
        .await
        .with_context(|| format!("read body from {url}"))?;
    let rows: Vec<serde_json::Value> =
        serde_json::from_slice(&body).with_context(|| format!("parse JSON page from {url}"))?;
    Ok(Page { rows, total })
}

/// Total from a `Content-Range` value such as `0-999/5234`; `None` when unknown (`*`).
fn content_range_total(v: &str) -> Option<u64> {
    v.rsplit_once('/')?.1.trim().parse().ok()
}

/// Pages through `fetch` into `dest` as one JSON array, via a `.part` file that is removed
/// if any page fails. Returns the row count and the last total the server reported.
async fn write_snapshot<F, Fut>(
    dest: &Path,
    page_rows: u64,
    fetch: F,
) -> anyhow::Result<(u64, Option<u64>)>
where
    F: FnMut(u64) -> Fut,
    Fut: Future<Output = anyhow::Result<Page>>,
{
    let tmp = tmp_path(dest);
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }

    let mut file = tokio::fs::File::create(&tmp)
        .await
        .with_context(|| format!("create {}", tmp.display()))?;

    let written = async {
        let counts = write_pages(&mut file, page_rows, fetch).await?;
        file.flush().await?;
        anyhow::Ok(counts)
    }
    .await;
    drop(file);

    let counts = match written {
        Ok(counts) => counts,
        Err(e) => {
            if let Err(rm) = tokio::fs::remove_file(&tmp).await {
                tracing::warn!("could not remove {}: {}", tmp.display(), rm);
            }
            return Err(e);
        }
    };

    tokio::fs::rename(&tmp, dest)
        .await
        .with_context(|| format!("rename {} -> {}", tmp.display(), dest.display()))?;
    Ok(counts)
}

/// Requests pages at increasing offsets until one comes back short.
async fn write_pages<W, F, Fut>(
    out: &mut W,
    page_rows: u64,
    mut fetch: F,
) -> anyhow::Result<(u64, Option<u64>)>
where
    W: AsyncWrite + Unpin,
    F: FnMut(u64) -> Fut,
    Fut: Future<Output = anyhow::Result<Page>>,
{
    let page_rows = page_rows.max(1);
    let mut offset: u64 = 0;
    let mut total = None;

    out.write_all(b"[").await?;
    loop {
        let page = fetch(offset).await?;
        total = page.total.or(total);
        let n = page.rows.len() as u64;
        for row in page.rows {
            if offset > 0 {
                out.write_all(b",\n").await?;
            }
            out.write_all(&serde_json::to_vec(&row)?).await?;
            offset += 1;
        }
        if n > 0 && offset % (50 * page_rows) == 0 {
            tracing::info!("... downloaded {} rows", offset);
        }
        if n < page_rows {
            break;
        }
    }
    out.write_all(b"]\n").await?;
    Ok((offset, total))
}

fn tmp_path(dest: &Path) -> PathBuf {
    let fname = dest
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("download");
    dest.with_file_name(format!("{fname}.part"))
}
