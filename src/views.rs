//! Dashboard state and saved views, persisted as one JSON document.
//!
//! Loaded once at startup; every committed change is written back before returning.

use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};

use crate::pipeline::GeoRequest;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedView {
    pub id: u64,
    pub name: String,
    pub filters: GeoRequest,
    pub created_at_unix: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct ViewsDoc {
    #[serde(default)]
    current: GeoRequest,
    #[serde(default)]
    views: Vec<SavedView>,
    #[serde(default)]
    next_id: u64,
}

#[derive(Debug)]
pub struct ViewStore {
    path: PathBuf,
    doc: ViewsDoc,
}

impl ViewStore {
    /// Reads `path`, starting from an empty store if it doesn't exist yet.
    pub fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let doc = match std::fs::read_to_string(&path) {
            Ok(s) if s.trim().is_empty() => ViewsDoc::default(),
            Ok(s) => serde_json::from_str(&s)
                .with_context(|| format!("parse views file {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ViewsDoc::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("read views file {}", path.display()));
            }
        };
        tracing::info!(
            "Loaded {} saved views from {}",
            doc.views.len(),
            path.display()
        );
        Ok(Self { path, doc })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current(&self) -> &GeoRequest {
        &self.doc.current
    }

    pub fn views(&self) -> &[SavedView] {
        &self.doc.views
    }

    pub fn set_current(&mut self, filters: GeoRequest) -> anyhow::Result<()> {
        self.commit(|doc| {
            doc.current = filters;
            Ok(())
        })
    }

    pub fn create(&mut self, name: &str, filters: GeoRequest) -> anyhow::Result<SavedView> {
        let name = name.trim();
        if name.is_empty() {
            return Err(anyhow!("view name must not be empty"));
        }
        if self.doc.views.iter().any(|v| v.name == name) {
            return Err(anyhow!("a view named {name:?} already exists"));
        }
        let view = SavedView {
            id: self.doc.next_id + 1,
            name: name.to_string(),
            filters,
            created_at_unix: unix_now(),
        };
        let out = view.clone();
        self.commit(move |doc| {
            doc.next_id = view.id;
            doc.views.push(view);
            Ok(())
        })?;
        Ok(out)
    }

    /// Returns false if no view has this id.
    pub fn delete(&mut self, id: u64) -> anyhow::Result<bool> {
        if !self.doc.views.iter().any(|v| v.id == id) {
            return Ok(false);
        }
        self.commit(|doc| {
            doc.views.retain(|v| v.id != id);
            Ok(())
        })?;
        Ok(true)
    }

    /// Makes a saved view's filters the current state.
    pub fn apply(&mut self, id: u64) -> anyhow::Result<Option<GeoRequest>> {
        let Some(filters) = self
            .doc
            .views
            .iter()
            .find(|v| v.id == id)
            .map(|v| v.filters.clone())
        else {
            return Ok(None);
        };
        self.set_current(filters.clone())?;
        Ok(Some(filters))
    }

    /// Applies `f` to a copy, writes it, and only then swaps it in.
    fn commit(
        &mut self,
        f: impl FnOnce(&mut ViewsDoc) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        let mut next = self.doc.clone();
        f(&mut next)?;
        write_atomic(&self.path, &next)?;
        self.doc = next;
        Ok(())
    }
}

fn write_atomic(path: &Path, v: &impl Serialize) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }
    let fname = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("views.json");
    let tmp = path.with_file_name(format!("{fname}.tmp"));
    let s = serde_json::to_string_pretty(v)?;
    std::fs::write(&tmp, s).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
