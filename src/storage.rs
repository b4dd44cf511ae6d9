use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct StoragePaths {
    pub source_dir: PathBuf,
    pub index_dir: PathBuf,
    pub duckdb_path: PathBuf,
    pub provider_index_dir: PathBuf,
    pub meta_path: PathBuf,
    pub views_path: PathBuf,
}

impl StoragePaths {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir: PathBuf = data_dir.into();
        let source_dir = data_dir.join("source");
        let index_dir = data_dir.join("index");
        let duckdb_path = data_dir.join("risk_panel.duckdb");
        let provider_index_dir = index_dir.join("providers");
        let meta_path = data_dir.join("meta.json");
        let views_path = data_dir.join("views.json");

        Self {
            source_dir,
            index_dir,
            duckdb_path,
            provider_index_dir,
            meta_path,
            views_path,
        }
    }

    /// Where a snapshot pulled from the hosted backend is stored.
    pub fn backend_snapshot(&self) -> PathBuf {
        self.source_dir.join("providers.json")
    }

    /// Backend snapshot of the patient risk table.
    pub fn patient_snapshot(&self) -> PathBuf {
        self.source_dir.join("patient_risks.json")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.source_dir)?;
        std::fs::create_dir_all(&self.index_dir)?;
        Ok(())
    }
}

pub fn file_present_nonempty(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(m) => m.is_file() && m.len() > 0,
        Err(_) => false,
    }
}
