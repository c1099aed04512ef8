use chrono::Local;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::{CanonicalJobRecord, ListingRecord};

pub const SEARCHES_DIR: &str = "searches";
pub const JOB_DETAILS_DIR: &str = "job_details";
pub const WAREHOUSE_DIR: &str = "warehouse";
pub const DIAGNOSTICS_DIR: &str = "diagnostics";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ArtifactError + '_ {
    move |source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub fn timestamp() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}

/// First free `<stem>_<ts>[_n].<ext>` in `dir`.
fn unique_path(dir: &Path, stem: &str, ts: &str, ext: &str) -> PathBuf {
    let mut candidate = dir.join(format!("{}_{}.{}", stem, ts, ext));
    let mut n = 1;
    while candidate.exists() {
        candidate = dir.join(format!("{}_{}_{}.{}", stem, ts, n, ext));
        n += 1;
    }
    candidate
}

/// Writes run outputs under one root directory. Files are never overwritten.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir(&self, sub: &str) -> Result<PathBuf, ArtifactError> {
        let dir = self.root.join(sub);
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        Ok(dir)
    }

    fn write_new(path: &Path, bytes: &[u8]) -> Result<(), ArtifactError> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(io_err(path))?;
        let mut writer = BufWriter::new(file);
        writer.write_all(bytes).map_err(io_err(path))?;
        writer.flush().map_err(io_err(path))
    }

    fn save_json<T: Serialize + ?Sized>(&self, sub: &str, stem: &str, value: &T) -> Result<PathBuf, ArtifactError> {
        let dir = self.dir(sub)?;
        let path = unique_path(&dir, stem, &timestamp(), "json");
        let bytes = serde_json::to_vec_pretty(value).map_err(|source| ArtifactError::Json {
            path: path.clone(),
            source,
        })?;
        Self::write_new(&path, &bytes)?;
        debug!(path = %path.display(), "artifact written");
        Ok(path)
    }

    pub fn save_listings(&self, listings: &[ListingRecord]) -> Result<PathBuf, ArtifactError> {
        self.save_json(SEARCHES_DIR, "jobs", listings)
    }

    pub fn save_job(&self, record: &CanonicalJobRecord) -> Result<PathBuf, ArtifactError> {
        self.save_json(JOB_DETAILS_DIR, "job", record)
    }

    pub fn save_diagnostic(&self, link: &str, raw: &str) -> Result<PathBuf, ArtifactError> {
        let dir = self.dir(DIAGNOSTICS_DIR)?;
        let path = unique_path(&dir, "llm", &timestamp(), "txt");
        let body = format!("link: {}\n\n{}\n", link, raw);
        Self::write_new(&path, body.as_bytes())?;
        Ok(path)
    }

    /// Publish several JSON documents under `sub` as one unit.
    ///
    /// Every document is staged first; nothing becomes visible unless all
    /// staged writes succeed, and a failed publish removes what it already
    /// placed.
    pub fn write_batch(&self, sub: &str, documents: &[(&str, Vec<u8>)]) -> Result<Vec<PathBuf>, ArtifactError> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }
        let dir = self.dir(sub)?;
        let ts = timestamp();

        let mut staged: Vec<(PathBuf, &str)> = Vec::with_capacity(documents.len());
        for (stem, bytes) in documents {
            let tmp = unique_path(&dir, &format!(".{}", stem), &ts, "json.partial");
            if let Err(e) = Self::write_new(&tmp, bytes) {
                remove_all(staged.iter().map(|(p, _)| p.as_path()));
                let _ = fs::remove_file(&tmp);
                return Err(e);
            }
            staged.push((tmp, *stem));
        }

        let mut published: Vec<PathBuf> = Vec::with_capacity(staged.len());
        for (i, (tmp, stem)) in staged.iter().enumerate() {
            let target = unique_path(&dir, stem, &ts, "json");
            if let Err(source) = fs::rename(tmp, &target) {
                warn!(path = %target.display(), error = %source, "publish failed, rolling back batch");
                remove_all(published.iter().map(|p| p.as_path()));
                remove_all(staged[i..].iter().map(|(p, _)| p.as_path()));
                return Err(ArtifactError::Io {
                    path: target,
                    source,
                });
            }
            published.push(target);
        }
        Ok(published)
    }
}

fn remove_all<'a>(paths: impl Iterator<Item = &'a Path>) {
    for path in paths {
        if let Err(e) = fs::remove_file(path) {
            debug!(path = %path.display(), error = %e, "cleanup failed");
        }
    }
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ArtifactError> {
    let file = fs::File::open(path).map_err(io_err(path))?;
    serde_json::from_reader(BufReader::new(file)).map_err(|source| ArtifactError::Json {
        path: path.to_path_buf(),
        source,
    })
}

pub fn read_listings(path: &Path) -> Result<Vec<ListingRecord>, ArtifactError> {
    read_json(path)
}
