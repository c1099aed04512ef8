use std::path::PathBuf;
use tracing::info;

use crate::artifacts::{ArtifactError, ArtifactStore, WAREHOUSE_DIR};
use crate::models::{ActivityRow, BenefitRow, CanonicalJobRecord, PrincipalRow, RequirementRow};

pub const PRINCIPAL: &str = "principal";
pub const REQUIREMENTS: &str = "requirements";
pub const BENEFITS: &str = "benefits";
pub const ACTIVITIES: &str = "activities";

/// The four normalized tables, linked by `job_id`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WarehouseTables {
    pub principal: Vec<PrincipalRow>,
    pub requirements: Vec<RequirementRow>,
    pub benefits: Vec<BenefitRow>,
    pub activities: Vec<ActivityRow>,
}

impl WarehouseTables {
    pub fn is_empty(&self) -> bool {
        self.principal.is_empty()
            && self.requirements.is_empty()
            && self.benefits.is_empty()
            && self.activities.is_empty()
    }

    fn encode(&self) -> Result<Vec<(&'static str, Vec<u8>)>, serde_json::Error> {
        let mut documents = Vec::new();
        if !self.principal.is_empty() {
            documents.push((PRINCIPAL, serde_json::to_vec_pretty(&self.principal)?));
        }
        if !self.requirements.is_empty() {
            documents.push((REQUIREMENTS, serde_json::to_vec_pretty(&self.requirements)?));
        }
        if !self.benefits.is_empty() {
            documents.push((BENEFITS, serde_json::to_vec_pretty(&self.benefits)?));
        }
        if !self.activities.is_empty() {
            documents.push((ACTIVITIES, serde_json::to_vec_pretty(&self.activities)?));
        }
        Ok(documents)
    }
}

/// Assigns job ids and accumulates table rows until flushed.
///
/// Ids start at 1, grow by exactly one per loaded job and are never reused,
/// not even across flushes.
pub struct Warehouse {
    store: ArtifactStore,
    next_job_id: u64,
    tables: WarehouseTables,
}

impl Warehouse {
    pub fn new(store: ArtifactStore) -> Self {
        Self {
            store,
            next_job_id: 1,
            tables: WarehouseTables::default(),
        }
    }

    #[cfg(test)]
    pub fn tables(&self) -> &WarehouseTables {
        &self.tables
    }

    /// Jobs loaded since the last successful flush.
    pub fn pending_jobs(&self) -> usize {
        self.tables.principal.len()
    }

    pub fn load(&mut self, record: CanonicalJobRecord) -> u64 {
        let job_id = self.next_job_id;
        self.next_job_id += 1;

        self.tables.principal.push(PrincipalRow {
            job_id,
            principal: record.principal,
        });
        self.tables.requirements.extend(
            record
                .requirements
                .into_iter()
                .map(|requirement| RequirementRow { job_id, requirement }),
        );
        self.tables.benefits.extend(
            record
                .benefits
                .into_iter()
                .map(|benefit| BenefitRow { job_id, benefit }),
        );
        self.tables.activities.extend(
            record
                .activities
                .into_iter()
                .map(|activity| ActivityRow { job_id, activity }),
        );
        job_id
    }

    /// Write every non-empty table, then clear them.
    ///
    /// On error nothing is published and the rows stay in memory, so the
    /// flush can simply be retried.
    pub fn flush(&mut self) -> Result<Vec<PathBuf>, ArtifactError> {
        if self.tables.is_empty() {
            return Ok(Vec::new());
        }
        let documents = self.tables.encode().map_err(|source| ArtifactError::Json {
            path: self.store.root().join(WAREHOUSE_DIR),
            source,
        })?;
        let paths = self.store.write_batch(WAREHOUSE_DIR, &documents)?;
        info!(
            jobs = self.tables.principal.len(),
            requirements = self.tables.requirements.len(),
            benefits = self.tables.benefits.len(),
            activities = self.tables.activities.len(),
            "warehouse flushed"
        );
        self.tables = WarehouseTables::default();
        Ok(paths)
    }
}

#[cfg(test)]
/// Reload flushed table files; each file is routed by its name prefix.
pub fn read_tables(paths: &[PathBuf]) -> Result<WarehouseTables, ArtifactError> {
    use crate::artifacts::read_json;

    let mut tables = WarehouseTables::default();
    for path in paths {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if name.starts_with(&format!("{}_", PRINCIPAL)) {
            tables.principal.extend(read_json::<Vec<PrincipalRow>>(path)?);
        } else if name.starts_with(&format!("{}_", REQUIREMENTS)) {
            tables.requirements.extend(read_json::<Vec<RequirementRow>>(path)?);
        } else if name.starts_with(&format!("{}_", BENEFITS)) {
            tables.benefits.extend(read_json::<Vec<BenefitRow>>(path)?);
        } else if name.starts_with(&format!("{}_", ACTIVITIES)) {
            tables.activities.extend(read_json::<Vec<ActivityRow>>(path)?);
        }
    }
    Ok(tables)
}
