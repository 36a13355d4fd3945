use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::catalog::CatalogClient;
use crate::config::ResolvedConfig;
use crate::domain::{EntityKind, StudyName};
use crate::error::SyncError;
use crate::manager::MetadataManager;
use crate::models::ProjectMetadata;
use crate::store::MetadataStore;
use crate::sync::{CatalogSynchronizer, SyncReport, update_project_metadata_from_catalog};

#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub command: String,
    pub study: Option<String>,
    pub report: SyncReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudiesResult {
    pub studies: Vec<StudyEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudyEntry {
    pub id: i32,
    pub name: String,
    pub files: usize,
    pub indexed_files: usize,
    pub samples: usize,
    pub cohorts: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct InspectResult {
    pub study: String,
    pub kind: EntityKind,
    pub records: Vec<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectResult {
    pub project: String,
    pub metadata: ProjectMetadata,
}

/// Wires the metadata store, its writer API and the catalog synchronizer.
pub struct App<C: CatalogClient> {
    store: Arc<MetadataStore>,
    manager: MetadataManager,
    synchronizer: CatalogSynchronizer<C>,
}

impl<C: CatalogClient> App<C> {
    pub fn new(store: Arc<MetadataStore>, catalog: C, config: &ResolvedConfig) -> Self {
        Self {
            manager: MetadataManager::new(store.clone(), config.lock_settings()),
            synchronizer: CatalogSynchronizer::new(store.clone(), catalog, config.sync_options()),
            store,
        }
    }

    pub fn manager(&self) -> &MetadataManager {
        &self.manager
    }

    pub fn synchronizer(&self) -> &CatalogSynchronizer<C> {
        &self.synchronizer
    }

    pub fn sync_study(&self, study: &StudyName, files: &[String]) -> Result<SyncResult, SyncError> {
        let files = (!files.is_empty()).then_some(files);
        let report = self.synchronizer.synchronize_study(study, files)?;
        Ok(sync_result("study", Some(study), report))
    }

    pub fn sync_files(&self, study: &StudyName) -> Result<SyncResult, SyncError> {
        let report = self.synchronizer.synchronize_files(study, None)?;
        Ok(sync_result("files", Some(study), report))
    }

    pub fn sync_samples(&self, study: &StudyName) -> Result<SyncResult, SyncError> {
        let report = self.synchronizer.synchronize_samples(study, None)?;
        Ok(sync_result("samples", Some(study), report))
    }

    pub fn sync_cohorts(&self, study: &StudyName) -> Result<SyncResult, SyncError> {
        let report = self.synchronizer.synchronize_cohorts(study)?;
        Ok(sync_result("cohorts", Some(study), report))
    }

    pub fn sync_all(&self) -> Result<SyncResult, SyncError> {
        let report = self.synchronizer.synchronize_all_studies()?;
        Ok(sync_result("all", None, report))
    }

    /// `study` is the catalog identifier; it is not looked up in storage.
    pub fn sync_removed(&self, study: &str) -> Result<SyncResult, SyncError> {
        let report = self.synchronizer.synchronize_removed_study(study)?;
        Ok(SyncResult {
            command: "removed".to_string(),
            study: Some(study.to_string()),
            report,
        })
    }

    pub fn studies(&self) -> Result<StudiesResult, SyncError> {
        let mut studies = Vec::new();
        for (name, id) in self.store.study_names()? {
            let files = self.store.files().list(id)?;
            studies.push(StudyEntry {
                id: id.get(),
                name,
                indexed_files: files.iter().filter(|file| file.is_indexed()).count(),
                files: files.len(),
                samples: self.store.samples().scan(id).count(),
                cohorts: self.store.cohorts().scan(id).count(),
            });
        }
        Ok(StudiesResult { studies })
    }

    pub fn inspect(&self, study: &StudyName, kind: EntityKind) -> Result<InspectResult, SyncError> {
        let metadata = self.store.study(study)?;
        let id = metadata.id;
        let records = match kind {
            EntityKind::Project => vec![to_value(kind, &self.manager.project_metadata()?)?],
            EntityKind::Study => vec![to_value(kind, &metadata)?],
            EntityKind::File => values(kind, self.store.files().list(id)?)?,
            EntityKind::Sample => values(kind, self.store.samples().list(id)?)?,
            EntityKind::Cohort => values(kind, self.store.cohorts().list(id)?)?,
            EntityKind::Task => values(kind, self.store.tasks().list(id)?)?,
            EntityKind::VariantFile => values(kind, self.store.variant_files().list(id)?)?,
        };
        Ok(InspectResult {
            study: metadata.name,
            kind,
            records,
        })
    }

    pub fn project_organism(&self, project: &str) -> Result<ProjectResult, SyncError> {
        let metadata =
            update_project_metadata_from_catalog(&self.manager, self.synchronizer.catalog(), project)?;
        Ok(ProjectResult {
            project: project.to_string(),
            metadata,
        })
    }
}

fn sync_result(command: &str, study: Option<&StudyName>, report: SyncReport) -> SyncResult {
    SyncResult {
        command: command.to_string(),
        study: study.map(ToString::to_string),
        report,
    }
}

fn to_value<T: Serialize>(kind: EntityKind, record: &T) -> Result<Value, SyncError> {
    serde_json::to_value(record).map_err(|err| SyncError::serialization(kind.as_str(), err))
}

fn values<T: Serialize>(kind: EntityKind, records: Vec<T>) -> Result<Vec<Value>, SyncError> {
    records.iter().map(|record| to_value(kind, record)).collect()
}
