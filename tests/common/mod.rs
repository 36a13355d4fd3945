#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use variant_catalog_sync::catalog::{
    CatalogClient, CatalogCohort, CatalogFile, CatalogFileIndex, CatalogJob, CatalogProject,
    CatalogSample, PageRequest, SampleIndexDoc,
};
use variant_catalog_sync::domain::{CohortStatus, IndexStatus, StudyId, to_uri};
use variant_catalog_sync::error::SyncError;
use variant_catalog_sync::lock::LockSettings;
use variant_catalog_sync::manager::MetadataManager;
use variant_catalog_sync::store::{MetadataStore, StoreOptions};
use variant_catalog_sync::sync::{CatalogSynchronizer, SyncOptions};

/// Catalog contents of a single study, keyed by catalog id.
#[derive(Debug, Default)]
pub struct CatalogState {
    pub files: BTreeMap<String, CatalogFile>,
    pub samples: BTreeMap<String, CatalogSample>,
    pub cohorts: BTreeMap<String, CatalogCohort>,
    pub jobs: Vec<CatalogJob>,
    pub project: Option<CatalogProject>,
    /// Sample names the catalog finds when it re-reads a file.
    pub source_samples: BTreeMap<String, Vec<String>>,
    /// Writes to these ids fail with a transport error.
    pub failing: BTreeSet<String>,
    /// Every successful write, in order.
    pub writes: Vec<String>,
}

#[derive(Debug, Default)]
pub struct FakeCatalog {
    state: Mutex<CatalogState>,
}

impl FakeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, CatalogState> {
        self.state.lock()
    }

    pub fn add_file(&self, file: CatalogFile) {
        self.state().files.insert(file.id.clone(), file);
    }

    pub fn add_sample(&self, id: &str) {
        self.state().samples.insert(
            id.to_string(),
            CatalogSample {
                id: id.to_string(),
                ..CatalogSample::default()
            },
        );
    }

    pub fn add_cohort(&self, id: &str, samples: &[&str], status: CohortStatus) {
        self.state().cohorts.insert(
            id.to_string(),
            CatalogCohort {
                id: id.to_string(),
                samples: samples.iter().map(|sample| sample.to_string()).collect(),
                status,
            },
        );
    }

    pub fn file(&self, id: &str) -> CatalogFile {
        self.state().files[id].clone()
    }

    pub fn sample(&self, id: &str) -> CatalogSample {
        self.state().samples[id].clone()
    }

    pub fn cohort(&self, id: &str) -> CatalogCohort {
        self.state().cohorts[id].clone()
    }

    pub fn writes(&self) -> Vec<String> {
        self.state().writes.clone()
    }

    pub fn fail_writes_to(&self, id: &str) {
        self.state().failing.insert(id.to_string());
    }

    fn write(
        &self,
        id: &str,
        label: String,
        apply: impl FnOnce(&mut CatalogState) -> Result<(), SyncError>,
    ) -> Result<(), SyncError> {
        let mut state = self.state();
        if state.failing.contains(id) {
            return Err(SyncError::CatalogHttp(format!("connection reset writing {id}")));
        }
        apply(&mut *state)?;
        state.writes.push(label);
        Ok(())
    }

    fn with_file(
        &self,
        file: &str,
        label: String,
        update: impl FnOnce(&mut CatalogFile),
    ) -> Result<(), SyncError> {
        self.write(file, label, |state| {
            let entry = state
                .files
                .get_mut(file)
                .ok_or_else(|| SyncError::CatalogNotFound(file.to_string()))?;
            update(entry);
            Ok(())
        })
    }

    fn with_sample(
        &self,
        sample: &str,
        label: String,
        update: impl FnOnce(&mut CatalogSample),
    ) -> Result<(), SyncError> {
        self.write(sample, label, |state| {
            let entry = state
                .samples
                .get_mut(sample)
                .ok_or_else(|| SyncError::CatalogNotFound(sample.to_string()))?;
            update(entry);
            Ok(())
        })
    }

    fn with_cohort(
        &self,
        cohort: &str,
        label: String,
        update: impl FnOnce(&mut CatalogCohort),
    ) -> Result<(), SyncError> {
        self.write(cohort, label, |state| {
            let entry = state
                .cohorts
                .get_mut(cohort)
                .ok_or_else(|| SyncError::CatalogNotFound(cohort.to_string()))?;
            update(entry);
            Ok(())
        })
    }
}

impl CatalogClient for FakeCatalog {
    fn files_by_uri(&self, _study: &str, uris: &[String]) -> Result<Vec<CatalogFile>, SyncError> {
        Ok(self
            .state()
            .files
            .values()
            .filter(|file| uris.contains(&file.uri))
            .cloned()
            .collect())
    }

    fn files_by_index_status(
        &self,
        _study: &str,
        statuses: &[IndexStatus],
        page: PageRequest,
    ) -> Result<Vec<CatalogFile>, SyncError> {
        Ok(self
            .state()
            .files
            .values()
            .filter(|file| statuses.contains(&file.index.status))
            .skip(page.skip)
            .take(page.limit)
            .cloned()
            .collect())
    }

    fn update_file_index_status(
        &self,
        _study: &str,
        file: &str,
        status: IndexStatus,
        _message: &str,
    ) -> Result<(), SyncError> {
        self.with_file(file, format!("file {file} index {status}"), |entry| {
            entry.index.status = status;
        })
    }

    fn update_file_annotation_index(
        &self,
        _study: &str,
        file: &str,
        status: IndexStatus,
    ) -> Result<(), SyncError> {
        self.with_file(file, format!("file {file} annotation {status}"), |entry| {
            entry.index.annotation_index_status = status;
        })
    }

    fn update_file_secondary_annotation_index(
        &self,
        _study: &str,
        file: &str,
        status: IndexStatus,
    ) -> Result<(), SyncError> {
        self.with_file(file, format!("file {file} secondary annotation {status}"), |entry| {
            entry.index.secondary_annotation_index_status = status;
        })
    }

    fn rederive_file_metadata(&self, _study: &str, file: &str) -> Result<(), SyncError> {
        let samples = self
            .state()
            .source_samples
            .get(file)
            .cloned()
            .unwrap_or_default();
        self.with_file(file, format!("file {file} rederive"), |entry| {
            entry.sample_ids = samples;
        })
    }

    fn samples(&self, _study: &str, ids: &[String]) -> Result<Vec<CatalogSample>, SyncError> {
        let state = self.state();
        Ok(ids
            .iter()
            .filter_map(|id| state.samples.get(id).cloned())
            .collect())
    }

    fn update_sample_index(
        &self,
        _study: &str,
        sample: &str,
        status: IndexStatus,
    ) -> Result<(), SyncError> {
        self.with_sample(sample, format!("sample {sample} index {status}"), |entry| {
            entry.index_status = status;
        })
    }

    fn update_sample_annotation_index(
        &self,
        _study: &str,
        sample: &str,
        status: IndexStatus,
    ) -> Result<(), SyncError> {
        self.with_sample(sample, format!("sample {sample} annotation {status}"), |entry| {
            entry.annotation_index_status = status;
        })
    }

    fn update_sample_secondary_annotation_index(
        &self,
        _study: &str,
        sample: &str,
        status: IndexStatus,
    ) -> Result<(), SyncError> {
        self.with_sample(
            sample,
            format!("sample {sample} secondary annotation {status}"),
            |entry| entry.secondary_annotation_index_status = status,
        )
    }

    fn update_sample_secondary_sample_index(
        &self,
        _study: &str,
        sample: &str,
        doc: &SampleIndexDoc,
    ) -> Result<(), SyncError> {
        let doc = doc.clone();
        self.with_sample(
            sample,
            format!("sample {sample} sample index {} v{}", doc.status, doc.version),
            |entry| entry.sample_index = doc,
        )
    }

    fn cohort(&self, _study: &str, cohort: &str) -> Result<Option<CatalogCohort>, SyncError> {
        Ok(self.state().cohorts.get(cohort).cloned())
    }

    fn cohorts(&self, _study: &str, ids: &[String]) -> Result<Vec<CatalogCohort>, SyncError> {
        let state = self.state();
        Ok(ids
            .iter()
            .filter_map(|id| state.cohorts.get(id).cloned())
            .collect())
    }

    fn set_cohort_status(
        &self,
        _study: &str,
        cohort: &str,
        status: CohortStatus,
        _message: &str,
    ) -> Result<(), SyncError> {
        self.with_cohort(cohort, format!("cohort {cohort} status {status}"), |entry| {
            entry.status = status;
        })
    }

    fn set_cohort_samples(
        &self,
        _study: &str,
        cohort: &str,
        samples: &[String],
    ) -> Result<(), SyncError> {
        let samples = samples.to_vec();
        self.with_cohort(
            cohort,
            format!("cohort {cohort} samples {}", samples.join(",")),
            |entry| entry.samples = samples,
        )
    }

    fn running_jobs(
        &self,
        _study: &str,
        input_file: &str,
        tool: &str,
    ) -> Result<Vec<CatalogJob>, SyncError> {
        Ok(self
            .state()
            .jobs
            .iter()
            .filter(|job| job.tool == tool && job.input_files.iter().any(|file| file == input_file))
            .cloned()
            .collect())
    }

    fn project(&self, project: &str) -> Result<CatalogProject, SyncError> {
        self.state()
            .project
            .clone()
            .filter(|candidate| candidate.id == project)
            .ok_or_else(|| SyncError::CatalogNotFound(project.to_string()))
    }
}

/// Catalog file named after the last component of `path`.
pub fn catalog_file(path: &str, status: IndexStatus) -> CatalogFile {
    let name = path.rsplit('/').next().unwrap_or(path).to_string();
    CatalogFile {
        id: name.clone(),
        name,
        path: path.to_string(),
        uri: to_uri(path),
        sample_ids: Vec::new(),
        index: CatalogFileIndex {
            status,
            ..CatalogFileIndex::default()
        },
    }
}

pub fn manager() -> MetadataManager {
    let store = Arc::new(MetadataStore::in_memory(StoreOptions::default()));
    MetadataManager::new(
        store,
        LockSettings {
            duration: Duration::from_secs(5),
            timeout: Duration::from_secs(5),
        },
    )
}

pub fn synchronizer(
    manager: &MetadataManager,
    catalog: FakeCatalog,
    batch_size: usize,
) -> CatalogSynchronizer<FakeCatalog> {
    CatalogSynchronizer::new(
        store_of(manager),
        catalog,
        SyncOptions {
            batch_size,
            deadline: None,
        },
    )
}

pub fn store_of(manager: &MetadataManager) -> Arc<MetadataStore> {
    manager.store_handle()
}

/// Registers `path` with its samples and marks it indexed.
pub fn index_file(manager: &MetadataManager, study: StudyId, path: &str, samples: &[&str]) {
    let file = manager.register_file(study, path).unwrap();
    let names: Vec<String> = samples.iter().map(|sample| sample.to_string()).collect();
    manager.register_file_samples(study, file, &names).unwrap();
    manager.add_indexed_files(study, &[file]).unwrap();
}

pub fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}
