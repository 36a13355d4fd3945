//! Reconciliation of the catalog against the metadata store.
//!
//! Storage is authoritative for indexing status, the catalog for identity and
//! membership. Every pass re-reads storage and recomputes the catalog state it
//! implies, so a pass can be repeated or interrupted at any point; each catalog
//! update is a full replace of one sub-document.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::catalog::{
    CatalogClient, CatalogFile, CatalogSample, PageRequest, SampleIndexDoc, VARIANT_INDEX_TOOL,
};
use crate::domain::{
    CohortStatus, DEFAULT_COHORT, FileId, IndexStatus, SampleId, StudyName, TaskStatus, TaskType,
    file_name, to_uri,
};
use crate::error::SyncError;
use crate::manager::MetadataManager;
use crate::models::{CohortMetadata, FileMetadata, ProjectMetadata, SampleMetadata, StudyMetadata};
use crate::store::{DEFAULT_PAGE_SIZE, MetadataStore};

const INDEXED_MESSAGE: &str = "Indexed, regarding storage metadata";
const NOT_INDEXED_MESSAGE: &str = "Not indexed, regarding storage metadata";
const LOADING_MESSAGE: &str = "File is being loaded, regarding storage metadata";
const COHORT_MESSAGE: &str = "Update status from storage";
const REMOVED_MESSAGE: &str = "Study has been removed from storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// Entities per catalog query and per sub-batch of updates.
    pub batch_size: usize,
    /// Wall-clock budget for one synchronize call, checked between sub-batches.
    pub deadline: Option<Duration>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_PAGE_SIZE,
            deadline: None,
        }
    }
}

/// Outcome of a synchronize call. `modified` is set iff a catalog write happened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub modified: bool,
    pub files_updated: usize,
    pub samples_updated: usize,
    pub cohorts_updated: usize,
    pub missing_in_catalog: usize,
    pub tolerated_failures: usize,
}

impl SyncReport {
    pub fn merge(&mut self, other: SyncReport) {
        self.modified |= other.modified;
        self.files_updated += other.files_updated;
        self.samples_updated += other.samples_updated;
        self.cohorts_updated += other.cohorts_updated;
        self.missing_in_catalog += other.missing_in_catalog;
        self.tolerated_failures += other.tolerated_failures;
    }
}

struct Deadline(Option<Instant>);

impl Deadline {
    fn after(budget: Option<Duration>) -> Self {
        Self(budget.map(|budget| Instant::now() + budget))
    }

    fn check(&self, stage: &str) -> Result<(), SyncError> {
        match self.0 {
            Some(at) if Instant::now() >= at => Err(SyncError::DeadlineExceeded(stage.to_string())),
            _ => Ok(()),
        }
    }
}

/// One sub-batch of catalog updates.
///
/// A failing item is skipped with a warning when an earlier item of the same
/// sub-batch succeeded; a failure before any success aborts the pass.
struct SubBatch {
    succeeded: bool,
}

impl SubBatch {
    fn new() -> Self {
        Self { succeeded: false }
    }

    /// Runs one item and returns how many catalog writes it made.
    fn run(
        &mut self,
        report: &mut SyncReport,
        label: &str,
        item: impl FnOnce(&mut usize) -> Result<(), SyncError>,
    ) -> Result<usize, SyncError> {
        let mut writes = 0;
        let result = item(&mut writes);
        if writes > 0 {
            report.modified = true;
        }
        match result {
            Ok(()) => {
                self.succeeded = true;
                Ok(writes)
            }
            Err(err) if self.succeeded && is_transient(&err) => {
                warn!("skipping {label} after failure: {err}");
                report.tolerated_failures += 1;
                Ok(writes)
            }
            Err(err) => Err(err),
        }
    }
}

fn is_transient(err: &SyncError) -> bool {
    matches!(
        err,
        SyncError::CatalogHttp(_)
            | SyncError::CatalogStatus { .. }
            | SyncError::CatalogNotFound(_)
            | SyncError::Store(_)
    )
}

/// Storage-side view of a study read once per pass.
struct StudyView {
    study: StudyMetadata,
    sample_names: BTreeMap<SampleId, String>,
    files: Vec<FileMetadata>,
    by_name: BTreeMap<String, usize>,
    by_id: BTreeMap<FileId, usize>,
    /// Requested file names, whether or not storage knows them.
    scope: Option<BTreeSet<String>>,
}

impl StudyView {
    fn new(
        study: StudyMetadata,
        sample_names: BTreeMap<SampleId, String>,
        files: Vec<FileMetadata>,
        scope: Option<BTreeSet<String>>,
    ) -> Self {
        let by_name = files
            .iter()
            .enumerate()
            .map(|(index, file)| (file.name.clone(), index))
            .collect();
        let by_id = files
            .iter()
            .enumerate()
            .map(|(index, file)| (file.id, index))
            .collect();
        Self {
            study,
            sample_names,
            files,
            by_name,
            by_id,
            scope,
        }
    }

    fn is_scoped(&self) -> bool {
        self.scope.is_some()
    }

    fn in_scope(&self, name: &str) -> bool {
        self.scope.as_ref().is_none_or(|names| names.contains(name))
    }

    fn indexed_names(&self) -> BTreeSet<&str> {
        self.files
            .iter()
            .filter(|file| file.is_indexed())
            .map(|file| file.name.as_str())
            .collect()
    }

    fn file_by_name(&self, name: &str) -> Option<&FileMetadata> {
        self.by_name.get(name).map(|index| &self.files[*index])
    }

    fn file_by_id(&self, id: FileId) -> Option<&FileMetadata> {
        self.by_id.get(&id).map(|index| &self.files[*index])
    }
}

pub struct CatalogSynchronizer<C: CatalogClient> {
    store: Arc<MetadataStore>,
    catalog: C,
    options: SyncOptions,
}

impl<C: CatalogClient> CatalogSynchronizer<C> {
    pub fn new(store: Arc<MetadataStore>, catalog: C, options: SyncOptions) -> Self {
        Self {
            store,
            catalog,
            options: SyncOptions {
                batch_size: options.batch_size.max(1),
                ..options
            },
        }
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    /// Full pass over a study: files, their samples and cohorts. With a file
    /// scope only those files and their samples are visited.
    pub fn synchronize_study(
        &self,
        study: &StudyName,
        files: Option<&[String]>,
    ) -> Result<SyncReport, SyncError> {
        let study = self.store.study(study)?;
        let deadline = Deadline::after(self.options.deadline);
        self.synchronize_study_metadata(&study, scope(files), &deadline)
    }

    pub fn synchronize_files(
        &self,
        study: &StudyName,
        files: Option<&[String]>,
    ) -> Result<SyncReport, SyncError> {
        let study = self.store.study(study)?;
        let deadline = Deadline::after(self.options.deadline);
        let files = scope(files);
        let view = self.read_view(study, files.as_ref())?;
        self.sync_files(&view, &deadline)
    }

    pub fn synchronize_samples(
        &self,
        study: &StudyName,
        samples: Option<&[String]>,
    ) -> Result<SyncReport, SyncError> {
        let study = self.store.study(study)?;
        let deadline = Deadline::after(self.options.deadline);
        let samples = self.read_samples(&study, scope(samples).as_ref())?;
        self.sync_samples(&study, &samples, &deadline)
    }

    pub fn synchronize_cohorts(&self, study: &StudyName) -> Result<SyncReport, SyncError> {
        let study = self.store.study(study)?;
        let deadline = Deadline::after(self.options.deadline);
        self.sync_cohorts(&study, &deadline)
    }

    /// Synchronizes every study registered in storage, in name order.
    pub fn synchronize_all_studies(&self) -> Result<SyncReport, SyncError> {
        let deadline = Deadline::after(self.options.deadline);
        let mut report = SyncReport::default();
        for (name, id) in self.store.study_names()? {
            deadline.check("study loop")?;
            let study = self.store.study_by_id(id)?;
            info!("synchronizing study {name}");
            report.merge(self.synchronize_study_metadata(&study, None, &deadline)?);
        }
        Ok(report)
    }

    /// Resets the catalog side of a study that no longer exists in storage.
    pub fn synchronize_removed_study(&self, study: &str) -> Result<SyncReport, SyncError> {
        let deadline = Deadline::after(self.options.deadline);
        let mut report = SyncReport::default();

        match self.catalog.cohort(study, DEFAULT_COHORT)? {
            Some(cohort) => {
                let mut batch = SubBatch::new();
                let writes = batch.run(&mut report, "default cohort", |writes| {
                    if !cohort.samples.is_empty() {
                        self.catalog.set_cohort_samples(study, DEFAULT_COHORT, &[])?;
                        *writes += 1;
                    }
                    if cohort.status != CohortStatus::None {
                        self.catalog.set_cohort_status(
                            study,
                            DEFAULT_COHORT,
                            CohortStatus::None,
                            REMOVED_MESSAGE,
                        )?;
                        *writes += 1;
                    }
                    Ok(())
                })?;
                if writes > 0 {
                    report.cohorts_updated += 1;
                }
            }
            None => {
                warn!("default cohort not found in catalog study {study}");
                report.missing_in_catalog += 1;
            }
        }

        let ready = self.catalog_files_with_status(study, &[IndexStatus::Ready], &deadline)?;
        for chunk in ready.chunks(self.options.batch_size) {
            deadline.check("removed study files")?;
            let mut batch = SubBatch::new();
            for file in chunk {
                let writes = batch.run(&mut report, &file.name, |writes| {
                    self.catalog.update_file_index_status(
                        study,
                        &file.id,
                        IndexStatus::None,
                        REMOVED_MESSAGE,
                    )?;
                    *writes += 1;
                    log_file_change(file, IndexStatus::None);
                    Ok(())
                })?;
                if writes > 0 {
                    report.files_updated += 1;
                }
            }
        }
        Ok(report)
    }

    fn synchronize_study_metadata(
        &self,
        study: &StudyMetadata,
        files: Option<BTreeSet<String>>,
        deadline: &Deadline,
    ) -> Result<SyncReport, SyncError> {
        info!("synchronizing study {}", study.name);
        let view = self.read_view(study.clone(), files.as_ref())?;
        let mut report = SyncReport::default();
        if !view.is_scoped() {
            report.merge(self.sync_cohorts(study, deadline)?);
        }
        report.merge(self.sync_files(&view, deadline)?);

        let samples = if view.is_scoped() {
            let ids: BTreeSet<SampleId> = view
                .files
                .iter()
                .flat_map(|file| file.samples.iter().copied())
                .collect();
            let mut samples = Vec::with_capacity(ids.len());
            for id in ids {
                match self.store.samples().get(study.id, id.0)? {
                    Some(sample) => samples.push(sample),
                    None => warn!("sample id {id} is referenced by a file but missing in storage"),
                }
            }
            samples
        } else {
            self.read_samples(study, None)?
        };
        report.merge(self.sync_samples(study, &samples, deadline)?);
        Ok(report)
    }

    fn read_view(
        &self,
        study: StudyMetadata,
        names: Option<&BTreeSet<String>>,
    ) -> Result<StudyView, SyncError> {
        let mut sample_names = BTreeMap::new();
        for sample in self.store.samples().scan(study.id) {
            let sample = sample?;
            sample_names.insert(sample.id, sample.name);
        }

        let files = match names {
            None => self.store.files().list(study.id)?,
            Some(names) => {
                let mut selected = Vec::with_capacity(names.len());
                for name in names {
                    match self.store.files().get_by_name(study.id, name)? {
                        Some(file) => selected.push(file),
                        None => warn!("file {name:?} is not registered in storage study {}", study.name),
                    }
                }
                selected
            }
        };
        Ok(StudyView::new(study, sample_names, files, names.cloned()))
    }

    fn read_samples(
        &self,
        study: &StudyMetadata,
        names: Option<&BTreeSet<String>>,
    ) -> Result<Vec<SampleMetadata>, SyncError> {
        match names {
            None => self.store.samples().list(study.id),
            Some(names) => {
                let mut samples = Vec::with_capacity(names.len());
                for name in names {
                    match self.store.samples().get_by_name(study.id, name)? {
                        Some(sample) => samples.push(sample),
                        None => warn!("sample {name:?} is not registered in storage study {}", study.name),
                    }
                }
                Ok(samples)
            }
        }
    }

    /// Sample names of a file, or an empty set when they cannot be resolved.
    fn resolve_samples(
        &self,
        view: &StudyView,
        file: &FileMetadata,
    ) -> Result<BTreeSet<String>, SyncError> {
        if file.samples.is_empty() {
            return match self.store.variant_files().get(file.study_id, file.id.0)? {
                Some(variant_file) => Ok(variant_file.sample_ids.into_iter().collect()),
                None => {
                    warn!(
                        "file {:?} has no samples and no variant file metadata; leaving its samples empty",
                        file.name
                    );
                    Ok(BTreeSet::new())
                }
            };
        }
        let mut names = BTreeSet::new();
        for id in &file.samples {
            match view.sample_names.get(id) {
                Some(name) => {
                    names.insert(name.clone());
                }
                None => {
                    warn!("file {:?} references missing sample id {id}", file.name);
                    return Ok(BTreeSet::new());
                }
            }
        }
        Ok(names)
    }

    fn sync_files(
        &self,
        view: &StudyView,
        deadline: &Deadline,
    ) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::default();
        self.promote_indexed_files(view, deadline, &mut report)?;
        self.demote_unindexed_files(view, deadline, &mut report)?;
        self.reconcile_running_files(view, deadline, &mut report)?;
        Ok(report)
    }

    fn promote_indexed_files(
        &self,
        view: &StudyView,
        deadline: &Deadline,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let study = view.study.name.as_str();
        let indexed: Vec<&FileMetadata> = view.files.iter().filter(|file| file.is_indexed()).collect();

        for chunk in indexed.chunks(self.options.batch_size) {
            deadline.check("indexed files")?;
            let uris: Vec<String> = chunk.iter().map(|file| to_uri(&file.path)).collect();
            let found: BTreeMap<String, CatalogFile> = self
                .catalog
                .files_by_uri(study, &uris)?
                .into_iter()
                .map(|file| (file.uri.clone(), file))
                .collect();

            let mut batch = SubBatch::new();
            for (file, uri) in chunk.iter().zip(&uris) {
                let Some(catalog_file) = found.get(uri) else {
                    warn!("file {:?} not found in catalog by uri {uri}", file.name);
                    report.missing_in_catalog += 1;
                    continue;
                };
                let writes = batch.run(report, &file.name, |writes| {
                    let samples = self.resolve_samples(view, file)?;
                    self.reconcile_indexed_file(study, file, catalog_file, &samples, writes)
                })?;
                if writes > 0 {
                    report.files_updated += 1;
                }
            }
        }
        Ok(())
    }

    fn reconcile_indexed_file(
        &self,
        study: &str,
        file: &FileMetadata,
        catalog_file: &CatalogFile,
        samples: &BTreeSet<String>,
        writes: &mut usize,
    ) -> Result<(), SyncError> {
        if catalog_file.index.status != IndexStatus::Ready {
            self.catalog.update_file_index_status(
                study,
                &catalog_file.id,
                IndexStatus::Ready,
                INDEXED_MESSAGE,
            )?;
            *writes += 1;
            log_file_change(catalog_file, IndexStatus::Ready);
        }

        let annotation = IndexStatus::from_ready(file.is_annotated());
        if catalog_file.index.annotation_index_status != annotation {
            self.catalog
                .update_file_annotation_index(study, &catalog_file.id, annotation)?;
            *writes += 1;
        }

        let secondary = IndexStatus::from_ready(file.is_secondary_annotation_indexed());
        if catalog_file.index.secondary_annotation_index_status != secondary {
            self.catalog
                .update_file_secondary_annotation_index(study, &catalog_file.id, secondary)?;
            *writes += 1;
        }

        let linked: BTreeSet<&str> = catalog_file.sample_ids.iter().map(String::as_str).collect();
        let expected: BTreeSet<&str> = samples.iter().map(String::as_str).collect();
        if linked != expected {
            info!(
                "file {:?} sample linkage differs from storage; re-deriving its metadata",
                catalog_file.name
            );
            self.catalog.rederive_file_metadata(study, &catalog_file.id)?;
            *writes += 1;
        }
        Ok(())
    }

    fn demote_unindexed_files(
        &self,
        view: &StudyView,
        deadline: &Deadline,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let study = view.study.name.as_str();
        let indexed = view.indexed_names();
        let ready: Vec<CatalogFile> = self
            .catalog_files_with_status(study, &[IndexStatus::Ready], deadline)?
            .into_iter()
            .filter(|file| view.in_scope(&file.name))
            .filter(|file| !indexed.contains(file.name.as_str()))
            .collect();

        for chunk in ready.chunks(self.options.batch_size) {
            deadline.check("ready files")?;
            let mut batch = SubBatch::new();
            for file in chunk {
                let status = file.index.unindexed_status();
                let writes = batch.run(report, &file.name, |writes| {
                    self.catalog
                        .update_file_index_status(study, &file.id, status, NOT_INDEXED_MESSAGE)?;
                    *writes += 1;
                    log_file_change(file, status);
                    Ok(())
                })?;
                if writes > 0 {
                    report.files_updated += 1;
                }
            }
        }
        Ok(())
    }

    fn reconcile_running_files(
        &self,
        view: &StudyView,
        deadline: &Deadline,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let study = view.study.name.as_str();
        let running_loads = self.load_tasks(view, TaskStatus::Running)?;
        let failed_loads = self.load_tasks(view, TaskStatus::Error)?;

        let running: Vec<CatalogFile> = self
            .catalog_files_with_status(
                study,
                &[IndexStatus::Loading, IndexStatus::Indexing],
                deadline,
            )?
            .into_iter()
            .filter(|file| view.in_scope(&file.name))
            .collect();

        for chunk in running.chunks(self.options.batch_size) {
            deadline.check("running files")?;
            let mut batch = SubBatch::new();
            for catalog_file in chunk {
                let Some(file) = view.file_by_name(&catalog_file.name) else {
                    continue;
                };
                let failed = !running_loads.contains(&file.id)
                    && (file.index_status == TaskStatus::Error || failed_loads.contains(&file.id));
                if !failed {
                    continue;
                }
                let writes = batch.run(report, &catalog_file.name, |writes| {
                    let jobs = self.catalog.running_jobs(
                        study,
                        &catalog_file.id,
                        VARIANT_INDEX_TOOL,
                    )?;
                    if !jobs.is_empty() {
                        debug!(
                            "file {:?} failed in storage but job {} is still running",
                            catalog_file.name, jobs[0].id
                        );
                        return Ok(());
                    }
                    let status = catalog_file.index.unindexed_status();
                    self.catalog.update_file_index_status(
                        study,
                        &catalog_file.id,
                        status,
                        &format!("Error loading. Reset status to {status}"),
                    )?;
                    *writes += 1;
                    log_file_change(catalog_file, status);
                    Ok(())
                })?;
                if writes > 0 {
                    report.files_updated += 1;
                }
            }
        }

        // Files storage is loading right now, unless storage already holds them as indexed.
        let loading: Vec<&FileMetadata> = running_loads
            .iter()
            .filter_map(|id| view.file_by_id(*id))
            .filter(|file| !file.is_indexed())
            .collect();
        for chunk in loading.chunks(self.options.batch_size) {
            deadline.check("loading files")?;
            let uris: Vec<String> = chunk.iter().map(|file| to_uri(&file.path)).collect();
            let found = self.catalog.files_by_uri(study, &uris)?;
            let mut batch = SubBatch::new();
            for catalog_file in &found {
                let status = if catalog_file.index.has_transformed_file() {
                    IndexStatus::Loading
                } else {
                    IndexStatus::Indexing
                };
                if catalog_file.index.status == status {
                    continue;
                }
                let writes = batch.run(report, &catalog_file.name, |writes| {
                    self.catalog.update_file_index_status(
                        study,
                        &catalog_file.id,
                        status,
                        LOADING_MESSAGE,
                    )?;
                    *writes += 1;
                    log_file_change(catalog_file, status);
                    Ok(())
                })?;
                if writes > 0 {
                    report.files_updated += 1;
                }
            }
        }
        Ok(())
    }

    /// Files referenced by LOAD tasks whose current status is `status`.
    fn load_tasks(&self, view: &StudyView, status: TaskStatus) -> Result<BTreeSet<FileId>, SyncError> {
        Ok(self
            .store
            .tasks()
            .with_status(view.study.id, status)?
            .into_iter()
            .filter(|task| task.task_type == TaskType::Load)
            .flat_map(|task| task.file_ids)
            .collect())
    }

    fn sync_samples(
        &self,
        study: &StudyMetadata,
        samples: &[SampleMetadata],
        deadline: &Deadline,
    ) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::default();
        for chunk in samples.chunks(self.options.batch_size) {
            deadline.check("samples")?;
            let names: Vec<String> = chunk.iter().map(|sample| sample.name.clone()).collect();
            let found: BTreeMap<String, CatalogSample> = self
                .catalog
                .samples(&study.name, &names)?
                .into_iter()
                .map(|sample| (sample.id.clone(), sample))
                .collect();

            let mut batch = SubBatch::new();
            for sample in chunk {
                let Some(catalog_sample) = found.get(&sample.name) else {
                    warn!("sample {:?} not found in catalog study {}", sample.name, study.name);
                    report.missing_in_catalog += 1;
                    continue;
                };
                let writes = batch.run(&mut report, &sample.name, |writes| {
                    self.reconcile_sample(study, sample, catalog_sample, writes)
                })?;
                if writes > 0 {
                    report.samples_updated += 1;
                }
            }
        }
        Ok(report)
    }

    fn reconcile_sample(
        &self,
        study: &StudyMetadata,
        sample: &SampleMetadata,
        catalog_sample: &CatalogSample,
        writes: &mut usize,
    ) -> Result<(), SyncError> {
        let study_name = study.name.as_str();
        let id = catalog_sample.id.as_str();

        let index = IndexStatus::from_ready(sample.is_indexed());
        if catalog_sample.index_status != index {
            self.catalog.update_sample_index(study_name, id, index)?;
            *writes += 1;
        }
        let annotation = IndexStatus::from_ready(sample.is_annotated());
        if catalog_sample.annotation_index_status != annotation {
            self.catalog
                .update_sample_annotation_index(study_name, id, annotation)?;
            *writes += 1;
        }
        let secondary =
            IndexStatus::from_ready(sample.secondary_annotation_index_status == TaskStatus::Ready);
        if catalog_sample.secondary_annotation_index_status != secondary {
            self.catalog
                .update_sample_secondary_annotation_index(study_name, id, secondary)?;
            *writes += 1;
        }
        let doc = expected_sample_index(sample, study);
        if catalog_sample.sample_index != doc {
            debug!(
                "sample {id:?} sample index {:?} -> {:?}",
                catalog_sample.sample_index, doc
            );
            self.catalog
                .update_sample_secondary_sample_index(study_name, id, &doc)?;
            *writes += 1;
        }
        Ok(())
    }

    fn sync_cohorts(
        &self,
        study: &StudyMetadata,
        deadline: &Deadline,
    ) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::default();
        let mut sample_names = BTreeMap::new();
        for sample in self.store.samples().scan(study.id) {
            let sample = sample?;
            sample_names.insert(sample.id, sample.name);
        }
        let names_of = |cohort: &CohortMetadata| -> BTreeSet<String> {
            cohort
                .samples
                .iter()
                .filter_map(|id| {
                    let name = sample_names.get(id).cloned();
                    if name.is_none() {
                        warn!("cohort {:?} references missing sample id {id}", cohort.name);
                    }
                    name
                })
                .collect()
        };

        deadline.check("default cohort")?;
        if let Some(default_cohort) = self.store.cohorts().get_by_name(study.id, DEFAULT_COHORT)? {
            self.sync_default_cohort(study, &default_cohort, &names_of(&default_cohort), &mut report)?;
        }

        let calculated: BTreeMap<String, CohortMetadata> = self
            .cohorts_where(study, CohortMetadata::is_stats_ready)?
            .into_iter()
            .map(|cohort| (cohort.name.clone(), cohort))
            .collect();
        let names: Vec<String> = calculated.keys().cloned().collect();
        for chunk in names.chunks(self.options.batch_size) {
            deadline.check("calculated cohorts")?;
            let mut batch = SubBatch::new();
            for cohort in self.catalog.cohorts(&study.name, chunk)? {
                let Some(storage_cohort) = calculated.get(&cohort.id) else {
                    continue;
                };
                if cohort.status == CohortStatus::Invalid {
                    if cohort.samples.len() != storage_cohort.samples.len() {
                        debug!("skip cohort {:?}: stays INVALID, sizes differ", cohort.id);
                        continue;
                    }
                    let from_catalog: BTreeSet<String> = cohort.samples.iter().cloned().collect();
                    if from_catalog != names_of(storage_cohort) {
                        debug!("skip cohort {:?}: stays INVALID, members differ", cohort.id);
                        continue;
                    }
                }
                if cohort.status == CohortStatus::Ready {
                    continue;
                }
                let writes = batch.run(&mut report, &cohort.id, |writes| {
                    self.set_cohort_status(study, &cohort.id, cohort.status, CohortStatus::Ready)?;
                    *writes += 1;
                    Ok(())
                })?;
                if writes > 0 {
                    report.cohorts_updated += 1;
                }
            }
        }

        let invalid: Vec<String> = self
            .cohorts_where(study, CohortMetadata::is_invalid)?
            .into_iter()
            .map(|cohort| cohort.name)
            .collect();
        for chunk in invalid.chunks(self.options.batch_size) {
            deadline.check("invalid cohorts")?;
            let mut batch = SubBatch::new();
            for cohort in self.catalog.cohorts(&study.name, chunk)? {
                if cohort.status == CohortStatus::Invalid {
                    continue;
                }
                let writes = batch.run(&mut report, &cohort.id, |writes| {
                    self.set_cohort_status(study, &cohort.id, cohort.status, CohortStatus::Invalid)?;
                    *writes += 1;
                    Ok(())
                })?;
                if writes > 0 {
                    report.cohorts_updated += 1;
                }
            }
        }
        Ok(report)
    }

    fn sync_default_cohort(
        &self,
        study: &StudyMetadata,
        storage_cohort: &CohortMetadata,
        from_storage: &BTreeSet<String>,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let Some(catalog_cohort) = self.catalog.cohort(&study.name, DEFAULT_COHORT)? else {
            warn!("default cohort not found in catalog study {}", study.name);
            report.missing_in_catalog += 1;
            return Ok(());
        };
        let from_catalog: BTreeSet<String> = catalog_cohort.samples.iter().cloned().collect();
        if catalog_cohort.samples.len() == from_storage.len() && from_catalog == *from_storage {
            return Ok(());
        }

        let mut batch = SubBatch::new();
        let writes = batch.run(report, DEFAULT_COHORT, |writes| {
            if catalog_cohort.status == CohortStatus::Calculating {
                let status = if storage_cohort.is_invalid() {
                    CohortStatus::Invalid
                } else if storage_cohort.is_stats_ready() {
                    CohortStatus::Ready
                } else {
                    CohortStatus::None
                };
                self.set_cohort_status(study, DEFAULT_COHORT, catalog_cohort.status, status)?;
                *writes += 1;
            }
            let members: Vec<String> = from_storage.iter().cloned().collect();
            self.catalog
                .set_cohort_samples(&study.name, DEFAULT_COHORT, &members)?;
            *writes += 1;
            info!(
                "default cohort of {} set to {} samples from storage",
                study.name,
                members.len()
            );
            Ok(())
        })?;
        if writes > 0 {
            report.cohorts_updated += 1;
        }
        Ok(())
    }

    fn set_cohort_status(
        &self,
        study: &StudyMetadata,
        cohort: &str,
        from: CohortStatus,
        to: CohortStatus,
    ) -> Result<(), SyncError> {
        info!("cohort {cohort:?} change status from {from} to {to}");
        self.catalog
            .set_cohort_status(&study.name, cohort, to, COHORT_MESSAGE)
    }

    fn cohorts_where(
        &self,
        study: &StudyMetadata,
        keep: fn(&CohortMetadata) -> bool,
    ) -> Result<Vec<CohortMetadata>, SyncError> {
        let mut cohorts = Vec::new();
        for cohort in self.store.cohorts().scan(study.id) {
            let cohort = cohort?;
            if keep(&cohort) {
                cohorts.push(cohort);
            }
        }
        Ok(cohorts)
    }

    /// Every catalog file in one of `statuses`, read page by page before any update.
    fn catalog_files_with_status(
        &self,
        study: &str,
        statuses: &[IndexStatus],
        deadline: &Deadline,
    ) -> Result<Vec<CatalogFile>, SyncError> {
        let limit = self.options.batch_size;
        let mut files = Vec::new();
        loop {
            deadline.check("catalog file query")?;
            let page = self.catalog.files_by_index_status(
                study,
                statuses,
                PageRequest {
                    skip: files.len(),
                    limit,
                },
            )?;
            let last = page.len() < limit;
            files.extend(page);
            if last {
                return Ok(files);
            }
        }
    }
}

fn scope(names: Option<&[String]>) -> Option<BTreeSet<String>> {
    names
        .filter(|names| !names.is_empty())
        .map(|names| names.iter().map(|name| file_name(name).to_string()).collect())
}

fn log_file_change(file: &CatalogFile, to: IndexStatus) {
    info!(
        "file {:?} change status from {} to {}",
        file.name, file.index.status, to
    );
}

/// Highest version READY in both the genotype and the annotation sample index,
/// or the study's latest configured version when there is none.
pub fn expected_sample_index_version(sample: &SampleMetadata, study: &StudyMetadata) -> i32 {
    let genotype: BTreeSet<i32> = sample.sample_index_versions().into_iter().collect();
    sample
        .sample_index_annotation_versions()
        .into_iter()
        .filter(|version| genotype.contains(version))
        .max()
        .unwrap_or_else(|| study.latest_sample_index_version())
}

/// The secondary sample index document storage implies for `sample`.
pub fn expected_sample_index(sample: &SampleMetadata, study: &StudyMetadata) -> SampleIndexDoc {
    let version = expected_sample_index_version(sample, study);
    let genotype = sample.sample_index_status_at(version);
    let annotation = sample.sample_index_annotation_status_at(version);
    let (status, message) = match (genotype, annotation) {
        (TaskStatus::Ready, TaskStatus::Ready) => (IndexStatus::Ready, String::new()),
        (TaskStatus::Ready, other) => (
            IndexStatus::None,
            format!("Sample index annotation is {other} at version {version}"),
        ),
        (TaskStatus::None, _) => (IndexStatus::None, String::new()),
        (other, _) => (
            IndexStatus::None,
            format!("Sample index is {other} at version {version}"),
        ),
    };
    SampleIndexDoc {
        status,
        message,
        version,
        family_status: IndexStatus::from_ready(
            sample.family_index_status_at(version) == TaskStatus::Ready,
        ),
    }
}

/// `Homo sapiens` → `hsapiens`.
pub fn normalize_species(scientific_name: &str) -> String {
    let trimmed = scientific_name.trim();
    let normalized = match trimmed.split_once(char::is_whitespace) {
        Some((genus, rest)) => {
            let initial: String = genus.chars().take(1).collect();
            format!("{initial}{rest}")
        }
        None => trimmed.to_string(),
    };
    normalized
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Copies the catalog project's organism and release into the project metadata.
pub fn update_project_metadata_from_catalog<C: CatalogClient>(
    manager: &MetadataManager,
    catalog: &C,
    project: &str,
) -> Result<ProjectMetadata, SyncError> {
    let catalog_project = catalog.project(project)?;
    let organism = catalog_project
        .organism
        .filter(|organism| {
            !organism.scientific_name.trim().is_empty() && !organism.assembly.trim().is_empty()
        })
        .ok_or(SyncError::MissingOrganism)?;
    let species = normalize_species(&organism.scientific_name);
    manager.update_project_metadata(|metadata| {
        metadata.species = species;
        metadata.assembly = organism.assembly.trim().to_string();
        metadata.release = catalog_project.current_release;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StudyId;

    fn sample() -> SampleMetadata {
        SampleMetadata::new(StudyId(1), SampleId(1), "S1")
    }

    #[test]
    fn version_is_max_of_intersection() {
        let study = StudyMetadata::new(StudyId(1), "s1");
        let mut sample = sample();
        for version in [1, 2, 3] {
            sample.set_sample_index_status(TaskStatus::Ready, version);
        }
        for version in [2, 3] {
            sample.set_sample_index_annotation_status(TaskStatus::Ready, version);
        }
        assert_eq!(expected_sample_index_version(&sample, &study), 3);
        let doc = expected_sample_index(&sample, &study);
        assert_eq!(doc.status, IndexStatus::Ready);
        assert_eq!(doc.version, 3);
        assert_eq!(doc.family_status, IndexStatus::None);
    }

    #[test]
    fn disjoint_versions_fall_back_to_study_latest() {
        let mut study = StudyMetadata::new(StudyId(1), "s1");
        study
            .sample_index_configurations
            .push(crate::models::SampleIndexConfiguration {
                version: 4,
                status: TaskStatus::Ready,
            });
        let mut sample = sample();
        sample.set_sample_index_status(TaskStatus::Ready, 1);
        sample.set_sample_index_annotation_status(TaskStatus::Ready, 2);
        assert_eq!(expected_sample_index_version(&sample, &study), 4);
        let doc = expected_sample_index(&sample, &study);
        assert_eq!(doc.status, IndexStatus::None);
        assert!(doc.message.is_empty());
    }

    #[test]
    fn annotation_pending_is_reported() {
        let study = StudyMetadata::new(StudyId(1), "s1");
        let mut sample = sample();
        sample
            .set_sample_index_status(TaskStatus::Ready, 1)
            .set_sample_index_annotation_status(TaskStatus::Running, 1)
            .set_family_index_status(TaskStatus::Ready, 1);
        let doc = expected_sample_index(&sample, &study);
        assert_eq!(doc.version, 1);
        assert_eq!(doc.status, IndexStatus::None);
        assert_eq!(doc.message, "Sample index annotation is RUNNING at version 1");
        assert_eq!(doc.family_status, IndexStatus::Ready);
    }

    #[test]
    fn species_names_are_normalized() {
        assert_eq!(normalize_species("Homo sapiens"), "hsapiens");
        assert_eq!(normalize_species(" Mus musculus "), "mmusculus");
        assert_eq!(normalize_species("Canis lupus familiaris"), "clupusfamiliaris");
        assert_eq!(normalize_species("hsapiens"), "hsapiens");
    }

    #[test]
    fn sub_batch_tolerates_failures_after_a_success() {
        let mut report = SyncReport::default();
        let mut batch = SubBatch::new();
        let fail = |_: &mut usize| Err(SyncError::CatalogHttp("boom".to_string()));
        assert!(batch.run(&mut report, "first", fail).is_err());

        let mut batch = SubBatch::new();
        batch
            .run(&mut report, "first", |writes| {
                *writes += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(batch.run(&mut report, "second", fail).unwrap(), 0);
        assert_eq!(report.tolerated_failures, 1);
        assert!(report.modified);
    }

    #[test]
    fn serialization_errors_are_never_tolerated() {
        let mut report = SyncReport::default();
        let mut batch = SubBatch::new();
        batch.run(&mut report, "first", |_| Ok(())).unwrap();
        let result = batch.run(&mut report, "second", |_| {
            Err(SyncError::serialization("sample", "bad"))
        });
        assert!(result.is_err());
    }

    #[test]
    fn expired_deadline_fails_checks() {
        let deadline = Deadline::after(Some(Duration::ZERO));
        assert!(matches!(
            deadline.check("files"),
            Err(SyncError::DeadlineExceeded(stage)) if stage == "files"
        ));
        assert!(Deadline::after(None).check("files").is_ok());
    }
}
