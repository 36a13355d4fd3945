//! Writer-side API used by indexing jobs to populate the metadata store.
//!
//! Every update locks the record's row, re-reads the record, applies the
//! change and writes the whole record back while the lease is still held.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{info, warn};

use crate::adaptor::{MetadataAdaptor, Record};
use crate::codec::{PROJECT_ROW, PROJECT_SCOPE_ID, entity_row, study_row};
use crate::counter::IdGenerator;
use crate::domain::{
    CohortId, DEFAULT_COHORT, EntityKind, FileId, SampleId, StudyId, StudyName, TaskId, TaskStatus,
    TaskType, file_name,
};
use crate::error::SyncError;
use crate::lock::{LockManager, LockSettings};
use crate::models::{
    CohortMetadata, FileMetadata, ProjectMetadata, SampleMetadata, StudyMetadata, TaskMetadata,
    VariantFileMetadata,
};
use crate::store::MetadataStore;

const RECORD_LOCK: &str = "lock";

pub struct MetadataManager {
    store: Arc<MetadataStore>,
    locks: Arc<LockManager>,
    ids: IdGenerator,
}

impl MetadataManager {
    pub fn new(store: Arc<MetadataStore>, settings: LockSettings) -> Self {
        let locks = Arc::new(LockManager::new(store.kv(), settings));
        let ids = IdGenerator::new(store.kv(), locks.clone());
        Self { store, locks, ids }
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    pub fn store_handle(&self) -> Arc<MetadataStore> {
        self.store.clone()
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn ids(&self) -> &IdGenerator {
        &self.ids
    }

    /// Project metadata with its counter snapshot filled from the live counters.
    pub fn project_metadata(&self) -> Result<ProjectMetadata, SyncError> {
        let mut project = self.store.project()?;
        project.counters = self.ids.snapshot(None)?;
        Ok(project)
    }

    pub fn update_project_metadata(
        &self,
        update: impl FnOnce(&mut ProjectMetadata) -> Result<(), SyncError>,
    ) -> Result<ProjectMetadata, SyncError> {
        let lock = self.locks.acquire(PROJECT_ROW, RECORD_LOCK)?;
        let mut project = self.store.project()?;
        update(&mut project)?;
        lock.check_locked()?;
        self.store.put_project(&project)?;
        lock.release()?;
        Ok(project)
    }

    /// Returns the existing study of that name, or registers a new one.
    pub fn create_study(&self, name: &StudyName) -> Result<StudyMetadata, SyncError> {
        let lock = self.locks.acquire(PROJECT_ROW, RECORD_LOCK)?;
        if let Some(id) = self
            .store
            .studies()
            .id_by_name(PROJECT_SCOPE_ID, name.as_str())?
        {
            lock.release()?;
            return self.store.study_by_id(StudyId(id));
        }
        let id = StudyId(self.ids.next_id(None, EntityKind::Study.as_str())?);
        let study = StudyMetadata::new(id, name.as_str());
        lock.check_locked()?;
        self.store.studies().put(&study)?;
        lock.release()?;
        info!("registered study {name} with id {id}");
        Ok(study)
    }

    pub fn update_study_metadata(
        &self,
        study: StudyId,
        update: impl FnOnce(&mut StudyMetadata) -> Result<(), SyncError>,
    ) -> Result<StudyMetadata, SyncError> {
        self.update_record(self.store.studies(), PROJECT_SCOPE_ID, study.0, update, || {
            SyncError::StudyNotFound(study.to_string())
        })
    }

    pub fn file_id(&self, study: StudyId, name: &str) -> Result<Option<FileId>, SyncError> {
        Ok(self.store.files().id_by_name(study, name)?.map(FileId))
    }

    pub fn sample_id(&self, study: StudyId, name: &str) -> Result<Option<SampleId>, SyncError> {
        Ok(self.store.samples().id_by_name(study, name)?.map(SampleId))
    }

    pub fn file(&self, study: StudyId, file: FileId) -> Result<FileMetadata, SyncError> {
        self.store
            .files()
            .get(study, file.0)?
            .ok_or_else(|| file_not_found(study, file))
    }

    /// Registers the file named after the last component of `path`.
    ///
    /// Fails if a file of that name is already indexed, or is registered with a
    /// different path and has left the NONE state.
    pub fn register_file(&self, study: StudyId, path: &str) -> Result<FileId, SyncError> {
        let name = file_name(path);
        if name.is_empty() {
            return Err(SyncError::InvalidName {
                kind: "file",
                name: path.to_string(),
            });
        }
        if let Some(id) = self.file_id(study, name)? {
            self.update_file_metadata(study, id, |file| {
                if file.is_indexed() {
                    return Err(SyncError::AlreadyIndexed {
                        id: file.id.0,
                        name: file.name.clone(),
                    });
                }
                if file.path != path {
                    if file.index_status != TaskStatus::None {
                        return Err(SyncError::PathConflict {
                            id: file.id.0,
                            name: file.name.clone(),
                        });
                    }
                    file.path = path.to_string();
                }
                Ok(())
            })?;
            return Ok(id);
        }

        let id = FileId(self.ids.next_id(Some(study), EntityKind::File.as_str())?);
        let lock = self.locks.acquire(&study_row(study), RECORD_LOCK)?;
        self.store
            .files()
            .put(&FileMetadata::new(study, id, name, path))?;
        lock.release()?;
        Ok(id)
    }

    /// Registers the samples of a file and links both sides.
    pub fn register_file_samples(
        &self,
        study: StudyId,
        file: FileId,
        sample_names: &[String],
    ) -> Result<Vec<SampleId>, SyncError> {
        let sample_ids = self.register_samples(study, sample_names)?;
        self.update_file_metadata(study, file, |metadata| {
            metadata.samples = sample_ids.clone();
            Ok(())
        })?;
        for sample in &sample_ids {
            self.update_sample_metadata(study, *sample, |metadata| {
                if !metadata.files.contains(&file) {
                    metadata.files.push(file);
                    metadata.files.sort();
                }
                metadata.multi_file_sample = metadata.files.len() > 1;
                Ok(())
            })?;
        }
        Ok(sample_ids)
    }

    /// Ids for the given sample names, registering the missing ones.
    pub fn register_samples(
        &self,
        study: StudyId,
        names: &[String],
    ) -> Result<Vec<SampleId>, SyncError> {
        let lock = self.locks.acquire(&study_row(study), RECORD_LOCK)?;
        let mut ids = Vec::with_capacity(names.len());
        for name in names {
            if name.trim().is_empty() {
                return Err(SyncError::InvalidName {
                    kind: "sample",
                    name: name.clone(),
                });
            }
            if let Some(id) = self.sample_id(study, name)? {
                ids.push(id);
                continue;
            }
            let id = SampleId(self.ids.next_id(Some(study), EntityKind::Sample.as_str())?);
            lock.check_locked()?;
            self.store
                .samples()
                .put(&SampleMetadata::new(study, id, name.as_str()))?;
            ids.push(id);
        }
        lock.release()?;
        Ok(ids)
    }

    /// Marks files and their samples as indexed and grows the default cohort.
    pub fn add_indexed_files(&self, study: StudyId, files: &[FileId]) -> Result<(), SyncError> {
        let mut samples = BTreeSet::new();
        for file in files {
            samples.extend(self.file(study, *file)?.samples);
        }
        for sample in &samples {
            self.update_sample_metadata(study, *sample, |metadata| {
                metadata.index_status = TaskStatus::Ready;
                Ok(())
            })?;
        }
        for file in files {
            let updated = self.update_file_metadata(study, *file, |metadata| {
                metadata.index_status = TaskStatus::Ready;
                Ok(())
            })?;
            info!("register file {} as indexed", updated.name);
        }

        let mut members: BTreeSet<SampleId> = self
            .store
            .cohorts()
            .get_by_name(study, DEFAULT_COHORT)?
            .map(|cohort| cohort.samples.into_iter().collect())
            .unwrap_or_default();
        if samples.iter().any(|sample| !members.contains(sample)) {
            members.extend(samples);
            let members: Vec<SampleId> = members.into_iter().collect();
            self.set_samples_to_cohort(study, DEFAULT_COHORT, &members)?;
        }
        Ok(())
    }

    /// Reverts files to NONE; samples left without any indexed file follow,
    /// and leave the default cohort.
    pub fn remove_indexed_files(&self, study: StudyId, files: &[FileId]) -> Result<(), SyncError> {
        let mut samples = BTreeSet::new();
        for file in files {
            let updated = self.update_file_metadata(study, *file, |metadata| {
                metadata.index_status = TaskStatus::None;
                Ok(())
            })?;
            samples.extend(updated.samples);
        }

        let mut unindexed = BTreeSet::new();
        for sample in &samples {
            let metadata = match self.store.samples().get(study, sample.0)? {
                Some(metadata) => metadata,
                None => {
                    warn!("sample {sample} of a removed file is missing in study {study}");
                    continue;
                }
            };
            let mut still_indexed = false;
            for file in metadata.files.iter().filter(|file| !files.contains(file)) {
                if let Some(other) = self.store.files().get(study, file.0)? {
                    still_indexed |= other.is_indexed();
                }
            }
            if !still_indexed {
                self.update_sample_metadata(study, *sample, |metadata| {
                    metadata.index_status = TaskStatus::None;
                    Ok(())
                })?;
                unindexed.insert(*sample);
            }
        }

        if let Some(cohort) = self.store.cohorts().get_by_name(study, DEFAULT_COHORT)? {
            if cohort.samples.iter().any(|sample| unindexed.contains(sample)) {
                let members: Vec<SampleId> = cohort
                    .samples
                    .into_iter()
                    .filter(|sample| !unindexed.contains(sample))
                    .collect();
                self.set_samples_to_cohort(study, DEFAULT_COHORT, &members)?;
            }
        }
        Ok(())
    }

    pub fn update_file_metadata(
        &self,
        study: StudyId,
        file: FileId,
        update: impl FnOnce(&mut FileMetadata) -> Result<(), SyncError>,
    ) -> Result<FileMetadata, SyncError> {
        self.update_record(self.store.files(), study, file.0, update, || {
            file_not_found(study, file)
        })
    }

    pub fn update_sample_metadata(
        &self,
        study: StudyId,
        sample: SampleId,
        update: impl FnOnce(&mut SampleMetadata) -> Result<(), SyncError>,
    ) -> Result<SampleMetadata, SyncError> {
        self.update_record(self.store.samples(), study, sample.0, update, || {
            SyncError::SampleNotFound {
                study: study.to_string(),
                sample: sample.to_string(),
            }
        })
    }

    pub fn update_cohort_metadata(
        &self,
        study: StudyId,
        cohort: CohortId,
        update: impl FnOnce(&mut CohortMetadata) -> Result<(), SyncError>,
    ) -> Result<CohortMetadata, SyncError> {
        self.update_record(self.store.cohorts(), study, cohort.0, update, || {
            SyncError::CohortNotFound {
                study: study.to_string(),
                cohort: cohort.to_string(),
            }
        })
    }

    pub fn update_task_metadata(
        &self,
        study: StudyId,
        task: TaskId,
        update: impl FnOnce(&mut TaskMetadata) -> Result<(), SyncError>,
    ) -> Result<TaskMetadata, SyncError> {
        self.update_record(self.store.tasks(), study, task.0, update, || {
            SyncError::TaskNotFound {
                study: study.to_string(),
                task: task.to_string(),
            }
        })
    }

    /// Ids for the given cohort names, registering empty cohorts for the missing ones.
    pub fn register_cohorts(
        &self,
        study: StudyId,
        names: &[String],
    ) -> Result<Vec<CohortId>, SyncError> {
        names
            .iter()
            .map(|name| self.cohort_id_or_register(study, name))
            .collect()
    }

    fn cohort_id_or_register(&self, study: StudyId, name: &str) -> Result<CohortId, SyncError> {
        if name.trim().is_empty() {
            return Err(SyncError::InvalidName {
                kind: "cohort",
                name: name.to_string(),
            });
        }
        let lock = self.locks.acquire(&study_row(study), RECORD_LOCK)?;
        if let Some(id) = self.store.cohorts().id_by_name(study, name)? {
            lock.release()?;
            return Ok(CohortId(id));
        }
        let id = CohortId(self.ids.next_id(Some(study), EntityKind::Cohort.as_str())?);
        lock.check_locked()?;
        self.store
            .cohorts()
            .put(&CohortMetadata::new(study, id, name))?;
        lock.release()?;
        Ok(id)
    }

    /// Replaces the cohort's members. Stats computed for the old membership
    /// become INVALID when the members or their files change.
    pub fn set_samples_to_cohort(
        &self,
        study: StudyId,
        cohort_name: &str,
        samples: &[SampleId],
    ) -> Result<CohortMetadata, SyncError> {
        let cohort_id = self.cohort_id_or_register(study, cohort_name)?;
        let mut members: Vec<SampleId> = samples.to_vec();
        members.sort();
        members.dedup();

        let mut files = BTreeSet::new();
        for sample in &members {
            let metadata = self.update_sample_metadata(study, *sample, |metadata| {
                if !metadata.cohorts.contains(&cohort_id) {
                    metadata.cohorts.push(cohort_id);
                    metadata.cohorts.sort();
                }
                Ok(())
            })?;
            files.extend(metadata.files);
        }
        let files: Vec<FileId> = files.into_iter().collect();

        let previous = self
            .store
            .cohorts()
            .get(study, cohort_id.0)?
            .map(|cohort| cohort.samples)
            .unwrap_or_default();
        for sample in previous.iter().filter(|sample| !members.contains(sample)) {
            self.update_sample_metadata(study, *sample, |metadata| {
                metadata.cohorts.retain(|cohort| *cohort != cohort_id);
                Ok(())
            })?;
        }

        self.update_cohort_metadata(study, cohort_id, |cohort| {
            let mut old_samples = cohort.samples.clone();
            old_samples.sort();
            let changed = old_samples != members || cohort.files != files;
            cohort.samples = members.clone();
            cohort.files = files.clone();
            if changed && cohort.is_stats_ready() {
                info!("cohort {} changed membership; invalidating stats", cohort.name);
                cohort.stats_status = TaskStatus::Invalid;
            }
            Ok(())
        })
    }

    /// Starts, or resumes, a task over `files`.
    ///
    /// An unfinished task for the same operation fails with
    /// `OperationInProgress` unless `resume` is set; one that ended in ERROR is
    /// always resumed. Unfinished tasks of other operations also block unless
    /// `allow_concurrent` is set.
    pub fn add_running_task(
        &self,
        study: StudyId,
        name: &str,
        files: &[FileId],
        resume: bool,
        task_type: TaskType,
        allow_concurrent: bool,
    ) -> Result<TaskMetadata, SyncError> {
        let mut resumable = None;
        for status in [TaskStatus::Done, TaskStatus::Running, TaskStatus::Error] {
            for task in self.store.tasks().with_status(study, status)? {
                if !task.same_operation(files, task_type, name) {
                    if !allow_concurrent {
                        return Err(in_progress(&task));
                    }
                    continue;
                }
                if status != TaskStatus::Error && !resume {
                    return Err(in_progress(&task));
                }
                info!("resuming operation {:?} ({})", task.name, task.id);
                resumable = Some(task);
            }
        }

        match resumable {
            Some(task) if task.current_status() == Some(TaskStatus::Done) => Ok(task),
            Some(task) => {
                let history = task.status_history.clone();
                self.update_task_metadata(study, task.id, |current| {
                    if current.status_history != history {
                        return Err(SyncError::OperationInProgress {
                            id: current.id.0,
                            task: current.name.clone(),
                            files: current.file_ids.iter().map(|file| file.0).collect(),
                        });
                    }
                    current.push_status(TaskStatus::Running);
                    Ok(())
                })
            }
            None => {
                let id = TaskId(self.ids.next_id(Some(study), EntityKind::Task.as_str())?);
                let mut task = TaskMetadata::new(study, id, name, task_type, files.to_vec());
                task.push_status(TaskStatus::Running);
                self.store.tasks().put(&task)?;
                Ok(task)
            }
        }
    }

    /// Appends `status` to the task's history.
    pub fn set_task_status(
        &self,
        study: StudyId,
        task: TaskId,
        status: TaskStatus,
    ) -> Result<TaskMetadata, SyncError> {
        self.update_task_metadata(study, task, |metadata| {
            metadata.push_status(status);
            Ok(())
        })
    }

    pub fn running_tasks(&self, study: StudyId) -> Result<Vec<TaskMetadata>, SyncError> {
        self.store.tasks().with_status(study, TaskStatus::Running)
    }

    pub fn calculated_cohorts(&self, study: StudyId) -> Result<Vec<CohortMetadata>, SyncError> {
        self.cohorts_matching(study, CohortMetadata::is_stats_ready)
    }

    pub fn invalid_cohorts(&self, study: StudyId) -> Result<Vec<CohortMetadata>, SyncError> {
        self.cohorts_matching(study, CohortMetadata::is_invalid)
    }

    fn cohorts_matching(
        &self,
        study: StudyId,
        keep: fn(&CohortMetadata) -> bool,
    ) -> Result<Vec<CohortMetadata>, SyncError> {
        let mut cohorts = Vec::new();
        for cohort in self.store.cohorts().scan(study) {
            let cohort = cohort?;
            if keep(&cohort) {
                cohorts.push(cohort);
            }
        }
        Ok(cohorts)
    }

    pub fn put_variant_file_metadata(&self, metadata: &VariantFileMetadata) -> Result<(), SyncError> {
        self.store.variant_files().put(metadata)
    }

    fn update_record<R: Record>(
        &self,
        adaptor: &MetadataAdaptor<R>,
        scope: StudyId,
        id: i32,
        update: impl FnOnce(&mut R) -> Result<(), SyncError>,
        not_found: impl FnOnce() -> SyncError,
    ) -> Result<R, SyncError> {
        let lock = self
            .locks
            .acquire(&entity_row(R::KIND, scope, id), RECORD_LOCK)?;
        let mut record = adaptor.get(scope, id)?.ok_or_else(not_found)?;
        update(&mut record)?;
        lock.check_locked()?;
        adaptor.put(&record)?;
        lock.release()?;
        Ok(record)
    }
}

fn file_not_found(study: StudyId, file: FileId) -> SyncError {
    SyncError::FileNotFound {
        study: study.to_string(),
        file: file.to_string(),
    }
}

fn in_progress(task: &TaskMetadata) -> SyncError {
    SyncError::OperationInProgress {
        id: task.id.0,
        task: task.name.clone(),
        files: task.file_ids.iter().map(|file| file.0).collect(),
    }
}
