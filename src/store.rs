use std::collections::BTreeMap;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;

use crate::adaptor::MetadataAdaptor;
use crate::codec::{PROJECT_ROW, PROJECT_SCOPE_ID, ValueCodec};
use crate::domain::{StudyId, StudyName};
use crate::error::SyncError;
use crate::kv::{KeyValueStore, MemoryStore, RedbStore};
use crate::models::{
    CohortMetadata, FileMetadata, ProjectMetadata, SampleMetadata, StudyMetadata, TaskMetadata,
    VariantFileMetadata,
};

pub const DEFAULT_PAGE_SIZE: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    pub compress_values: bool,
    /// Rows pulled per page by every scan.
    pub page_size: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            compress_values: true,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// `<home>/.cache/variant-catalog-sync/metadata.redb`
pub fn default_store_path() -> Result<Utf8PathBuf, SyncError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(
                dirs.home_dir()
                    .join(".cache")
                    .join("variant-catalog-sync")
                    .join("metadata.redb"),
            )
            .ok()
        })
        .ok_or_else(|| SyncError::Store("unable to resolve cache directory".to_string()))
}

/// The metadata store: one adaptor per record kind over a shared backend.
pub struct MetadataStore {
    kv: Arc<dyn KeyValueStore>,
    codec: ValueCodec,
    options: StoreOptions,
    studies: MetadataAdaptor<StudyMetadata>,
    files: MetadataAdaptor<FileMetadata>,
    samples: MetadataAdaptor<SampleMetadata>,
    cohorts: MetadataAdaptor<CohortMetadata>,
    tasks: MetadataAdaptor<TaskMetadata>,
    variant_files: MetadataAdaptor<VariantFileMetadata>,
}

impl MetadataStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, options: StoreOptions) -> Self {
        let codec = ValueCodec::new(options.compress_values);
        let page_size = options.page_size.max(1);
        Self {
            studies: MetadataAdaptor::new(kv.clone(), codec, page_size),
            files: MetadataAdaptor::new(kv.clone(), codec, page_size),
            samples: MetadataAdaptor::new(kv.clone(), codec, page_size),
            cohorts: MetadataAdaptor::new(kv.clone(), codec, page_size),
            tasks: MetadataAdaptor::new(kv.clone(), codec, page_size),
            variant_files: MetadataAdaptor::new(kv.clone(), codec, page_size),
            kv,
            codec,
            options,
        }
    }

    pub fn open(path: &Utf8Path, options: StoreOptions) -> Result<Self, SyncError> {
        let kv = RedbStore::open(path.as_std_path())?;
        Ok(Self::new(Arc::new(kv), options))
    }

    pub fn in_memory(options: StoreOptions) -> Self {
        Self::new(Arc::new(MemoryStore::new()), options)
    }

    pub fn kv(&self) -> Arc<dyn KeyValueStore> {
        self.kv.clone()
    }

    pub fn options(&self) -> StoreOptions {
        self.options
    }

    pub fn studies(&self) -> &MetadataAdaptor<StudyMetadata> {
        &self.studies
    }

    pub fn files(&self) -> &MetadataAdaptor<FileMetadata> {
        &self.files
    }

    pub fn samples(&self) -> &MetadataAdaptor<SampleMetadata> {
        &self.samples
    }

    pub fn cohorts(&self) -> &MetadataAdaptor<CohortMetadata> {
        &self.cohorts
    }

    pub fn tasks(&self) -> &MetadataAdaptor<TaskMetadata> {
        &self.tasks
    }

    pub fn variant_files(&self) -> &MetadataAdaptor<VariantFileMetadata> {
        &self.variant_files
    }

    /// The project singleton; an empty store reads as the default project.
    pub fn project(&self) -> Result<ProjectMetadata, SyncError> {
        match self.kv.get(PROJECT_ROW) {
            Ok(Some(bytes)) => self.codec.decode("project", &bytes),
            Ok(None) | Err(SyncError::StoreUnavailable(_)) => Ok(ProjectMetadata::default()),
            Err(err) => Err(err),
        }
    }

    pub fn put_project(&self, project: &ProjectMetadata) -> Result<(), SyncError> {
        let bytes = self.codec.encode("project", project)?;
        self.kv.put(PROJECT_ROW, &bytes)
    }

    /// Every registered study, by name.
    pub fn study_names(&self) -> Result<BTreeMap<String, StudyId>, SyncError> {
        let mut names = BTreeMap::new();
        for study in self.studies.scan(PROJECT_SCOPE_ID) {
            let study = study?;
            names.insert(study.name, study.id);
        }
        Ok(names)
    }

    /// Resolves a study by its registered name, falling back to the alias of an FQN.
    pub fn study_id(&self, name: &StudyName) -> Result<Option<StudyId>, SyncError> {
        if let Some(id) = self.studies.id_by_name(PROJECT_SCOPE_ID, name.as_str())? {
            return Ok(Some(StudyId(id)));
        }
        for study in self.studies.scan(PROJECT_SCOPE_ID) {
            let study = study?;
            let registered = study.name.parse::<StudyName>().ok();
            let alias = registered.as_ref().map(|registered| registered.alias());
            if alias == Some(name.alias()) {
                return Ok(Some(study.id));
            }
        }
        Ok(None)
    }

    pub fn study(&self, name: &StudyName) -> Result<StudyMetadata, SyncError> {
        let id = self
            .study_id(name)?
            .ok_or_else(|| SyncError::StudyNotFound(name.to_string()))?;
        self.study_by_id(id)
    }

    pub fn study_by_id(&self, id: StudyId) -> Result<StudyMetadata, SyncError> {
        self.studies
            .get(PROJECT_SCOPE_ID, id.0)?
            .ok_or_else(|| SyncError::StudyNotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn default_path_layout() {
        let path = default_store_path().unwrap();
        assert!(path.ends_with(".cache/variant-catalog-sync/metadata.redb"));
    }

    #[test]
    fn empty_store_reads_default_project() {
        let store = MetadataStore::in_memory(StoreOptions::default());
        assert_eq!(store.project().unwrap(), ProjectMetadata::default());
        assert!(store.study_names().unwrap().is_empty());
    }

    #[test]
    fn studies_resolve_by_name_and_alias() {
        let store = MetadataStore::in_memory(StoreOptions::default());
        store
            .studies()
            .put(&StudyMetadata::new(StudyId(4), "user@p1:s1"))
            .unwrap();

        let fqn: StudyName = "user@p1:s1".parse().unwrap();
        let alias: StudyName = "s1".parse().unwrap();
        assert_eq!(store.study_id(&fqn).unwrap(), Some(StudyId(4)));
        assert_eq!(store.study_id(&alias).unwrap(), Some(StudyId(4)));
        assert_eq!(store.study(&alias).unwrap().name, "user@p1:s1");

        let missing: StudyName = "s2".parse().unwrap();
        assert_matches!(store.study(&missing), Err(SyncError::StudyNotFound(_)));
    }

    #[test]
    fn redb_store_round_trip() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("metadata.redb")).unwrap();
        let store = MetadataStore::open(&path, StoreOptions::default()).unwrap();
        let project = ProjectMetadata {
            species: "hsapiens".to_string(),
            assembly: "GRCh38".to_string(),
            release: 1,
            counters: BTreeMap::new(),
        };
        store.put_project(&project).unwrap();
        drop(store);

        let reopened = MetadataStore::open(&path, StoreOptions::default()).unwrap();
        assert_eq!(reopened.project().unwrap(), project);
    }
}
