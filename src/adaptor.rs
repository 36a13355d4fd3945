//! Typed get/put/scan over one record family of the metadata store.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::codec::{
    self, PROJECT_SCOPE_ID, ValueCodec, decode_task_status_row, entity_prefix, entity_row,
    name_index_row, task_status_prefix, task_status_row,
};
use crate::domain::{EntityKind, StudyId, TaskId, TaskStatus};
use crate::error::SyncError;
use crate::kv::{KeyValueStore, PrefixScan};
use crate::models::{
    CohortMetadata, FileMetadata, SampleMetadata, StudyMetadata, TaskMetadata,
    VariantFileMetadata,
};

/// A record stored under `(kind, scope, id)`.
pub trait Record: Serialize + DeserializeOwned {
    const KIND: EntityKind;

    fn scope(&self) -> StudyId;
    fn key_id(&self) -> i32;

    /// Name kept in the name index, for record kinds that have one.
    fn index_name(&self) -> Option<&str> {
        None
    }

    /// Extra index rows derived from the record's current state.
    fn derived_rows(&self) -> Vec<Vec<u8>> {
        Vec::new()
    }
}

impl Record for StudyMetadata {
    const KIND: EntityKind = EntityKind::Study;

    fn scope(&self) -> StudyId {
        PROJECT_SCOPE_ID
    }

    fn key_id(&self) -> i32 {
        self.id.0
    }

    fn index_name(&self) -> Option<&str> {
        Some(&self.name)
    }
}

impl Record for FileMetadata {
    const KIND: EntityKind = EntityKind::File;

    fn scope(&self) -> StudyId {
        self.study_id
    }

    fn key_id(&self) -> i32 {
        self.id.0
    }

    fn index_name(&self) -> Option<&str> {
        Some(&self.name)
    }
}

impl Record for SampleMetadata {
    const KIND: EntityKind = EntityKind::Sample;

    fn scope(&self) -> StudyId {
        self.study_id
    }

    fn key_id(&self) -> i32 {
        self.id.0
    }

    fn index_name(&self) -> Option<&str> {
        Some(&self.name)
    }
}

impl Record for CohortMetadata {
    const KIND: EntityKind = EntityKind::Cohort;

    fn scope(&self) -> StudyId {
        self.study_id
    }

    fn key_id(&self) -> i32 {
        self.id.0
    }

    fn index_name(&self) -> Option<&str> {
        Some(&self.name)
    }
}

impl Record for TaskMetadata {
    const KIND: EntityKind = EntityKind::Task;

    fn scope(&self) -> StudyId {
        self.study_id
    }

    fn key_id(&self) -> i32 {
        self.id.0
    }

    /// Only the current status is indexed.
    fn derived_rows(&self) -> Vec<Vec<u8>> {
        self.current_status()
            .map(|status| vec![task_status_row(self.study_id, status, self.id)])
            .unwrap_or_default()
    }
}

impl Record for VariantFileMetadata {
    const KIND: EntityKind = EntityKind::VariantFile;

    fn scope(&self) -> StudyId {
        self.study_id
    }

    fn key_id(&self) -> i32 {
        self.id.0
    }
}

pub struct MetadataAdaptor<R> {
    kv: Arc<dyn KeyValueStore>,
    codec: ValueCodec,
    page_size: usize,
    _record: PhantomData<fn() -> R>,
}

impl<R: Record> MetadataAdaptor<R> {
    pub fn new(kv: Arc<dyn KeyValueStore>, codec: ValueCodec, page_size: usize) -> Self {
        Self {
            kv,
            codec,
            page_size,
            _record: PhantomData,
        }
    }

    pub fn get(&self, scope: StudyId, id: i32) -> Result<Option<R>, SyncError> {
        let bytes = match self.kv.get(&entity_row(R::KIND, scope, id)) {
            Ok(bytes) => bytes,
            Err(SyncError::StoreUnavailable(_)) => None,
            Err(err) => return Err(err),
        };
        bytes
            .map(|bytes| self.codec.decode(R::KIND.as_str(), &bytes))
            .transpose()
    }

    /// Replaces the whole record, then brings its index rows in line.
    ///
    /// The primary row is written first; a reader may briefly see it without its
    /// name row, which `id_by_name` covers with a scan.
    pub fn put(&self, record: &R) -> Result<(), SyncError> {
        let previous = self.get(record.scope(), record.key_id())?;
        let bytes = self.codec.encode(R::KIND.as_str(), record)?;
        self.kv
            .put(&entity_row(R::KIND, record.scope(), record.key_id()), &bytes)?;

        let current = index_rows(record);
        for row in &current {
            self.kv.put(&row.0, &row.1)?;
        }
        if let Some(previous) = previous {
            for (row, _) in index_rows(&previous) {
                if !current.iter().any(|(kept, _)| *kept == row) {
                    self.kv.delete(&row)?;
                }
            }
        }
        Ok(())
    }

    pub fn delete(&self, scope: StudyId, id: i32) -> Result<Option<R>, SyncError> {
        let Some(previous) = self.get(scope, id)? else {
            return Ok(None);
        };
        for (row, _) in index_rows(&previous) {
            self.kv.delete(&row)?;
        }
        self.kv.delete(&entity_row(R::KIND, scope, id))?;
        Ok(Some(previous))
    }

    /// Lazily decodes every record of the scope in id order.
    pub fn scan(&self, scope: StudyId) -> RecordScan<'_, R> {
        RecordScan {
            rows: PrefixScan::new(
                self.kv.as_ref(),
                entity_prefix(R::KIND, scope),
                self.page_size,
            ),
            codec: self.codec,
            _record: PhantomData,
        }
    }

    pub fn list(&self, scope: StudyId) -> Result<Vec<R>, SyncError> {
        self.scan(scope).collect()
    }

    pub fn id_by_name(&self, scope: StudyId, name: &str) -> Result<Option<i32>, SyncError> {
        let row = name_index_row(R::KIND, scope, name);
        let indexed = match self.kv.get(&row) {
            Ok(value) => value.as_deref().and_then(codec::decode_id),
            Err(SyncError::StoreUnavailable(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        if let Some(id) = indexed {
            if let Some(record) = self.get(scope, id)? {
                if record.index_name() == Some(name) {
                    return Ok(Some(id));
                }
            }
        }
        debug!("{} name index miss for {name:?}; scanning", R::KIND);
        for record in self.scan(scope) {
            let record = record?;
            if record.index_name() == Some(name) {
                return Ok(Some(record.key_id()));
            }
        }
        Ok(None)
    }

    pub fn get_by_name(&self, scope: StudyId, name: &str) -> Result<Option<R>, SyncError> {
        match self.id_by_name(scope, name)? {
            Some(id) => self.get(scope, id),
            None => Ok(None),
        }
    }
}

impl MetadataAdaptor<TaskMetadata> {
    /// Tasks whose current status is `status`, read from the status index.
    pub fn ids_with_status(
        &self,
        study: StudyId,
        status: TaskStatus,
    ) -> Result<Vec<TaskId>, SyncError> {
        let mut ids = Vec::new();
        for row in PrefixScan::new(
            self.kv.as_ref(),
            task_status_prefix(study, status),
            self.page_size,
        ) {
            let (key, _) = row?;
            if let Some(id) = decode_task_status_row(&key) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    pub fn with_status(
        &self,
        study: StudyId,
        status: TaskStatus,
    ) -> Result<Vec<TaskMetadata>, SyncError> {
        let mut tasks = Vec::new();
        for id in self.ids_with_status(study, status)? {
            if let Some(task) = self.get(study, id.0)? {
                if task.current_status() == Some(status) {
                    tasks.push(task);
                }
            }
        }
        Ok(tasks)
    }
}

fn index_rows<R: Record>(record: &R) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut rows = Vec::new();
    if let Some(name) = record.index_name() {
        rows.push((
            name_index_row(R::KIND, record.scope(), name),
            codec::encode_id(record.key_id()),
        ));
    }
    rows.extend(record.derived_rows().into_iter().map(|row| (row, Vec::new())));
    rows
}

pub struct RecordScan<'a, R> {
    rows: PrefixScan<'a>,
    codec: ValueCodec,
    _record: PhantomData<fn() -> R>,
}

impl<R: Record> Iterator for RecordScan<'_, R> {
    type Item = Result<R, SyncError>;

    fn next(&mut self) -> Option<Self::Item> {
        let row = self.rows.next()?;
        Some(row.and_then(|(_, value)| self.codec.decode(R::KIND.as_str(), &value)))
    }
}
