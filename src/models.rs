//! Records kept in the metadata store.
//!
//! Each record is persisted whole: any update rewrites the full record under
//! its key, never a subset of its fields.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{CohortId, FileId, SampleId, StudyId, TaskId, TaskStatus, TaskType};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectMetadata {
    #[serde(default)]
    pub species: String,
    #[serde(default)]
    pub assembly: String,
    #[serde(default)]
    pub release: i32,
    /// Snapshot of the id counters; the live values are the counter rows.
    #[serde(default)]
    pub counters: BTreeMap<String, i64>,
}

impl ProjectMetadata {
    pub fn has_organism(&self) -> bool {
        !self.species.trim().is_empty() && !self.assembly.trim().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleIndexConfiguration {
    pub version: i32,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyMetadata {
    pub id: StudyId,
    pub name: String,
    #[serde(default = "default_sample_index_configurations")]
    pub sample_index_configurations: Vec<SampleIndexConfiguration>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

fn default_sample_index_configurations() -> Vec<SampleIndexConfiguration> {
    vec![SampleIndexConfiguration {
        version: 1,
        status: TaskStatus::Ready,
    }]
}

impl StudyMetadata {
    pub fn new(id: StudyId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            sample_index_configurations: default_sample_index_configurations(),
            attributes: BTreeMap::new(),
        }
    }

    /// Highest configured sample-index version, 1 when none is configured.
    pub fn latest_sample_index_version(&self) -> i32 {
        self.sample_index_configurations
            .iter()
            .map(|conf| conf.version)
            .max()
            .unwrap_or(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub id: FileId,
    pub study_id: StudyId,
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub samples: Vec<SampleId>,
    #[serde(default)]
    pub index_status: TaskStatus,
    #[serde(default)]
    pub annotation_status: TaskStatus,
    #[serde(default)]
    pub secondary_annotation_index_status: TaskStatus,
}

impl FileMetadata {
    pub fn new(study_id: StudyId, id: FileId, name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id,
            study_id,
            name: name.into(),
            path: path.into(),
            samples: Vec::new(),
            index_status: TaskStatus::None,
            annotation_status: TaskStatus::None,
            secondary_annotation_index_status: TaskStatus::None,
        }
    }

    pub fn is_indexed(&self) -> bool {
        self.index_status == TaskStatus::Ready
    }

    pub fn is_annotated(&self) -> bool {
        self.annotation_status == TaskStatus::Ready
    }

    pub fn is_secondary_annotation_indexed(&self) -> bool {
        self.secondary_annotation_index_status == TaskStatus::Ready
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleMetadata {
    pub id: SampleId,
    pub study_id: StudyId,
    pub name: String,
    #[serde(default)]
    pub files: Vec<FileId>,
    #[serde(default)]
    pub cohorts: Vec<CohortId>,
    #[serde(default)]
    pub multi_file_sample: bool,
    #[serde(default)]
    pub index_status: TaskStatus,
    #[serde(default)]
    pub annotation_status: TaskStatus,
    #[serde(default)]
    pub secondary_annotation_index_status: TaskStatus,
    #[serde(default)]
    pub sample_index_status: BTreeMap<i32, TaskStatus>,
    #[serde(default)]
    pub sample_index_annotation_status: BTreeMap<i32, TaskStatus>,
    #[serde(default)]
    pub family_index_status: BTreeMap<i32, TaskStatus>,
}

impl SampleMetadata {
    pub fn new(study_id: StudyId, id: SampleId, name: impl Into<String>) -> Self {
        Self {
            id,
            study_id,
            name: name.into(),
            files: Vec::new(),
            cohorts: Vec::new(),
            multi_file_sample: false,
            index_status: TaskStatus::None,
            annotation_status: TaskStatus::None,
            secondary_annotation_index_status: TaskStatus::None,
            sample_index_status: BTreeMap::new(),
            sample_index_annotation_status: BTreeMap::new(),
            family_index_status: BTreeMap::new(),
        }
    }

    pub fn is_indexed(&self) -> bool {
        self.index_status == TaskStatus::Ready
    }

    pub fn is_annotated(&self) -> bool {
        self.annotation_status == TaskStatus::Ready
    }

    /// Versions whose genotype sample index is READY, ascending.
    pub fn sample_index_versions(&self) -> Vec<i32> {
        ready_versions(&self.sample_index_status)
    }

    /// Versions whose sample index annotation is READY, ascending.
    pub fn sample_index_annotation_versions(&self) -> Vec<i32> {
        ready_versions(&self.sample_index_annotation_status)
    }

    pub fn sample_index_status_at(&self, version: i32) -> TaskStatus {
        self.sample_index_status
            .get(&version)
            .copied()
            .unwrap_or_default()
    }

    pub fn sample_index_annotation_status_at(&self, version: i32) -> TaskStatus {
        self.sample_index_annotation_status
            .get(&version)
            .copied()
            .unwrap_or_default()
    }

    pub fn family_index_status_at(&self, version: i32) -> TaskStatus {
        self.family_index_status
            .get(&version)
            .copied()
            .unwrap_or_default()
    }

    pub fn set_sample_index_status(&mut self, status: TaskStatus, version: i32) -> &mut Self {
        self.sample_index_status.insert(version, status);
        self
    }

    pub fn set_sample_index_annotation_status(
        &mut self,
        status: TaskStatus,
        version: i32,
    ) -> &mut Self {
        self.sample_index_annotation_status.insert(version, status);
        self
    }

    pub fn set_family_index_status(&mut self, status: TaskStatus, version: i32) -> &mut Self {
        self.family_index_status.insert(version, status);
        self
    }
}

fn ready_versions(statuses: &BTreeMap<i32, TaskStatus>) -> Vec<i32> {
    statuses
        .iter()
        .filter(|(_, status)| **status == TaskStatus::Ready)
        .map(|(version, _)| *version)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortMetadata {
    pub id: CohortId,
    pub study_id: StudyId,
    pub name: String,
    #[serde(default)]
    pub samples: Vec<SampleId>,
    #[serde(default)]
    pub files: Vec<FileId>,
    #[serde(default)]
    pub stats_status: TaskStatus,
}

impl CohortMetadata {
    pub fn new(study_id: StudyId, id: CohortId, name: impl Into<String>) -> Self {
        Self {
            id,
            study_id,
            name: name.into(),
            samples: Vec::new(),
            files: Vec::new(),
            stats_status: TaskStatus::None,
        }
    }

    pub fn is_stats_ready(&self) -> bool {
        self.stats_status == TaskStatus::Ready
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self.stats_status, TaskStatus::Invalid | TaskStatus::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub at: DateTime<Utc>,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub id: TaskId,
    pub study_id: StudyId,
    pub name: String,
    pub task_type: TaskType,
    #[serde(default)]
    pub file_ids: Vec<FileId>,
    pub created_at: DateTime<Utc>,
    /// Append-only; the last event is the current status.
    #[serde(default)]
    pub status_history: Vec<StatusEvent>,
}

impl TaskMetadata {
    pub fn new(
        study_id: StudyId,
        id: TaskId,
        name: impl Into<String>,
        task_type: TaskType,
        file_ids: Vec<FileId>,
    ) -> Self {
        Self {
            id,
            study_id,
            name: name.into(),
            task_type,
            file_ids,
            created_at: Utc::now(),
            status_history: Vec::new(),
        }
    }

    pub fn current_status(&self) -> Option<TaskStatus> {
        self.status_history.last().map(|event| event.status)
    }

    pub fn push_status(&mut self, status: TaskStatus) -> &mut Self {
        self.push_status_at(Utc::now(), status)
    }

    pub fn push_status_at(&mut self, at: DateTime<Utc>, status: TaskStatus) -> &mut Self {
        self.status_history.push(StatusEvent { at, status });
        self
    }

    pub fn same_operation(&self, file_ids: &[FileId], task_type: TaskType, name: &str) -> bool {
        self.task_type == task_type && self.name == name && self.file_ids == file_ids
    }
}

/// Header summary of a file as read at load time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantFileMetadata {
    pub id: FileId,
    pub study_id: StudyId,
    pub path: String,
    #[serde(default)]
    pub sample_ids: Vec<String>,
}
