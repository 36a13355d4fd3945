use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum SyncError {
    #[error("invalid study name: {0}")]
    InvalidStudyName(String),

    #[error("invalid {kind} name: {name:?}")]
    InvalidName { kind: &'static str, name: String },

    #[error("missing config file vcsync.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("metadata store error: {0}")]
    Store(String),

    #[error("metadata store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("failed to (de)serialize {kind} record: {message}")]
    Serialization { kind: &'static str, message: String },

    #[error("failed to (de)compress value: {0}")]
    Compression(String),

    #[error("timed out after {waited_ms}ms waiting for lock {column} on row {row}")]
    LockTimeout {
        row: String,
        column: String,
        waited_ms: u64,
    },

    #[error("lock {column} on row {row} is no longer held by this owner")]
    LockLost { row: String, column: String },

    #[error("project metadata has no organism; set species and assembly first")]
    MissingOrganism,

    #[error("study not found: {0}")]
    StudyNotFound(String),

    #[error("file {file} not found in study {study}")]
    FileNotFound { study: String, file: String },

    #[error("sample {sample} not found in study {study}")]
    SampleNotFound { study: String, sample: String },

    #[error("cohort {cohort} not found in study {study}")]
    CohortNotFound { study: String, cohort: String },

    #[error("task {task} not found in study {study}")]
    TaskNotFound { study: String, task: String },

    #[error("file {name} ({id}) is already indexed")]
    AlreadyIndexed { id: i32, name: String },

    #[error("file {name} ({id}) is already registered with a different path")]
    PathConflict { id: i32, name: String },

    #[error("operation {task} ({id}) is in progress for files {files:?}")]
    OperationInProgress {
        id: i32,
        task: String,
        files: Vec<i32>,
    },

    #[error("catalog request failed: {0}")]
    CatalogHttp(String),

    #[error("catalog returned status {status}: {message}")]
    CatalogStatus { status: u16, message: String },

    #[error("catalog entity not found: {0}")]
    CatalogNotFound(String),

    #[error("synchronization deadline exceeded during {0}")]
    DeadlineExceeded(String),
}

impl SyncError {
    pub fn serialization(kind: &'static str, err: impl ToString) -> Self {
        SyncError::Serialization {
            kind,
            message: err.to_string(),
        }
    }
}
