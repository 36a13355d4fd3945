use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::LazyLock;

use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

macro_rules! entity_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i32);

        impl $name {
            pub fn get(self) -> i32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i32> for $name {
            fn from(value: i32) -> Self {
                Self(value)
            }
        }
    };
}

entity_id!(StudyId);
entity_id!(FileId);
entity_id!(SampleId);
entity_id!(CohortId);
entity_id!(TaskId);

/// Name of the cohort holding every indexed sample of a study.
pub const DEFAULT_COHORT: &str = "ALL";

static STUDY_FQN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.\-]+@[A-Za-z0-9_.\-]+:[A-Za-z0-9_.\-]+$").unwrap());
static STUDY_ALIAS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.\-]+$").unwrap());

/// Study name as known by both stores: a bare alias or a `user@project:study` FQN.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StudyName(String);

impl StudyName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_fqn(&self) -> bool {
        STUDY_FQN.is_match(&self.0)
    }

    /// The trailing study alias of an FQN, or the whole name for a bare alias.
    pub fn alias(&self) -> &str {
        self.0.rsplit_once(':').map(|(_, alias)| alias).unwrap_or(&self.0)
    }
}

impl fmt::Display for StudyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StudyName {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if STUDY_FQN.is_match(trimmed) || STUDY_ALIAS.is_match(trimmed) {
            Ok(Self(trimmed.to_string()))
        } else {
            Err(SyncError::InvalidStudyName(value.to_string()))
        }
    }
}

/// Storage-side status of an indexing step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    #[default]
    None,
    Running,
    Done,
    Ready,
    Error,
    Invalid,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::None => "NONE",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Done => "DONE",
            TaskStatus::Ready => "READY",
            TaskStatus::Error => "ERROR",
            TaskStatus::Invalid => "INVALID",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    Load,
    Annotation,
    SecondaryIndex,
    Remove,
    Other,
}

/// Catalog-side status of a file's variant index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndexStatus {
    #[default]
    None,
    Transformed,
    Loading,
    Indexing,
    Ready,
    Error,
}

impl IndexStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            IndexStatus::None => "NONE",
            IndexStatus::Transformed => "TRANSFORMED",
            IndexStatus::Loading => "LOADING",
            IndexStatus::Indexing => "INDEXING",
            IndexStatus::Ready => "READY",
            IndexStatus::Error => "ERROR",
        }
    }

    /// Boolean sub-steps (annotation, secondary index) mirror as READY or NONE.
    pub fn from_ready(ready: bool) -> Self {
        if ready {
            IndexStatus::Ready
        } else {
            IndexStatus::None
        }
    }
}

impl fmt::Display for IndexStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CohortStatus {
    #[default]
    None,
    Calculating,
    Ready,
    Invalid,
}

impl fmt::Display for CohortStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            CohortStatus::None => "NONE",
            CohortStatus::Calculating => "CALCULATING",
            CohortStatus::Ready => "READY",
            CohortStatus::Invalid => "INVALID",
        };
        f.write_str(value)
    }
}

/// Record families kept in the metadata store. The prefix byte leads every row key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum EntityKind {
    Project,
    Study,
    File,
    Sample,
    Cohort,
    Task,
    VariantFile,
}

impl EntityKind {
    pub fn prefix(self) -> u8 {
        match self {
            EntityKind::Project => b'P',
            EntityKind::Study => b'S',
            EntityKind::File => b'F',
            EntityKind::Sample => b'M',
            EntityKind::Cohort => b'C',
            EntityKind::Task => b'T',
            EntityKind::VariantFile => b'V',
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Project => "project",
            EntityKind::Study => "study",
            EntityKind::File => "file",
            EntityKind::Sample => "sample",
            EntityKind::Cohort => "cohort",
            EntityKind::Task => "task",
            EntityKind::VariantFile => "variant-file",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// URI a catalog uses to identify a file registered in storage by `path`.
pub fn to_uri(path: &str) -> String {
    if path.contains("://") {
        return path.to_string();
    }
    if path.starts_with('/') {
        return format!("file://{path}");
    }
    match std::env::current_dir() {
        Ok(cwd) => format!("file://{}", cwd.join(path).display()),
        Err(_) => format!("file://{path}"),
    }
}

/// Last path component, which is how storage names a registered file.
pub fn file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    Path::new(trimmed)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(trimmed)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_study_fqn() {
        let name: StudyName = "user@p1:s1".parse().unwrap();
        assert!(name.is_fqn());
        assert_eq!(name.alias(), "s1");
    }

    #[test]
    fn parse_study_alias() {
        let name: StudyName = " study_1 ".parse().unwrap();
        assert_eq!(name.as_str(), "study_1");
        assert!(!name.is_fqn());
        assert_eq!(name.alias(), "study_1");
    }

    #[test]
    fn parse_study_invalid() {
        let err = "user@p1:s1:extra".parse::<StudyName>().unwrap_err();
        assert_matches!(err, SyncError::InvalidStudyName(_));
        let err = "".parse::<StudyName>().unwrap_err();
        assert_matches!(err, SyncError::InvalidStudyName(_));
    }

    #[test]
    fn absolute_paths_become_file_uris() {
        assert_eq!(to_uri("/data/a.vcf.gz"), "file:///data/a.vcf.gz");
        assert_eq!(to_uri("file:///data/a.vcf.gz"), "file:///data/a.vcf.gz");
        assert!(to_uri("rel/a.vcf").starts_with("file:///"));
        assert!(to_uri("rel/a.vcf").ends_with("rel/a.vcf"));
    }

    #[test]
    fn file_names_from_paths() {
        assert_eq!(file_name("/data/vcfs/a.vcf.gz"), "a.vcf.gz");
        assert_eq!(file_name("a.vcf"), "a.vcf");
    }

    #[test]
    fn entity_prefixes_are_distinct() {
        let kinds = [
            EntityKind::Project,
            EntityKind::Study,
            EntityKind::File,
            EntityKind::Sample,
            EntityKind::Cohort,
            EntityKind::Task,
            EntityKind::VariantFile,
        ];
        let mut prefixes: Vec<u8> = kinds.iter().map(|k| k.prefix()).collect();
        prefixes.sort();
        prefixes.dedup();
        assert_eq!(prefixes.len(), kinds.len());
    }
}
