//! Row keys and value encoding for the metadata store.
//!
//! Primary rows are `prefix ':' study(be32) id(be32)`, so a scan over
//! `prefix ':' study(be32)` visits one study's records of one kind in id order.
//! Name index rows are `'N' prefix study(be32) name` and hold the id as be32.
//! Studies themselves live in the project scope (study 0).

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::{EntityKind, StudyId, TaskId, TaskStatus};
use crate::error::SyncError;

pub const PROJECT_ROW: &[u8] = b"P";

const NAME_INDEX: u8 = b'N';
const TASK_STATUS_INDEX: u8 = b'X';
const COUNTER: u8 = b'#';
const LOCK: u8 = b'L';
const SEP: u8 = b':';
const PROJECT_SCOPE: u32 = u32::MAX;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

fn be(value: i32) -> [u8; 4] {
    (value as u32).to_be_bytes()
}

/// Scope of project-wide rows such as studies and the study name index.
pub const PROJECT_SCOPE_ID: StudyId = StudyId(0);

pub fn study_row(study: StudyId) -> Vec<u8> {
    entity_row(EntityKind::Study, PROJECT_SCOPE_ID, study.0)
}

pub fn entity_prefix(kind: EntityKind, study: StudyId) -> Vec<u8> {
    let mut key = vec![kind.prefix(), SEP];
    key.extend_from_slice(&be(study.0));
    key
}

pub fn entity_row(kind: EntityKind, study: StudyId, id: i32) -> Vec<u8> {
    let mut key = entity_prefix(kind, study);
    key.extend_from_slice(&be(id));
    key
}

pub fn name_index_prefix(kind: EntityKind, study: StudyId) -> Vec<u8> {
    let mut key = vec![NAME_INDEX, kind.prefix()];
    key.extend_from_slice(&be(study.0));
    key
}

pub fn name_index_row(kind: EntityKind, study: StudyId, name: &str) -> Vec<u8> {
    let mut key = name_index_prefix(kind, study);
    key.extend_from_slice(name.as_bytes());
    key
}

pub fn task_status_prefix(study: StudyId, status: TaskStatus) -> Vec<u8> {
    let mut key = vec![TASK_STATUS_INDEX];
    key.extend_from_slice(&be(study.0));
    key.push(status_byte(status));
    key
}

pub fn task_status_row(study: StudyId, status: TaskStatus, task: TaskId) -> Vec<u8> {
    let mut key = task_status_prefix(study, status);
    key.extend_from_slice(&be(task.0));
    key
}

pub fn decode_task_status_row(key: &[u8]) -> Option<TaskId> {
    if key.len() != 10 || key[0] != TASK_STATUS_INDEX {
        return None;
    }
    Some(TaskId(i32::from_be_bytes(key[6..10].try_into().ok()?)))
}

fn status_byte(status: TaskStatus) -> u8 {
    match status {
        TaskStatus::None => b'n',
        TaskStatus::Running => b'r',
        TaskStatus::Done => b'd',
        TaskStatus::Ready => b'y',
        TaskStatus::Error => b'e',
        TaskStatus::Invalid => b'i',
    }
}

/// Counter column, scoped to one study or (with `None`) to the whole project.
pub fn counter_row(scope: Option<StudyId>, name: &str) -> Vec<u8> {
    let mut key = vec![COUNTER];
    let scope = scope.map(|study| study.0 as u32).unwrap_or(PROJECT_SCOPE);
    key.extend_from_slice(&scope.to_be_bytes());
    key.extend_from_slice(name.as_bytes());
    key
}

pub fn counter_prefix(scope: Option<StudyId>) -> Vec<u8> {
    counter_row(scope, "")
}

/// Counter name of a row built by `counter_row`.
pub fn decode_counter_name(key: &[u8]) -> Option<&str> {
    if key.len() < 5 || key[0] != COUNTER {
        return None;
    }
    std::str::from_utf8(&key[5..]).ok()
}

pub fn lock_row(row: &[u8], column: &str) -> Vec<u8> {
    let mut key = vec![LOCK];
    key.extend_from_slice(&(row.len() as u16).to_be_bytes());
    key.extend_from_slice(row);
    key.extend_from_slice(column.as_bytes());
    key
}

pub fn encode_id(id: i32) -> Vec<u8> {
    be(id).to_vec()
}

pub fn decode_id(value: &[u8]) -> Option<i32> {
    let bytes: [u8; 4] = value.try_into().ok()?;
    Some(i32::from_be_bytes(bytes))
}

/// Printable form of a row key for logs and errors.
pub fn describe_row(row: &[u8]) -> String {
    row.iter()
        .map(|byte| {
            if byte.is_ascii_graphic() {
                (*byte as char).to_string()
            } else {
                format!("\\x{byte:02x}")
            }
        })
        .collect()
}

/// Smallest key strictly greater than every key starting with `prefix`.
pub fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.pop() {
        if last < u8::MAX {
            upper.push(last + 1);
            return Some(upper);
        }
    }
    None
}

/// JSON values, gzip-compressed when `compress` is set.
#[derive(Debug, Clone, Copy)]
pub struct ValueCodec {
    compress: bool,
}

impl ValueCodec {
    pub fn new(compress: bool) -> Self {
        Self { compress }
    }

    pub fn encode<T: Serialize>(&self, kind: &'static str, value: &T) -> Result<Vec<u8>, SyncError> {
        let json = serde_json::to_vec(value).map_err(|err| SyncError::serialization(kind, err))?;
        if !self.compress {
            return Ok(json);
        }
        let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 2), Compression::default());
        encoder
            .write_all(&json)
            .map_err(|err| SyncError::Compression(err.to_string()))?;
        encoder
            .finish()
            .map_err(|err| SyncError::Compression(err.to_string()))
    }

    /// Reads both compressed and legacy plain-JSON values, whatever `compress` says.
    pub fn decode<T: DeserializeOwned>(&self, kind: &'static str, bytes: &[u8]) -> Result<T, SyncError> {
        let json = match gunzip(bytes) {
            Ok(json) => json,
            Err(_) if looks_like_json(bytes) => bytes.to_vec(),
            Err(err) => return Err(SyncError::Compression(err.to_string())),
        };
        serde_json::from_slice(&json).map_err(|err| SyncError::serialization(kind, err))
    }
}

impl Default for ValueCodec {
    fn default() -> Self {
        Self::new(true)
    }
}

fn gunzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    if !bytes.starts_with(&GZIP_MAGIC) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "missing gzip header",
        ));
    }
    let mut out = Vec::with_capacity(bytes.len() * 4);
    GzDecoder::new(bytes).read_to_end(&mut out)?;
    Ok(out)
}

fn looks_like_json(bytes: &[u8]) -> bool {
    matches!(bytes.iter().find(|b| !b.is_ascii_whitespace()), Some(b'{') | Some(b'['))
}
