//! The entity catalog as seen by the synchronizer, and its REST client.

use std::time::Duration;

use reqwest::Url;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::domain::{CohortStatus, IndexStatus};
use crate::error::SyncError;

/// Tool name of catalog jobs that index variant files.
pub const VARIANT_INDEX_TOOL: &str = "variant-index";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogFileIndex {
    #[serde(default)]
    pub status: IndexStatus,
    /// Catalog id of the transform artifact, when the file has been transformed.
    #[serde(default)]
    pub transformed_file: Option<i64>,
    #[serde(default)]
    pub annotation_index_status: IndexStatus,
    #[serde(default)]
    pub secondary_annotation_index_status: IndexStatus,
}

impl CatalogFileIndex {
    pub fn has_transformed_file(&self) -> bool {
        self.transformed_file.is_some_and(|id| id > 0)
    }

    /// Where a file falls back to when storage does not hold it as indexed.
    pub fn unindexed_status(&self) -> IndexStatus {
        if self.has_transformed_file() {
            IndexStatus::Transformed
        } else {
            IndexStatus::None
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogFile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub path: String,
    pub uri: String,
    #[serde(default)]
    pub sample_ids: Vec<String>,
    #[serde(default)]
    pub index: CatalogFileIndex,
}

/// The catalog's mirror of a sample's secondary sample index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleIndexDoc {
    #[serde(default)]
    pub status: IndexStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub version: i32,
    #[serde(default)]
    pub family_status: IndexStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSample {
    pub id: String,
    #[serde(default)]
    pub index_status: IndexStatus,
    #[serde(default)]
    pub annotation_index_status: IndexStatus,
    #[serde(default)]
    pub secondary_annotation_index_status: IndexStatus,
    #[serde(default)]
    pub sample_index: SampleIndexDoc,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogCohort {
    pub id: String,
    #[serde(default)]
    pub samples: Vec<String>,
    #[serde(default)]
    pub status: CohortStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogJob {
    pub id: String,
    pub tool: String,
    #[serde(default)]
    pub input_files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectOrganism {
    #[serde(default)]
    pub scientific_name: String,
    #[serde(default)]
    pub assembly: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogProject {
    pub id: String,
    #[serde(default)]
    pub organism: Option<ProjectOrganism>,
    #[serde(default)]
    pub current_release: i32,
}

/// A slice of a larger catalog result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub skip: usize,
    pub limit: usize,
}

/// The catalog operations the synchronizer relies on. Each update is one
/// atomic catalog write that fully replaces the targeted sub-document.
pub trait CatalogClient: Send + Sync {
    fn files_by_uri(&self, study: &str, uris: &[String]) -> Result<Vec<CatalogFile>, SyncError>;
    fn files_by_index_status(
        &self,
        study: &str,
        statuses: &[IndexStatus],
        page: PageRequest,
    ) -> Result<Vec<CatalogFile>, SyncError>;
    fn update_file_index_status(
        &self,
        study: &str,
        file: &str,
        status: IndexStatus,
        message: &str,
    ) -> Result<(), SyncError>;
    fn update_file_annotation_index(
        &self,
        study: &str,
        file: &str,
        status: IndexStatus,
    ) -> Result<(), SyncError>;
    fn update_file_secondary_annotation_index(
        &self,
        study: &str,
        file: &str,
        status: IndexStatus,
    ) -> Result<(), SyncError>;
    /// Re-reads the source file and rewrites its sample linkage.
    fn rederive_file_metadata(&self, study: &str, file: &str) -> Result<(), SyncError>;

    fn samples(&self, study: &str, ids: &[String]) -> Result<Vec<CatalogSample>, SyncError>;
    fn update_sample_index(
        &self,
        study: &str,
        sample: &str,
        status: IndexStatus,
    ) -> Result<(), SyncError>;
    fn update_sample_annotation_index(
        &self,
        study: &str,
        sample: &str,
        status: IndexStatus,
    ) -> Result<(), SyncError>;
    fn update_sample_secondary_annotation_index(
        &self,
        study: &str,
        sample: &str,
        status: IndexStatus,
    ) -> Result<(), SyncError>;
    fn update_sample_secondary_sample_index(
        &self,
        study: &str,
        sample: &str,
        doc: &SampleIndexDoc,
    ) -> Result<(), SyncError>;

    fn cohort(&self, study: &str, cohort: &str) -> Result<Option<CatalogCohort>, SyncError>;
    fn cohorts(&self, study: &str, ids: &[String]) -> Result<Vec<CatalogCohort>, SyncError>;
    fn set_cohort_status(
        &self,
        study: &str,
        cohort: &str,
        status: CohortStatus,
        message: &str,
    ) -> Result<(), SyncError>;
    /// Replaces the cohort's member list (action SET).
    fn set_cohort_samples(
        &self,
        study: &str,
        cohort: &str,
        samples: &[String],
    ) -> Result<(), SyncError>;

    fn running_jobs(
        &self,
        study: &str,
        input_file: &str,
        tool: &str,
    ) -> Result<Vec<CatalogJob>, SyncError>;

    fn project(&self, project: &str) -> Result<CatalogProject, SyncError>;
}

#[derive(Debug, Deserialize)]
struct ResultsEnvelope<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
}

#[derive(Clone)]
pub struct CatalogHttpClient {
    client: Client,
    base_url: Url,
}

impl CatalogHttpClient {
    pub fn new(base_url: &str, token: Option<&str>) -> Result<Self, SyncError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("vcsync/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| SyncError::CatalogHttp(err.to_string()))?,
        );
        if let Some(token) = token.map(str::trim).filter(|token| !token.is_empty()) {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|err| SyncError::CatalogHttp(err.to_string()))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| SyncError::CatalogHttp(err.to_string()))?;
        let base_url = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|err| SyncError::InvalidConfig(format!("catalog.base_url: {err}")))?;
        if base_url.cannot_be_a_base() {
            return Err(SyncError::InvalidConfig(format!(
                "catalog.base_url is not a base URL: {base_url}"
            )));
        }
        Ok(Self { client, base_url })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, SyncError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::CatalogHttp(format!("invalid base url {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<Response, SyncError>
    where
        F: FnMut() -> RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        std::thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        std::thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(SyncError::CatalogHttp(err.to_string()));
                }
            }
        }
    }

    fn handle_status(response: Response) -> Result<Response, SyncError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "catalog request failed".to_string());
        Err(SyncError::CatalogStatus { status, message })
    }

    fn get_results<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        query: &[(&str, String)],
    ) -> Result<Vec<T>, SyncError> {
        let url = self.url(segments)?;
        let response = self.send_with_retries(|| self.client.get(url.clone()).query(query))?;
        let envelope: ResultsEnvelope<T> = Self::handle_status(response)?
            .json()
            .map_err(|err| SyncError::CatalogHttp(err.to_string()))?;
        Ok(envelope.results)
    }

    fn post(&self, segments: &[&str], body: &serde_json::Value) -> Result<(), SyncError> {
        let url = self.url(segments)?;
        let response = self.send_with_retries(|| self.client.post(url.clone()).json(body))?;
        Self::handle_status(response)?;
        Ok(())
    }
}

impl CatalogClient for CatalogHttpClient {
    fn files_by_uri(&self, study: &str, uris: &[String]) -> Result<Vec<CatalogFile>, SyncError> {
        if uris.is_empty() {
            return Ok(Vec::new());
        }
        self.get_results(
            &["studies", study, "files"],
            &[
                ("uri", uris.join(",")),
                ("limit", uris.len().to_string()),
            ],
        )
    }

    fn files_by_index_status(
        &self,
        study: &str,
        statuses: &[IndexStatus],
        page: PageRequest,
    ) -> Result<Vec<CatalogFile>, SyncError> {
        let statuses: Vec<&str> = statuses.iter().map(|status| status.as_str()).collect();
        self.get_results(
            &["studies", study, "files"],
            &[
                ("indexStatus", statuses.join(",")),
                ("bioformat", "VARIANT".to_string()),
                ("format", "VCF,GVCF".to_string()),
                ("skip", page.skip.to_string()),
                ("limit", page.limit.to_string()),
            ],
        )
    }

    fn update_file_index_status(
        &self,
        study: &str,
        file: &str,
        status: IndexStatus,
        message: &str,
    ) -> Result<(), SyncError> {
        self.post(
            &["studies", study, "files", file, "internal", "variant", "index"],
            &json!({ "status": status, "message": message }),
        )
    }

    fn update_file_annotation_index(
        &self,
        study: &str,
        file: &str,
        status: IndexStatus,
    ) -> Result<(), SyncError> {
        self.post(
            &["studies", study, "files", file, "internal", "variant", "annotationIndex"],
            &json!({ "status": status }),
        )
    }

    fn update_file_secondary_annotation_index(
        &self,
        study: &str,
        file: &str,
        status: IndexStatus,
    ) -> Result<(), SyncError> {
        self.post(
            &[
                "studies",
                study,
                "files",
                file,
                "internal",
                "variant",
                "secondaryAnnotationIndex",
            ],
            &json!({ "status": status }),
        )
    }

    fn rederive_file_metadata(&self, study: &str, file: &str) -> Result<(), SyncError> {
        self.post(
            &["studies", study, "files", file, "metadata", "rederive"],
            &json!({}),
        )
    }

    fn samples(&self, study: &str, ids: &[String]) -> Result<Vec<CatalogSample>, SyncError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.get_results(
            &["studies", study, "samples"],
            &[("id", ids.join(",")), ("limit", ids.len().to_string())],
        )
    }

    fn update_sample_index(
        &self,
        study: &str,
        sample: &str,
        status: IndexStatus,
    ) -> Result<(), SyncError> {
        self.post(
            &["studies", study, "samples", sample, "internal", "variant", "index"],
            &json!({ "status": status }),
        )
    }

    fn update_sample_annotation_index(
        &self,
        study: &str,
        sample: &str,
        status: IndexStatus,
    ) -> Result<(), SyncError> {
        self.post(
            &["studies", study, "samples", sample, "internal", "variant", "annotationIndex"],
            &json!({ "status": status }),
        )
    }

    fn update_sample_secondary_annotation_index(
        &self,
        study: &str,
        sample: &str,
        status: IndexStatus,
    ) -> Result<(), SyncError> {
        self.post(
            &[
                "studies",
                study,
                "samples",
                sample,
                "internal",
                "variant",
                "secondaryAnnotationIndex",
            ],
            &json!({ "status": status }),
        )
    }

    fn update_sample_secondary_sample_index(
        &self,
        study: &str,
        sample: &str,
        doc: &SampleIndexDoc,
    ) -> Result<(), SyncError> {
        let body = serde_json::to_value(doc).map_err(|err| SyncError::serialization("sample index", err))?;
        self.post(
            &[
                "studies",
                study,
                "samples",
                sample,
                "internal",
                "variant",
                "secondarySampleIndex",
            ],
            &body,
        )
    }

    fn cohort(&self, study: &str, cohort: &str) -> Result<Option<CatalogCohort>, SyncError> {
        match self.get_results::<CatalogCohort>(&["studies", study, "cohorts", cohort], &[]) {
            Ok(mut results) => Ok(results.pop()),
            Err(SyncError::CatalogStatus { status: 404, .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn cohorts(&self, study: &str, ids: &[String]) -> Result<Vec<CatalogCohort>, SyncError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.get_results(
            &["studies", study, "cohorts"],
            &[("id", ids.join(",")), ("limit", ids.len().to_string())],
        )
    }

    fn set_cohort_status(
        &self,
        study: &str,
        cohort: &str,
        status: CohortStatus,
        message: &str,
    ) -> Result<(), SyncError> {
        self.post(
            &["studies", study, "cohorts", cohort, "status"],
            &json!({ "status": status, "message": message }),
        )
    }

    fn set_cohort_samples(
        &self,
        study: &str,
        cohort: &str,
        samples: &[String],
    ) -> Result<(), SyncError> {
        self.post(
            &["studies", study, "cohorts", cohort, "samples"],
            &json!({ "action": "SET", "samples": samples }),
        )
    }

    fn running_jobs(
        &self,
        study: &str,
        input_file: &str,
        tool: &str,
    ) -> Result<Vec<CatalogJob>, SyncError> {
        self.get_results(
            &["studies", study, "jobs"],
            &[
                ("status", "RUNNING".to_string()),
                ("tool", tool.to_string()),
                ("input", input_file.to_string()),
            ],
        )
    }

    fn project(&self, project: &str) -> Result<CatalogProject, SyncError> {
        match self.get_results::<CatalogProject>(&["projects", project], &[]) {
            Ok(mut results) => results
                .pop()
                .ok_or_else(|| SyncError::CatalogNotFound(format!("project {project}"))),
            Err(SyncError::CatalogStatus { status: 404, .. }) => {
                Err(SyncError::CatalogNotFound(format!("project {project}")))
            }
            Err(err) => Err(err),
        }
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn urls_escape_study_names() {
        let client = CatalogHttpClient::new("https://catalog.example.org/api/v2/", None).unwrap();
        let url = client
            .url(&["studies", "user@p1:s1", "files", "a b.vcf"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://catalog.example.org/api/v2/studies/user@p1:s1/files/a%20b.vcf"
        );
    }

    #[test]
    fn rejects_non_base_urls() {
        let err = CatalogHttpClient::new("mailto:someone@example.org", None).err().unwrap();
        assert_matches!(err, SyncError::InvalidConfig(_));
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(503));
        assert!(is_retryable_status(429));
        assert!(!is_retryable_status(404));
    }

    #[test]
    fn transformed_files_fall_back_to_transformed() {
        let mut index = CatalogFileIndex::default();
        assert_eq!(index.unindexed_status(), IndexStatus::None);
        index.transformed_file = Some(0);
        assert_eq!(index.unindexed_status(), IndexStatus::None);
        index.transformed_file = Some(12);
        assert_eq!(index.unindexed_status(), IndexStatus::Transformed);
    }

    #[test]
    fn file_json_uses_catalog_field_names() {
        let file: CatalogFile = serde_json::from_str(
            r#"{"id":"a.vcf","name":"a.vcf","uri":"file:///d/a.vcf","sampleIds":["S1"],
                "index":{"status":"READY","transformedFile":3}}"#,
        )
        .unwrap();
        assert_eq!(file.index.status, IndexStatus::Ready);
        assert!(file.index.has_transformed_file());
        assert_eq!(file.sample_ids, vec!["S1".to_string()]);
    }
}
