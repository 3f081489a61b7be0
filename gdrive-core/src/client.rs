use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use rand::Rng;
use rand::distributions::Alphanumeric;
use reqwest::header::{CONTENT_TYPE, HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com";
const FILE_FIELDS: &str = "id,name,modifiedTime,size,md5Checksum";
const PAGE_SIZE: u32 = 1000;
const BOUNDARY_PREFIX: &str = "syncer-part-";
const BOUNDARY_RANDOM_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("api returned {status}: {body}")]
    Api {
        status: StatusCode,
        body: String,
        retry_after: Option<Duration>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

/// Body of a media download, consumed chunk by chunk.
pub struct Download {
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, Result<Bytes, DriveError>>,
}

#[derive(Clone)]
pub struct DriveClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl DriveClient {
    pub fn new(token: impl Into<String>) -> Result<Self, DriveError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, DriveError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    /// Rebuilds the HTTP client so every request is bounded by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, DriveError> {
        self.http = Client::builder().timeout(timeout).build()?;
        Ok(self)
    }

    pub async fn list_files_page(&self, page_token: Option<&str>) -> Result<FileList, DriveError> {
        let mut url = self.endpoint("/drive/v3/files")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("q", "trashed=false");
            query.append_pair("fields", &format!("nextPageToken,files({FILE_FIELDS})"));
            query.append_pair("pageSize", &PAGE_SIZE.to_string());
            if let Some(token) = page_token.filter(|t| !t.is_empty()) {
                query.append_pair("pageToken", token);
            }
        }
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn list_files_all(&self) -> Result<Vec<DriveFile>, DriveError> {
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page = self.list_files_page(page_token.as_deref()).await?;
            files.extend(page.files);
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }
        Ok(files)
    }

    pub async fn download(&self, file_id: &str) -> Result<Download, DriveError> {
        let mut url = self.endpoint(&format!("/drive/v3/files/{file_id}"))?;
        url.query_pairs_mut().append_pair("alt", "media");
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        let content_length = response.content_length();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(DriveError::from))
            .boxed();
        Ok(Download {
            content_length,
            body,
        })
    }

    /// Creates a new file named `name` in the root of the drive.
    pub async fn create_file(&self, name: &str, content: Vec<u8>) -> Result<DriveFile, DriveError> {
        let mut url = self.endpoint("/upload/drive/v3/files")?;
        url.query_pairs_mut()
            .append_pair("uploadType", "multipart")
            .append_pair("fields", FILE_FIELDS);
        let metadata = serde_json::to_vec(&NewFileMetadata { name })?;
        let boundary = multipart_boundary(&mut rand::thread_rng(), &content);
        let body = multipart_related_body(&boundary, &metadata, &content);
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .header(
                CONTENT_TYPE,
                format!("multipart/related; boundary={boundary}"),
            )
            .body(body)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn update_file_content(
        &self,
        file_id: &str,
        content: Vec<u8>,
    ) -> Result<DriveFile, DriveError> {
        let mut url = self.endpoint(&format!("/upload/drive/v3/files/{file_id}"))?;
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("fields", FILE_FIELDS);
        let response = self
            .http
            .patch(url)
            .bearer_auth(&self.token)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(content)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    fn endpoint(&self, path: &str) -> Result<Url, DriveError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, DriveError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            Err(Self::api_error(response).await)
        }
    }

    async fn api_error(response: reqwest::Response) -> DriveError {
        let status = response.status();
        let retry_after = parse_retry_after(response.headers(), SystemTime::now());
        let body = response.text().await.unwrap_or_default();
        DriveError::Api {
            status,
            body,
            retry_after,
        }
    }
}

impl DriveError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            DriveError::Api { status, .. } => Some(classify_api_status(*status)),
            DriveError::Request(err) if err.is_timeout() || err.is_connect() => {
                Some(ApiErrorClass::Transient)
            }
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DriveError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

fn parse_retry_after(headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = httpdate::parse_http_date(raw).ok()?;
    Some(at.duration_since(now).unwrap_or(Duration::ZERO))
}

/// Random per-request boundary that does not occur in `content`.
fn multipart_boundary<R: Rng + ?Sized>(rng: &mut R, content: &[u8]) -> String {
    loop {
        let suffix: String = (0..BOUNDARY_RANDOM_LEN)
            .map(|_| char::from(rng.sample(Alphanumeric)))
            .collect();
        let boundary = format!("{BOUNDARY_PREFIX}{suffix}");
        if !contains_subslice(content, boundary.as_bytes()) {
            return boundary;
        }
    }
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|window| window == needle)
}

fn multipart_related_body(boundary: &str, metadata: &[u8], content: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(metadata.len() + content.len() + 256);
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.extend_from_slice(metadata);
    body.extend_from_slice(format!("\r\n--{boundary}\r\n").as_bytes());
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

#[derive(Serialize)]
struct NewFileMetadata<'a> {
    name: &'a str,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub modified_time: Option<String>,
    /// Drive reports int64 fields as decimal strings.
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub md5_checksum: Option<String>,
}

impl DriveFile {
    pub fn size_bytes(&self) -> Option<u64> {
        self.size.as_deref().and_then(|s| s.parse().ok())
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileList {
    #[serde(default)]
    pub files: Vec<DriveFile>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn classifies_statuses() {
        assert_eq!(
            classify_api_status(StatusCode::UNAUTHORIZED),
            ApiErrorClass::Auth
        );
        assert_eq!(
            classify_api_status(StatusCode::TOO_MANY_REQUESTS),
            ApiErrorClass::RateLimit
        );
        assert_eq!(
            classify_api_status(StatusCode::BAD_GATEWAY),
            ApiErrorClass::Transient
        );
        assert_eq!(
            classify_api_status(StatusCode::NOT_FOUND),
            ApiErrorClass::Permanent
        );
    }

    #[test]
    fn parses_retry_after_seconds_and_dates() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(
            parse_retry_after(&headers, now),
            Some(Duration::from_secs(7))
        );

        let later = httpdate::fmt_http_date(now + Duration::from_secs(30));
        headers.insert(RETRY_AFTER, HeaderValue::from_str(&later).unwrap());
        assert_eq!(
            parse_retry_after(&headers, now),
            Some(Duration::from_secs(30))
        );

        headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(parse_retry_after(&headers, now), None);
    }

    #[test]
    fn multipart_body_wraps_metadata_and_media() {
        let body = multipart_related_body("b0und", br#"{"name":"a.txt"}"#, b"payload");
        let text = String::from_utf8(body).unwrap();
        assert!(text.starts_with("--b0und\r\n"));
        assert!(text.contains("{\"name\":\"a.txt\"}"));
        assert!(text.contains("application/octet-stream\r\n\r\npayload\r\n"));
        assert!(text.ends_with("--b0und--\r\n"));
    }

    #[test]
    fn boundary_differs_per_request() {
        let mut rng = rand::thread_rng();
        let first = multipart_boundary(&mut rng, b"payload");
        let second = multipart_boundary(&mut rng, b"payload");
        assert!(first.starts_with(BOUNDARY_PREFIX));
        assert_eq!(first.len(), BOUNDARY_PREFIX.len() + BOUNDARY_RANDOM_LEN);
        assert_ne!(first, second);
    }

    #[test]
    fn boundary_never_occurs_in_content() {
        use rand::SeedableRng;
        use rand::rngs::StdRng;

        let taken = multipart_boundary(&mut StdRng::seed_from_u64(7), b"");
        let content = format!("header\r\n--{taken}\r\ntrailer");

        let boundary = multipart_boundary(&mut StdRng::seed_from_u64(7), content.as_bytes());

        assert_ne!(boundary, taken);
        assert!(!content.contains(&boundary));
    }

    #[test]
    fn size_is_parsed_from_string() {
        let file = DriveFile {
            id: "1".into(),
            name: "a".into(),
            modified_time: None,
            size: Some("42".into()),
            md5_checksum: None,
        };
        assert_eq!(file.size_bytes(), Some(42));
    }
}
