//! S3-compatible object store over signed REST calls.
//!
//! Works against AWS S3 (virtual-hosted addressing) and any endpoint that
//! speaks the S3 API such as MinIO (path-style addressing when an endpoint
//! URL is configured).

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use reqwest::{Method, Response};
use std::time::Duration;
use tracing::debug;

use super::sigv4::{
    self, AwsCredentials, SigningRequest, UNSIGNED_PAYLOAD, canonical_query, encode_key,
    escape_xml, extract_xml_blocks, extract_xml_value,
};
use super::{BackendKind, ByteStream, ObjectMeta, ObjectStore, PartTag, UploadHandle};
use crate::config::S3Config;
use crate::error::{ServiceError, ServiceResult, StorageError, StorageResult};

pub struct S3Store {
    client: reqwest::Client,
    bucket: String,
    region: String,
    /// `scheme://host[:port]` of a custom endpoint, path-style addressing
    endpoint: Option<String>,
    credentials: AwsCredentials,
}

impl S3Store {
    pub fn new(config: &S3Config) -> ServiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ServiceError::Config {
                message: format!("Failed to build S3 HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            endpoint: config
                .endpoint_url
                .as_ref()
                .map(|e| e.trim_end_matches('/').to_string()),
            credentials: AwsCredentials::resolve(config)?,
        })
    }

    /// Host header value and base URL for requests.
    fn host_and_base(&self) -> (String, String) {
        match &self.endpoint {
            Some(endpoint) => {
                let host = endpoint
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .to_string();
                (host, endpoint.clone())
            }
            None => {
                let host = format!("{}.s3.{}.amazonaws.com", self.bucket, self.region);
                let base = format!("https://{}", host);
                (host, base)
            }
        }
    }

    /// Path component for a key (or the bucket root when `key` is empty).
    fn canonical_uri(&self, key: &str) -> String {
        let encoded = encode_key(key);
        match &self.endpoint {
            Some(_) if encoded.is_empty() => format!("/{}", sigv4::uri_encode(&self.bucket)),
            Some(_) => format!("/{}/{}", sigv4::uri_encode(&self.bucket), encoded),
            None => format!("/{}", encoded),
        }
    }

    async fn send(
        &self,
        operation: &str,
        method: Method,
        key: &str,
        query: &[(String, String)],
        content_type: Option<&str>,
        body: Option<Bytes>,
    ) -> StorageResult<Response> {
        let (host, base) = self.host_and_base();
        let canonical_uri = self.canonical_uri(key);
        let query_string = canonical_query(query);

        let headers = sigv4::sign(
            &SigningRequest {
                method: method.as_str(),
                host: &host,
                canonical_uri: &canonical_uri,
                query,
                payload_hash: UNSIGNED_PAYLOAD,
                region: &self.region,
                service: "s3",
                now: Utc::now(),
            },
            &self.credentials,
        );

        let url = if query_string.is_empty() {
            format!("{}{}", base, canonical_uri)
        } else {
            format!("{}{}?{}", base, canonical_uri, query_string)
        };

        let mut request = self.client.request(method, &url);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        if let Some(content_type) = content_type {
            request = request.header(reqwest::header::CONTENT_TYPE, content_type);
        }
        if let Some(body) = body {
            request = request.body(body);
        }

        request
            .send()
            .await
            .map_err(|e| StorageError::from_transport(operation, e))
    }

    /// Turn a non-success response into a classified error.
    async fn check(response: Response, key: &str) -> StorageResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(StorageError::from_status(key, status.as_u16(), &body))
    }

    fn upload_query(handle: &UploadHandle) -> Vec<(String, String)> {
        vec![("uploadId".to_string(), handle.upload_id.clone())]
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    fn kind(&self) -> BackendKind {
        BackendKind::S3
    }

    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> StorageResult<String> {
        let size = data.len();
        let response = self
            .send("put", Method::PUT, key, &[], Some(content_type), Some(data))
            .await?;
        Self::check(response, key).await?;
        debug!(key, size, bucket = %self.bucket, "Stored object");
        Ok(key.to_string())
    }

    async fn get(&self, key: &str) -> StorageResult<ByteStream> {
        let response = self.send("get", Method::GET, key, &[], None, None).await?;
        let response = Self::check(response, key).await?;
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| StorageError::from_transport("get", e)))
            .boxed())
    }

    async fn stat(&self, key: &str) -> StorageResult<Option<ObjectMeta>> {
        let response = self.send("stat", Method::HEAD, key, &[], None, None).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check(response, key).await?;
        let size = response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        Ok(Some(ObjectMeta {
            key: key.to_string(),
            size,
        }))
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        let response = self
            .send("remove", Method::DELETE, key, &[], None, None)
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(response, key).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<ObjectMeta>> {
        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
            ];
            if !prefix.is_empty() {
                query.push(("prefix".to_string(), prefix.to_string()));
            }
            if let Some(ref token) = continuation_token {
                query.push(("continuation-token".to_string(), token.clone()));
            }

            let response = self.send("list", Method::GET, "", &query, None, None).await?;
            let body = Self::check(response, prefix)
                .await?
                .text()
                .await
                .map_err(|e| StorageError::from_transport("list", e))?;

            let page = parse_list_objects(&body);
            objects.extend(page.items);
            continuation_token = page.next;
            if continuation_token.is_none() {
                break;
            }
        }

        Ok(objects)
    }

    async fn create_multipart(&self, key: &str, content_type: &str) -> StorageResult<UploadHandle> {
        let query = vec![("uploads".to_string(), String::new())];
        let response = self
            .send(
                "create_multipart",
                Method::POST,
                key,
                &query,
                Some(content_type),
                None,
            )
            .await?;
        let body = Self::check(response, key)
            .await?
            .text()
            .await
            .map_err(|e| StorageError::from_transport("create_multipart", e))?;

        let upload_id =
            extract_xml_value(&body, "UploadId").ok_or_else(|| StorageError::Service {
                status: 500,
                message: "CreateMultipartUpload response missing UploadId".to_string(),
            })?;

        debug!(key, upload_id = %upload_id, "Created multipart upload");
        Ok(UploadHandle {
            key: key.to_string(),
            upload_id,
        })
    }

    async fn upload_part(
        &self,
        handle: &UploadHandle,
        part_number: u32,
        data: Bytes,
    ) -> StorageResult<PartTag> {
        let size = data.len() as u64;
        let mut query = Self::upload_query(handle);
        query.push(("partNumber".to_string(), part_number.to_string()));

        let response = self
            .send("upload_part", Method::PUT, &handle.key, &query, None, Some(data))
            .await?;
        let response = Self::check(response, &handle.key).await?;
        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| StorageError::Service {
                status: 500,
                message: format!("UploadPart response for part {part_number} missing ETag"),
            })?;

        Ok(PartTag {
            part_number,
            etag,
            size,
        })
    }

    async fn list_parts(&self, handle: &UploadHandle) -> StorageResult<Vec<PartTag>> {
        let mut parts = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut query = Self::upload_query(handle);
            if let Some(ref marker) = marker {
                query.push(("part-number-marker".to_string(), marker.clone()));
            }

            let response = self
                .send("list_parts", Method::GET, &handle.key, &query, None, None)
                .await?;
            let body = Self::check(response, &handle.key)
                .await?
                .text()
                .await
                .map_err(|e| StorageError::from_transport("list_parts", e))?;

            let page = parse_list_parts(&body);
            parts.extend(page.items);
            marker = page.next;
            if marker.is_none() {
                break;
            }
        }

        parts.sort_by_key(|p| p.part_number);
        Ok(parts)
    }

    async fn complete_multipart(
        &self,
        handle: &UploadHandle,
        parts: &[PartTag],
    ) -> StorageResult<String> {
        let body = complete_multipart_body(parts);

        let query = Self::upload_query(handle);
        let response = self
            .send(
                "complete_multipart",
                Method::POST,
                &handle.key,
                &query,
                Some("application/xml"),
                Some(Bytes::from(body)),
            )
            .await?;
        let text = Self::check(response, &handle.key)
            .await?
            .text()
            .await
            .map_err(|e| StorageError::from_transport("complete_multipart", e))?;

        // S3 can report a failed completion inside a 200 response
        if let Some(e) = completion_error(&text) {
            return Err(e);
        }

        debug!(key = %handle.key, parts = parts.len(), "Completed multipart upload");
        Ok(handle.key.clone())
    }

    async fn abort_multipart(&self, handle: &UploadHandle) -> StorageResult<()> {
        let query = Self::upload_query(handle);
        let response = self
            .send(
                "abort_multipart",
                Method::DELETE,
                &handle.key,
                &query,
                None,
                None,
            )
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(response, &handle.key).await?;
        Ok(())
    }
}

/// One page of a paginated listing; `next` is set only when more pages follow.
#[derive(Debug)]
struct ListPage<T> {
    items: Vec<T>,
    next: Option<String>,
}

/// Continuation value of a listing page, if the response says it is truncated.
fn next_page_marker(body: &str, marker_tag: &str) -> Option<String> {
    if extract_xml_value(body, "IsTruncated").as_deref() == Some("true") {
        extract_xml_value(body, marker_tag)
    } else {
        None
    }
}

/// Parse a ListObjectsV2 response.
fn parse_list_objects(body: &str) -> ListPage<ObjectMeta> {
    let items = extract_xml_blocks(body, "Contents")
        .into_iter()
        .filter_map(|block| {
            let key = extract_xml_value(block, "Key")?;
            let size = extract_xml_value(block, "Size")
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0);
            Some(ObjectMeta { key, size })
        })
        .collect();

    ListPage {
        items,
        next: next_page_marker(body, "NextContinuationToken"),
    }
}

/// Parse a ListParts response. Parts missing a number, ETag or size are skipped.
fn parse_list_parts(body: &str) -> ListPage<PartTag> {
    let items = extract_xml_blocks(body, "Part")
        .into_iter()
        .filter_map(|block| {
            Some(PartTag {
                part_number: extract_xml_value(block, "PartNumber")?.parse().ok()?,
                etag: extract_xml_value(block, "ETag")?,
                size: extract_xml_value(block, "Size")?.parse().ok()?,
            })
        })
        .collect();

    ListPage {
        items,
        next: next_page_marker(body, "NextPartNumberMarker"),
    }
}

/// CompleteMultipartUpload request body, parts in ascending part-number order.
fn complete_multipart_body(parts: &[PartTag]) -> String {
    let mut ordered: Vec<&PartTag> = parts.iter().collect();
    ordered.sort_by_key(|part| part.part_number);

    let mut body = String::from("<CompleteMultipartUpload>");
    for part in ordered {
        body.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
            part.part_number,
            escape_xml(&part.etag)
        ));
    }
    body.push_str("</CompleteMultipartUpload>");
    body
}

/// Error reported in the body of a successful CompleteMultipartUpload response.
fn completion_error(body: &str) -> Option<StorageError> {
    if !body.contains("<Error>") {
        return None;
    }
    let code = extract_xml_value(body, "Code").unwrap_or_default();
    let message = extract_xml_value(body, "Message").unwrap_or_default();
    let message = format!("{code}: {message}");
    // Rejected part lists will not succeed on retry
    Some(match code.as_str() {
        "InvalidPart" | "InvalidPartOrder" | "NoSuchUpload" | "EntityTooSmall" => {
            StorageError::InvalidRequest { message }
        }
        _ => StorageError::Service {
            status: 500,
            message,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(endpoint: Option<&str>) -> S3Config {
        S3Config {
            bucket: "docs".into(),
            region: "eu-west-1".into(),
            endpoint_url: endpoint.map(str::to_string),
            access_key_id: Some("AKID".into()),
            secret_access_key: Some("secret".into()),
            session_token: None,
            request_timeout_secs: 5,
        }
    }

    #[test]
    fn test_virtual_hosted_addressing() {
        let store = S3Store::new(&config(None)).unwrap();
        let (host, base) = store.host_and_base();
        assert_eq!(host, "docs.s3.eu-west-1.amazonaws.com");
        assert_eq!(base, "https://docs.s3.eu-west-1.amazonaws.com");
        assert_eq!(store.canonical_uri("documents/a/x y.txt"), "/documents/a/x%20y.txt");
        assert_eq!(store.canonical_uri(""), "/");
    }

    #[test]
    fn test_path_style_addressing_for_custom_endpoint() {
        let store = S3Store::new(&config(Some("http://localhost:9000/"))).unwrap();
        let (host, base) = store.host_and_base();
        assert_eq!(host, "localhost:9000");
        assert_eq!(base, "http://localhost:9000");
        assert_eq!(store.canonical_uri("documents/a.txt"), "/docs/documents/a.txt");
        assert_eq!(store.canonical_uri(""), "/docs");
        assert_eq!(store.kind(), BackendKind::S3);
    }

    fn part(part_number: u32, etag: &str) -> PartTag {
        PartTag {
            part_number,
            etag: etag.to_string(),
            size: 5,
        }
    }

    #[test]
    fn test_list_parts_page_with_marker() {
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListPartsResult>
  <Bucket>docs</Bucket>
  <UploadId>up-1</UploadId>
  <PartNumberMarker>0</PartNumberMarker>
  <NextPartNumberMarker>2</NextPartNumberMarker>
  <IsTruncated>true</IsTruncated>
  <Part><PartNumber>1</PartNumber><ETag>&quot;aaa&quot;</ETag><Size>5242880</Size></Part>
  <Part><PartNumber>2</PartNumber><ETag>&quot;bbb&quot;</ETag><Size>17</Size></Part>
</ListPartsResult>"#;

        let page = parse_list_parts(body);
        assert_eq!(
            page.items,
            vec![
                PartTag {
                    part_number: 1,
                    etag: "\"aaa\"".to_string(),
                    size: 5_242_880,
                },
                PartTag {
                    part_number: 2,
                    etag: "\"bbb\"".to_string(),
                    size: 17,
                },
            ]
        );
        assert_eq!(page.next.as_deref(), Some("2"));
    }

    #[test]
    fn test_list_parts_last_page_has_no_marker() {
        // A marker on a non-truncated page must not trigger another request
        let body = "<ListPartsResult><NextPartNumberMarker>3</NextPartNumberMarker>\
            <IsTruncated>false</IsTruncated>\
            <Part><PartNumber>3</PartNumber><ETag>ccc</ETag><Size>9</Size></Part>\
            <Part><PartNumber>x</PartNumber><ETag>bad</ETag><Size>9</Size></Part>\
            </ListPartsResult>";

        let page = parse_list_parts(body);
        assert_eq!(page.items, vec![PartTag { part_number: 3, etag: "ccc".to_string(), size: 9 }]);
        assert!(page.next.is_none());

        let empty = parse_list_parts("<ListPartsResult><IsTruncated>false</IsTruncated></ListPartsResult>");
        assert!(empty.items.is_empty());
        assert!(empty.next.is_none());
    }

    #[test]
    fn test_list_objects_continuation() {
        let body = "<ListBucketResult><IsTruncated>true</IsTruncated>\
            <NextContinuationToken>tok/2</NextContinuationToken>\
            <Contents><Key>documents/ab/a.txt</Key><Size>12</Size></Contents>\
            <Contents><Key>documents/cd/b.pdf</Key><Size>40</Size></Contents>\
            </ListBucketResult>";

        let page = parse_list_objects(body);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[1], ObjectMeta { key: "documents/cd/b.pdf".to_string(), size: 40 });
        assert_eq!(page.next.as_deref(), Some("tok/2"));
    }

    #[test]
    fn test_complete_body_orders_parts_and_escapes_etags() {
        let body = complete_multipart_body(&[part(3, "\"c\""), part(1, "\"a\""), part(2, "b&b")]);
        assert_eq!(
            body,
            "<CompleteMultipartUpload>\
             <Part><PartNumber>1</PartNumber><ETag>&quot;a&quot;</ETag></Part>\
             <Part><PartNumber>2</PartNumber><ETag>b&amp;b</ETag></Part>\
             <Part><PartNumber>3</PartNumber><ETag>&quot;c&quot;</ETag></Part>\
             </CompleteMultipartUpload>"
        );
    }

    #[test]
    fn test_error_inside_successful_completion() {
        let ok = "<CompleteMultipartUploadResult><Key>documents/a.txt</Key>\
            <ETag>&quot;abc-2&quot;</ETag></CompleteMultipartUploadResult>";
        assert!(completion_error(ok).is_none());

        let internal = "<Error><Code>InternalError</Code>\
            <Message>We encountered an internal error.</Message></Error>";
        let err = completion_error(internal).unwrap();
        assert!(matches!(err, StorageError::Service { status: 500, .. }));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("InternalError"));

        let invalid = "<Error><Code>InvalidPart</Code><Message>part 2 not found</Message></Error>";
        let err = completion_error(invalid).unwrap();
        assert!(matches!(err, StorageError::InvalidRequest { .. }));
        assert!(!err.is_retryable());
    }

    fn response(status: u16, body: &'static str) -> Response {
        Response::from(
            axum::http::Response::builder()
                .status(status)
                .body(body)
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_check_classifies_status() {
        let ok = S3Store::check(response(200, "fine"), "k").await.unwrap();
        assert_eq!(ok.status(), reqwest::StatusCode::OK);

        let cases: [(u16, fn(&StorageError) -> bool, bool); 7] = [
            (401, |e| matches!(e, StorageError::Auth { .. }), false),
            (403, |e| matches!(e, StorageError::Auth { .. }), false),
            (404, |e| matches!(e, StorageError::NotFound { key } if key == "k"), false),
            (408, |e| matches!(e, StorageError::Timeout { .. }), true),
            (429, |e| matches!(e, StorageError::Service { status: 429, .. }), true),
            (503, |e| matches!(e, StorageError::Service { status: 503, .. }), true),
            (409, |e| matches!(e, StorageError::InvalidRequest { .. }), false),
        ];
        for (status, expected, retryable) in cases {
            let err = S3Store::check(response(status, "<Error><Code>X</Code></Error>"), "k")
                .await
                .unwrap_err();
            assert!(expected(&err), "status {status} classified as {err:?}");
            assert_eq!(err.is_retryable(), retryable, "status {status}");
        }
    }
}
