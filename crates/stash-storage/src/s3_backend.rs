//! S3-compatible object storage backend (AWS S3, MinIO, R2, ...).
//!
//! One object per key, named by the key itself. Creation time and ttl are
//! stored as object user-metadata rather than a binary envelope:
//!
//! | metadata key      | value |
//! |-------------------|-------|
//! | `b-created-date`  | RFC 3339 UTC timestamp, nanosecond precision |
//! | `b-time-to-live`  | ttl in nanoseconds, decimal; `0` = never expires |
//!
//! Saves are check-then-act: the object is stat'ed for a live record, then
//! uploaded. Two writers racing on a fresh key may both succeed and the last
//! upload wins. Streams that fit in one part go up as a single `PutObject`;
//! anything larger uses a multipart upload that is aborted on any failure,
//! cancellation, or when the save future is dropped.
//!
//! Feature-gated behind `s3-backend`.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use aws_credential_types::Credentials;
use aws_credential_types::provider::SharedCredentialsProvider;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLocationConstraint, CompletedMultipartUpload, CompletedPart, CreateBucketConfiguration,
};
use chrono::{DateTime, SecondsFormat, Utc};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::ttl::TtlHeader;
use crate::{
    BoxReader, CancelReader, CancelToken, Removable, StorageError, StorageResult, StreamBackend,
};

/// Default multipart part size (16 MiB).
pub const DEFAULT_PART_SIZE: usize = 16 * 1024 * 1024;
/// Smallest part size S3 accepts for all but the last part (5 MiB).
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

const META_CREATED: &str = "b-created-date";
const META_TTL: &str = "b-time-to-live";
const BUCKET_CHECK_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_REGION: &str = "us-east-1";

/// Configuration for [`S3Backend`].
#[derive(Clone, PartialEq, Eq)]
pub struct S3Config {
    /// Bucket holding the objects. Created at startup if missing.
    pub bucket: String,
    /// Custom endpoint (`host:port` or URL) for S3-compatible services.
    /// `None` targets AWS.
    pub endpoint: Option<String>,
    /// Region name.
    pub region: String,
    /// Access key id.
    pub access_key: String,
    /// Secret access key.
    pub secret_key: String,
    /// Address buckets as `endpoint/bucket` instead of `bucket.endpoint`.
    pub force_path_style: bool,
    /// Use plain HTTP for an endpoint given without a scheme.
    pub disable_ssl: bool,
    /// Multipart part size in bytes.
    pub part_size: usize,
}

impl std::fmt::Debug for S3Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Config")
            .field("bucket", &self.bucket)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("access_key", &self.access_key)
            .field("secret_key", &"[REDACTED]")
            .field("force_path_style", &self.force_path_style)
            .field("disable_ssl", &self.disable_ssl)
            .field("part_size", &self.part_size)
            .finish()
    }
}

impl S3Config {
    /// Configuration for `bucket` with static credentials and default
    /// settings for everything else.
    pub fn new(
        bucket: impl Into<String>,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            endpoint: None,
            region: DEFAULT_REGION.to_owned(),
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            force_path_style: false,
            disable_ssl: false,
            part_size: DEFAULT_PART_SIZE,
        }
    }

    /// Check required fields.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Config`] naming the first missing field, or
    /// if the part size is below [`MIN_PART_SIZE`].
    pub fn validate(&self) -> StorageResult<()> {
        let required = [
            ("region", &self.region),
            ("bucket", &self.bucket),
            ("access key", &self.access_key),
            ("secret key", &self.secret_key),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(StorageError::Config {
                    reason: format!("s3 {name} cannot be empty"),
                });
            }
        }
        if self.part_size < MIN_PART_SIZE {
            return Err(StorageError::Config {
                reason: format!(
                    "s3 part size {} is below the {MIN_PART_SIZE} byte minimum",
                    self.part_size
                ),
            });
        }
        Ok(())
    }

    fn endpoint_url(&self) -> Option<String> {
        let endpoint = self.endpoint.as_deref()?.trim();
        if endpoint.is_empty() {
            return None;
        }
        if endpoint.contains("://") {
            Some(endpoint.to_owned())
        } else if self.disable_ssl {
            Some(format!("http://{endpoint}"))
        } else {
            Some(format!("https://{endpoint}"))
        }
    }

    fn client(&self) -> Client {
        let creds = Credentials::new(&self.access_key, &self.secret_key, None, None, "stash");
        let mut builder = aws_sdk_s3::Config::builder()
            .region(Region::new(self.region.clone()))
            .credentials_provider(SharedCredentialsProvider::new(creds))
            .force_path_style(self.force_path_style)
            .behavior_version_latest();
        if let Some(url) = self.endpoint_url() {
            builder = builder.endpoint_url(url);
        }
        Client::from_conf(builder.build())
    }
}

/// A [`StreamBackend`] storing one S3 object per key.
#[derive(Clone)]
pub struct S3Backend {
    client: Client,
    bucket: String,
    region: String,
    part_size: usize,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("bucket", &self.bucket)
            .field("part_size", &self.part_size)
            .finish_non_exhaustive()
    }
}

impl S3Backend {
    /// Build a client and make sure the bucket exists, creating it if
    /// needed. The bucket check gives up after three seconds.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Config`] for an invalid configuration and
    /// [`StorageError::Open`] if the bucket cannot be found or created.
    pub async fn connect(config: S3Config) -> StorageResult<Self> {
        config.validate()?;
        let backend = Self {
            client: config.client(),
            bucket: config.bucket,
            region: config.region,
            part_size: config.part_size,
        };

        tokio::time::timeout(BUCKET_CHECK_TIMEOUT, backend.ensure_bucket())
            .await
            .map_err(|_| backend.open_error("bucket check timed out".to_owned()))??;
        Ok(backend)
    }

    /// Name of the bucket this backend writes to.
    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn ensure_bucket(&self) -> StorageResult<()> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => return Ok(()),
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(self.open_error(format!("bucket check failed: {e}"))),
        }

        let mut create = self.client.create_bucket().bucket(&self.bucket);
        if self.region != DEFAULT_REGION {
            create = create.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }
        create
            .send()
            .await
            .map_err(|e| self.open_error(format!("cannot create bucket: {e}")))?;
        tracing::debug!(bucket = %self.bucket, "created bucket");
        Ok(())
    }

    fn open_error(&self, reason: String) -> StorageError {
        StorageError::Open {
            path: format!("s3://{}", self.bucket),
            reason,
        }
    }

    /// Abort every incomplete multipart upload for `key`. Returns how many
    /// were aborted.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Delete`] if listing or aborting fails.
    pub async fn abort_incomplete_uploads(&self, key: &str) -> StorageResult<usize> {
        let delete_err = |reason: String| StorageError::Delete {
            key: key.to_owned(),
            reason,
        };

        let mut aborted = 0;
        let mut key_marker: Option<String> = None;
        let mut upload_id_marker: Option<String> = None;
        loop {
            let response = self
                .client
                .list_multipart_uploads()
                .bucket(&self.bucket)
                .prefix(key)
                .set_key_marker(key_marker.take())
                .set_upload_id_marker(upload_id_marker.take())
                .send()
                .await
                .map_err(|e| delete_err(format!("cannot list uploads: {e}")))?;

            for upload in response.uploads.unwrap_or_default() {
                if upload.key.as_deref() != Some(key) {
                    continue;
                }
                let Some(upload_id) = upload.upload_id else {
                    continue;
                };
                self.client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                    .map_err(|e| delete_err(format!("cannot abort upload {upload_id}: {e}")))?;
                aborted += 1;
            }

            if response.is_truncated != Some(true) {
                break;
            }
            key_marker = response.next_key_marker;
            upload_id_marker = response.next_upload_id_marker;
            if key_marker.is_none() && upload_id_marker.is_none() {
                break;
            }
        }
        Ok(aborted)
    }

    /// Fetch the stored header for `key`, or `None` if no object exists.
    async fn stat(&self, key: &str) -> StorageResult<Option<TtlHeader>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(head) => parse_metadata(key, head.metadata.as_ref()).map(Some),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(StorageError::Read {
                key: key.to_owned(),
                reason: format!("head object failed: {e}"),
            }),
        }
    }

    fn evict(&self, key: &str) {
        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let key = key.to_owned();
        tokio::spawn(async move {
            match client.delete_object().bucket(&bucket).key(&key).send().await {
                Ok(_) => tracing::debug!(key = %key, "evicted object"),
                Err(e) => tracing::warn!(key = %key, error = %e, "failed to evict object"),
            }
        });
    }

    /// Upload `body` in one request. If `cancel` fires while the request is
    /// in flight the request is dropped and any object it may have committed
    /// is evicted.
    async fn put_single(
        &self,
        cancel: &CancelToken,
        key: &str,
        header: &TtlHeader,
        body: Vec<u8>,
    ) -> StorageResult<u64> {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        let len = body.len() as u64;
        let (created, ttl) = metadata_values(header);
        let put = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .metadata(META_CREATED, created)
            .metadata(META_TTL, ttl)
            .body(ByteStream::from(body))
            .send();
        let sent = match until_cancelled(cancel, put).await {
            Ok(sent) => sent,
            Err(e) => {
                tracing::debug!(key = %key, "single put cancelled in flight");
                self.evict(key);
                return Err(e);
            }
        };
        sent.map_err(|e| StorageError::Write {
            key: key.to_owned(),
            reason: format!("put object failed: {e}"),
        })?;
        Ok(len)
    }

    async fn put_multipart<R>(
        &self,
        cancel: &CancelToken,
        key: &str,
        header: &TtlHeader,
        first: Vec<u8>,
        second: Vec<u8>,
        reader: &mut R,
    ) -> StorageResult<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        let (created, ttl) = metadata_values(header);
        let upload_id = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .metadata(META_CREATED, created)
            .metadata(META_TTL, ttl)
            .send()
            .await
            .map_err(|e| StorageError::Write {
                key: key.to_owned(),
                reason: format!("cannot start multipart upload: {e}"),
            })?
            .upload_id
            .ok_or_else(|| StorageError::Write {
                key: key.to_owned(),
                reason: "multipart upload has no id".to_owned(),
            })?;

        let mut pending = PendingUpload {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: key.to_owned(),
            upload_id: upload_id.clone(),
            armed: true,
        };

        let result = self
            .upload_parts(cancel, key, &upload_id, first, second, reader)
            .await;
        pending.armed = false;
        if result.is_err() {
            self.abort_upload(key, &upload_id).await;
        }
        result
    }

    async fn upload_parts<R>(
        &self,
        cancel: &CancelToken,
        key: &str,
        upload_id: &str,
        first: Vec<u8>,
        second: Vec<u8>,
        reader: &mut R,
    ) -> StorageResult<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut parts = Vec::new();
        let mut written = 0u64;
        let mut part_number = 1i32;
        let mut part = first;
        let mut lookahead = Some(second);

        loop {
            written += part.len() as u64;
            let upload = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(part))
                .send();
            let uploaded = until_cancelled(cancel, upload)
                .await?
                .map_err(|e| StorageError::Write {
                    key: key.to_owned(),
                    reason: format!("part {part_number} upload failed: {e}"),
                })?;
            parts.push(
                CompletedPart::builder()
                    .set_e_tag(uploaded.e_tag)
                    .part_number(part_number)
                    .build(),
            );

            part = match lookahead.take() {
                Some(next) => next,
                None => read_part(key, reader, self.part_size).await?,
            };
            if part.is_empty() {
                break;
            }
            part_number += 1;
        }

        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| StorageError::Write {
                key: key.to_owned(),
                reason: format!("cannot complete multipart upload: {e}"),
            })?;
        Ok(written)
    }

    /// Abort one upload, falling back to sweeping every incomplete upload
    /// for the key. Failures are logged, not returned.
    async fn abort_upload(&self, key: &str, upload_id: &str) {
        let aborted = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await;
        let Err(e) = aborted else {
            tracing::debug!(key = %key, upload_id = %upload_id, "aborted multipart upload");
            return;
        };

        tracing::warn!(key = %key, upload_id = %upload_id, error = %e, "multipart abort failed, sweeping");
        match self.abort_incomplete_uploads(key).await {
            Ok(count) => tracing::debug!(key = %key, count, "swept incomplete uploads"),
            Err(e) => tracing::warn!(key = %key, error = %e, "incomplete upload sweep failed"),
        }
    }
}

#[async_trait::async_trait]
impl StreamBackend for S3Backend {
    async fn save_ttl(
        &self,
        cancel: &CancelToken,
        key: &str,
        reader: BoxReader,
        ttl: Duration,
    ) -> StorageResult<u64> {
        validate_key(key)?;
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }

        if self.stat(key).await?.is_some_and(|h| !h.is_expired()) {
            tracing::debug!(key = %key, "save rejected, live object exists");
            return Err(StorageError::conflict(key));
        }

        let header = TtlHeader::new(ttl);
        let mut reader = CancelReader::new(reader, cancel);

        let first = read_part(key, &mut reader, self.part_size).await?;
        let written = if first.len() < self.part_size {
            self.put_single(cancel, key, &header, first).await?
        } else {
            let second = read_part(key, &mut reader, self.part_size).await?;
            if second.is_empty() {
                self.put_single(cancel, key, &header, first).await?
            } else {
                self.put_multipart(cancel, key, &header, first, second, &mut reader)
                    .await?
            }
        };

        tracing::debug!(
            key = %key,
            bytes = written,
            ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            "saved object"
        );
        Ok(written)
    }

    async fn retrieve(&self, cancel: &CancelToken, key: &str) -> StorageResult<BoxReader> {
        validate_key(key)?;
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }

        let Some(header) = self.stat(key).await? else {
            return Err(StorageError::not_found(key));
        };
        if header.is_expired() {
            self.evict(key);
            return Err(StorageError::not_found(key));
        }

        let object = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(object) => object,
            Err(e) if is_not_found(&e) => return Err(StorageError::not_found(key)),
            Err(e) => {
                return Err(StorageError::Read {
                    key: key.to_owned(),
                    reason: format!("get object failed: {e}"),
                });
            }
        };

        let body = Box::pin(object.body.into_async_read());
        Ok(Box::pin(CancelReader::new(body, cancel)))
    }
}

#[async_trait::async_trait]
impl Removable for S3Backend {
    async fn delete(&self, key: &str) -> StorageResult<()> {
        validate_key(key)?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::Delete {
                key: key.to_owned(),
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

/// Aborts the upload from a background task if the save future is dropped
/// before it finishes.
struct PendingUpload {
    client: Client,
    bucket: String,
    key: String,
    upload_id: String,
    armed: bool,
}

impl Drop for PendingUpload {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(key = %self.key, upload_id = %self.upload_id, "no runtime to abort upload");
            return;
        };
        let client = self.client.clone();
        let bucket = std::mem::take(&mut self.bucket);
        let key = std::mem::take(&mut self.key);
        let upload_id = std::mem::take(&mut self.upload_id);
        runtime.spawn(async move {
            let aborted = client
                .abort_multipart_upload()
                .bucket(&bucket)
                .key(&key)
                .upload_id(&upload_id)
                .send()
                .await;
            if let Err(e) = aborted {
                tracing::warn!(key = %key, upload_id = %upload_id, error = %e, "failed to abort abandoned upload");
            }
        });
    }
}

fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey {
            key: key.to_owned(),
            reason: "object key cannot be empty".to_owned(),
        });
    }
    Ok(())
}

/// Read up to `limit` bytes. A short result means the stream ended.
async fn read_part<R>(key: &str, reader: &mut R, limit: usize) -> StorageResult<Vec<u8>>
where
    R: AsyncRead + Unpin + Send,
{
    let mut buf = Vec::with_capacity(limit.min(1024 * 1024));
    reader
        .take(limit as u64)
        .read_to_end(&mut buf)
        .await
        .map_err(|e| StorageError::from_stream_io(key, &e, StorageError::write))?;
    Ok(buf)
}

async fn until_cancelled<F: Future>(cancel: &CancelToken, fut: F) -> StorageResult<F::Output> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(StorageError::Cancelled),
        out = fut => Ok(out),
    }
}

fn metadata_values(header: &TtlHeader) -> (String, String) {
    (
        header
            .created_at()
            .to_rfc3339_opts(SecondsFormat::Nanos, true),
        header.ttl().as_nanos().to_string(),
    )
}

/// Objects without our metadata never expire.
fn parse_metadata(key: &str, metadata: Option<&HashMap<String, String>>) -> StorageResult<TtlHeader> {
    let lookup = |name: &str| {
        metadata.and_then(|m| {
            m.iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        })
    };
    let header_err = |reason: String| StorageError::Header {
        reason: format!("object '{key}': {reason}"),
    };

    let (Some(created), Some(ttl)) = (lookup(META_CREATED), lookup(META_TTL)) else {
        return Ok(TtlHeader::with_created_at(Utc::now(), Duration::ZERO));
    };
    let created = DateTime::parse_from_rfc3339(created)
        .map_err(|e| header_err(format!("bad {META_CREATED} '{created}': {e}")))?
        .with_timezone(&Utc);
    let ttl = ttl
        .parse::<u64>()
        .map_err(|e| header_err(format!("bad {META_TTL} '{ttl}': {e}")))?;
    Ok(TtlHeader::with_created_at(created, Duration::from_nanos(ttl)))
}

fn is_not_found<E>(err: &SdkError<E>) -> bool {
    matches!(err, SdkError::ServiceError(e) if e.raw().status().as_u16() == 404)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    fn config() -> S3Config {
        S3Config::new("stash", "access", "secret")
    }

    #[test]
    fn validate_names_missing_field() {
        let mut cfg = config();
        cfg.region = String::new();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("region"));

        let mut cfg = config();
        cfg.secret_key = " ".to_owned();
        assert!(cfg.validate().unwrap_err().to_string().contains("secret key"));

        assert!(config().validate().is_ok());
    }

    #[test]
    fn part_size_has_a_floor() {
        let mut cfg = config();
        cfg.part_size = MIN_PART_SIZE - 1;
        assert!(matches!(cfg.validate(), Err(StorageError::Config { .. })));
    }

    #[test]
    fn endpoint_scheme_follows_ssl_setting() {
        let mut cfg = config();
        assert_eq!(cfg.endpoint_url(), None);

        cfg.endpoint = Some("localhost:9000".to_owned());
        assert_eq!(cfg.endpoint_url().as_deref(), Some("https://localhost:9000"));

        cfg.disable_ssl = true;
        assert_eq!(cfg.endpoint_url().as_deref(), Some("http://localhost:9000"));

        cfg.endpoint = Some("https://minio.internal".to_owned());
        assert_eq!(cfg.endpoint_url().as_deref(), Some("https://minio.internal"));
    }

    #[test]
    fn debug_redacts_secret() {
        let rendered = format!("{:?}", config());
        assert!(!rendered.contains("\"secret\""));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[test]
    fn metadata_roundtrips_through_strings() {
        let created = Utc::now() - TimeDelta::seconds(2);
        let header = TtlHeader::with_created_at(created, Duration::from_millis(500));
        let (created_str, ttl_str) = metadata_values(&header);

        let mut map = HashMap::new();
        map.insert("B-Created-Date".to_owned(), created_str);
        map.insert(META_TTL.to_owned(), ttl_str);

        let parsed = parse_metadata("k", Some(&map)).unwrap();
        assert_eq!(parsed, header);
        assert!(parsed.is_expired());
    }

    #[test]
    fn missing_metadata_never_expires() {
        let parsed = parse_metadata("k", None).unwrap();
        assert_eq!(parsed.ttl(), Duration::ZERO);
        assert!(!parsed.is_expired());
    }

    #[test]
    fn malformed_metadata_is_a_header_error() {
        let mut map = HashMap::new();
        map.insert(META_CREATED.to_owned(), "yesterday".to_owned());
        map.insert(META_TTL.to_owned(), "10".to_owned());
        assert!(matches!(
            parse_metadata("k", Some(&map)),
            Err(StorageError::Header { .. })
        ));
    }

    #[tokio::test]
    async fn read_part_stops_at_limit() {
        let mut source = &[7u8; 10][..];
        let first = read_part("k", &mut source, 4).await.unwrap();
        let second = read_part("k", &mut source, 4).await.unwrap();
        let third = read_part("k", &mut source, 4).await.unwrap();
        let fourth = read_part("k", &mut source, 4).await.unwrap();
        assert_eq!((first.len(), second.len(), third.len()), (4, 4, 2));
        assert!(fourth.is_empty());
    }

    #[tokio::test]
    async fn read_part_reports_cancellation() {
        let token = CancelToken::new();
        token.cancel();
        let mut reader = CancelReader::new(&b"data"[..], &token);
        let err = read_part("k", &mut reader, 4).await.unwrap_err();
        assert!(matches!(err, StorageError::Cancelled));
    }
}
