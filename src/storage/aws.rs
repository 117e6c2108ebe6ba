//! S3 object store client.
//!
//! Talks to AWS S3 or any S3-compatible service.  Each container is its
//! own bucket; blob keys are used unchanged as object keys.
//!
//! Credentials come from the settings when both keys are given, otherwise
//! from the standard AWS credential chain (env vars, `~/.aws/credentials`,
//! IAM role, etc.).

use aws_sdk_s3::types::{
    BucketLocationConstraint, CreateBucketConfiguration, Delete, ObjectIdentifier,
};
use aws_sdk_s3::Client;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use md5::{Digest, Md5};
use tracing::{debug, info, warn};

use super::object::{ObjectInfo, ObjectStore};
use crate::config::S3Settings;
use crate::BoxFuture;

/// Largest batch a single DeleteObjects request accepts.
const DELETE_BATCH: usize = 1000;

/// Region in which buckets are created without a location constraint.
const DEFAULT_REGION: &str = "us-east-1";

/// [`ObjectStore`] backed by the AWS SDK.
pub struct S3ObjectStore {
    client: Client,
    region: String,
}

impl S3ObjectStore {
    /// Build a client from `settings`.
    pub async fn new(settings: &S3Settings) -> anyhow::Result<Self> {
        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(settings.region.clone()));

        if !settings.endpoint_url.is_empty() {
            config_loader = config_loader.endpoint_url(&settings.endpoint_url);
        }

        if !settings.access_key_id.is_empty() && !settings.secret_access_key.is_empty() {
            let creds = aws_sdk_s3::config::Credentials::new(
                &settings.access_key_id,
                &settings.secret_access_key,
                None,
                None,
                "chunkstore-config",
            );
            config_loader = config_loader.credentials_provider(creds);
        }

        let sdk_config = config_loader.load().await;
        let s3_config_builder = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(settings.use_path_style);
        let client = Client::from_conf(s3_config_builder.build());

        info!(
            "S3 object store initialized: region={} endpoint='{}'",
            settings.region, settings.endpoint_url
        );
        Ok(Self::from_client(client, settings.region.clone()))
    }

    /// Wrap an already configured client.
    pub fn from_client(client: Client, region: impl Into<String>) -> Self {
        Self {
            client,
            region: region.into(),
        }
    }

    fn map_sdk_error(context: &str, err: impl std::fmt::Display) -> anyhow::Error {
        anyhow::anyhow!("AWS S3 {context}: {err}")
    }
}

/// HTTP `Range` header covering `length` bytes from `offset` (inclusive end).
fn range_header(offset: u64, length: u64) -> String {
    format!("bytes={}-{}", offset, offset + length - 1)
}

/// Base64 MD5 digest sent as `Content-MD5` so S3 rejects corrupted uploads.
fn content_md5(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    STANDARD.encode(hasher.finalize())
}

impl ObjectStore for S3ObjectStore {
    fn create_bucket(&self, bucket: &str) -> BoxFuture<'_, anyhow::Result<()>> {
        let bucket = bucket.to_string();
        Box::pin(async move {
            debug!("AWS create_bucket: bucket={} region={}", bucket, self.region);

            let mut req = self.client.create_bucket().bucket(&bucket);
            if self.region != DEFAULT_REGION {
                let constraint = CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build();
                req = req.create_bucket_configuration(constraint);
            }

            match req.send().await {
                Ok(_) => Ok(()),
                Err(e) => {
                    let service_err = e.into_service_error();
                    if service_err.is_bucket_already_owned_by_you()
                        || service_err.is_bucket_already_exists()
                    {
                        Ok(())
                    } else {
                        Err(Self::map_sdk_error("create_bucket", service_err))
                    }
                }
            }
        })
    }

    fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> BoxFuture<'_, anyhow::Result<Vec<ObjectInfo>>> {
        let bucket = bucket.to_string();
        let prefix = prefix.to_string();
        Box::pin(async move {
            debug!("AWS list_objects_v2: bucket={} prefix={}", bucket, prefix);

            let mut objects = Vec::new();
            let mut continuation_token: Option<String> = None;
            loop {
                let mut req = self.client.list_objects_v2().bucket(&bucket).prefix(&prefix);
                if let Some(ref token) = continuation_token {
                    req = req.continuation_token(token);
                }

                let resp = match req.send().await {
                    Ok(resp) => resp,
                    Err(e) => {
                        let service_err = e.into_service_error();
                        if service_err.is_no_such_bucket() {
                            return Ok(Vec::new());
                        }
                        return Err(Self::map_sdk_error("list_objects_v2", service_err));
                    }
                };

                for obj in resp.contents() {
                    if let Some(key) = obj.key() {
                        objects.push(ObjectInfo {
                            key: key.to_string(),
                            size: obj.size().unwrap_or(0).max(0) as u64,
                        });
                    }
                }

                if resp.is_truncated() == Some(true) {
                    continuation_token = resp.next_continuation_token().map(|s| s.to_string());
                } else {
                    break;
                }
            }
            Ok(objects)
        })
    }

    fn get_range(
        &self,
        bucket: &str,
        key: &str,
        offset: u64,
        length: u64,
    ) -> BoxFuture<'_, anyhow::Result<Bytes>> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        Box::pin(async move {
            if length == 0 {
                return Ok(Bytes::new());
            }
            let range = range_header(offset, length);
            debug!("AWS get_object: bucket={} key={} range={}", bucket, key, range);

            let resp = self
                .client
                .get_object()
                .bucket(&bucket)
                .key(&key)
                .range(range)
                .send()
                .await
                .map_err(|e| {
                    let service_err = e.into_service_error();
                    if service_err.is_no_such_key() {
                        anyhow::anyhow!("Object not found: {bucket}/{key}")
                    } else {
                        Self::map_sdk_error("get_object", service_err)
                    }
                })?;

            let body = resp
                .body
                .collect()
                .await
                .map_err(|e| Self::map_sdk_error("get_object body", e))?
                .into_bytes();
            Ok(body)
        })
    }

    fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> BoxFuture<'_, anyhow::Result<()>> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        Box::pin(async move {
            debug!("AWS put_object: bucket={} key={} size={}", bucket, key, data.len());

            let md5 = content_md5(&data);
            self.client
                .put_object()
                .bucket(&bucket)
                .key(&key)
                .content_md5(md5)
                .body(aws_sdk_s3::primitives::ByteStream::from(data))
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("put_object", e))?;
            Ok(())
        })
    }

    fn delete_objects(&self, bucket: &str, keys: &[String]) -> BoxFuture<'_, anyhow::Result<usize>> {
        let bucket = bucket.to_string();
        let keys = keys.to_vec();
        Box::pin(async move {
            let mut deleted = 0usize;
            for batch in keys.chunks(DELETE_BATCH) {
                let objects = batch
                    .iter()
                    .map(|k| {
                        ObjectIdentifier::builder()
                            .key(k)
                            .build()
                            .map_err(|e| Self::map_sdk_error("object identifier build", e))
                    })
                    .collect::<anyhow::Result<Vec<_>>>()?;
                let delete = Delete::builder()
                    .set_objects(Some(objects))
                    .quiet(true)
                    .build()
                    .map_err(|e| Self::map_sdk_error("delete_objects build", e))?;

                debug!("AWS delete_objects: bucket={} count={}", bucket, batch.len());
                let resp = self
                    .client
                    .delete_objects()
                    .bucket(&bucket)
                    .delete(delete)
                    .send()
                    .await
                    .map_err(|e| Self::map_sdk_error("delete_objects", e))?;

                let errors = resp.errors();
                for err in errors {
                    warn!(
                        "AWS delete_objects: bucket={} key={} code={}",
                        bucket,
                        err.key().unwrap_or(""),
                        err.code().unwrap_or("")
                    );
                }
                deleted += batch.len().saturating_sub(errors.len());
            }
            Ok(deleted)
        })
    }

    fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> BoxFuture<'_, anyhow::Result<()>> {
        let copy_source = format!("{src_bucket}/{src_key}");
        let dst_bucket = dst_bucket.to_string();
        let dst_key = dst_key.to_string();
        Box::pin(async move {
            debug!("AWS copy_object: src={} dst={}/{}", copy_source, dst_bucket, dst_key);

            self.client
                .copy_object()
                .bucket(&dst_bucket)
                .key(&dst_key)
                .copy_source(&copy_source)
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("copy_object", e.into_service_error()))?;
            Ok(())
        })
    }
}
