//! Archive upload and remote retention pruning against S3-compatible
//! object storage.

use std::path::Path;

use anyhow::{Context, Result};
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use tracing::info;

use kubexporter_config::{ExportConfig, S3Config};

use crate::archive::archive_name_pattern;

fn build_store(s3: &S3Config) -> Result<impl ObjectStore> {
    let endpoint = if s3.endpoint.contains("://") {
        s3.endpoint.clone()
    } else if s3.secure {
        format!("https://{}", s3.endpoint)
    } else {
        format!("http://{}", s3.endpoint)
    };

    let mut builder = AmazonS3Builder::new()
        .with_bucket_name(&s3.bucket)
        .with_region("us-east-1")
        .with_endpoint(endpoint)
        .with_allow_http(!s3.secure)
        .with_virtual_hosted_style_request(false);
    if !s3.access_key_id.is_empty() {
        builder = builder
            .with_access_key_id(&s3.access_key_id)
            .with_secret_access_key(&s3.secret_access_key);
    }
    if !s3.token.is_empty() {
        builder = builder.with_token(&s3.token);
    }
    builder.build().context("building object store client")
}

/// Upload the fresh archive, then prune remote archives older than the
/// retention window by object timestamp. Returns the deleted object keys.
pub async fn upload_archive(
    config: &ExportConfig,
    s3: &S3Config,
    archive: &Path,
) -> Result<Vec<String>> {
    let store = build_store(s3)?;

    let key = ObjectPath::from(
        archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    );
    let data = tokio::fs::read(archive)
        .await
        .with_context(|| format!("reading {}", archive.display()))?;
    store
        .put(&key, data.into())
        .await
        .with_context(|| format!("uploading {key}"))?;
    info!(bucket = %s3.bucket, object = %key, "archive uploaded");

    let mut deleted = Vec::new();
    if config.archive_retention_days > 0 {
        let pattern = archive_name_pattern(config)?;
        let cutoff =
            chrono::Utc::now() - chrono::Duration::days(i64::from(config.archive_retention_days));
        let mut listing = store.list(None);
        while let Some(object) = listing.try_next().await.context("listing bucket")? {
            let name = object
                .location
                .filename()
                .map(str::to_string)
                .unwrap_or_default();
            if pattern.is_match(&name) && object.last_modified < cutoff {
                store
                    .delete(&object.location)
                    .await
                    .with_context(|| format!("deleting {}", object.location))?;
                info!(object = %object.location, "pruned expired remote archive");
                deleted.push(object.location.to_string());
            }
        }
    }
    Ok(deleted)
}
