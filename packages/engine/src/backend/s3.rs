//! The primary object-store backend: a real [`ObjectStoreBackend`] on top
//! of `aws-sdk-s3`, backing the blob side-storage layer's cache-miss path.
//! [`ObjectMetadata`] travels as S3 user metadata (`x-amz-meta-*`) rather
//! than folded into the object body, so a `head` call never needs to fetch
//! the (possibly large, possibly gzipped) blob itself.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;

use crate::backend::{ObjectMetadata, ObjectStoreBackend};
use crate::config::S3Config;
use crate::{Error, Result};

const META_RESOURCE_TYPE: &str = "resource-type";
const META_RESOURCE_ID: &str = "resource-id";
const META_FIELD_NAME: &str = "field-name";
const META_COMPRESSED: &str = "compressed";
const META_VERSION: &str = "version";

fn metadata_to_map(metadata: &ObjectMetadata) -> HashMap<String, String> {
    let mut map = HashMap::new();
    map.insert(META_RESOURCE_TYPE.to_string(), metadata.resource_type.clone());
    map.insert(META_RESOURCE_ID.to_string(), metadata.resource_id.clone());
    map.insert(META_FIELD_NAME.to_string(), metadata.field_name.clone());
    map.insert(META_COMPRESSED.to_string(), metadata.compressed.to_string());
    if let Some(version) = metadata.version {
        map.insert(META_VERSION.to_string(), version.to_string());
    }
    map
}

fn map_to_metadata(map: Option<&HashMap<String, String>>, content_type: Option<String>) -> ObjectMetadata {
    let get = |k: &str| map.and_then(|m| m.get(k)).cloned();
    ObjectMetadata {
        resource_type: get(META_RESOURCE_TYPE).unwrap_or_default(),
        resource_id: get(META_RESOURCE_ID).unwrap_or_default(),
        field_name: get(META_FIELD_NAME).unwrap_or_default(),
        compressed: get(META_COMPRESSED).as_deref() == Some("true"),
        version: get(META_VERSION).and_then(|v| v.parse().ok()),
        content_type,
    }
}

/// The real S3-backed object store (`feature = "s3"`).
pub struct S3ObjectStoreBackend {
    client: Client,
    bucket: String,
}

impl S3ObjectStoreBackend {
    #[must_use]
    pub fn new(client: Client, config: &S3Config) -> Self {
        Self { client, bucket: config.bucket.clone() }
    }
}

#[async_trait]
impl ObjectStoreBackend for S3ObjectStoreBackend {
    async fn put(&self, key: &str, body: Vec<u8>, metadata: ObjectMetadata) -> Result<()> {
        let mut request = self
            .client
            .put_object()
            .bucket(self.bucket.clone())
            .key(key)
            .body(ByteStream::from(body))
            .set_metadata(Some(metadata_to_map(&metadata)));
        if let Some(content_type) = &metadata.content_type {
            request = request.content_type(content_type.clone());
        }
        request.send().await.map_err(Error::backend)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, ObjectMetadata)>> {
        let output = match self.client.get_object().bucket(self.bucket.clone()).key(key).send().await {
            Ok(output) => output,
            Err(err) if is_not_found(&err) => return Ok(None),
            Err(err) => return Err(Error::backend(err)),
        };
        let content_type = output.content_type.clone();
        let metadata = map_to_metadata(output.metadata.as_ref(), content_type);
        let body = output.body.collect().await.map_err(Error::backend)?.into_bytes().to_vec();
        Ok(Some((body, metadata)))
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMetadata>> {
        let output = match self.client.head_object().bucket(self.bucket.clone()).key(key).send().await {
            Ok(output) => output,
            Err(err) if is_not_found(&err) => return Ok(None),
            Err(err) => return Err(Error::backend(err)),
        };
        Ok(Some(map_to_metadata(output.metadata.as_ref(), output.content_type.clone())))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client.delete_object().bucket(self.bucket.clone()).key(key).send().await.map_err(Error::backend)?;
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token = None;
        loop {
            let mut request = self.client.list_objects_v2().bucket(self.bucket.clone()).prefix(prefix);
            if let Some(token) = &continuation_token {
                request = request.continuation_token(token.clone());
            }
            let output = request.send().await.map_err(Error::backend)?;
            for object in output.contents.unwrap_or_default() {
                if let Some(key) = object.key {
                    keys.push(key);
                }
            }
            continuation_token = output.next_continuation_token;
            if continuation_token.is_none() {
                break;
            }
        }
        Ok(keys)
    }

    async fn copy(&self, source_key: &str, dest_key: &str) -> Result<()> {
        let source = format!("{}/{}", self.bucket, urlencode_copy_source(source_key));
        self.client
            .copy_object()
            .bucket(self.bucket.clone())
            .copy_source(source)
            .key(dest_key)
            .metadata_directive(aws_sdk_s3::types::MetadataDirective::Copy)
            .send()
            .await
            .map_err(Error::backend)?;
        Ok(())
    }
}

/// S3's `copy_source` parameter requires percent-encoding of everything but
/// the path separators -- server-side copy relies on this to avoid
/// misinterpreting `/`-bearing blob keys as literal slashes being escaped.
fn urlencode_copy_source(key: &str) -> String {
    key.split('/')
        .map(|segment| {
            segment
                .bytes()
                .map(|b| {
                    if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
                        (b as char).to_string()
                    } else {
                        format!("%{b:02X}")
                    }
                })
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn is_not_found(err: &aws_sdk_s3::error::SdkError<impl std::error::Error + Send + Sync + 'static>) -> bool {
    err.to_string().contains("NotFound") || err.to_string().contains("NoSuchKey")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_roundtrips_through_the_user_metadata_map() {
        let metadata = ObjectMetadata {
            resource_type: "Doc".to_string(),
            resource_id: "01ABC".to_string(),
            field_name: "attachment".to_string(),
            compressed: true,
            version: Some(3),
            content_type: Some("application/octet-stream".to_string()),
        };
        let map = metadata_to_map(&metadata);
        let back = map_to_metadata(Some(&map), metadata.content_type.clone());
        assert_eq!(back.resource_type, metadata.resource_type);
        assert_eq!(back.resource_id, metadata.resource_id);
        assert_eq!(back.field_name, metadata.field_name);
        assert_eq!(back.compressed, metadata.compressed);
        assert_eq!(back.version, metadata.version);
    }

    #[test]
    fn missing_version_roundtrips_as_none() {
        let metadata = ObjectMetadata {
            resource_type: "Doc".to_string(),
            resource_id: "01ABC".to_string(),
            field_name: "attachment".to_string(),
            compressed: false,
            version: None,
            content_type: None,
        };
        let map = metadata_to_map(&metadata);
        assert!(!map.contains_key(META_VERSION));
        let back = map_to_metadata(Some(&map), None);
        assert!(back.version.is_none());
    }

    #[test]
    fn copy_source_escapes_reserved_characters_per_segment() {
        let encoded = urlencode_copy_source("Doc/01 ABC/v2/attachment field");
        assert_eq!(encoded, "Doc/01%20ABC/v2/attachment%20field");
    }
}
