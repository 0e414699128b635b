use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlobStoreError {
    #[error("blob not found: {0}")]
    NotFound(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Content-addressed put/get/list/delete of opaque bytes under a key
/// prefix (C1). `put` is last-write-wins; no conditional writes are
/// required by the core.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: Option<&str>,
    ) -> Result<(), BlobStoreError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobStoreError>;

    async fn delete(&self, key: &str) -> Result<(), BlobStoreError>;

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BlobStoreError>;
}

struct StoredBlob {
    bytes: Vec<u8>,
    #[allow(dead_code)]
    content_type: Option<String>,
}

/// In-memory `BlobStore`, used by tests and by the reindexer's dry-run
/// mode.
#[derive(Default)]
pub struct InMemoryBlobStore {
    objects: DashMap<String, StoredBlob>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: Option<&str>,
    ) -> Result<(), BlobStoreError> {
        self.objects.insert(
            key.to_string(),
            StoredBlob {
                bytes: bytes.to_vec(),
                content_type: content_type.map(|s| s.to_string()),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobStoreError> {
        self.objects
            .get(key)
            .map(|entry| entry.bytes.clone())
            .ok_or_else(|| BlobStoreError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), BlobStoreError> {
        self.objects.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BlobStoreError> {
        Ok(self
            .objects
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|key| key.starts_with(prefix))
            .collect())
    }
}

/// S3-backed `BlobStore`.
pub struct S3BlobStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3BlobStore {
    pub fn new(client: aws_sdk_s3::Client, bucket: String) -> Self {
        Self { client, bucket }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: Option<&str>,
    ) -> Result<(), BlobStoreError> {
        let mut req = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(bytes.to_vec().into());
        if let Some(content_type) = content_type {
            req = req.content_type(content_type);
        }
        req.send()
            .await
            .map_err(|e| BlobStoreError::Transport(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobStoreError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("NoSuchKey") {
                    BlobStoreError::NotFound(key.to_string())
                } else {
                    BlobStoreError::Transport(msg)
                }
            })?;
        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| BlobStoreError::Transport(e.to_string()))?;
        Ok(bytes.into_bytes().to_vec())
    }

    async fn delete(&self, key: &str) -> Result<(), BlobStoreError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| BlobStoreError::Transport(e.to_string()))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BlobStoreError> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(token) = &continuation {
                req = req.continuation_token(token);
            }
            let output = req
                .send()
                .await
                .map_err(|e| BlobStoreError::Transport(e.to_string()))?;
            for obj in output.contents() {
                if let Some(key) = obj.key() {
                    keys.push(key.to_string());
                }
            }
            if output.is_truncated().unwrap_or(false) {
                continuation = output.next_continuation_token().map(|s| s.to_string());
            } else {
                break;
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_r::test(tokio::test)]
    async fn put_then_get_round_trips() {
        let store = InMemoryBlobStore::new();
        store.put("repo/wf/hello.py", b"content", None).await.unwrap();
        let bytes = store.get("repo/wf/hello.py").await.unwrap();
        assert_eq!(bytes, b"content");
    }

    #[test_r::test(tokio::test)]
    async fn get_missing_is_not_found() {
        let store = InMemoryBlobStore::new();
        let err = store.get("missing").await.unwrap_err();
        assert!(matches!(err, BlobStoreError::NotFound(_)));
    }

    #[test_r::test(tokio::test)]
    async fn list_filters_by_prefix() {
        let store = InMemoryBlobStore::new();
        store.put("repo/a.py", b"x", None).await.unwrap();
        store.put("repo/b.py", b"y", None).await.unwrap();
        store.put("other/c.py", b"z", None).await.unwrap();
        let mut keys = store.list("repo/").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["repo/a.py".to_string(), "repo/b.py".to_string()]);
    }
}
