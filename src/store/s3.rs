//! S3 multipart backend
//!
//! Each upload is an S3 multipart session. The container record (JSON object
//! `<prefix>/container.<name>`) carries the session id, the ordered part list
//! and the content type sniffed from the first part. Completion finalizes the
//! session into `<prefix>/<name>` and fixes its content type with a
//! copy-in-place, since multipart sessions cannot change it afterwards.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;

use super::{fetch_target, ContainerRecord, Continuation, StoreKind, UploadStore, UploadedPart};
use crate::error::{StoreError, StoreResult};

const CONTAINER_PREFIX: &str = "container.";
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// A part as reported by the remote listing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartSummary {
    pub part_number: i32,
    pub size: u64,
}

/// Object store operations the multipart backend relies on
#[async_trait]
pub trait ObjectClient: Send + Sync {
    /// Open a multipart session, returning its upload id
    async fn create_multipart_upload(&self, key: &str) -> StoreResult<String>;

    /// Upload one part, returning its ETag
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> StoreResult<String>;

    /// All parts received so far for a session
    async fn list_parts(&self, key: &str, upload_id: &str) -> StoreResult<Vec<PartSummary>>;

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> StoreResult<()>;

    /// Abort a session; a session that no longer exists is `NotFound`
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> StoreResult<()>;

    /// Replace an object's content type with a metadata-only copy onto itself
    async fn set_content_type(&self, key: &str, content_type: &str) -> StoreResult<()>;

    /// Store an object; with `exclusive` an existing key is `AlreadyExists`
    async fn put_object(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
        exclusive: bool,
    ) -> StoreResult<()>;

    /// Read a small object (container records) into memory
    async fn get_object(&self, key: &str) -> StoreResult<Bytes>;

    /// Stream an object into a local file
    async fn download_object(&self, key: &str, target: &Path) -> StoreResult<()>;

    /// Object size, or `None` if the key does not exist
    async fn head_object(&self, key: &str) -> StoreResult<Option<u64>>;

    async fn delete_object(&self, key: &str) -> StoreResult<()>;
}

/// Multipart object store backend
pub struct ObjectStore<C> {
    client: C,
    prefix: String,
}

impl<C: ObjectClient> ObjectStore<C> {
    pub fn new(client: C, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into().trim_end_matches('/').to_string(),
        }
    }

    #[cfg(test)]
    pub(crate) fn client(&self) -> &C {
        &self.client
    }

    fn object_key(&self, name: &str) -> String {
        format!("{}/{}", self.prefix, name)
    }

    fn container_key(&self, name: &str) -> String {
        format!("{}/{}{}", self.prefix, CONTAINER_PREFIX, name)
    }

    async fn try_container(&self, name: &str) -> StoreResult<Option<ContainerRecord>> {
        match self.container_fetch(name).await {
            Ok(record) => Ok(Some(record)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn abort(&self, name: &str, upload_id: &str) -> StoreResult<()> {
        match self.client.abort_multipart_upload(&self.object_key(name), upload_id).await {
            Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn finalize(
        &self,
        name: &str,
        upload_id: &str,
        parts: &[UploadedPart],
        content_type: Option<&str>,
    ) -> StoreResult<()> {
        let key = self.object_key(name);

        if parts.is_empty() {
            // Nothing was uploaded; S3 refuses to finalize an empty session
            self.abort(name, upload_id).await?;
            let content_type = content_type.unwrap_or(DEFAULT_CONTENT_TYPE);
            return self.client.put_object(&key, Bytes::new(), content_type, false).await;
        }

        self.client.complete_multipart_upload(&key, upload_id, parts).await?;

        if let Some(content_type) = content_type {
            self.client.set_content_type(&key, content_type).await?;
        }
        Ok(())
    }
}

/// Content type of an upload, sniffed from its first bytes
fn sniff_content_type(name: &str, data: &[u8]) -> String {
    infer::get(data)
        .map(|kind| kind.mime_type().to_string())
        .or_else(|| mime_guess::from_path(name).first().map(|m| m.essence_str().to_string()))
        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string())
}

#[async_trait]
impl<C: ObjectClient> UploadStore for ObjectStore<C> {
    fn kind(&self) -> StoreKind {
        StoreKind::ObjectStore
    }

    async fn exists(&self, name: &str) -> StoreResult<bool> {
        if self.container_exists(name).await? {
            return Ok(true);
        }
        Ok(self.client.head_object(&self.object_key(name)).await?.is_some())
    }

    async fn create(&self, name: &str, mut record: ContainerRecord) -> StoreResult<()> {
        if self.client.head_object(&self.object_key(name)).await?.is_some() {
            return Err(StoreError::AlreadyExists(name.to_string()));
        }

        let upload_id = self.client.create_multipart_upload(&self.object_key(name)).await?;
        record.continuation = Continuation::Multipart {
            upload_id: upload_id.clone(),
            parts: Vec::new(),
            content_type: None,
        };

        if let Err(e) = self.container_create(name, &record).await {
            // Another writer won the race for this name
            if let Err(abort_err) = self.client.abort_multipart_upload(&self.object_key(name), &upload_id).await {
                tracing::warn!(name = %name, error = %abort_err, "Failed to abort losing multipart session");
            }
            return Err(e);
        }

        tracing::debug!(name = %name, upload_id = %upload_id, "Opened multipart session");
        Ok(())
    }

    async fn size(&self, name: &str) -> StoreResult<u64> {
        if let Some(record) = self.try_container(name).await? {
            return match record.continuation {
                Continuation::Multipart { upload_id, .. } => {
                    let parts = self.client.list_parts(&self.object_key(name), &upload_id).await?;
                    Ok(parts.iter().map(|p| p.size).sum())
                }
                _ => Ok(0),
            };
        }

        self.client
            .head_object(&self.object_key(name))
            .await?
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn append(&self, name: &str, data: Bytes) -> StoreResult<()> {
        let mut record = self.container_fetch(name).await?;

        let Continuation::Multipart { upload_id, parts, content_type } = &mut record.continuation
        else {
            return Err(StoreError::Backend(format!("No multipart session recorded for {}", name)));
        };

        let part_number = parts.iter().map(|p| p.part_number).max().unwrap_or(0) + 1;
        if part_number == 1 {
            *content_type = Some(sniff_content_type(name, &data));
        }

        let e_tag = self
            .client
            .upload_part(&self.object_key(name), upload_id.as_str(), part_number, data)
            .await?;

        tracing::debug!(name = %name, part_number = part_number, "Uploaded part");
        parts.push(UploadedPart { part_number, e_tag });

        self.container_update(name, &record).await
    }

    async fn delete(&self, name: &str) -> StoreResult<()> {
        if let Some(ContainerRecord {
            continuation: Continuation::Multipart { upload_id, .. },
            ..
        }) = self.try_container(name).await?
        {
            self.abort(name, &upload_id).await?;
        }

        let key = self.object_key(name);
        if self.client.head_object(&key).await?.is_some() {
            self.client.delete_object(&key).await?;
        }
        Ok(())
    }

    async fn complete(&self, name: &str, record: &ContainerRecord) -> StoreResult<()> {
        let Continuation::Multipart { upload_id, parts, content_type } = &record.continuation else {
            return Err(StoreError::Backend(format!("No multipart session recorded for {}", name)));
        };

        if let Err(e) = self.finalize(name, upload_id, parts, content_type.as_deref()).await {
            tracing::warn!(name = %name, error = %e, "Finalize failed, discarding upload");
            if let Err(abort_err) = self.abort(name, upload_id).await {
                tracing::warn!(name = %name, error = %abort_err, "Failed to abort multipart session");
            }
            if let Err(delete_err) = self.container_delete(name).await {
                tracing::warn!(name = %name, error = %delete_err, "Failed to delete container record");
            }
            return Err(e);
        }

        tracing::info!(name = %name, parts = parts.len(), "Multipart upload finalized");
        Ok(())
    }

    async fn fetch(&self, name: &str, destination: &Path, remove_after: bool) -> StoreResult<PathBuf> {
        let key = self.object_key(name);
        let target = fetch_target(destination, name).await?;
        self.client.download_object(&key, &target).await?;

        if remove_after {
            self.client.delete_object(&key).await?;
            self.container_delete(name).await?;
        }
        Ok(target)
    }

    fn is_reserved(&self, name: &str) -> bool {
        name.starts_with(CONTAINER_PREFIX)
    }

    async fn container_exists(&self, name: &str) -> StoreResult<bool> {
        Ok(self.client.head_object(&self.container_key(name)).await?.is_some())
    }

    async fn container_create(&self, name: &str, record: &ContainerRecord) -> StoreResult<()> {
        let json = serde_json::to_vec(record)?;
        self.client
            .put_object(&self.container_key(name), Bytes::from(json), "application/json", true)
            .await
            .map_err(|e| match e {
                StoreError::AlreadyExists(_) => StoreError::AlreadyExists(name.to_string()),
                other => other,
            })
    }

    async fn container_update(&self, name: &str, record: &ContainerRecord) -> StoreResult<()> {
        let json = serde_json::to_vec(record)?;
        self.client
            .put_object(&self.container_key(name), Bytes::from(json), "application/json", false)
            .await
    }

    async fn container_fetch(&self, name: &str) -> StoreResult<ContainerRecord> {
        let json = self.client.get_object(&self.container_key(name)).await?;
        Ok(serde_json::from_slice(&json)?)
    }

    async fn container_delete(&self, name: &str) -> StoreResult<()> {
        match self.client.delete_object(&self.container_key(name)).await {
            Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Session {
        key: String,
        parts: HashMap<i32, Bytes>,
    }

    #[derive(Default)]
    struct Object {
        data: Bytes,
        content_type: String,
    }

    /// In-memory stand-in for an S3 bucket
    #[derive(Default)]
    pub(crate) struct MemoryObjectClient {
        objects: Mutex<HashMap<String, Object>>,
        sessions: Mutex<HashMap<String, Session>>,
        next_id: AtomicU32,
        pub(crate) fail_complete: AtomicBool,
        pub(crate) completed: Mutex<Vec<Vec<UploadedPart>>>,
    }

    impl MemoryObjectClient {
        pub(crate) fn object(&self, key: &str) -> Option<(Bytes, String)> {
            self.objects
                .lock()
                .get(key)
                .map(|o| (o.data.clone(), o.content_type.clone()))
        }

        pub(crate) fn open_sessions(&self) -> usize {
            self.sessions.lock().len()
        }
    }

    fn etag(data: &[u8]) -> String {
        format!("\"{:08x}\"", crc32fast::hash(data))
    }

    #[async_trait]
    impl ObjectClient for MemoryObjectClient {
        async fn create_multipart_upload(&self, key: &str) -> StoreResult<String> {
            let id = format!("upload-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            self.sessions.lock().insert(
                id.clone(),
                Session { key: key.to_string(), parts: HashMap::new() },
            );
            Ok(id)
        }

        async fn upload_part(
            &self,
            key: &str,
            upload_id: &str,
            part_number: i32,
            data: Bytes,
        ) -> StoreResult<String> {
            let mut sessions = self.sessions.lock();
            let session = sessions
                .get_mut(upload_id)
                .filter(|s| s.key == key)
                .ok_or_else(|| StoreError::NotFound(upload_id.to_string()))?;
            let tag = etag(&data);
            session.parts.insert(part_number, data);
            Ok(tag)
        }

        async fn list_parts(&self, _key: &str, upload_id: &str) -> StoreResult<Vec<PartSummary>> {
            let sessions = self.sessions.lock();
            let session = sessions
                .get(upload_id)
                .ok_or_else(|| StoreError::NotFound(upload_id.to_string()))?;
            let mut parts: Vec<PartSummary> = session
                .parts
                .iter()
                .map(|(n, d)| PartSummary { part_number: *n, size: d.len() as u64 })
                .collect();
            parts.sort_by_key(|p| p.part_number);
            Ok(parts)
        }

        async fn complete_multipart_upload(
            &self,
            key: &str,
            upload_id: &str,
            parts: &[UploadedPart],
        ) -> StoreResult<()> {
            if self.fail_complete.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("InvalidPart".to_string()));
            }

            let session = self
                .sessions
                .lock()
                .remove(upload_id)
                .ok_or_else(|| StoreError::NotFound(upload_id.to_string()))?;

            let mut data = Vec::new();
            for (i, part) in parts.iter().enumerate() {
                assert_eq!(part.part_number, i as i32 + 1, "parts must be contiguous");
                let bytes = &session.parts[&part.part_number];
                assert_eq!(part.e_tag, etag(bytes));
                data.extend_from_slice(bytes);
            }

            self.completed.lock().push(parts.to_vec());
            self.objects.lock().insert(
                key.to_string(),
                Object { data: Bytes::from(data), content_type: "binary/octet-stream".into() },
            );
            Ok(())
        }

        async fn abort_multipart_upload(&self, _key: &str, upload_id: &str) -> StoreResult<()> {
            self.sessions
                .lock()
                .remove(upload_id)
                .map(|_| ())
                .ok_or_else(|| StoreError::NotFound(upload_id.to_string()))
        }

        async fn set_content_type(&self, key: &str, content_type: &str) -> StoreResult<()> {
            let mut objects = self.objects.lock();
            let object = objects
                .get_mut(key)
                .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            object.content_type = content_type.to_string();
            Ok(())
        }

        async fn put_object(
            &self,
            key: &str,
            data: Bytes,
            content_type: &str,
            exclusive: bool,
        ) -> StoreResult<()> {
            let mut objects = self.objects.lock();
            if exclusive && objects.contains_key(key) {
                return Err(StoreError::AlreadyExists(key.to_string()));
            }
            objects.insert(
                key.to_string(),
                Object { data, content_type: content_type.to_string() },
            );
            Ok(())
        }

        async fn get_object(&self, key: &str) -> StoreResult<Bytes> {
            self.objects
                .lock()
                .get(key)
                .map(|o| o.data.clone())
                .ok_or_else(|| StoreError::NotFound(key.to_string()))
        }

        async fn download_object(&self, key: &str, target: &Path) -> StoreResult<()> {
            let data = self.get_object(key).await?;
            tokio::fs::write(target, &data).await?;
            Ok(())
        }

        async fn head_object(&self, key: &str) -> StoreResult<Option<u64>> {
            Ok(self.objects.lock().get(key).map(|o| o.data.len() as u64))
        }

        async fn delete_object(&self, key: &str) -> StoreResult<()> {
            self.objects.lock().remove(key);
            Ok(())
        }
    }

    const PNG_HEADER: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D];

    fn store() -> ObjectStore<MemoryObjectClient> {
        ObjectStore::new(MemoryObjectClient::default(), "tus-temp/")
    }

    #[tokio::test]
    async fn test_create_opens_session() {
        let store = store();
        store.create("a.png", ContainerRecord::new(4, None)).await.unwrap();

        assert!(store.exists("a.png").await.unwrap());
        assert_eq!(store.size("a.png").await.unwrap(), 0);
        assert_eq!(store.client.open_sessions(), 1);

        let record = store.container_fetch("a.png").await.unwrap();
        assert!(matches!(
            record.continuation,
            Continuation::Multipart { ref upload_id, ref parts, .. } if upload_id == "upload-0" && parts.is_empty()
        ));
        assert!(store.client.object("tus-temp/container.a.png").is_some());
    }

    #[tokio::test]
    async fn test_second_create_conflicts() {
        let store = store();
        store.create("a", ContainerRecord::new(4, None)).await.unwrap();
        let again = store.create("a", ContainerRecord::new(4, None)).await;
        assert!(matches!(again, Err(StoreError::AlreadyExists(_))));
        // The losing session is not left dangling
        assert_eq!(store.client.open_sessions(), 1);
    }

    #[tokio::test]
    async fn test_parts_are_numbered_in_order() {
        let store = store();
        store.create("a.png", ContainerRecord::new(20, None)).await.unwrap();

        let mut first = PNG_HEADER.to_vec();
        first.resize(12, 0);
        store.append("a.png", Bytes::from(first)).await.unwrap();
        store.append("a.png", Bytes::from_static(b"12345678")).await.unwrap();

        assert_eq!(store.size("a.png").await.unwrap(), 20);

        let record = store.container_fetch("a.png").await.unwrap();
        let Continuation::Multipart { parts, content_type, .. } = record.continuation else {
            panic!("expected multipart continuation");
        };
        assert_eq!(parts.iter().map(|p| p.part_number).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(content_type.as_deref(), Some("image/png"));
    }

    #[tokio::test]
    async fn test_complete_sets_content_type() {
        let store = store();
        store.create("a.png", ContainerRecord::new(12, None)).await.unwrap();
        store.append("a.png", Bytes::from_static(PNG_HEADER)).await.unwrap();

        let record = store.container_fetch("a.png").await.unwrap();
        store.container_delete("a.png").await.unwrap();
        store.complete("a.png", &record).await.unwrap();

        let (data, content_type) = store.client.object("tus-temp/a.png").unwrap();
        assert_eq!(&data[..], PNG_HEADER);
        assert_eq!(content_type, "image/png");
        assert_eq!(store.client.completed.lock().len(), 1);

        // Finalized uploads still report their size and existence
        assert!(store.exists("a.png").await.unwrap());
        assert_eq!(store.size("a.png").await.unwrap(), 12);
    }

    #[tokio::test]
    async fn test_complete_without_parts_stores_empty_object() {
        let store = store();
        store.create("empty.txt", ContainerRecord::new(0, None)).await.unwrap();

        let record = store.container_fetch("empty.txt").await.unwrap();
        store.container_delete("empty.txt").await.unwrap();
        store.complete("empty.txt", &record).await.unwrap();

        let (data, _) = store.client.object("tus-temp/empty.txt").unwrap();
        assert!(data.is_empty());
        assert_eq!(store.client.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_failed_finalize_aborts() {
        let store = store();
        store.create("a", ContainerRecord::new(3, None)).await.unwrap();
        store.append("a", Bytes::from_static(b"abc")).await.unwrap();
        store.client.fail_complete.store(true, Ordering::SeqCst);

        let record = store.container_fetch("a").await.unwrap();
        assert!(store.complete("a", &record).await.is_err());

        assert_eq!(store.client.open_sessions(), 0);
        assert!(!store.container_exists("a").await.unwrap());
        assert!(!store.exists("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_tolerates_missing_session() {
        let store = store();
        store.create("a", ContainerRecord::new(3, None)).await.unwrap();
        store.delete("a").await.unwrap();
        assert_eq!(store.client.open_sessions(), 0);

        // Session already aborted: still fine
        store.delete("a").await.unwrap();
        store.container_delete("a").await.unwrap();
        assert!(!store.exists("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_no_cross_check() {
        let store = store();
        assert!(!store.supports_cross_check());
        assert!(store.cross_check_algorithms().is_empty());
    }

    #[test]
    fn test_sniff_content_type() {
        assert_eq!(sniff_content_type("x", PNG_HEADER), "image/png");
        assert_eq!(sniff_content_type("notes.txt", b"plain words"), "text/plain");
        assert_eq!(sniff_content_type("blob", b"\x00\x01"), DEFAULT_CONTENT_TYPE);
    }
}
