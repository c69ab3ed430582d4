//! Filesystem object store.
//!
//! Objects live under `<root>/objects/<key>`. A multipart upload is a private
//! staging directory `<root>/staging/<upload_id>/` holding one file per chunk
//! index; completion concatenates them in part order.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::debug;

use super::{BackendKind, ByteStream, ObjectMeta, ObjectStore, PartTag, UploadHandle};
use crate::error::{StorageError, StorageResult};

pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn objects_dir(&self) -> PathBuf {
        self.root.join("objects")
    }

    fn object_path(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(self.objects_dir().join(key))
    }

    fn staging_dir(&self, upload_id: &str) -> StorageResult<PathBuf> {
        if upload_id.is_empty()
            || !upload_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(StorageError::InvalidRequest {
                message: format!("invalid upload id {upload_id:?}"),
            });
        }
        Ok(self.root.join("staging").join(upload_id))
    }

    fn part_tag(part_number: u32, size: u64) -> PartTag {
        PartTag {
            part_number,
            etag: format!("{part_number}-{size}"),
            size,
        }
    }

    /// Write `data` to `path` through a temporary sibling and rename it into place.
    async fn write_atomic(path: &Path, data: &[u8]) -> StorageResult<()> {
        let parent = path.parent().ok_or_else(|| StorageError::InvalidRequest {
            message: format!("no parent directory for {}", path.display()),
        })?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(StorageError::Io)?;

        let tmp = temp_sibling(path);
        let written = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(data).await?;
            file.sync_all().await
        }
        .await
        .map_err(StorageError::Io);

        commit_temp(&tmp, path, written).await
    }

    /// Remove empty directories between `path` and the objects root.
    async fn prune_empty_parents(&self, path: &Path) {
        let objects = self.objects_dir();
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir == objects || !dir.starts_with(&objects) {
                break;
            }
            if tokio::fs::remove_dir(dir).await.is_err() {
                break;
            }
            current = dir.parent();
        }
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn put(&self, key: &str, data: Bytes, _content_type: &str) -> StorageResult<String> {
        let path = self.object_path(key)?;
        Self::write_atomic(&path, &data).await?;
        debug!(key, size = data.len(), "Stored object");
        Ok(key.to_string())
    }

    async fn get(&self, key: &str) -> StorageResult<ByteStream> {
        let path = self.object_path(key)?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| not_found_or_io(key, e))?;
        Ok(ReaderStream::new(file)
            .map(|chunk| chunk.map_err(StorageError::Io))
            .boxed())
    }

    async fn stat(&self, key: &str) -> StorageResult<Option<ObjectMeta>> {
        let path = self.object_path(key)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(ObjectMeta {
                key: key.to_string(),
                size: meta.len(),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        let path = self.object_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                self.prune_empty_parents(&path).await;
                debug!(key, "Removed object");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<ObjectMeta>> {
        let objects = self.objects_dir();
        let mut results = Vec::new();
        let mut pending = vec![objects.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::Io(e)),
            };
            while let Some(entry) = entries.next_entry().await.map_err(StorageError::Io)? {
                let path = entry.path();
                let file_type = entry.file_type().await.map_err(StorageError::Io)?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&objects) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if is_temp_name(&key) || !key.starts_with(prefix) {
                    continue;
                }
                let size = entry.metadata().await.map_err(StorageError::Io)?.len();
                results.push(ObjectMeta { key, size });
            }
        }

        results.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(results)
    }

    async fn create_multipart(&self, key: &str, _content_type: &str) -> StorageResult<UploadHandle> {
        validate_key(key)?;
        let upload_id = uuid::Uuid::new_v4().to_string();
        let dir = self.staging_dir(&upload_id)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(StorageError::Io)?;
        debug!(key, upload_id = %upload_id, "Opened local staging directory");
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
        if part_number == 0 {
            return Err(StorageError::InvalidRequest {
                message: "part numbers start at 1".to_string(),
            });
        }
        let dir = self.staging_dir(&handle.upload_id)?;
        if !tokio::fs::try_exists(&dir).await.map_err(StorageError::Io)? {
            return Err(StorageError::NotFound {
                key: format!("upload {}", handle.upload_id),
            });
        }

        let path = dir.join((part_number - 1).to_string());
        Self::write_atomic(&path, &data).await?;
        Ok(Self::part_tag(part_number, data.len() as u64))
    }

    async fn list_parts(&self, handle: &UploadHandle) -> StorageResult<Vec<PartTag>> {
        let dir = self.staging_dir(&handle.upload_id)?;
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| not_found_or_io(&format!("upload {}", handle.upload_id), e))?;

        let mut parts = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(StorageError::Io)? {
            let name = entry.file_name();
            let Some(index) = name.to_str().and_then(|n| n.parse::<u32>().ok()) else {
                continue;
            };
            let size = entry.metadata().await.map_err(StorageError::Io)?.len();
            parts.push(Self::part_tag(index + 1, size));
        }

        parts.sort_by_key(|p| p.part_number);
        Ok(parts)
    }

    async fn complete_multipart(
        &self,
        handle: &UploadHandle,
        parts: &[PartTag],
    ) -> StorageResult<String> {
        let dir = self.staging_dir(&handle.upload_id)?;
        let target = self.object_path(&handle.key)?;
        let parent = target.parent().ok_or_else(|| StorageError::InvalidRequest {
            message: format!("no parent directory for {}", handle.key),
        })?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(StorageError::Io)?;

        let tmp = temp_sibling(&target);
        let written = async {
            let mut output = tokio::fs::File::create(&tmp)
                .await
                .map_err(StorageError::Io)?;
            for part in parts {
                let part_path = dir.join(part.part_number.saturating_sub(1).to_string());
                let mut input = tokio::fs::File::open(&part_path).await.map_err(|e| {
                    not_found_or_io(
                        &format!("part {} of upload {}", part.part_number, handle.upload_id),
                        e,
                    )
                })?;
                tokio::io::copy(&mut input, &mut output)
                    .await
                    .map_err(StorageError::Io)?;
            }
            output.sync_all().await.map_err(StorageError::Io)
        }
        .await;

        // Parts stay staged on failure so completion can be retried
        commit_temp(&tmp, &target, written).await?;
        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(StorageError::Io)?;

        debug!(key = %handle.key, parts = parts.len(), "Assembled multipart upload");
        Ok(handle.key.clone())
    }

    async fn abort_multipart(&self, handle: &UploadHandle) -> StorageResult<()> {
        let dir = self.staging_dir(&handle.upload_id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

/// Keys are relative, `/`-separated and may not escape the objects directory.
fn validate_key(key: &str) -> StorageResult<()> {
    let path = Path::new(key);
    let well_formed = !key.is_empty()
        && !key.contains('\\')
        && !is_temp_name(key)
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if well_formed {
        Ok(())
    } else {
        Err(StorageError::InvalidRequest {
            message: format!("invalid object key {key:?}"),
        })
    }
}

const TEMP_MARKER: &str = ".docpipe-tmp-";

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{name}{TEMP_MARKER}{}", uuid::Uuid::new_v4()))
}

/// Rename a fully written temporary file into place, or remove it if any step failed.
async fn commit_temp(tmp: &Path, target: &Path, written: StorageResult<()>) -> StorageResult<()> {
    let result = match written {
        Ok(()) => tokio::fs::rename(tmp, target)
            .await
            .map_err(StorageError::Io),
        Err(e) => Err(e),
    };
    if result.is_err() {
        let _ = tokio::fs::remove_file(tmp).await;
    }
    result
}

fn is_temp_name(key: &str) -> bool {
    key.contains(TEMP_MARKER)
}

fn not_found_or_io(key: &str, e: std::io::Error) -> StorageError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound {
            key: key.to_string(),
        }
    } else {
        StorageError::Io(e)
    }
}
