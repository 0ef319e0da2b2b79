// Filesystem-backed object store.
//
// Objects are files under a root directory. Writes go to a temp file
// first; `put` renames it into place and `put_if_absent` hard-links it,
// which fails atomically when the target already exists.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::{ObjectMeta, ObjectStore, StorageError};

const TEMP_MARKER: &str = ".tmp-";

#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| StorageError::io(&root.display().to_string(), e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, key: &str) -> PathBuf {
        key.split('/')
            .filter(|part| !part.is_empty())
            .fold(self.root.clone(), |path, part| path.join(part))
    }

    fn key_of(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<_> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }

    /// Write `data` to a fresh temp file next to `key` and return its path.
    async fn write_temp(&self, key: &str, data: &[u8]) -> Result<PathBuf, StorageError> {
        let target = self.path_of(key);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(key, e))?;
        }

        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = target.with_file_name(format!("{file_name}{TEMP_MARKER}{}", Uuid::new_v4()));

        let mut file = fs::File::create(&temp)
            .await
            .map_err(|e| StorageError::io(key, e))?;
        file.write_all(data)
            .await
            .map_err(|e| StorageError::io(key, e))?;
        file.sync_all()
            .await
            .map_err(|e| StorageError::io(key, e))?;
        Ok(temp)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
        let temp = self.write_temp(key, &data).await?;
        fs::rename(&temp, self.path_of(key))
            .await
            .map_err(|e| StorageError::io(key, e))
    }

    async fn put_if_absent(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
        let temp = self.write_temp(key, &data).await?;
        let linked = fs::hard_link(&temp, self.path_of(key)).await;
        let _ = fs::remove_file(&temp).await;
        linked.map_err(|e| StorageError::io(key, e))
    }

    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        fs::read(self.path_of(key))
            .await
            .map(Bytes::from)
            .map_err(|e| StorageError::io(key, e))
    }

    async fn head(&self, key: &str) -> Result<ObjectMeta, StorageError> {
        let meta = fs::metadata(self.path_of(key))
            .await
            .map_err(|e| StorageError::io(key, e))?;
        if !meta.is_file() {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Ok(ObjectMeta {
            key: key.to_string(),
            size: meta.len(),
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, StorageError> {
        // Walk from the deepest directory fully named by the prefix.
        let dir_part = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let mut pending = vec![self.path_of(dir_part)];
        let mut found = Vec::new();

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::io(prefix, e)),
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StorageError::io(prefix, e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| StorageError::io(prefix, e))?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Some(key) = self.key_of(&path) else { continue };
                if key.contains(TEMP_MARKER) || !key.starts_with(prefix) {
                    continue;
                }
                let size = entry
                    .metadata()
                    .await
                    .map_err(|e| StorageError::io(&key, e))?
                    .len();
                found.push(ObjectMeta { key, size });
            }
        }

        found.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(found)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path_of(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(key, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn put_get_roundtrip_through_nested_dirs() {
        let dir = tempdir().unwrap();
        let store = LocalObjectStore::open(dir.path()).await.unwrap();

        store
            .put("minio/api_logs/data/a.parquet", Bytes::from_static(b"abc"))
            .await
            .unwrap();

        assert_eq!(
            store.get("minio/api_logs/data/a.parquet").await.unwrap(),
            Bytes::from_static(b"abc")
        );
        assert_eq!(store.head("minio/api_logs/data/a.parquet").await.unwrap().size, 3);
    }

    #[tokio::test]
    async fn put_if_absent_is_exclusive() {
        let dir = tempdir().unwrap();
        let store = LocalObjectStore::open(dir.path()).await.unwrap();

        store.put_if_absent("m/v1", Bytes::from_static(b"first")).await.unwrap();
        let err = store
            .put_if_absent("m/v1", Bytes::from_static(b"second"))
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::AlreadyExists(_)));
        assert_eq!(store.get("m/v1").await.unwrap(), Bytes::from_static(b"first"));
        // no temp files left behind
        assert_eq!(store.list("m/").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_recurses_and_filters_by_prefix() {
        let dir = tempdir().unwrap();
        let store = LocalObjectStore::open(dir.path()).await.unwrap();
        for key in [
            "t/.meta/pending/n1/1.json",
            "t/.meta/pending/n2/1.json",
            "t/.meta/leader/1.json",
            "t/data/x.parquet",
        ] {
            store.put(key, Bytes::from_static(b"{}")).await.unwrap();
        }

        let keys: Vec<_> = store
            .list("t/.meta/pending/")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.key)
            .collect();
        assert_eq!(
            keys,
            vec!["t/.meta/pending/n1/1.json", "t/.meta/pending/n2/1.json"]
        );
        assert!(store.list("missing/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_missing_key_is_ok() {
        let dir = tempdir().unwrap();
        let store = LocalObjectStore::open(dir.path()).await.unwrap();
        store.delete("nothing/here").await.unwrap();
    }
}
