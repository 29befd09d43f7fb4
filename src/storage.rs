use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

/// One stored file on the wire and in hand-off batches.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub body: Vec<u8>,
}

/// A directory-backed key to bytes map. The file name is the key, the
/// file body is the value, and the directory listing is authoritative;
/// there is no index or manifest.
pub struct FileStore {
    dir: PathBuf,
}

fn io_err(context: &str, err: std::io::Error) -> Error {
    Error::Storage(format!("{context}: {err}"))
}

impl FileStore {
    pub async fn open(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_err("creating store directory", e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // keys are opaque strings but they become file names, so anything
    // that would escape the directory is rejected
    fn path_for(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains('/')
            || name.contains('\\')
        {
            return Err(Error::Storage(format!("invalid key name {name:?}")));
        }
        Ok(self.dir.join(name))
    }

    pub async fn put(&self, name: &str, body: &[u8]) -> Result<()> {
        let path = self.path_for(name)?;
        fs::write(&path, body)
            .await
            .map_err(|e| io_err("writing file", e))
    }

    pub async fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(name)?;
        match fs::read(&path).await {
            Ok(body) => Ok(Some(body)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err("reading file", e)),
        }
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        let path = self.path_for(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err("removing file", e)),
        }
    }

    /// Sorted list of every key in the store.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| io_err("listing store", e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_err("listing store", e))?
        {
            let is_file = entry
                .file_type()
                .await
                .map(|t| t.is_file())
                .unwrap_or(false);
            if !is_file {
                continue;
            }
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    pub async fn clear(&self) -> Result<()> {
        for name in self.list().await? {
            self.delete(&name).await?;
        }
        Ok(())
    }

    /// Read out every entry with its body.
    pub async fn entries(&self) -> Result<Vec<FileEntry>> {
        let mut out = Vec::new();
        for name in self.list().await? {
            // a file may vanish between the listing and the read
            if let Some(body) = self.get(&name).await? {
                out.push(FileEntry { name, body });
            }
        }
        Ok(out)
    }

    pub async fn store_entries(&self, entries: &[FileEntry]) -> Result<()> {
        for entry in entries {
            self.put(&entry.name, &entry.body).await?;
        }
        Ok(())
    }

    /// Remove and return every entry whose key matches the predicate.
    /// An entry that cannot be read or removed is skipped; the caller
    /// proceeds with what was actually extracted.
    pub async fn extract_by_filter<F>(&self, pred: F) -> Result<Vec<FileEntry>>
    where
        F: Fn(&str) -> bool,
    {
        let mut extracted = Vec::new();
        for name in self.list().await? {
            if !pred(&name) {
                continue;
            }
            let body = match self.get(&name).await {
                Ok(Some(body)) => body,
                _ => continue,
            };
            if self.delete(&name).await.is_err() {
                continue;
            }
            extracted.push(FileEntry { name, body });
        }
        Ok(extracted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("primary")).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (_dir, store) = store().await;
        store.put("alpha", b"hello").await.unwrap();
        assert_eq!(store.get("alpha").await.unwrap(), Some(b"hello".to_vec()));
        assert_eq!(store.get("beta").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_put_replaces() {
        let (_dir, store) = store().await;
        store.put("alpha", b"first").await.unwrap();
        store.put("alpha", b"second").await.unwrap();
        assert_eq!(store.get("alpha").await.unwrap(), Some(b"second".to_vec()));
    }

    #[tokio::test]
    async fn test_list_and_clear() {
        let (_dir, store) = store().await;
        store.put("b", b"2").await.unwrap();
        store.put("a", b"1").await.unwrap();
        assert_eq!(store.list().await.unwrap(), vec!["a", "b"]);
        store.clear().await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let (_dir, store) = store().await;
        store.delete("nothing").await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_path_escapes() {
        let (_dir, store) = store().await;
        assert!(store.put("../evil", b"x").await.is_err());
        assert!(store.put("a/b", b"x").await.is_err());
        assert!(store.put("", b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_extract_by_filter_removes_and_returns() {
        let (_dir, store) = store().await;
        store.put("keep", b"k").await.unwrap();
        store.put("move-1", b"1").await.unwrap();
        store.put("move-2", b"2").await.unwrap();

        let extracted = store
            .extract_by_filter(|name| name.starts_with("move"))
            .await
            .unwrap();
        let names: Vec<_> = extracted.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["move-1", "move-2"]);
        assert_eq!(store.list().await.unwrap(), vec!["keep"]);
    }

    #[tokio::test]
    async fn test_entries_round_trip() {
        let (_dir, store) = store().await;
        store.put("x", b"one").await.unwrap();
        store.put("y", b"two").await.unwrap();
        let entries = store.entries().await.unwrap();
        assert_eq!(entries.len(), 2);

        let other = FileStore::open(store.dir().parent().unwrap().join("backup0"))
            .await
            .unwrap();
        other.store_entries(&entries).await.unwrap();
        assert_eq!(other.get("x").await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(other.get("y").await.unwrap(), Some(b"two".to_vec()));
    }
}
