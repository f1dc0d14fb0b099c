//! A typed record list persisted as one JSON file.
//!
//! All access goes through a single reader/writer lock. Writers get a
//! [`WriteHandle`] and every mutation is flushed to disk before the call
//! returns; dropping (or closing) the handle releases the lock.

use std::path::{Path, PathBuf};

use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Classify, ErrorKind};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store io failed at {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode store {path}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode store")]
    Encode(#[source] serde_json::Error),
}

impl Classify for StoreError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::IoFailure
    }
}

#[derive(Debug)]
pub struct Store<M> {
    path: PathBuf,
    rows: RwLock<Vec<M>>,
}

impl<M> Store<M>
where
    M: Serialize + DeserializeOwned + Clone + Send + Sync,
{
    /// Loads `path`, or starts empty when the file does not exist yet.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let rows = match tokio::fs::read(&path).await {
            Ok(buf) if buf.iter().all(u8::is_ascii_whitespace) => Vec::new(),
            Ok(buf) => serde_json::from_slice(&buf).map_err(|source| StoreError::Decode {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        Ok(Self {
            path,
            rows: RwLock::new(rows),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write_handle(&self) -> WriteHandle<'_, M> {
        WriteHandle {
            path: &self.path,
            rows: self.rows.write().await,
        }
    }

    pub async fn read_handle(&self) -> ReadHandle<'_, M> {
        ReadHandle {
            rows: self.rows.read().await,
        }
    }
}

pub struct WriteHandle<'a, M> {
    path: &'a Path,
    rows: RwLockWriteGuard<'a, Vec<M>>,
}

impl<M> WriteHandle<'_, M>
where
    M: Serialize + Clone,
{
    pub async fn insert(&mut self, row: M) -> Result<(), StoreError> {
        self.rows.push(row);
        if let Err(e) = self.flush().await {
            self.rows.pop();
            return Err(e);
        }
        Ok(())
    }

    pub fn find(&self, pred: impl Fn(&M) -> bool) -> Option<&M> {
        self.rows.iter().find(|row| pred(row))
    }

    /// Removes every matching row and returns how many went away.
    pub async fn delete(&mut self, pred: impl Fn(&M) -> bool) -> Result<usize, StoreError> {
        let (removed, kept): (Vec<M>, Vec<M>) = self.rows.iter().cloned().partition(|row| pred(row));
        if removed.is_empty() {
            return Ok(0);
        }
        let previous = std::mem::replace(&mut *self.rows, kept);
        if let Err(e) = self.flush().await {
            *self.rows = previous;
            return Err(e);
        }
        Ok(removed.len())
    }

    /// A read view that shares this handle's lock instead of taking a new one.
    pub fn read(&self) -> ReadView<'_, M> {
        ReadView { rows: &self.rows }
    }

    pub fn close(self) {}

    async fn flush(&self) -> Result<(), StoreError> {
        let buf = serde_json::to_vec_pretty(&*self.rows).map_err(StoreError::Encode)?;
        write_atomic(self.path, &buf).await
    }
}

pub struct ReadHandle<'a, M> {
    rows: RwLockReadGuard<'a, Vec<M>>,
}

impl<M: Clone> ReadHandle<'_, M> {
    pub fn find(&self, pred: impl Fn(&M) -> bool) -> Option<&M> {
        self.rows.iter().find(|row| pred(row))
    }

    pub fn view(&self) -> ReadView<'_, M> {
        ReadView { rows: &self.rows }
    }

    pub fn close(self) {}
}

#[derive(Clone, Copy)]
pub struct ReadView<'a, M> {
    rows: &'a [M],
}

impl<'a, M: Clone> ReadView<'a, M> {
    pub fn find(&self, pred: impl Fn(&M) -> bool) -> Option<&'a M> {
        self.rows.iter().find(|row| pred(row))
    }

    pub fn copy_out(&self) -> Vec<M> {
        self.rows.to_vec()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Writes to a sibling temp file, then renames over `path`.
async fn write_atomic(path: &Path, buf: &[u8]) -> Result<(), StoreError> {
    let io = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io)?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, buf).await.map_err(io)?;
    tokio::fs::rename(&tmp, path).await.map_err(io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Row {
        name: String,
        n: u32,
    }

    fn row(name: &str, n: u32) -> Row {
        Row {
            name: name.into(),
            n,
        }
    }

    #[tokio::test]
    async fn open_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::<Row>::open(dir.path().join("none.db")).await.unwrap();
        assert!(store.read_handle().await.view().is_empty());
    }

    #[tokio::test]
    async fn mutations_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("rows.db");

        let store = Store::<Row>::open(&path).await.unwrap();
        let mut w = store.write_handle().await;
        w.insert(row("a", 1)).await.unwrap();
        w.insert(row("b", 2)).await.unwrap();
        w.insert(row("a", 3)).await.unwrap();
        assert_eq!(w.find(|r| r.name == "a"), Some(&row("a", 1)));
        assert_eq!(w.delete(|r| r.n == 1).await.unwrap(), 1);
        w.close();

        let reopened = Store::<Row>::open(&path).await.unwrap();
        let r = reopened.read_handle().await;
        assert_eq!(r.view().copy_out(), vec![row("b", 2), row("a", 3)]);
        assert_eq!(r.find(|r| r.name == "a"), Some(&row("a", 3)));
    }

    #[tokio::test]
    async fn delete_without_match_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::<Row>::open(dir.path().join("rows.db")).await.unwrap();
        let mut w = store.write_handle().await;
        assert_eq!(w.delete(|_| true).await.unwrap(), 0);
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn corrupt_file_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.db");
        std::fs::write(&path, b"{not json").unwrap();
        let err = Store::<Row>::open(&path).await.unwrap_err();
        assert!(matches!(err, StoreError::Decode { .. }));
    }

    #[tokio::test]
    async fn writer_read_view_sees_own_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::<Row>::open(dir.path().join("rows.db")).await.unwrap();
        let mut w = store.write_handle().await;
        w.insert(row("x", 9)).await.unwrap();
        let view = w.read();
        assert_eq!(view.len(), 1);
        assert_eq!(view.find(|r| r.n == 9).map(|r| r.name.as_str()), Some("x"));
    }
}
