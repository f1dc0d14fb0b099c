use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{SystemTime, UNIX_EPOCH},
};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache has no backing file")]
    NoFile,
    #[error("cache io failed at {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cache file {path} is not valid")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode cache")]
    Encode(#[source] serde_json::Error),
}

pub(crate) fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub status_code: u16,
    pub value: String,
    /// Unix nanoseconds after which the entry is stale. `None` never expires.
    pub deadline: Option<i64>,
    #[serde(default)]
    pub last_used: i64,
}

impl CacheEntry {
    fn expired(&self, now: i64) -> bool {
        self.deadline.is_some_and(|d| d < now)
    }
}

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct CacheFile {
    values: HashMap<String, CacheEntry>,
}

#[derive(Debug, Default)]
struct CacheState {
    size: usize,
    values: HashMap<String, CacheEntry>,
}

impl CacheState {
    fn remove(&mut self, key: &str) {
        if let Some(entry) = self.values.remove(key) {
            self.size -= entry.value.len();
            tracing::debug!(url = key, size = entry.value.len(), "removed from http cache");
        }
    }

    /// Drops expired entries, then least recently used ones until the
    /// total fits. Does nothing while below `max_size`.
    fn compact(&mut self, max_size: usize) {
        if self.size < max_size {
            return;
        }
        let start_size = self.size;
        let now = now_nanos();
        let stale = self
            .values
            .iter()
            .filter(|(_, e)| e.expired(now))
            .map(|(k, _)| k.clone())
            .collect::<Vec<_>>();
        for key in stale {
            self.remove(&key);
        }

        while self.size > max_size {
            let Some(oldest) = self
                .values
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            self.remove(&oldest);
        }
        tracing::debug!(start_size, end_size = self.size, entries = self.values.len(), "http cache compacted");
    }
}

/// URL-keyed response bodies with deadlines, evicted least-recently-used
/// once their combined size passes `max_size` bytes.
#[derive(Debug)]
pub struct HttpCache {
    path: Option<PathBuf>,
    max_size: usize,
    state: Mutex<CacheState>,
}

impl HttpCache {
    /// An empty cache. `path` is only used by [`HttpCache::save`].
    pub fn new(path: Option<PathBuf>, max_size: usize) -> Self {
        Self {
            path,
            max_size,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Loads the cache persisted at `path`; a missing file gives an empty cache.
    pub async fn open(path: PathBuf, max_size: usize) -> Result<Self, CacheError> {
        let file = match tokio::fs::read(&path).await {
            Ok(buf) => serde_json::from_slice::<CacheFile>(&buf).map_err(|source| CacheError::Decode {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CacheFile::default(),
            Err(source) => return Err(CacheError::Io { path, source }),
        };

        let mut state = CacheState {
            size: file.values.values().map(|e| e.value.len()).sum(),
            values: file.values,
        };
        state.compact(max_size);
        tracing::debug!(path = %path.display(), entries = state.values.len(), size = state.size, max_size, "loaded http cache");

        Ok(Self {
            path: Some(path),
            max_size,
            state: Mutex::new(state),
        })
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn size(&self) -> usize {
        self.state().size
    }

    pub fn len(&self) -> usize {
        self.state().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A live entry for `key`, marking it as just used. Expired entries are
    /// dropped and reported as misses.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut state = self.state();
        let now = now_nanos();
        if state.values.get(key)?.expired(now) {
            state.remove(key);
            return None;
        }
        let entry = state.values.get_mut(key)?;
        entry.last_used = now;
        Some(entry.clone())
    }

    /// Stores `entry` under `key`, replacing any previous one. Values at
    /// least as large as the whole cache are refused.
    pub fn set(&self, key: &str, mut entry: CacheEntry) {
        if entry.value.len() >= self.max_size {
            tracing::debug!(url = key, size = entry.value.len(), max = self.max_size, "refusing to cache large resource");
            return;
        }
        let mut state = self.state();
        state.remove(key);
        entry.last_used = now_nanos();
        state.size += entry.value.len();
        state.values.insert(key.to_string(), entry);
        state.compact(self.max_size);
    }

    pub fn delete(&self, key: &str) {
        self.state().remove(key);
    }

    /// Compacts, then writes every entry to the backing file.
    pub async fn save(&self) -> Result<(), CacheError> {
        let path = self.path.clone().ok_or(CacheError::NoFile)?;
        let buf = {
            let mut state = self.state();
            state.compact(self.max_size);
            let file = CacheFile {
                values: state.values.clone(),
            };
            serde_json::to_vec(&file).map_err(CacheError::Encode)?
        };

        let io = |source| CacheError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io)?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &buf).await.map_err(io)?;
        tokio::fs::rename(&tmp, &path).await.map_err(io)?;
        Ok(())
    }
}
