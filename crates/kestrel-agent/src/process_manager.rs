//! Supervises OS processes keyed by [`Identity`].
//!
//! Every mutation runs under the record store's write lock for its whole
//! duration, so spawn, kill and remove never interleave. Liveness and health
//! are always re-checked against the OS; a stored record only says that the
//! process was started at some point.

use std::{
    collections::HashMap,
    path::PathBuf,
    process::Stdio,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use chrono::Utc;
use kestrel_process::{Identity, ProcessConfig, ProcessRecord, ProcessState, ProcessStatus};
use tokio::process::Command;

use crate::{
    error::{Classify, ErrorKind},
    health::{ProbeTarget, probe_for},
    log_tail,
    platform::ProcessControl,
    pubsub::{Registry, Subscription, Topic, TopicError},
    settings::Settings,
    store::{ReadHandle, ReadView, Store, StoreError, WriteHandle},
};

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("process not found: {0}")]
    NotFound(Identity),
    #[error("invalid process config: {0}")]
    InvalidConfig(&'static str),
    #[error("command not found on PATH: {command}")]
    CommandNotFound {
        command: String,
        #[source]
        source: which::Error,
    },
    #[error("failed to spawn {command}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to kill pid {pid}")]
    Kill {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("io failed at {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to build http client")]
    HttpClient(#[source] reqwest::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Topic(#[from] TopicError),
}

impl Classify for ProcessError {
    fn kind(&self) -> ErrorKind {
        match self {
            ProcessError::NotFound(_) | ProcessError::CommandNotFound { .. } => ErrorKind::NotFound,
            ProcessError::InvalidConfig(_) => ErrorKind::InvalidInput,
            ProcessError::Topic(e) => e.kind(),
            ProcessError::Spawn { .. }
            | ProcessError::Kill { .. }
            | ProcessError::Io { .. }
            | ProcessError::HttpClient(_)
            | ProcessError::Store(_) => ErrorKind::IoFailure,
        }
    }
}

/// Result of a spawn request. A live process under the same identity is not
/// an error; callers usually treat it as success.
#[derive(Debug, Clone)]
pub enum SpawnOutcome {
    Spawned(ProcessRecord),
    AlreadyRunning(ProcessRecord),
}

impl SpawnOutcome {
    pub fn record(&self) -> &ProcessRecord {
        match self {
            SpawnOutcome::Spawned(r) | SpawnOutcome::AlreadyRunning(r) => r,
        }
    }

    pub fn into_record(self) -> ProcessRecord {
        match self {
            SpawnOutcome::Spawned(r) | SpawnOutcome::AlreadyRunning(r) => r,
        }
    }

    pub fn already_running(&self) -> bool {
        matches!(self, SpawnOutcome::AlreadyRunning(_))
    }
}

/// Complete log lines plus the counter a follower resumes from.
/// Message `n` on the log topic is line `n` of the file.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct LogSnapshot {
    pub text: String,
    pub counter: i32,
}

fn snapshot_of(buf: &[u8]) -> LogSnapshot {
    let complete = buf.iter().rposition(|b| *b == b'\n').map_or(0, |nl| nl + 1);
    let lines = buf[..complete].iter().filter(|b| **b == b'\n').count();
    LogSnapshot {
        text: String::from_utf8_lossy(&buf[..complete]).into_owned(),
        // Topic counters wrap the same way.
        counter: lines as i32,
    }
}

#[derive(Debug, Clone)]
pub struct ProcessManagerOptions {
    pub db_path: PathBuf,
    pub logs_root: PathBuf,
    pub health_timeout: Duration,
    pub tail_poll: Duration,
}

impl ProcessManagerOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            db_path: settings.process_db_path(),
            logs_root: settings.process_logs_dir(),
            health_timeout: settings.health_timeout,
            tail_poll: settings.tail_poll,
        }
    }
}

#[derive(Clone)]
pub struct ProcessManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    db: Store<ProcessRecord>,
    logs_root: PathBuf,
    platform: Arc<dyn ProcessControl>,
    topics: Registry,
    http: reqwest::Client,
    health_timeout: Duration,
    tail_poll: Duration,
    tailers: Mutex<HashMap<Identity, Arc<Topic<String>>>>,
}

impl std::fmt::Debug for ProcessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessManager")
            .field("db", &self.inner.db.path())
            .field("logs_root", &self.inner.logs_root)
            .finish_non_exhaustive()
    }
}

impl ManagerInner {
    fn log_path(&self, id: &Identity) -> PathBuf {
        self.logs_root.join(id.relative_path("log"))
    }

    fn record_alive(&self, record: &ProcessRecord) -> bool {
        self.platform.is_alive(record.pid)
    }

    async fn probe(&self, record: &ProcessRecord) -> bool {
        let Some(spec) = &record.health_check else {
            return false;
        };
        probe_for(spec, &self.http, &self.platform, self.health_timeout)
            .check(ProbeTarget::from(record))
            .await
    }
}

impl ProcessManager {
    /// Opens the record store. Records left by an earlier supervisor run are
    /// kept; their liveness is re-evaluated whenever someone asks.
    pub async fn open(
        options: ProcessManagerOptions,
        platform: Arc<dyn ProcessControl>,
        topics: Registry,
    ) -> Result<Self, ProcessError> {
        let db = Store::open(&options.db_path).await?;
        let http = reqwest::Client::builder()
            .timeout(options.health_timeout)
            .build()
            .map_err(ProcessError::HttpClient)?;

        let manager = Self {
            inner: Arc::new(ManagerInner {
                db,
                logs_root: options.logs_root,
                platform,
                topics,
                http,
                health_timeout: options.health_timeout,
                tail_poll: options.tail_poll,
                tailers: Mutex::new(HashMap::new()),
            }),
        };

        let known = manager.read_handle().await.view().copy_out_data();
        if !known.is_empty() {
            let alive = known.iter().filter(|r| manager.inner.record_alive(r)).count();
            tracing::info!(records = known.len(), alive, "loaded process records");
        }
        Ok(manager)
    }

    pub async fn write_handle(&self) -> ProcessWriteHandle<'_> {
        ProcessWriteHandle {
            inner: &self.inner,
            db: self.inner.db.write_handle().await,
        }
    }

    pub async fn read_handle(&self) -> ProcessReadHandle<'_> {
        ProcessReadHandle {
            inner: &self.inner,
            db: self.inner.db.read_handle().await,
        }
    }

    pub fn platform(&self) -> &Arc<dyn ProcessControl> {
        &self.inner.platform
    }

    pub fn topics(&self) -> &Registry {
        &self.inner.topics
    }

    pub fn log_path(&self, id: &Identity) -> PathBuf {
        self.inner.log_path(id)
    }

    pub async fn spawn(&self, config: ProcessConfig) -> Result<SpawnOutcome, ProcessError> {
        self.write_handle().await.spawn(config).await
    }

    pub async fn spawn_from_path_var(&self, config: ProcessConfig) -> Result<SpawnOutcome, ProcessError> {
        self.write_handle().await.spawn_from_path_var(config).await
    }

    pub async fn kill(&self, id: &Identity) -> Result<(), ProcessError> {
        self.write_handle().await.kill(id).await
    }

    pub async fn remove(&self, id: &Identity) -> Result<(), ProcessError> {
        self.write_handle().await.remove(id).await
    }

    pub async fn find_by_id(&self, id: &Identity) -> Option<ProcessRecord> {
        self.read_handle().await.view().find_by_id(id)
    }

    pub async fn is_alive(&self, id: &Identity) -> bool {
        self.read_handle().await.view().is_alive(id)
    }

    /// Runs the configured probe without holding the store lock while the
    /// probe is in flight.
    pub async fn check_health(&self, id: &Identity) -> bool {
        let Some(record) = self.find_by_id(id).await else {
            return false;
        };
        self.inner.probe(&record).await
    }

    pub async fn copy_out_data(&self) -> Vec<ProcessRecord> {
        self.read_handle().await.view().copy_out_data()
    }

    pub async fn statuses(&self) -> Vec<ProcessStatus> {
        self.read_handle().await.view().statuses()
    }

    /// Reads the complete lines of the log file. `counter` is the number of
    /// lines read, which is the counter of the first log message not covered
    /// by `text`. A trailing partial line is left for the log topic.
    pub async fn log_snapshot(&self, id: &Identity) -> Result<LogSnapshot, ProcessError> {
        let path = self.log_path(id);
        let buf = match tokio::fs::read(&path).await {
            Ok(buf) => buf,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(ProcessError::NotFound(id.clone())),
            Err(source) => return Err(ProcessError::Io { path, source }),
        };
        Ok(snapshot_of(&buf))
    }

    /// Subscribes to the log lines of `id`, starting the tailer if none is
    /// following the current log topic.
    pub async fn subscribe_logs(&self, id: &Identity) -> Result<Subscription<String>, ProcessError> {
        if self.find_by_id(id).await.is_none() {
            return Err(ProcessError::NotFound(id.clone()));
        }
        let topic = self.inner.topics.get_or_create::<String>(&id.logs_topic())?;
        let subscription = topic.subscribe()?;
        self.ensure_tailer(id, topic);
        Ok(subscription)
    }

    fn ensure_tailer(&self, id: &Identity, topic: Arc<Topic<String>>) {
        {
            let mut active = self
                .inner
                .tailers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if active.get(id).is_some_and(|t| Arc::ptr_eq(t, &topic)) {
                return;
            }
            active.insert(id.clone(), topic.clone());
        }

        let manager = self.clone();
        let id = id.clone();
        tokio::spawn(async move {
            log_tail::follow(&manager, &id, &topic, manager.inner.tail_poll).await;
            let mut active = manager
                .inner
                .tailers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if active.get(&id).is_some_and(|t| Arc::ptr_eq(t, &topic)) {
                active.remove(&id);
            }
        });
    }
}

/// Consistent read access to the process records.
pub struct ProcessView<'a> {
    inner: &'a ManagerInner,
    rows: ReadView<'a, ProcessRecord>,
}

impl ProcessView<'_> {
    pub fn find_by_id(&self, id: &Identity) -> Option<ProcessRecord> {
        self.rows.find(|r| &r.id == id).cloned()
    }

    pub fn is_alive(&self, id: &Identity) -> bool {
        self.rows
            .find(|r| &r.id == id)
            .is_some_and(|r| self.inner.record_alive(r))
    }

    /// False when the record is missing or has no health check configured.
    pub async fn check_health(&self, id: &Identity) -> bool {
        match self.rows.find(|r| &r.id == id) {
            Some(record) => self.inner.probe(record).await,
            None => false,
        }
    }

    pub fn copy_out_data(&self) -> Vec<ProcessRecord> {
        self.rows.copy_out()
    }

    pub fn statuses(&self) -> Vec<ProcessStatus> {
        self.rows
            .copy_out()
            .into_iter()
            .map(|process| {
                let state = if self.inner.record_alive(&process) {
                    ProcessState::Running
                } else {
                    ProcessState::Exited
                };
                ProcessStatus { process, state }
            })
            .collect()
    }
}

pub struct ProcessReadHandle<'a> {
    inner: &'a ManagerInner,
    db: ReadHandle<'a, ProcessRecord>,
}

impl ProcessReadHandle<'_> {
    pub fn view(&self) -> ProcessView<'_> {
        ProcessView {
            inner: self.inner,
            rows: self.db.view(),
        }
    }

    pub fn close(self) {}
}

/// Exclusive access to the process records for spawn, kill and remove.
pub struct ProcessWriteHandle<'a> {
    inner: &'a ManagerInner,
    db: WriteHandle<'a, ProcessRecord>,
}

impl ProcessWriteHandle<'_> {
    /// Reads through the lock this handle already holds.
    pub fn read(&self) -> ProcessView<'_> {
        ProcessView {
            inner: self.inner,
            rows: self.db.read(),
        }
    }

    pub fn close(self) {}

    pub async fn spawn(&mut self, config: ProcessConfig) -> Result<SpawnOutcome, ProcessError> {
        let inner = self.inner;
        if config.id.category_str().is_empty() {
            return Err(ProcessError::InvalidConfig("process category is required"));
        }
        if config.id.key().is_empty() {
            return Err(ProcessError::InvalidConfig("process key is required"));
        }
        if config.command.is_empty() {
            return Err(ProcessError::InvalidConfig("command is required"));
        }

        if let Some(previous) = self.db.find(|r| r.id == config.id).cloned() {
            if inner.record_alive(&previous) {
                return Ok(SpawnOutcome::AlreadyRunning(previous));
            }
            tracing::info!(process_id = %previous.id, pid = previous.pid, "removing stale process record");
            self.db.delete(|r| r.id == previous.id).await?;
        }
        // The previous incarnation's log stream ends here.
        inner.topics.close_topic(&config.id.logs_topic());

        let work_dir = match config.work_dir {
            Some(dir) => dir,
            None => std::env::current_dir().map_err(|source| ProcessError::Io {
                path: PathBuf::from("."),
                source,
            })?,
        };
        tokio::fs::create_dir_all(&work_dir)
            .await
            .map_err(|source| ProcessError::Io {
                path: work_dir.clone(),
                source,
            })?;

        let log_path = inner.log_path(&config.id);
        let io = |source| ProcessError::Io {
            path: log_path.clone(),
            source,
        };
        if let Some(parent) = log_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io)?;
        }
        let stdout = tokio::fs::File::create(&log_path)
            .await
            .map_err(io)?
            .into_std()
            .await;
        let stderr = stdout.try_clone().map_err(io)?;

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .current_dir(&work_dir)
            .envs(&config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    // New session, so a kill can take the whole process tree.
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            command: config.command.clone(),
            source,
        })?;
        let Some(pid) = child.id() else {
            return Err(ProcessError::Spawn {
                command: config.command.clone(),
                source: std::io::Error::other("child exited before reporting a pid"),
            });
        };

        let record = ProcessRecord {
            id: config.id,
            pid,
            started_at: Utc::now(),
            work_dir,
            env: config.env,
            command: config.command,
            args: config.args,
            port: config.port,
            health_check: config.health_check,
        };

        if let Err(e) = self.db.insert(record.clone()).await {
            tracing::error!(process_id = %record.id, pid, error = %e, "failed to record process, killing it");
            if let Err(kill_err) = inner.platform.kill(pid) {
                tracing::warn!(process_id = %record.id, pid, error = %kill_err, "failed to kill unrecorded process");
            }
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
            return Err(e.into());
        }

        tracing::info!(
            process_id = %record.id,
            pid,
            command = %record.command,
            log = %log_path.display(),
            "process spawned"
        );

        let id = record.id.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    tracing::info!(process_id = %id, pid, code = ?status.code(), "process exited")
                }
                Err(e) => tracing::warn!(process_id = %id, pid, error = %e, "failed to wait for process"),
            }
        });

        Ok(SpawnOutcome::Spawned(record))
    }

    /// Like [`spawn`](Self::spawn), resolving the command on `PATH` first.
    pub async fn spawn_from_path_var(&mut self, mut config: ProcessConfig) -> Result<SpawnOutcome, ProcessError> {
        let resolved = which::which(&config.command).map_err(|source| ProcessError::CommandNotFound {
            command: config.command.clone(),
            source,
        })?;
        config.command = resolved.to_string_lossy().into_owned();
        self.spawn(config).await
    }

    pub async fn kill(&mut self, id: &Identity) -> Result<(), ProcessError> {
        let Some(record) = self.db.find(|r| &r.id == id).cloned() else {
            return Err(ProcessError::NotFound(id.clone()));
        };
        self.inner
            .platform
            .kill(record.pid)
            .map_err(|source| ProcessError::Kill {
                pid: record.pid,
                source,
            })?;
        self.db.delete(|r| &r.id == id).await?;
        self.inner.topics.close_topic(&id.logs_topic());
        tracing::info!(process_id = %id, pid = record.pid, "process killed");
        Ok(())
    }

    /// Kills the process if it is alive and forgets it. Absent ids are fine.
    pub async fn remove(&mut self, id: &Identity) -> Result<(), ProcessError> {
        let Some(record) = self.db.find(|r| &r.id == id).cloned() else {
            return Ok(());
        };
        if self.inner.record_alive(&record) {
            return self.kill(id).await;
        }
        self.db.delete(|r| &r.id == id).await?;
        self.inner.topics.close_topic(&id.logs_topic());
        Ok(())
    }
}
